//! Name ↔ id translation for cross-table record links.
//!
//! Linked-record cells display the target record's primary-field value, but
//! the API stores arrays of record ids. Both directions of translation go
//! through a process-wide cache keyed by `(base_id, linked_table_id)`, so a
//! run that touches the same linked table from many rows fetches it once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};

use crate::clients::airtable::{AirtableClient, ListOptions};
use crate::error::ProviderError;
use crate::tokens::AccessToken;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
pub struct ResolvedNames {
    /// record id → primary-field value
    pub names: HashMap<String, String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ResolvedIds {
    /// original (untrimmed-case) name → record id
    pub ids: HashMap<String, String>,
    pub missing: Vec<String>,
}

#[derive(Debug)]
pub struct PreloadStats {
    pub records: usize,
    pub elapsed_ms: u128,
}

struct TableCache {
    primary_field: String,
    id_to_name: HashMap<String, String>,
    /// keys lower-cased and trimmed
    name_to_id: HashMap<String, String>,
    fetched_at: Instant,
}

impl TableCache {
    fn insert(&mut self, id: String, name: String) {
        self.name_to_id.insert(name.trim().to_lowercase(), id.clone());
        self.id_to_name.insert(id, name);
    }
}

type TableKey = (String, String);
type TableSlot = Arc<tokio::sync::Mutex<Option<TableCache>>>;

/// Process-wide resolver. One instance lives for the process lifetime and is
/// shared by all concurrent runs; the per-table async mutex coalesces
/// concurrent fetches of the same table into one request.
pub struct LinkedRecordResolver {
    ttl: Duration,
    tables: Mutex<HashMap<TableKey, TableSlot>>,
}

impl LinkedRecordResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tables: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, base: &str, table: &str) -> TableSlot {
        let mut tables = self.tables.lock().unwrap();
        tables
            .entry((base.to_string(), table.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
            .clone()
    }

    fn is_fresh(&self, cache: &Option<TableCache>) -> bool {
        cache
            .as_ref()
            .is_some_and(|c| c.fetched_at.elapsed() < self.ttl)
    }

    /// Drop the cache entry for one table.
    pub fn clear(&self, base: &str, table: &str) {
        let mut tables = self.tables.lock().unwrap();
        tables.remove(&(base.to_string(), table.to_string()));
    }

    /// Drop every entry past its TTL. Entries currently being refreshed are
    /// left alone.
    pub fn clear_expired(&self) {
        let tables = self.tables.lock().unwrap();
        for slot in tables.values() {
            if let Ok(mut guard) = slot.try_lock() {
                if guard.as_ref().is_some_and(|c| c.fetched_at.elapsed() >= self.ttl) {
                    *guard = None;
                }
            }
        }
    }

    async fn fetch_table(
        client: &dyn AirtableClient,
        token: &AccessToken,
        base: &str,
        table: &str,
    ) -> Result<TableCache, ProviderError> {
        let schema = client.get_base_schema(token, base).await?;
        let table_schema = schema
            .iter()
            .find(|t| t.id == table || t.name == table)
            .ok_or_else(|| ProviderError::api(404, format!("linked table {table} not found")))?;
        let primary_field = table_schema
            .primary_field()
            .map(|f| f.name.clone())
            .ok_or_else(|| {
                ProviderError::Decode(format!("table {table} has no primary field"))
            })?;

        let records = client
            .list_records(token, base, table, &ListOptions::default())
            .await?;

        let mut cache = TableCache {
            primary_field,
            id_to_name: HashMap::with_capacity(records.len()),
            name_to_id: HashMap::with_capacity(records.len()),
            fetched_at: Instant::now(),
        };
        for record in records {
            let name = record
                .field(&cache.primary_field)
                .map(display_value)
                .unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            cache.insert(record.id, name);
        }
        Ok(cache)
    }

    /// Translate record ids into primary-field values, fetching the linked
    /// table on cache miss or expiry.
    pub async fn resolve_ids_to_names(
        &self,
        client: &dyn AirtableClient,
        token: &AccessToken,
        base: &str,
        table: &str,
        ids: &[String],
    ) -> Result<ResolvedNames, ProviderError> {
        let slot = self.slot(base, table);
        let mut guard = slot.lock().await;
        if !self.is_fresh(&guard) {
            *guard = Some(Self::fetch_table(client, token, base, table).await?);
        }
        let cache = guard.as_ref().unwrap();

        let mut out = ResolvedNames::default();
        for id in ids {
            match cache.id_to_name.get(id) {
                Some(name) => {
                    out.names.insert(id.clone(), name.clone());
                }
                None => out.missing.push(id.clone()),
            }
        }
        Ok(out)
    }

    /// Translate primary-field values into record ids. Matching is
    /// case-insensitive and trimmed. When `create_missing` is set, unmatched
    /// names get a minimal record created in the linked table.
    pub async fn resolve_names_to_ids(
        &self,
        client: &dyn AirtableClient,
        token: &AccessToken,
        base: &str,
        table: &str,
        names: &[String],
        create_missing: bool,
    ) -> Result<ResolvedIds, ProviderError> {
        let slot = self.slot(base, table);
        let mut guard = slot.lock().await;
        if !self.is_fresh(&guard) {
            *guard = Some(Self::fetch_table(client, token, base, table).await?);
        }
        let cache = guard.as_mut().unwrap();

        let mut out = ResolvedIds::default();
        let mut to_create: Vec<String> = Vec::new();
        for name in names {
            let key = name.trim().to_lowercase();
            if key.is_empty() {
                continue;
            }
            match cache.name_to_id.get(&key) {
                Some(id) => {
                    out.ids.insert(name.clone(), id.clone());
                }
                None if create_missing => {
                    if !to_create.iter().any(|n| n.trim().to_lowercase() == key) {
                        to_create.push(name.clone());
                    }
                }
                None => out.missing.push(name.clone()),
            }
        }

        for chunk in to_create.chunks(10) {
            let fields: Vec<Map<String, Value>> = chunk
                .iter()
                .map(|name| {
                    let mut f = Map::new();
                    f.insert(cache.primary_field.clone(), json!(name.trim()));
                    f
                })
                .collect();
            let created = client.create_records(token, base, table, &fields).await?;
            for (record, name) in created.into_iter().zip(chunk) {
                out.ids.insert(name.clone(), record.id.clone());
                cache.insert(record.id, name.trim().to_string());
            }
        }
        Ok(out)
    }

    /// Force a full fetch of one table, warming both maps.
    pub async fn preload_table(
        &self,
        client: &dyn AirtableClient,
        token: &AccessToken,
        base: &str,
        table: &str,
    ) -> Result<PreloadStats, ProviderError> {
        let started = Instant::now();
        let slot = self.slot(base, table);
        let mut guard = slot.lock().await;
        if !self.is_fresh(&guard) {
            *guard = Some(Self::fetch_table(client, token, base, table).await?);
        }
        Ok(PreloadStats {
            records: guard.as_ref().unwrap().id_to_name.len(),
            elapsed_ms: started.elapsed().as_millis(),
        })
    }
}

impl Default for LinkedRecordResolver {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

/// Render a primary-field value as display text.
fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
