use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Last-known state for one record, persisted between runs.
///
/// Two hashes are kept because the two sides hash different shapes: the
/// Airtable hash covers every field of the record (so unmapped changes are
/// still detected), while the sheet hash covers the row cells with the
/// id-column excluded. Change detection always compares a side's current
/// hash against the last-known hash of that same side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordState {
    pub record_id: String,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airtable_modified_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheets_modified_time: Option<String>,
    pub captured_at: String,
}

/// Everything the engine remembers about one sync config between runs.
/// Created on the first successful run, mutated only by the engine, and
/// destroyed when the config is deleted or explicitly reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub sync_config_id: String,
    #[serde(default)]
    pub records: HashMap<String, RecordState>,
    #[serde(default)]
    pub last_sync_time: Option<String>,
}

impl SyncState {
    pub fn new(sync_config_id: impl Into<String>) -> Self {
        Self {
            sync_config_id: sync_config_id.into(),
            records: HashMap::new(),
            last_sync_time: None,
        }
    }

    /// A first run is one with no remembered records.
    pub fn is_first_run(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record(&self, id: &str) -> Option<&RecordState> {
        self.records.get(id)
    }

    pub fn upsert(&mut self, entry: RecordState) {
        self.records.insert(entry.record_id.clone(), entry);
    }

    pub fn remove(&mut self, id: &str) {
        self.records.remove(id);
    }
}
