//! Canonical content hashing.
//!
//! Change detection never stores previous content, only a SHA-256 over a
//! canonical serialization of it. Canonicalization makes the hash stable
//! under key reordering and semantic-equality normalization: strings are
//! trimmed, numbers rounded to six decimals, arrays sorted, and
//! linked-record arrays reduced to sorted id lists.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::sheet::{CellValue, canonical_number};

/// Hash the full field set of an Airtable record.
pub fn hash_record_fields(fields: &Map<String, Value>) -> String {
    let mut entries: Vec<(&String, Value)> = fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k, normalize_value(v)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let mut canonical = Map::new();
    for (k, v) in entries {
        canonical.insert(k.clone(), v);
    }
    digest(&Value::Object(canonical))
}

/// Hash a sheet row, excluding the id-column (the record id is sync
/// metadata, not content) and ignoring trailing empty cells.
pub fn hash_sheet_row(row: &[CellValue], id_column_index: usize) -> String {
    let mut cells: Vec<Value> = row
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != id_column_index)
        .map(|(_, c)| normalize_cell(c))
        .collect();
    while cells.last() == Some(&Value::Null) {
        cells.pop();
    }
    digest(&Value::Array(cells))
}

/// Normalize one JSON value for hashing. Recursion covers nested objects
/// (e.g. barcode or attachment shapes).
pub fn normalize_value(v: &Value) -> Value {
    match v {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => match n.as_f64() {
            Some(f) => Value::String(canonical_number(f)),
            None => Value::String(n.to_string()),
        },
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => {
            if let Some(ids) = linked_record_ids(items) {
                Value::Array(ids.into_iter().map(Value::String).collect())
            } else {
                let mut normalized: Vec<Value> = items.iter().map(normalize_value).collect();
                normalized.sort_by_key(|v| serde_json::to_string(v).unwrap_or_default());
                Value::Array(normalized)
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, Value)> =
                map.iter().map(|(k, v)| (k, normalize_value(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in entries {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
    }
}

fn normalize_cell(c: &CellValue) -> Value {
    if c.is_empty() {
        Value::Null
    } else {
        Value::String(c.as_trimmed_str())
    }
}

/// A linked-record array is a non-empty array of objects each carrying an
/// `id` string. Reduced to its sorted id list.
fn linked_record_ids(items: &[Value]) -> Option<Vec<String>> {
    if items.is_empty() {
        return None;
    }
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let id = item.as_object()?.get("id")?.as_str()?;
        ids.push(id.to_string());
    }
    ids.sort();
    Some(ids)
}

fn digest(v: &Value) -> String {
    let serialized = serde_json::to_string(v).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}
