pub mod airtable_to_sheets;
pub mod bidirectional;
pub mod sheets_to_airtable;

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream;

use crate::clients::airtable::{AirtableClient, ListOptions};
use crate::clients::sheets::{SheetsClient, column_number_to_letter};
use crate::config::{SyncConfig, ValidationMode};
use crate::error::{ProviderError, SyncError};
use crate::field_mapper::LinkContext;
use crate::invoker::{CancelToken, InvokeOptions, invoke};
use crate::models::outcome::RunReport;
use crate::models::record::{AirtableRecord, FieldSchema, TableSchema};
use crate::models::state::RecordState;
use crate::resolver::LinkedRecordResolver;
use crate::tokens::AccessToken;

/// Everything one pipeline invocation needs, borrowed from the engine.
pub struct RunContext<'a> {
    pub config: &'a SyncConfig,
    pub airtable: &'a dyn AirtableClient,
    pub sheets: &'a dyn SheetsClient,
    pub airtable_token: &'a AccessToken,
    pub sheets_token: &'a AccessToken,
    pub resolver: &'a LinkedRecordResolver,
    pub cancel: &'a CancelToken,
}

impl<'a> RunContext<'a> {
    pub fn link_context(&'a self) -> Option<LinkContext<'a>> {
        if !self.config.resolve_linked_records {
            return None;
        }
        Some(LinkContext {
            resolver: self.resolver,
            client: self.airtable,
            token: self.airtable_token,
            base_id: &self.config.airtable_base_id,
            create_missing: self.config.create_missing_linked_records,
        })
    }

    pub fn invoke_opts(&self, op_name: &'a str) -> InvokeOptions<'a> {
        InvokeOptions {
            max_retries: self.config.max_retries,
            op_name,
        }
    }
}

/// Fetch the base schema and pick out the configured table.
pub async fn fetch_table_schema(ctx: &RunContext<'_>) -> Result<TableSchema, SyncError> {
    let tables = invoke(
        || ctx.airtable.get_base_schema(ctx.airtable_token, &ctx.config.airtable_base_id),
        &ctx.invoke_opts("get_base_schema"),
        ctx.cancel,
    )
    .await
    .map_err(|e| SyncError::from_fetch_failure(&e))?;
    tables
        .into_iter()
        .find(|t| t.id == ctx.config.airtable_table_id || t.name == ctx.config.airtable_table_id)
        .ok_or_else(|| {
            SyncError::fetch(format!(
                "table {} not found in base {}",
                ctx.config.airtable_table_id, ctx.config.airtable_base_id
            ))
        })
}

/// Fetch every record of the configured table.
pub async fn fetch_records(ctx: &RunContext<'_>) -> Result<Vec<AirtableRecord>, SyncError> {
    let opts = ListOptions {
        view: ctx.config.airtable_view.clone(),
        ..Default::default()
    };
    invoke(
        || {
            ctx.airtable.list_records(
                ctx.airtable_token,
                &ctx.config.airtable_base_id,
                &ctx.config.airtable_table_id,
                &opts,
            )
        },
        &ctx.invoke_opts("list_records"),
        ctx.cancel,
    )
    .await
    .map_err(|e| SyncError::from_fetch_failure(&e))
}

/// Warm the resolver cache for every linked table referenced by the schema,
/// fanning out up to the configured bound. Failures are warnings in lenient
/// mode and terminate the run in strict mode.
pub async fn preload_linked_tables(
    ctx: &RunContext<'_>,
    schema: &TableSchema,
    report: &mut RunReport,
) -> Result<(), SyncError> {
    if !ctx.config.resolve_linked_records {
        return Ok(());
    }
    let tables: Vec<String> = schema
        .link_fields()
        .iter()
        .filter_map(|f| f.linked_table_id().map(str::to_string))
        .collect();
    if tables.is_empty() {
        return Ok(());
    }

    let results: Vec<(String, Result<_, ProviderError>)> = stream::iter(tables)
        .map(|table| async move {
            let result = ctx
                .resolver
                .preload_table(
                    ctx.airtable,
                    ctx.airtable_token,
                    &ctx.config.airtable_base_id,
                    &table,
                )
                .await;
            (table, result)
        })
        .buffer_unordered(ctx.config.fan_out())
        .collect()
        .await;

    for (table, result) in results {
        match result {
            Ok(stats) => {
                tracing::debug!(
                    table,
                    records = stats.records,
                    elapsed_ms = stats.elapsed_ms as u64,
                    "preloaded linked table"
                );
            }
            Err(e) if ctx.config.validation_mode == ValidationMode::Strict => {
                return Err(SyncError::linked_record(format!(
                    "failed to preload linked table {table}: {e}"
                )));
            }
            Err(e) => {
                report.warn(format!("failed to preload linked table {table}: {e}"));
            }
        }
    }
    Ok(())
}

/// Column layout for rendering records into rows: every mapped field, or all
/// schema fields positionally when no mapping is configured.
pub fn read_columns(config: &SyncConfig, schema: &TableSchema) -> Vec<(FieldSchema, usize)> {
    columns_for(config, schema, false)
}

/// Column layout for parsing rows into records: writable fields only.
pub fn write_columns(config: &SyncConfig, schema: &TableSchema) -> Vec<(FieldSchema, usize)> {
    columns_for(config, schema, true)
}

fn columns_for(
    config: &SyncConfig,
    schema: &TableSchema,
    writable_only: bool,
) -> Vec<(FieldSchema, usize)> {
    let mut columns: Vec<(FieldSchema, usize)> = if config.field_mappings.is_empty() {
        schema
            .fields
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != config.id_column_index)
            .map(|(i, f)| (f.clone(), i))
            .collect()
    } else {
        config
            .field_mappings
            .iter()
            .filter_map(|m| {
                schema
                    .field_by_id(&m.field_id)
                    .map(|f| (f.clone(), m.column_index))
            })
            .collect()
    };
    if writable_only {
        columns.retain(|(f, _)| f.field_type.is_writable());
    }
    columns.sort_by_key(|(_, i)| *i);
    columns
}

/// The fetch range always reaches the id-column so it comes back even when
/// every id cell is blank.
pub fn fetch_range(config: &SyncConfig) -> String {
    format!("A:{}", column_number_to_letter(config.id_column_index + 1))
}

pub fn state_entry(record_id: &str, content_hash: String, sheet_hash: String) -> RecordState {
    RecordState {
        record_id: record_id.to_string(),
        content_hash,
        sheet_hash: Some(sheet_hash),
        airtable_modified_time: None,
        sheets_modified_time: None,
        captured_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }
}

/// Collapse a set of zero-based row indices into contiguous `(start, count)`
/// runs, ordered bottom-up so earlier deletions never shift later targets.
pub fn descending_delete_runs(mut indices: Vec<usize>) -> Vec<(usize, usize)> {
    indices.sort_unstable_by(|a, b| b.cmp(a));
    indices.dedup();
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for idx in indices {
        match runs.last_mut() {
            Some((start, count)) if idx + 1 == *start => {
                *start = idx;
                *count += 1;
            }
            _ => runs.push((idx, 1)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMapping;
    use crate::models::record::FieldType;

    fn schema() -> TableSchema {
        serde_json::from_value(serde_json::json!({
            "id": "tblX",
            "name": "Tasks",
            "primaryFieldId": "fld1",
            "fields": [
                {"id": "fld1", "name": "Name", "type": "singleLineText"},
                {"id": "fld2", "name": "Total", "type": "formula"},
                {"id": "fld3", "name": "Age", "type": "number"}
            ]
        }))
        .unwrap()
    }

    fn config(mappings: Vec<FieldMapping>) -> SyncConfig {
        let mut cfg: SyncConfig = serde_json::from_str(
            r#"{
                "id": "cfg1", "user_id": "u1",
                "airtable_base_id": "appX", "airtable_table_id": "tblX",
                "spreadsheet_id": "ssX", "sheet": "Sheet1",
                "direction": "sheets_to_airtable"
            }"#,
        )
        .unwrap();
        cfg.field_mappings = mappings;
        cfg
    }

    #[test]
    fn test_positional_columns() {
        let cfg = config(vec![]);
        let cols = read_columns(&cfg, &schema());
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[0].0.name, "Name");
        assert_eq!(cols[0].1, 0);
    }

    #[test]
    fn test_write_columns_exclude_read_only() {
        let cfg = config(vec![]);
        let cols = write_columns(&cfg, &schema());
        assert_eq!(cols.len(), 2);
        assert!(cols.iter().all(|(f, _)| f.field_type != FieldType::Formula));
    }

    #[test]
    fn test_mapped_columns_sorted_by_index() {
        let cfg = config(vec![
            FieldMapping { field_id: "fld3".into(), column_index: 4 },
            FieldMapping { field_id: "fld1".into(), column_index: 1 },
        ]);
        let cols = read_columns(&cfg, &schema());
        assert_eq!(cols[0].0.id, "fld1");
        assert_eq!(cols[1].0.id, "fld3");
        assert_eq!(cols[1].1, 4);
    }

    #[test]
    fn test_fetch_range_covers_id_column() {
        let cfg = config(vec![]);
        assert_eq!(fetch_range(&cfg), "A:AA");
    }

    #[test]
    fn test_descending_delete_runs() {
        assert_eq!(descending_delete_runs(vec![3, 6, 7]), vec![(6, 2), (3, 1)]);
        assert_eq!(descending_delete_runs(vec![2]), vec![(2, 1)]);
        assert_eq!(descending_delete_runs(vec![5, 4, 3]), vec![(3, 3)]);
        assert!(descending_delete_runs(vec![]).is_empty());
    }
}
