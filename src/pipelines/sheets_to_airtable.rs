//! One-way pipeline: sheet rows → Airtable records.
//!
//! Row identity is matched in two stages: by the id-column first, then by
//! the table's primary field for rows that have data but no id yet. Newly
//! created records get their ids written back into the id-column so the next
//! run matches them directly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::clients::sheets::column_number_to_letter;
use crate::config::ValidationMode;
use crate::error::SyncError;
use crate::field_mapper::row_to_fields;
use crate::hashing::{hash_record_fields, hash_sheet_row};
use crate::invoker::{batch_operations, invoke};
use crate::models::outcome::RunReport;
use crate::models::record::AirtableRecord;
use crate::models::sheet::{CellValue, SheetRow};
use crate::models::state::SyncState;

use super::{
    RunContext, fetch_range, fetch_records, fetch_table_schema, preload_linked_tables,
    state_entry, write_columns,
};

const WRITE_BACK_GROUP: usize = 10;
const WRITE_BACK_PAUSE: Duration = Duration::from_millis(250);

struct ParsedRow {
    a1_row: usize,
    record_id: Option<String>,
    fields: Map<String, Value>,
    row: SheetRow,
}

pub async fn run(
    ctx: &RunContext<'_>,
    report: &mut RunReport,
    state: &mut SyncState,
) -> Result<(), SyncError> {
    let config = ctx.config;
    let strict = config.validation_mode == ValidationMode::Strict;
    let id_col = config.id_column_index;

    // The id-column must exist before the fetch so the range covers it.
    let sheet_id = invoke(
        || ctx.sheets.resolve_sheet_id(ctx.sheets_token, &config.spreadsheet_id, &config.sheet),
        &ctx.invoke_opts("resolve_sheet_id"),
        ctx.cancel,
    )
    .await
    .map_err(|e| SyncError::from_fetch_failure(&e))?;
    invoke(
        || {
            ctx.sheets.ensure_columns_exist(
                ctx.sheets_token,
                &config.spreadsheet_id,
                sheet_id,
                id_col + 1,
            )
        },
        &ctx.invoke_opts("ensure_columns_exist"),
        ctx.cancel,
    )
    .await
    .map_err(|e| SyncError::from_write_failure(&e))?;

    let range = fetch_range(config);
    let sheet_rows = invoke(
        || {
            ctx.sheets.get_sheet_data(
                ctx.sheets_token,
                &config.spreadsheet_id,
                &config.sheet,
                &range,
            )
        },
        &ctx.invoke_opts("get_sheet_data"),
        ctx.cancel,
    )
    .await
    .map_err(|e| SyncError::from_fetch_failure(&e))?;

    let schema = fetch_table_schema(ctx).await?;
    preload_linked_tables(ctx, &schema, report).await?;
    let link = ctx.link_context();
    let columns = write_columns(config, &schema);
    let primary_name = schema.primary_field().map(|f| f.name.clone());

    // Parse rows into field maps.
    let header_offset = if config.skip_header_row { 1 } else { 0 };
    let mut parsed: Vec<ParsedRow> = Vec::new();
    for (i, row) in sheet_rows.iter().enumerate().skip(header_offset) {
        let a1_row = i + 1;
        let record_id = row
            .get(id_col)
            .map(|c| c.as_trimmed_str())
            .filter(|s| !s.is_empty());
        let has_data = row
            .iter()
            .enumerate()
            .any(|(col, c)| col != id_col && !c.is_empty());
        if !has_data && record_id.is_none() {
            continue;
        }

        let converted = row_to_fields(row, &columns, link.as_ref(), config.validation_mode).await;
        for w in converted.warnings {
            report.warn(format!("row {a1_row}: {w}"));
        }
        if !converted.errors.is_empty() {
            for (field, e) in &converted.errors {
                let err = SyncError::new(e.kind, e.message.clone())
                    .with_row(a1_row)
                    .with_field(field.clone());
                if strict {
                    return Err(err);
                }
                report.error(err);
            }
            continue;
        }
        let mut fields = converted.fields;
        for issue in crate::validator::sanitize_airtable_fields(&mut fields, a1_row) {
            let err = SyncError::validation(format!(
                "{}: value truncated ({})",
                issue.field_name, issue.sampled_value
            ))
            .with_row(a1_row)
            .with_field(issue.field_name.clone());
            if strict {
                return Err(err);
            }
            report.error(err);
        }
        parsed.push(ParsedRow {
            a1_row,
            record_id,
            fields,
            row: row.clone(),
        });
    }
    report.total = parsed.len();

    // Existing records, indexed by id and by primary-field value.
    let records = fetch_records(ctx).await?;
    let by_id: HashMap<&str, &AirtableRecord> =
        records.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut by_primary: HashMap<String, &AirtableRecord> = HashMap::new();
    if let Some(ref primary) = primary_name {
        for record in &records {
            let key = record
                .field(primary)
                .map(value_display)
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            if !key.is_empty() {
                by_primary.entry(key).or_insert(record);
            }
        }
    }

    // Identity matching: by id, then by primary field.
    let mut to_create: Vec<(usize, Map<String, Value>, SheetRow)> = Vec::new();
    let mut to_update: Vec<(String, Map<String, Value>, SheetRow)> = Vec::new();
    let mut unchanged: Vec<(String, SheetRow)> = Vec::new();
    let mut write_back: Vec<(usize, String)> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for p in parsed {
        let matched: Option<&AirtableRecord> = match &p.record_id {
            Some(id) => match by_id.get(id.as_str()) {
                Some(record) => Some(record),
                None => {
                    report.warn(format!(
                        "row {}: id {id} no longer exists, treating as new",
                        p.a1_row
                    ));
                    None
                }
            },
            None => primary_name.as_ref().and_then(|primary| {
                let key = p
                    .fields
                    .get(primary)
                    .map(value_display)
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase();
                let recovered = by_primary.get(&key).copied();
                if let Some(record) = recovered {
                    write_back.push((p.a1_row, record.id.clone()));
                }
                recovered
            }),
        };

        match matched {
            Some(record) => {
                seen_ids.insert(record.id.clone());
                if crate::conflict::has_record_changed(record, &p.fields) {
                    to_update.push((record.id.clone(), p.fields, p.row));
                } else {
                    unchanged.push((record.id.clone(), p.row));
                }
            }
            None => to_create.push((p.a1_row, p.fields, p.row)),
        }
    }

    let unmatched: Vec<&AirtableRecord> = records
        .iter()
        .filter(|r| !seen_ids.contains(&r.id))
        .collect();
    let mut to_delete: Vec<String> = Vec::new();
    if config.delete_extras {
        to_delete = unmatched.iter().map(|r| r.id.clone()).collect();
    } else if !unmatched.is_empty() {
        report.warn(format!(
            "{} record(s) have no matching sheet row and were retained",
            unmatched.len()
        ));
    }

    // Apply Airtable mutations in provider-sized batches.
    let mut advanced: Vec<(String, String, SheetRow)> = Vec::new();
    for (id, row) in unchanged {
        let content = hash_record_fields(&by_id[id.as_str()].fields);
        advanced.push((id, content, row));
    }

    'creates: for batch in batch_operations(to_create, config.airtable_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before create batch"));
            break 'creates;
        }
        let fields: Vec<Map<String, Value>> = batch.iter().map(|(_, f, _)| f.clone()).collect();
        match invoke(
            || {
                ctx.airtable.create_records(
                    ctx.airtable_token,
                    &config.airtable_base_id,
                    &config.airtable_table_id,
                    &fields,
                )
            },
            &ctx.invoke_opts("create_records"),
            ctx.cancel,
        )
        .await
        {
            Ok(created) => {
                report.added += created.len();
                for (record, (a1_row, written, row)) in created.into_iter().zip(batch) {
                    write_back.push((a1_row, record.id.clone()));
                    advanced.push((record.id, hash_record_fields(&written), row));
                }
            }
            Err(e) => {
                let err = SyncError::from_write_failure(&e);
                if strict {
                    return Err(err);
                }
                report.error(err);
            }
        }
    }

    'updates: for batch in batch_operations(to_update, config.airtable_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before update batch"));
            break 'updates;
        }
        let updates: Vec<(String, Map<String, Value>)> = batch
            .iter()
            .map(|(id, f, _)| (id.clone(), f.clone()))
            .collect();
        match invoke(
            || {
                ctx.airtable.update_records(
                    ctx.airtable_token,
                    &config.airtable_base_id,
                    &config.airtable_table_id,
                    &updates,
                )
            },
            &ctx.invoke_opts("update_records"),
            ctx.cancel,
        )
        .await
        {
            Ok(()) => {
                report.updated += batch.len();
                for (id, written, row) in batch {
                    let mut merged = by_id[id.as_str()].fields.clone();
                    for (k, v) in written {
                        merged.insert(k, v);
                    }
                    advanced.push((id, hash_record_fields(&merged), row));
                }
            }
            Err(e) => {
                let err = SyncError::from_write_failure(&e);
                if strict {
                    return Err(err);
                }
                report.error(err);
            }
        }
    }

    let mut deleted_ids: Vec<String> = Vec::new();
    'deletes: for batch in batch_operations(to_delete, config.airtable_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before delete batch"));
            break 'deletes;
        }
        match invoke(
            || {
                ctx.airtable.delete_records(
                    ctx.airtable_token,
                    &config.airtable_base_id,
                    &config.airtable_table_id,
                    &batch,
                )
            },
            &ctx.invoke_opts("delete_records"),
            ctx.cancel,
        )
        .await
        {
            Ok(()) => {
                report.deleted += batch.len();
                deleted_ids.extend(batch);
            }
            Err(e) => {
                let err = SyncError::from_write_failure(&e);
                if strict {
                    return Err(err);
                }
                report.error(err);
            }
        }
    }

    // Id write-back. Failures are warnings only: the next run recovers the
    // row through primary-field matching.
    write_back_ids(ctx, report, &write_back, sheet_id).await;

    // Advance state for everything that converged.
    for (id, content_hash, row) in advanced {
        let sheet_hash = hash_sheet_row(&row, id_col);
        state.upsert(state_entry(&id, content_hash, sheet_hash));
    }
    for id in deleted_ids {
        state.remove(&id);
    }

    Ok(())
}

/// Write record ids into the id-column of their originating rows, in small
/// groups with a pause between them, then hide the column.
pub(super) async fn write_back_ids(
    ctx: &RunContext<'_>,
    report: &mut RunReport,
    pairs: &[(usize, String)],
    sheet_id: i64,
) {
    if pairs.is_empty() {
        return;
    }
    let config = ctx.config;
    let letter = column_number_to_letter(config.id_column_index + 1);

    for (group_idx, group) in pairs.chunks(WRITE_BACK_GROUP).enumerate() {
        if group_idx > 0 {
            tokio::time::sleep(WRITE_BACK_PAUSE).await;
        }
        for (a1_row, record_id) in group {
            let range = format!("{letter}{a1_row}:{letter}{a1_row}");
            let values = vec![vec![CellValue::text(record_id.clone())]];
            if let Err(e) = invoke(
                || {
                    ctx.sheets.update_sheet_data(
                        ctx.sheets_token,
                        &config.spreadsheet_id,
                        &config.sheet,
                        &range,
                        &values,
                    )
                },
                &ctx.invoke_opts("write_back_id"),
                ctx.cancel,
            )
            .await
            {
                report.warn(format!(
                    "row {a1_row}: failed to write back record id {record_id}: {e}"
                ));
            }
        }
    }

    if let Err(e) = invoke(
        || {
            ctx.sheets.hide_column(
                ctx.sheets_token,
                &config.spreadsheet_id,
                sheet_id,
                config.id_column_index,
            )
        },
        &ctx.invoke_opts("hide_column"),
        ctx.cancel,
    )
    .await
    {
        report.warn(format!("failed to hide id column: {e}"));
    }
}

fn value_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
