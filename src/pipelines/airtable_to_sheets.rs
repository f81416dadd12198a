//! One-way pipeline: Airtable records → sheet rows.

use std::collections::{HashMap, HashSet};

use crate::clients::sheets::column_number_to_letter;
use crate::config::ValidationMode;
use crate::error::SyncError;
use crate::field_mapper::record_to_row;
use crate::hashing::{hash_record_fields, hash_sheet_row};
use crate::invoker::{batch_operations, invoke};
use crate::models::outcome::RunReport;
use crate::models::record::AirtableRecord;
use crate::models::sheet::{CellValue, SheetRow, are_rows_equal};
use crate::models::state::SyncState;
use crate::validator::sanitize_sheet_row;

use super::{
    RunContext, descending_delete_runs, fetch_range, fetch_records, fetch_table_schema,
    preload_linked_tables, read_columns, state_entry,
};

pub async fn run(
    ctx: &RunContext<'_>,
    report: &mut RunReport,
    state: &mut SyncState,
) -> Result<(), SyncError> {
    let config = ctx.config;
    let strict = config.validation_mode == ValidationMode::Strict;
    let id_col = config.id_column_index;

    // Fetch + transform.
    let records = fetch_records(ctx).await?;
    report.total = records.len();
    let schema = fetch_table_schema(ctx).await?;
    preload_linked_tables(ctx, &schema, report).await?;
    let link = ctx.link_context();
    let columns = read_columns(config, &schema);

    let mut planned: Vec<(AirtableRecord, SheetRow)> = Vec::with_capacity(records.len());
    for (i, record) in records.into_iter().enumerate() {
        let (mut row, warnings) = record_to_row(&record, &columns, link.as_ref()).await;
        for w in warnings {
            report.warn(format!("record {}: {w}", record.id));
        }
        if row.len() <= id_col {
            row.resize(id_col + 1, CellValue::Empty);
        }
        let issues = sanitize_sheet_row(&mut row, i);
        for issue in issues {
            let err = SyncError::validation(format!(
                "{}: value truncated ({})",
                issue.field_name, issue.sampled_value
            ))
            .with_record(record.id.clone());
            if strict {
                return Err(err);
            }
            report.error(err);
        }
        row[id_col] = CellValue::text(record.id.clone());
        planned.push((record, row));
    }

    // Current sheet contents.
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

    let header_offset = if config.skip_header_row { 1 } else { 0 };
    let data_rows: &[SheetRow] = if sheet_rows.len() > header_offset {
        &sheet_rows[header_offset..]
    } else {
        &[]
    };

    // Index existing rows by the id-column.
    let mut existing: HashMap<String, (usize, &SheetRow)> = HashMap::new();
    let mut orphan_rows = 0usize;
    for (i, row) in data_rows.iter().enumerate() {
        let id = row
            .get(id_col)
            .map(|c| c.as_trimmed_str())
            .unwrap_or_default();
        if id.is_empty() {
            if row.iter().any(|c| !c.is_empty()) {
                orphan_rows += 1;
            }
        } else {
            existing.insert(id, (i, row));
        }
    }

    // Diff.
    let airtable_ids: HashSet<&str> = planned.iter().map(|(r, _)| r.id.as_str()).collect();
    let mut to_add: Vec<(String, SheetRow)> = Vec::new();
    let mut to_update: Vec<(usize, String, SheetRow)> = Vec::new();
    let mut unchanged: Vec<String> = Vec::new();
    for (record, row) in &planned {
        match existing.get(record.id.as_str()) {
            None => to_add.push((record.id.clone(), row.clone())),
            Some((data_idx, current)) => {
                if are_rows_equal(row, current) {
                    unchanged.push(record.id.clone());
                } else {
                    let a1_row = data_idx + header_offset + 1;
                    to_update.push((a1_row, record.id.clone(), row.clone()));
                }
            }
        }
    }

    let mut to_delete: Vec<(usize, String)> = Vec::new();
    let stale: Vec<(&String, usize)> = existing
        .iter()
        .filter(|(id, _)| !airtable_ids.contains(id.as_str()))
        .map(|(id, (data_idx, _))| (id, *data_idx))
        .collect();
    if config.delete_extras {
        for (id, data_idx) in stale {
            to_delete.push((data_idx + header_offset, id.clone()));
        }
    } else if !stale.is_empty() {
        report.warn(format!(
            "{} sheet row(s) have no matching record and were retained",
            stale.len()
        ));
    }
    if orphan_rows > 0 {
        report.warn(format!("{orphan_rows} sheet row(s) without a record id were retained"));
    }

    // Apply.
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

    let mut advanced: HashSet<String> = unchanged.iter().cloned().collect();
    let range_letter = column_number_to_letter(id_col + 1);
    let first_use = state.is_first_run() || !to_add.is_empty();

    'updates: for batch in batch_operations(to_update, config.sheets_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before update batch"));
            break 'updates;
        }
        for (a1_row, record_id, row) in batch {
            let range = format!("A{a1_row}:{range_letter}{a1_row}");
            let values = vec![row];
            match invoke(
                || {
                    ctx.sheets.update_sheet_data(
                        ctx.sheets_token,
                        &config.spreadsheet_id,
                        &config.sheet,
                        &range,
                        &values,
                    )
                },
                &ctx.invoke_opts("update_sheet_data"),
                ctx.cancel,
            )
            .await
            {
                Ok(()) => {
                    report.updated += 1;
                    advanced.insert(record_id);
                }
                Err(e) => {
                    let err = SyncError::from_write_failure(&e).with_record(record_id);
                    if strict {
                        return Err(err);
                    }
                    report.error(err);
                }
            }
        }
    }

    'appends: for batch in batch_operations(to_add, config.sheets_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before append batch"));
            break 'appends;
        }
        let (ids, rows): (Vec<String>, Vec<SheetRow>) = batch.into_iter().unzip();
        match invoke(
            || {
                ctx.sheets.append_rows(
                    ctx.sheets_token,
                    &config.spreadsheet_id,
                    &config.sheet,
                    &rows,
                )
            },
            &ctx.invoke_opts("append_rows"),
            ctx.cancel,
        )
        .await
        {
            Ok(()) => {
                report.added += ids.len();
                advanced.extend(ids);
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

    let delete_ids: Vec<String> = to_delete.iter().map(|(_, id)| id.clone()).collect();
    let runs = descending_delete_runs(to_delete.into_iter().map(|(idx, _)| idx).collect());
    let mut deletes_ok = true;
    for (start, count) in runs {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before delete batch"));
            deletes_ok = false;
            break;
        }
        match invoke(
            || {
                ctx.sheets.delete_rows(
                    ctx.sheets_token,
                    &config.spreadsheet_id,
                    sheet_id,
                    start,
                    count,
                )
            },
            &ctx.invoke_opts("delete_rows"),
            ctx.cancel,
        )
        .await
        {
            Ok(()) => report.deleted += count,
            Err(e) => {
                let err = SyncError::from_write_failure(&e);
                if strict {
                    return Err(err);
                }
                report.error(err);
                deletes_ok = false;
            }
        }
    }

    if first_use {
        if let Err(e) = invoke(
            || ctx.sheets.hide_column(ctx.sheets_token, &config.spreadsheet_id, sheet_id, id_col),
            &ctx.invoke_opts("hide_column"),
            ctx.cancel,
        )
        .await
        {
            report.warn(format!("failed to hide id column: {e}"));
        }
    }

    // Advance state only for rows that actually converged.
    for (record, row) in &planned {
        if advanced.contains(&record.id) {
            state.upsert(state_entry(
                &record.id,
                hash_record_fields(&record.fields),
                hash_sheet_row(row, id_col),
            ));
        }
    }
    if deletes_ok {
        for id in delete_ids {
            state.remove(&id);
        }
    }

    Ok(())
}
