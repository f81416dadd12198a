//! Bidirectional orchestration: one conflict-aware plan per invocation.
//!
//! All actions are computed up front from the two snapshots and the
//! persisted state; Airtable mutations run first, then sheet mutations, then
//! id write-back, and the state is advanced once at the end. Nothing is
//! re-fetched mid-run, so row indices stay valid for the whole invocation.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::clients::sheets::column_number_to_letter;
use crate::config::{ConflictPolicy, ValidationMode};
use crate::conflict::{ClassifierInput, classify, has_record_changed, resolve_conflicts};
use crate::error::SyncError;
use crate::field_mapper::{record_to_row, row_to_fields};
use crate::hashing::{hash_record_fields, hash_sheet_row};
use crate::invoker::{batch_operations, invoke};
use crate::models::conflict::{ConflictKind, ResolutionAction};
use crate::models::outcome::RunReport;
use crate::models::record::AirtableRecord;
use crate::models::sheet::{CellValue, SheetRow, are_rows_equal};
use crate::models::state::SyncState;
use crate::validator::{sanitize_airtable_fields, sanitize_sheet_row};

use super::sheets_to_airtable::write_back_ids;
use super::{
    RunContext, descending_delete_runs, fetch_range, fetch_records, fetch_table_schema,
    preload_linked_tables, read_columns, state_entry, write_columns,
};

struct SheetSnapshot {
    /// record id → (1-based row, captured cells)
    by_id: HashMap<String, (usize, SheetRow)>,
    /// rows with data but no id yet
    without_id: Vec<(usize, SheetRow)>,
}

pub async fn run(
    ctx: &RunContext<'_>,
    report: &mut RunReport,
    state: &mut SyncState,
) -> Result<(), SyncError> {
    let config = ctx.config;
    let strict = config.validation_mode == ValidationMode::Strict;
    let id_col = config.id_column_index;

    // Snapshot both sides once.
    let records = fetch_records(ctx).await?;
    let schema = fetch_table_schema(ctx).await?;
    preload_linked_tables(ctx, &schema, report).await?;
    let link = ctx.link_context();
    let read_cols = read_columns(config, &schema);
    let write_cols = write_columns(config, &schema);
    let primary_name = schema.primary_field().map(|f| f.name.clone());

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

    let header_offset = if config.skip_header_row { 1 } else { 0 };
    let mut snapshot = SheetSnapshot {
        by_id: HashMap::new(),
        without_id: Vec::new(),
    };
    for (i, row) in sheet_rows.iter().enumerate().skip(header_offset) {
        let a1_row = i + 1;
        let id = row
            .get(id_col)
            .map(|c| c.as_trimmed_str())
            .unwrap_or_default();
        let has_data = row
            .iter()
            .enumerate()
            .any(|(col, c)| col != id_col && !c.is_empty());
        if !id.is_empty() {
            snapshot.by_id.insert(id, (a1_row, row.clone()));
        } else if has_data {
            snapshot.without_id.push((a1_row, row.clone()));
        }
    }

    let by_id: HashMap<&str, &AirtableRecord> =
        records.iter().map(|r| (r.id.as_str(), r)).collect();
    let airtable_hashes: HashMap<String, String> = records
        .iter()
        .map(|r| (r.id.clone(), hash_record_fields(&r.fields)))
        .collect();
    let sheet_hashes: HashMap<String, String> = snapshot
        .by_id
        .iter()
        .map(|(id, (_, row))| (id.clone(), hash_sheet_row(row, id_col)))
        .collect();
    report.total = airtable_hashes.len() + snapshot.without_id.len();

    // Classify and resolve.
    let classification = classify(&ClassifierInput {
        airtable_hashes: &airtable_hashes,
        sheet_hashes: &sheet_hashes,
        previous: state,
    });
    report.conflicts = classification.conflicts.len();
    let resolutions = resolve_conflicts(&classification.conflicts, config.conflict_policy);
    for r in &resolutions {
        report.warn(format!("conflict on {}: {}", r.record_id, r.reason));
    }

    // Derive the full action plan before touching either side.
    let mut push_to_sheet: Vec<String> = classification.airtable_changed.clone();
    let mut push_to_airtable: Vec<String> = classification.sheets_changed.clone();
    let mut sheet_row_deletes: Vec<String> = classification.deleted_in_airtable.clone();
    let mut record_deletes: Vec<String> = classification.deleted_in_sheets.clone();
    let mut restore_to_sheet: Vec<String> = Vec::new();

    push_to_sheet.extend(classification.new_in_airtable.iter().cloned());

    for id in &classification.both_new {
        match config.conflict_policy {
            ConflictPolicy::SheetsWins => push_to_airtable.push(id.clone()),
            _ => push_to_sheet.push(id.clone()),
        }
    }

    let kind_of: HashMap<&str, ConflictKind> = classification
        .conflicts
        .iter()
        .map(|c| (c.record_id.as_str(), c.kind))
        .collect();
    for r in &resolutions {
        let kind = kind_of[r.record_id.as_str()];
        match (r.action, kind) {
            (ResolutionAction::UseAirtable, ConflictKind::DeletedInSheets) => {
                restore_to_sheet.push(r.record_id.clone());
            }
            (ResolutionAction::UseAirtable, _) => push_to_sheet.push(r.record_id.clone()),
            (ResolutionAction::UseSheets, _) => push_to_airtable.push(r.record_id.clone()),
            (ResolutionAction::Delete, ConflictKind::DeletedInAirtable) => {
                sheet_row_deletes.push(r.record_id.clone());
            }
            (ResolutionAction::Delete, _) => record_deletes.push(r.record_id.clone()),
            (ResolutionAction::Skip, _) => {}
        }
    }

    // Transform Airtable-side content into rows.
    let mut sheet_updates: Vec<(usize, String, SheetRow)> = Vec::new();
    let mut sheet_appends: Vec<(String, SheetRow)> = Vec::new();
    let mut already_synced: Vec<(String, SheetRow)> = Vec::new();
    for id in push_to_sheet.iter().chain(restore_to_sheet.iter()) {
        let Some(record) = by_id.get(id.as_str()) else { continue };
        let (mut row, warnings) = record_to_row(record, &read_cols, link.as_ref()).await;
        for w in warnings {
            report.warn(format!("record {id}: {w}"));
        }
        if row.len() <= id_col {
            row.resize(id_col + 1, CellValue::Empty);
        }
        for issue in sanitize_sheet_row(&mut row, 0) {
            let err = SyncError::validation(format!(
                "{}: value truncated ({})",
                issue.field_name, issue.sampled_value
            ))
            .with_record(id.clone());
            if strict {
                return Err(err);
            }
            report.error(err);
        }
        row[id_col] = CellValue::text(id.clone());
        match snapshot.by_id.get(id) {
            Some((_, current)) if are_rows_equal(&row, current) => {
                already_synced.push((id.clone(), row));
            }
            Some((a1_row, _)) => sheet_updates.push((*a1_row, id.clone(), row)),
            None => sheet_appends.push((id.clone(), row)),
        }
    }

    // Transform sheet-side content into field maps.
    let mut at_updates: Vec<(String, Map<String, Value>, SheetRow)> = Vec::new();
    let mut at_creates: Vec<(usize, Map<String, Value>, SheetRow)> = Vec::new();
    let mut write_back: Vec<(usize, String)> = Vec::new();
    let mut unchanged_rows: Vec<(String, SheetRow)> = Vec::new();

    for id in &push_to_airtable {
        let Some((a1_row, row)) = snapshot.by_id.get(id) else { continue };
        match convert_row(ctx, report, row, *a1_row, &write_cols, strict).await? {
            Some(fields) => match by_id.get(id.as_str()) {
                Some(record) if !has_record_changed(record, &fields) => {
                    // Only unmapped columns moved; remember the new row shape.
                    unchanged_rows.push((id.clone(), row.clone()));
                }
                Some(_) => at_updates.push((id.clone(), fields, row.clone())),
                // The record is gone; recreate it and adopt the new id.
                None => at_creates.push((*a1_row, fields, row.clone())),
            },
            None => continue,
        }
    }

    // Sheet ids unknown to both Airtable and the state are rows whose id went
    // stale; recreate their records.
    for id in &classification.new_in_sheets {
        let Some((a1_row, row)) = snapshot.by_id.get(id) else { continue };
        if let Some(fields) =
            convert_row(ctx, report, row, *a1_row, &write_cols, strict).await?
        {
            report.warn(format!("row {a1_row}: id {id} no longer exists, recreating"));
            at_creates.push((*a1_row, fields, row.clone()));
        }
    }

    // Rows without an id: recover identity via the primary field, create
    // otherwise.
    for (a1_row, row) in &snapshot.without_id {
        let Some(fields) =
            convert_row(ctx, report, row, *a1_row, &write_cols, strict).await?
        else {
            continue;
        };
        let matched = primary_name.as_ref().and_then(|primary| {
            let key = fields
                .get(primary)
                .map(value_display)
                .unwrap_or_default()
                .trim()
                .to_lowercase();
            if key.is_empty() {
                return None;
            }
            records.iter().find(|r| {
                r.field(primary)
                    .map(value_display)
                    .unwrap_or_default()
                    .trim()
                    .to_lowercase()
                    == key
            })
        });
        match matched {
            Some(record) => {
                write_back.push((*a1_row, record.id.clone()));
                if has_record_changed(record, &fields) {
                    at_updates.push((record.id.clone(), fields, row.clone()));
                } else {
                    unchanged_rows.push((record.id.clone(), row.clone()));
                }
            }
            None => at_creates.push((*a1_row, fields, row.clone())),
        }
    }

    // Execute: Airtable first, then the sheet, then write-back.
    let mut advanced: Vec<(String, String, String)> = Vec::new(); // (id, content, sheet)
    for id in &classification.no_change {
        advanced.push((
            id.clone(),
            airtable_hashes[id].clone(),
            sheet_hashes[id].clone(),
        ));
    }
    for (id, row) in unchanged_rows.iter().chain(already_synced.iter()) {
        advanced.push((
            id.clone(),
            airtable_hashes[id].clone(),
            hash_sheet_row(row, id_col),
        ));
    }

    'creates: for batch in batch_operations(at_creates, config.airtable_batch()) {
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
                    advanced.push((
                        record.id,
                        hash_record_fields(&written),
                        hash_sheet_row(&row, id_col),
                    ));
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

    'at_updates: for batch in batch_operations(at_updates, config.airtable_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before update batch"));
            break 'at_updates;
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
                    advanced.push((
                        id,
                        hash_record_fields(&merged),
                        hash_sheet_row(&row, id_col),
                    ));
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

    let mut removed: Vec<String> = classification.vanished.clone();
    'rec_deletes: for batch in batch_operations(record_deletes, config.airtable_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before delete batch"));
            break 'rec_deletes;
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
                removed.extend(batch);
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

    // Sheet mutations.
    let range_letter = column_number_to_letter(id_col + 1);
    'sheet_updates: for batch in batch_operations(sheet_updates, config.sheets_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before sheet update batch"));
            break 'sheet_updates;
        }
        for (a1_row, id, row) in batch {
            let range = format!("A{a1_row}:{range_letter}{a1_row}");
            let sheet_hash = hash_sheet_row(&row, id_col);
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
                    advanced.push((id.clone(), airtable_hashes[&id].clone(), sheet_hash));
                }
                Err(e) => {
                    let err = SyncError::from_write_failure(&e).with_record(id);
                    if strict {
                        return Err(err);
                    }
                    report.error(err);
                }
            }
        }
    }

    'sheet_appends: for batch in batch_operations(sheet_appends, config.sheets_batch()) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before sheet append batch"));
            break 'sheet_appends;
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
                for (id, row) in ids.into_iter().zip(rows) {
                    advanced.push((
                        id.clone(),
                        airtable_hashes[&id].clone(),
                        hash_sheet_row(&row, id_col),
                    ));
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

    let delete_indices: Vec<usize> = sheet_row_deletes
        .iter()
        .filter_map(|id| snapshot.by_id.get(id).map(|(a1_row, _)| a1_row - 1))
        .collect();
    let mut sheet_deletes_ok = true;
    for (start, count) in descending_delete_runs(delete_indices) {
        if ctx.cancel.is_cancelled() {
            report.error(SyncError::cancelled("run cancelled before sheet delete batch"));
            sheet_deletes_ok = false;
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
                sheet_deletes_ok = false;
            }
        }
    }
    if sheet_deletes_ok {
        removed.extend(sheet_row_deletes);
    }

    write_back_ids(ctx, report, &write_back, sheet_id).await;

    // Single state advance at the end of the run.
    for (id, content_hash, sheet_hash) in advanced {
        state.upsert(state_entry(&id, content_hash, sheet_hash));
    }
    for id in removed {
        state.remove(&id);
    }

    Ok(())
}

/// Convert one sheet row to a field map, honoring the validation mode.
/// Returns `None` when the row was skipped in lenient mode.
async fn convert_row(
    ctx: &RunContext<'_>,
    report: &mut RunReport,
    row: &SheetRow,
    a1_row: usize,
    write_cols: &[(crate::models::record::FieldSchema, usize)],
    strict: bool,
) -> Result<Option<Map<String, Value>>, SyncError> {
    let converted = row_to_fields(
        row,
        write_cols,
        ctx.link_context().as_ref(),
        ctx.config.validation_mode,
    )
    .await;
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
        return Ok(None);
    }
    let mut fields = converted.fields;
    for issue in sanitize_airtable_fields(&mut fields, a1_row) {
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
    Ok(Some(fields))
}

fn value_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}
