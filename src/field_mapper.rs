//! Bidirectional value conversion between Airtable field types and sheet
//! cells.
//!
//! Reading (record → cell) is total: every field type renders to something,
//! with warnings where fidelity is lost. Writing (cell → field value) is
//! partial: read-only and unsupported types are skipped with a warning, and
//! malformed values produce per-field errors that the pipeline resolves
//! according to the validation mode.

use serde_json::{Map, Value, json};

use crate::clients::airtable::AirtableClient;
use crate::config::ValidationMode;
use crate::error::ErrorKind;
use crate::models::record::{AirtableRecord, FieldSchema, FieldType};
use crate::models::sheet::{CellValue, SheetRow, canonical_number};
use crate::resolver::LinkedRecordResolver;
use crate::tokens::AccessToken;
use crate::validator::{
    ValidationCode, is_valid_email, is_valid_number, is_valid_url, parse_date_lenient,
};

/// Everything linked-record conversion needs from the run.
pub struct LinkContext<'a> {
    pub resolver: &'a LinkedRecordResolver,
    pub client: &'a dyn AirtableClient,
    pub token: &'a AccessToken,
    pub base_id: &'a str,
    pub create_missing: bool,
}

/// A per-field conversion failure. The pipeline decides whether it skips the
/// row (lenient) or terminates the run (strict).
#[derive(Debug, Clone)]
pub struct ConvertError {
    pub kind: ErrorKind,
    pub code: Option<ValidationCode>,
    pub message: String,
}

impl ConvertError {
    fn validation(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            code: Some(code),
            message: message.into(),
        }
    }

    fn linked(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::LinkedRecord,
            code: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CellOutcome {
    pub cell: CellValue,
    pub warnings: Vec<String>,
}

impl CellOutcome {
    fn plain(cell: CellValue) -> Self {
        Self {
            cell,
            warnings: Vec::new(),
        }
    }

    fn warned(cell: CellValue, warning: String) -> Self {
        Self {
            cell,
            warnings: vec![warning],
        }
    }
}

#[derive(Debug, Default)]
pub struct FieldOutcome {
    /// `None` means the field is omitted from the write payload.
    pub value: Option<Value>,
    pub warnings: Vec<String>,
}

impl FieldOutcome {
    fn skip() -> Self {
        Self::default()
    }

    fn skip_warned(warning: String) -> Self {
        Self {
            value: None,
            warnings: vec![warning],
        }
    }

    fn value(v: Value) -> Self {
        Self {
            value: Some(v),
            warnings: Vec::new(),
        }
    }
}

/// Render one Airtable field value as a sheet cell.
pub async fn airtable_to_cell(
    value: Option<&Value>,
    field: &FieldSchema,
    link: Option<&LinkContext<'_>>,
) -> CellOutcome {
    let value = match value {
        None | Some(Value::Null) => return CellOutcome::plain(CellValue::Empty),
        Some(v) => v,
    };

    match &field.field_type {
        FieldType::Checkbox => {
            let checked = value.as_bool().unwrap_or(false);
            CellOutcome::plain(CellValue::text(if checked { "TRUE" } else { "FALSE" }))
        }
        FieldType::Number
        | FieldType::Currency
        | FieldType::Percent
        | FieldType::Duration
        | FieldType::Rating
        | FieldType::AutoNumber
        | FieldType::Count => match value.as_f64() {
            Some(n) => CellOutcome::plain(CellValue::Number(n)),
            None => CellOutcome::warned(
                CellValue::text(display_value(value)),
                format!("field {}: non-numeric value in numeric field", field.name),
            ),
        },
        FieldType::Date => match value.as_str().and_then(parse_date_lenient) {
            Some(dt) => CellOutcome::plain(CellValue::text(dt.format("%Y-%m-%d").to_string())),
            None => CellOutcome::warned(
                CellValue::Empty,
                format!("field {}: unparseable date {value}", field.name),
            ),
        },
        FieldType::DateTime | FieldType::CreatedTime | FieldType::LastModifiedTime => {
            match value.as_str().and_then(parse_date_lenient) {
                Some(dt) => CellOutcome::plain(CellValue::text(
                    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                )),
                None => CellOutcome::warned(
                    CellValue::Empty,
                    format!("field {}: unparseable timestamp {value}", field.name),
                ),
            }
        }
        FieldType::SingleSelect => CellOutcome::plain(CellValue::text(choice_name(value))),
        FieldType::MultipleSelects => {
            let names: Vec<String> = value
                .as_array()
                .map(|items| items.iter().map(choice_name).collect())
                .unwrap_or_else(|| vec![choice_name(value)]);
            CellOutcome::plain(CellValue::text(names.join(", ")))
        }
        FieldType::MultipleRecordLinks => linked_to_cell(value, field, link).await,
        FieldType::MultipleAttachments => {
            let urls: Vec<String> = value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|a| a.get("url").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            CellOutcome::plain(CellValue::text(urls.join(", ")))
        }
        FieldType::CreatedBy
        | FieldType::LastModifiedBy
        | FieldType::SingleCollaborator => {
            CellOutcome::plain(CellValue::text(collaborator_name(value)))
        }
        FieldType::MultipleCollaborators => {
            let names: Vec<String> = value
                .as_array()
                .map(|items| items.iter().map(collaborator_name).collect())
                .unwrap_or_default();
            CellOutcome::plain(CellValue::text(names.join(", ")))
        }
        FieldType::Barcode => CellOutcome::plain(CellValue::text(
            value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )),
        FieldType::Button => CellOutcome::plain(CellValue::text(
            value
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )),
        FieldType::Formula | FieldType::Rollup | FieldType::Lookup => {
            CellOutcome::plain(computed_to_cell(value))
        }
        FieldType::SingleLineText
        | FieldType::MultilineText
        | FieldType::RichText
        | FieldType::Email
        | FieldType::Url
        | FieldType::PhoneNumber => match value {
            Value::String(s) => CellOutcome::plain(CellValue::text(s.clone())),
            other => CellOutcome::plain(CellValue::text(display_value(other))),
        },
        FieldType::Unknown(name) => CellOutcome::warned(
            CellValue::text(display_value(value)),
            format!(
                "field {}: unknown type {name}, coerced to text",
                field.name
            ),
        ),
    }
}

async fn linked_to_cell(
    value: &Value,
    field: &FieldSchema,
    link: Option<&LinkContext<'_>>,
) -> CellOutcome {
    let ids = link_ids(value);
    if ids.is_empty() {
        return CellOutcome::plain(CellValue::Empty);
    }
    let (ctx, table) = match (link, field.linked_table_id()) {
        (Some(ctx), Some(table)) => (ctx, table),
        _ => {
            return CellOutcome::warned(
                CellValue::text(ids.join(", ")),
                format!("field {}: linked records shown as ids", field.name),
            );
        }
    };
    match ctx
        .resolver
        .resolve_ids_to_names(ctx.client, ctx.token, ctx.base_id, table, &ids)
        .await
    {
        Ok(resolved) => {
            let mut warnings = Vec::new();
            let names: Vec<String> = ids
                .iter()
                .map(|id| {
                    resolved
                        .names
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| id.clone())
                })
                .collect();
            if !resolved.missing.is_empty() {
                warnings.push(format!(
                    "field {}: {} linked record(s) not found, ids kept",
                    field.name,
                    resolved.missing.len()
                ));
            }
            CellOutcome {
                cell: CellValue::text(names.join(", ")),
                warnings,
            }
        }
        Err(e) => CellOutcome::warned(
            CellValue::text(ids.join(", ")),
            format!("field {}: linked table fetch failed ({e}), ids kept", field.name),
        ),
    }
}

/// Parse one sheet cell into an Airtable field value.
pub async fn cell_to_airtable(
    cell: &CellValue,
    field: &FieldSchema,
    link: Option<&LinkContext<'_>>,
    mode: ValidationMode,
) -> Result<FieldOutcome, ConvertError> {
    if field.field_type.is_read_only() {
        return Ok(if cell.is_empty() {
            FieldOutcome::skip()
        } else {
            FieldOutcome::skip_warned(format!(
                "field {}: read-only type, value not written",
                field.name
            ))
        });
    }
    if field.field_type.is_write_unsupported() {
        return Ok(if cell.is_empty() {
            FieldOutcome::skip()
        } else {
            FieldOutcome::skip_warned(format!(
                "field {}: unsupported write type, value not written",
                field.name
            ))
        });
    }
    if cell.is_empty() {
        return Ok(FieldOutcome::skip());
    }

    match &field.field_type {
        FieldType::Checkbox => {
            let text = cell.as_trimmed_str();
            match text.to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(FieldOutcome::value(json!(true))),
                "false" | "0" | "no" => Ok(FieldOutcome::value(json!(false))),
                other => Err(ConvertError::validation(
                    ValidationCode::InvalidBoolean,
                    format!("field {}: {other:?} is not a checkbox value", field.name),
                )),
            }
        }
        FieldType::Number
        | FieldType::Currency
        | FieldType::Percent
        | FieldType::Duration
        | FieldType::Rating => {
            let n = match cell {
                CellValue::Number(n) => *n,
                other => other.as_trimmed_str().parse::<f64>().map_err(|_| {
                    ConvertError::validation(
                        ValidationCode::InvalidNumber,
                        format!(
                            "field {}: {:?} is not a number",
                            field.name,
                            other.as_trimmed_str()
                        ),
                    )
                })?,
            };
            if !is_valid_number(n) {
                return Err(ConvertError::validation(
                    ValidationCode::InvalidNumber,
                    format!("field {}: non-finite number", field.name),
                ));
            }
            Ok(FieldOutcome::value(json!(n)))
        }
        FieldType::Date => {
            let text = cell.as_trimmed_str();
            match parse_date_lenient(&text) {
                Some(dt) => Ok(FieldOutcome::value(json!(dt.format("%Y-%m-%d").to_string()))),
                None => Err(ConvertError::validation(
                    ValidationCode::InvalidDate,
                    format!("field {}: {text:?} is not a date", field.name),
                )),
            }
        }
        FieldType::DateTime => {
            let text = cell.as_trimmed_str();
            match parse_date_lenient(&text) {
                Some(dt) => Ok(FieldOutcome::value(json!(
                    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
                ))),
                None => Err(ConvertError::validation(
                    ValidationCode::InvalidDate,
                    format!("field {}: {text:?} is not a timestamp", field.name),
                )),
            }
        }
        FieldType::SingleSelect => {
            let text = cell.as_trimmed_str();
            match match_choice(field, &text) {
                Some(canonical) => Ok(FieldOutcome::value(json!(canonical))),
                None if mode == ValidationMode::Strict => Err(ConvertError::validation(
                    ValidationCode::UnknownChoice,
                    format!("field {}: {text:?} is not a known choice", field.name),
                )),
                None => Ok(FieldOutcome {
                    value: Some(json!(text)),
                    warnings: vec![format!(
                        "field {}: {text:?} is not a known choice, writing as-is",
                        field.name
                    )],
                }),
            }
        }
        FieldType::MultipleSelects => {
            let mut values = Vec::new();
            let mut warnings = Vec::new();
            for part in split_list(&cell.as_trimmed_str()) {
                match match_choice(field, &part) {
                    Some(canonical) => values.push(json!(canonical)),
                    None if mode == ValidationMode::Strict => {
                        return Err(ConvertError::validation(
                            ValidationCode::UnknownChoice,
                            format!("field {}: {part:?} is not a known choice", field.name),
                        ));
                    }
                    None => {
                        warnings.push(format!(
                            "field {}: {part:?} is not a known choice, writing as-is",
                            field.name
                        ));
                        values.push(json!(part));
                    }
                }
            }
            Ok(FieldOutcome {
                value: Some(Value::Array(values)),
                warnings,
            })
        }
        FieldType::MultipleRecordLinks => cell_to_links(cell, field, link, mode).await,
        FieldType::Email => {
            let text = cell.as_trimmed_str();
            let mut warnings = Vec::new();
            if !is_valid_email(&text) {
                warnings.push(format!(
                    "field {}: {text:?} does not look like an email address",
                    field.name
                ));
            }
            Ok(FieldOutcome {
                value: Some(json!(text)),
                warnings,
            })
        }
        FieldType::Url => {
            let text = cell.as_trimmed_str();
            let mut warnings = Vec::new();
            if !is_valid_url(&text) {
                warnings.push(format!("field {}: {text:?} is not a valid URL", field.name));
            }
            Ok(FieldOutcome {
                value: Some(json!(text)),
                warnings,
            })
        }
        FieldType::SingleLineText
        | FieldType::MultilineText
        | FieldType::RichText
        | FieldType::PhoneNumber => {
            let text = match cell {
                CellValue::Text(s) => s.clone(),
                other => other.as_trimmed_str(),
            };
            Ok(FieldOutcome::value(json!(text)))
        }
        FieldType::Unknown(name) => Ok(FieldOutcome {
            value: Some(json!(cell.as_trimmed_str())),
            warnings: vec![format!(
                "field {}: unknown type {name}, writing as text",
                field.name
            )],
        }),
        // Remaining types are covered by the read-only / unsupported guards.
        _ => Ok(FieldOutcome::skip()),
    }
}

async fn cell_to_links(
    cell: &CellValue,
    field: &FieldSchema,
    link: Option<&LinkContext<'_>>,
    mode: ValidationMode,
) -> Result<FieldOutcome, ConvertError> {
    let names = split_list(&cell.as_trimmed_str());
    if names.is_empty() {
        return Ok(FieldOutcome::skip());
    }
    // Cells that already hold record ids pass through untouched.
    if names.iter().all(|n| looks_like_record_id(n)) {
        let links: Vec<Value> = names.iter().map(|id| json!({ "id": id })).collect();
        return Ok(FieldOutcome::value(Value::Array(links)));
    }
    let (ctx, table) = match (link, field.linked_table_id()) {
        (Some(ctx), Some(table)) => (ctx, table),
        _ => {
            return Err(ConvertError::linked(format!(
                "field {}: linked-record resolution unavailable",
                field.name
            )));
        }
    };
    let resolved = ctx
        .resolver
        .resolve_names_to_ids(
            ctx.client,
            ctx.token,
            ctx.base_id,
            table,
            &names,
            ctx.create_missing,
        )
        .await
        .map_err(|e| {
            ConvertError::linked(format!(
                "field {}: linked table fetch failed: {e}",
                field.name
            ))
        })?;

    let mut warnings = Vec::new();
    if !resolved.missing.is_empty() {
        if mode == ValidationMode::Strict {
            return Err(ConvertError::linked(format!(
                "field {}: unresolved linked record(s): {}",
                field.name,
                resolved.missing.join(", ")
            )));
        }
        warnings.push(format!(
            "field {}: {} linked record(s) not found, dropped",
            field.name,
            resolved.missing.len()
        ));
    }
    let links: Vec<Value> = names
        .iter()
        .filter_map(|n| resolved.ids.get(n))
        .map(|id| json!({ "id": id }))
        .collect();
    Ok(FieldOutcome {
        value: Some(Value::Array(links)),
        warnings,
    })
}

/// Render a full record as a sheet row. The row covers exactly the mapped
/// columns; the caller widens it and fills the id-column.
pub async fn record_to_row(
    record: &AirtableRecord,
    columns: &[(FieldSchema, usize)],
    link: Option<&LinkContext<'_>>,
) -> (SheetRow, Vec<String>) {
    let width = columns.iter().map(|(_, i)| i + 1).max().unwrap_or(0);
    let mut row = vec![CellValue::Empty; width];
    let mut warnings = Vec::new();
    for (field, column) in columns {
        let outcome = airtable_to_cell(record.field(&field.name), field, link).await;
        row[*column] = outcome.cell;
        warnings.extend(outcome.warnings);
    }
    (row, warnings)
}

#[derive(Debug, Default)]
pub struct RowFields {
    pub fields: Map<String, Value>,
    pub errors: Vec<(String, ConvertError)>,
    pub warnings: Vec<String>,
}

/// Parse the mapped columns of one row into an Airtable field map.
pub async fn row_to_fields(
    row: &[CellValue],
    columns: &[(FieldSchema, usize)],
    link: Option<&LinkContext<'_>>,
    mode: ValidationMode,
) -> RowFields {
    let mut out = RowFields::default();
    for (field, column) in columns {
        let cell = row.get(*column).cloned().unwrap_or(CellValue::Empty);
        match cell_to_airtable(&cell, field, link, mode).await {
            Ok(outcome) => {
                out.warnings.extend(outcome.warnings);
                if let Some(value) = outcome.value {
                    out.fields.insert(field.name.clone(), value);
                }
            }
            Err(e) => out.errors.push((field.name.clone(), e)),
        }
    }
    out
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn looks_like_record_id(s: &str) -> bool {
    s.len() == 17 && s.starts_with("rec") && s[3..].chars().all(|c| c.is_ascii_alphanumeric())
}

/// Case-insensitive match against the field's choice list; returns the
/// canonical choice name. Fields without a choice list accept anything.
fn match_choice(field: &FieldSchema, text: &str) -> Option<String> {
    let choices = field.choices();
    if choices.is_empty() {
        return Some(text.to_string());
    }
    choices
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(text))
        .map(|c| c.name.clone())
}

fn link_ids(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(o) => o.get("id").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn choice_name(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Object(o) => o
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        other => display_value(other),
    }
}

fn collaborator_name(v: &Value) -> String {
    v.get("name")
        .or_else(|| v.get("email"))
        .or_else(|| v.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn computed_to_cell(value: &Value) -> CellValue {
    match value {
        Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
        Value::Bool(b) => CellValue::text(if *b { "TRUE" } else { "FALSE" }),
        Value::Array(items) => {
            CellValue::text(items.iter().map(display_value).collect::<Vec<_>>().join(", "))
        }
        other => CellValue::text(display_value(other)),
    }
}

fn display_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.as_f64().map(canonical_number).unwrap_or_else(|| n.to_string()),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, t: FieldType) -> FieldSchema {
        FieldSchema {
            id: format!("fld_{name}"),
            name: name.to_string(),
            field_type: t,
            options: None,
        }
    }

    fn select_field(name: &str, choices: &[&str]) -> FieldSchema {
        FieldSchema {
            id: format!("fld_{name}"),
            name: name.to_string(),
            field_type: FieldType::SingleSelect,
            options: Some(crate::models::record::FieldOptions {
                choices: choices
                    .iter()
                    .map(|c| crate::models::record::SelectChoice {
                        id: None,
                        name: c.to_string(),
                    })
                    .collect(),
                linked_table_id: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_checkbox_both_directions() {
        let f = field("Done", FieldType::Checkbox);
        let out = airtable_to_cell(Some(&json!(true)), &f, None).await;
        assert_eq!(out.cell, CellValue::text("TRUE"));

        for input in ["TRUE", "true", "1", "yes", "Yes"] {
            let out = cell_to_airtable(&CellValue::text(input), &f, None, ValidationMode::Lenient)
                .await
                .unwrap();
            assert_eq!(out.value, Some(json!(true)), "input {input}");
        }
        for input in ["FALSE", "0", "no"] {
            let out = cell_to_airtable(&CellValue::text(input), &f, None, ValidationMode::Lenient)
                .await
                .unwrap();
            assert_eq!(out.value, Some(json!(false)), "input {input}");
        }
        let err = cell_to_airtable(&CellValue::text("maybe"), &f, None, ValidationMode::Lenient)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(ValidationCode::InvalidBoolean));
    }

    #[tokio::test]
    async fn test_number_rejects_garbage() {
        let f = field("Age", FieldType::Number);
        let ok = cell_to_airtable(&CellValue::text("42.5"), &f, None, ValidationMode::Lenient)
            .await
            .unwrap();
        assert_eq!(ok.value, Some(json!(42.5)));
        let err = cell_to_airtable(&CellValue::text("forty"), &f, None, ValidationMode::Lenient)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(ValidationCode::InvalidNumber));
    }

    #[tokio::test]
    async fn test_date_lenient_formats() {
        let f = field("Due", FieldType::Date);
        for input in ["2026-03-01", "03/01/2026", "2026-03-01T00:00:00Z"] {
            let out = cell_to_airtable(&CellValue::text(input), &f, None, ValidationMode::Lenient)
                .await
                .unwrap();
            assert_eq!(out.value, Some(json!("2026-03-01")), "input {input}");
        }
        let err = cell_to_airtable(&CellValue::text("soon"), &f, None, ValidationMode::Lenient)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(ValidationCode::InvalidDate));
    }

    #[tokio::test]
    async fn test_datetime_written_as_iso() {
        let f = field("When", FieldType::DateTime);
        let out = airtable_to_cell(Some(&json!("2026-03-01T10:30:00.000Z")), &f, None).await;
        assert_eq!(out.cell, CellValue::text("2026-03-01T10:30:00Z"));
    }

    #[tokio::test]
    async fn test_single_select_matching() {
        let f = select_field("Status", &["Open", "Closed"]);
        let out = cell_to_airtable(&CellValue::text("open"), &f, None, ValidationMode::Strict)
            .await
            .unwrap();
        assert_eq!(out.value, Some(json!("Open")));

        let err = cell_to_airtable(&CellValue::text("Pending"), &f, None, ValidationMode::Strict)
            .await
            .unwrap_err();
        assert_eq!(err.code, Some(ValidationCode::UnknownChoice));

        let out = cell_to_airtable(&CellValue::text("Pending"), &f, None, ValidationMode::Lenient)
            .await
            .unwrap();
        assert_eq!(out.value, Some(json!("Pending")));
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_multiple_selects_split_and_trim() {
        let mut f = select_field("Tags", &["Red", "Blue"]);
        f.field_type = FieldType::MultipleSelects;
        let out = cell_to_airtable(
            &CellValue::text(" red ,Blue, "),
            &f,
            None,
            ValidationMode::Strict,
        )
        .await
        .unwrap();
        assert_eq!(out.value, Some(json!(["Red", "Blue"])));
    }

    #[tokio::test]
    async fn test_read_only_skipped_with_warning() {
        for t in [FieldType::Formula, FieldType::AutoNumber, FieldType::CreatedTime] {
            let f = field("X", t);
            let out = cell_to_airtable(&CellValue::text("v"), &f, None, ValidationMode::Strict)
                .await
                .unwrap();
            assert!(out.value.is_none());
            assert_eq!(out.warnings.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_attachments_read_only_write_skipped() {
        let f = field("Files", FieldType::MultipleAttachments);
        let value = json!([{"url": "https://a/1.png"}, {"url": "https://a/2.png"}]);
        let out = airtable_to_cell(Some(&value), &f, None).await;
        assert_eq!(out.cell, CellValue::text("https://a/1.png, https://a/2.png"));

        let out = cell_to_airtable(&CellValue::text("x"), &f, None, ValidationMode::Lenient)
            .await
            .unwrap();
        assert!(out.value.is_none());
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_linked_ids_pass_through_without_resolver() {
        let f = FieldSchema {
            id: "fldL".into(),
            name: "Owner".into(),
            field_type: FieldType::MultipleRecordLinks,
            options: Some(crate::models::record::FieldOptions {
                choices: vec![],
                linked_table_id: Some("tbl2".into()),
            }),
        };
        let out = cell_to_airtable(
            &CellValue::text("recAAAAAAAAAAAAA1, recAAAAAAAAAAAAA2"),
            &f,
            None,
            ValidationMode::Lenient,
        )
        .await
        .unwrap();
        assert_eq!(
            out.value,
            Some(json!([{"id": "recAAAAAAAAAAAAA1"}, {"id": "recAAAAAAAAAAAAA2"}]))
        );
    }

    #[tokio::test]
    async fn test_linked_read_falls_back_to_ids() {
        let f = FieldSchema {
            id: "fldL".into(),
            name: "Owner".into(),
            field_type: FieldType::MultipleRecordLinks,
            options: None,
        };
        let value = json!([{"id": "recX"}]);
        let out = airtable_to_cell(Some(&value), &f, None).await;
        assert_eq!(out.cell, CellValue::text("recX"));
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_coerced_with_warning() {
        let f = field("Mystery", FieldType::Unknown("aiText".into()));
        let out = airtable_to_cell(Some(&json!({"state": "done"})), &f, None).await;
        assert!(matches!(out.cell, CellValue::Text(_)));
        assert_eq!(out.warnings.len(), 1);

        let out = cell_to_airtable(&CellValue::text("v"), &f, None, ValidationMode::Strict)
            .await
            .unwrap();
        assert_eq!(out.value, Some(json!("v")));
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_email_and_url_warn_but_never_fail() {
        let f = field("Contact", FieldType::Email);
        let out = cell_to_airtable(&CellValue::text("nope"), &f, None, ValidationMode::Strict)
            .await
            .unwrap();
        assert_eq!(out.value, Some(json!("nope")));
        assert_eq!(out.warnings.len(), 1);

        let f = field("Site", FieldType::Url);
        let out = cell_to_airtable(
            &CellValue::text("https://example.com"),
            &f,
            None,
            ValidationMode::Strict,
        )
        .await
        .unwrap();
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_empty_maps_to_omitted() {
        let f = field("Age", FieldType::Number);
        let out = cell_to_airtable(&CellValue::Empty, &f, None, ValidationMode::Strict)
            .await
            .unwrap();
        assert!(out.value.is_none());
        assert!(out.warnings.is_empty());

        let out = airtable_to_cell(None, &f, None).await;
        assert_eq!(out.cell, CellValue::Empty);
    }

    #[tokio::test]
    async fn test_record_to_row_respects_mapping() {
        let record = AirtableRecord {
            id: "recA".into(),
            created_time: None,
            fields: json!({"Name": "Alice", "Age": 30})
                .as_object()
                .unwrap()
                .clone(),
        };
        let columns = vec![
            (field("Name", FieldType::SingleLineText), 0),
            (field("Age", FieldType::Number), 2),
        ];
        let (row, warnings) = record_to_row(&record, &columns, None).await;
        assert_eq!(row.len(), 3);
        assert_eq!(row[0], CellValue::text("Alice"));
        assert_eq!(row[1], CellValue::Empty);
        assert_eq!(row[2], CellValue::Number(30.0));
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn test_row_to_fields_collects_errors() {
        let columns = vec![
            (field("Name", FieldType::SingleLineText), 0),
            (field("Age", FieldType::Number), 1),
        ];
        let row = vec![CellValue::text("Bob"), CellValue::text("old")];
        let out = row_to_fields(&row, &columns, None, ValidationMode::Lenient).await;
        assert_eq!(out.fields.get("Name"), Some(&json!("Bob")));
        assert!(!out.fields.contains_key("Age"));
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].0, "Age");
    }
}
