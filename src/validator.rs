//! Sanitization and type validation applied before any write.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;

use crate::models::sheet::{CellValue, SheetRow};

/// Airtable rejects long-text values beyond this.
pub const MAX_AIRTABLE_TEXT_LEN: usize = 100_000;
/// Google Sheets rejects cells beyond this.
pub const MAX_SHEET_CELL_LEN: usize = 50_000;

/// Rows are validated in chunks of this size to bound peak memory.
pub const VALIDATION_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    InvalidNumber,
    InvalidBoolean,
    InvalidDate,
    InvalidEmail,
    InvalidUrl,
    ValueTruncated,
    UnknownChoice,
    UnsupportedFieldType,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub field_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_index: Option<usize>,
    pub code: ValidationCode,
    pub sampled_value: String,
}

impl ValidationIssue {
    pub fn new(field_name: impl Into<String>, code: ValidationCode, value: &str) -> Self {
        Self {
            field_name: field_name.into(),
            row_index: None,
            code,
            sampled_value: sample(value),
        }
    }

    pub fn at_row(mut self, row_index: usize) -> Self {
        self.row_index = Some(row_index);
        self
    }
}

/// Keep error payloads small; values can be up to 100k chars.
fn sample(value: &str) -> String {
    const SAMPLE_LEN: usize = 40;
    if value.chars().count() <= SAMPLE_LEN {
        value.to_string()
    } else {
        let mut s: String = value.chars().take(SAMPLE_LEN).collect();
        s.push('…');
        s
    }
}

/// Strip null bytes and C0 control characters, keeping tab, newline and
/// carriage return.
pub fn sanitize_string(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '\u{0000}'..='\u{001F}') || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// A leading `=`, `+`, `-` or `@` would be interpreted as a formula by the
/// spreadsheet; prefix with an apostrophe so the value stays literal.
pub fn guard_formula_injection(s: &str) -> String {
    if s.starts_with(['=', '+', '-', '@']) {
        format!("'{s}")
    } else {
        s.to_string()
    }
}

/// Truncate to `max` characters. Returns the (possibly shortened) string and
/// whether truncation happened.
pub fn clamp_length(s: &str, max: usize) -> (String, bool) {
    if s.chars().count() <= max {
        (s.to_string(), false)
    } else {
        (s.chars().take(max).collect(), true)
    }
}

pub fn is_valid_email(s: &str) -> bool {
    static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
    let re = EMAIL_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap()
    });
    re.is_match(s)
}

pub fn is_valid_url(s: &str) -> bool {
    match reqwest::Url::parse(s) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

pub fn is_valid_number(n: f64) -> bool {
    n.is_finite()
}

/// Lenient date parsing shared by the validator and the field converter.
/// Accepts RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DDTHH:MM:SS`, and `MM/DD/YYYY`.
pub fn parse_date_lenient(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
        }
    }
    None
}

/// Sanitize one outgoing sheet row in place: control characters stripped,
/// formula injection guarded, oversized cells truncated with an issue.
pub fn sanitize_sheet_row(row: &mut SheetRow, row_index: usize) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (col, cell) in row.iter_mut().enumerate() {
        if let CellValue::Text(s) = cell {
            let cleaned = sanitize_string(s);
            let guarded = guard_formula_injection(&cleaned);
            let (clamped, truncated) = clamp_length(&guarded, MAX_SHEET_CELL_LEN);
            if truncated {
                issues.push(
                    ValidationIssue::new(
                        format!("column {col}"),
                        ValidationCode::ValueTruncated,
                        &clamped,
                    )
                    .at_row(row_index),
                );
            }
            *s = clamped;
        }
    }
    issues
}

/// Sanitize a batch of rows, processing in chunks to bound memory.
pub fn sanitize_sheet_rows(rows: &mut [SheetRow], first_row_index: usize) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut offset = 0;
    for chunk in rows.chunks_mut(VALIDATION_CHUNK_SIZE) {
        for (i, row) in chunk.iter_mut().enumerate() {
            issues.extend(sanitize_sheet_row(row, first_row_index + offset + i));
        }
        offset += chunk.len();
    }
    issues
}

/// Sanitize every string value headed for Airtable: control characters
/// stripped, long text clamped. Returns issues for truncated values.
pub fn sanitize_airtable_fields(
    fields: &mut serde_json::Map<String, serde_json::Value>,
    row_index: usize,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for (name, value) in fields.iter_mut() {
        if let serde_json::Value::String(s) = value {
            let cleaned = sanitize_string(s);
            let (clamped, truncated) = clamp_length(&cleaned, MAX_AIRTABLE_TEXT_LEN);
            if truncated {
                issues.push(
                    ValidationIssue::new(name.clone(), ValidationCode::ValueTruncated, &clamped)
                        .at_row(row_index),
                );
            }
            *s = clamped;
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_string("a\u{0000}b\u{0007}c"), "abc");
        assert_eq!(sanitize_string("line1\nline2\tx\r"), "line1\nline2\tx\r");
    }

    #[test]
    fn test_formula_injection_guard() {
        for s in ["=1+1", "+SUM(A1)", "-2", "@cmd"] {
            let guarded = guard_formula_injection(s);
            assert!(guarded.starts_with('\''), "{s} should be guarded");
            assert_eq!(&guarded[1..], s);
        }
        assert_eq!(guard_formula_injection("plain"), "plain");
        assert_eq!(guard_formula_injection("'=already"), "'=already");
    }

    #[test]
    fn test_clamp_length() {
        let (s, truncated) = clamp_length("hello", 10);
        assert_eq!(s, "hello");
        assert!(!truncated);
        let (s, truncated) = clamp_length("hello", 3);
        assert_eq!(s, "hel");
        assert!(truncated);
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("a@b.com"));
        assert!(is_valid_email("first.last+tag@sub.example.org"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@b"));
    }

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com/x?y=1"));
        assert!(is_valid_url("http://localhost:8080"));
        assert!(!is_valid_url("ftp://example.com"));
        assert!(!is_valid_url("example.com"));
    }

    #[test]
    fn test_date_parsing() {
        assert!(parse_date_lenient("2026-03-01").is_some());
        assert!(parse_date_lenient("03/01/2026").is_some());
        assert!(parse_date_lenient("2026-03-01T10:30:00Z").is_some());
        assert!(parse_date_lenient("2026-03-01T10:30:00").is_some());
        assert!(parse_date_lenient("yesterday").is_none());
        assert!(parse_date_lenient("").is_none());
    }

    #[test]
    fn test_sanitize_sheet_row_guards_and_reports() {
        let mut row = vec![
            CellValue::text("=1+1"),
            CellValue::text("x".repeat(MAX_SHEET_CELL_LEN + 10)),
            CellValue::Number(5.0),
        ];
        let issues = sanitize_sheet_row(&mut row, 3);
        assert_eq!(row[0], CellValue::text("'=1+1"));
        match &row[1] {
            CellValue::Text(s) => assert_eq!(s.chars().count(), MAX_SHEET_CELL_LEN),
            other => panic!("unexpected cell {other:?}"),
        }
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, ValidationCode::ValueTruncated);
        assert_eq!(issues[0].row_index, Some(3));
    }

    #[test]
    fn test_issue_sampling_caps_value() {
        let issue = ValidationIssue::new("f", ValidationCode::InvalidNumber, &"9".repeat(500));
        assert!(issue.sampled_value.chars().count() <= 41);
    }

    #[test]
    fn test_sanitize_airtable_fields() {
        let mut fields = serde_json::json!({
            "Notes": format!("a\u{0000}b{}", "x".repeat(MAX_AIRTABLE_TEXT_LEN)),
            "Age": 30
        })
        .as_object()
        .unwrap()
        .clone();
        let issues = sanitize_airtable_fields(&mut fields, 2);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, ValidationCode::ValueTruncated);
        assert_eq!(issues[0].row_index, Some(2));
        let s = fields["Notes"].as_str().unwrap();
        assert!(s.starts_with("ab"));
        assert_eq!(s.chars().count(), MAX_AIRTABLE_TEXT_LEN);
    }
}
