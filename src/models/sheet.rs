use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single spreadsheet cell. The Sheets API returns unformatted values as
/// JSON booleans, numbers, or strings; absent trailing cells arrive as
/// missing array elements and are modeled as `Empty`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Empty,
}

pub type SheetRow = Vec<CellValue>;

impl Default for CellValue {
    fn default() -> Self {
        Self::Empty
    }
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// The cell rendered as a plain string, trimmed. Empty cells render as "".
    pub fn as_trimmed_str(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => canonical_number(*n),
            Self::Bool(b) => if *b { "TRUE".into() } else { "FALSE".into() },
        }
    }

    /// JSON value sent to the Sheets API. Empty cells are written as "" so
    /// stale content is cleared on update.
    pub fn to_api_value(&self) -> Value {
        match self {
            Self::Empty => Value::String(String::new()),
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(n.to_string())),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    pub fn from_api_value(v: &Value) -> Self {
        match v {
            Value::Null => Self::Empty,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => n.as_f64().map(Self::Number).unwrap_or(Self::Empty),
            Value::String(s) => {
                if s.is_empty() {
                    Self::Empty
                } else {
                    Self::Text(s.clone())
                }
            }
            other => Self::Text(other.to_string()),
        }
    }
}

/// Render a number the way a sheet displays it: integers without a decimal
/// point, everything else at up to six decimals with trailing zeros dropped.
pub fn canonical_number(n: f64) -> String {
    if !n.is_finite() {
        return n.to_string();
    }
    let rounded = (n * 1e6).round() / 1e6;
    if rounded == rounded.trunc() && rounded.abs() < 1e15 {
        format!("{}", rounded as i64)
    } else {
        let s = format!("{rounded:.6}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Element-wise row equality after normalization: strings trimmed, numbers
/// rendered canonically, and null/undefined/empty all equal.
pub fn are_rows_equal(a: &[CellValue], b: &[CellValue]) -> bool {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).unwrap_or(&CellValue::Empty);
        let right = b.get(i).unwrap_or(&CellValue::Empty);
        if !cells_equal(left, right) {
            return false;
        }
    }
    true
}

pub fn cells_equal(a: &CellValue, b: &CellValue) -> bool {
    if a.is_empty() && b.is_empty() {
        return true;
    }
    a.as_trimmed_str() == b.as_trimmed_str()
}

/// Decode one API row into cells.
pub fn row_from_api(values: &[Value]) -> SheetRow {
    values.iter().map(CellValue::from_api_value).collect()
}
