//! Google Sheets v4 REST client.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::config::SheetRef;
use crate::error::ProviderError;
use crate::models::sheet::{SheetRow, row_from_api};
use crate::tokens::AccessToken;

const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// The sheet operations the engine needs. Ranges are A1-notation without the
/// sheet prefix; implementations qualify them with the tab title.
#[async_trait]
pub trait SheetsClient: Send + Sync {
    async fn get_sheet_data(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        range: &str,
    ) -> Result<Vec<SheetRow>, ProviderError>;

    async fn update_sheet_data(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        range: &str,
        values: &[SheetRow],
    ) -> Result<(), ProviderError>;

    async fn append_rows(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        values: &[SheetRow],
    ) -> Result<(), ProviderError>;

    /// Delete `count` rows starting at zero-based `start_row`.
    async fn delete_rows(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet_id: i64,
        start_row: usize,
        count: usize,
    ) -> Result<(), ProviderError>;

    /// Grow the grid so at least `min_columns` columns exist.
    async fn ensure_columns_exist(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet_id: i64,
        min_columns: usize,
    ) -> Result<(), ProviderError>;

    async fn hide_column(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet_id: i64,
        column_index: usize,
    ) -> Result<(), ProviderError>;

    /// Map a tab reference to its numeric sheet id.
    async fn resolve_sheet_id(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
    ) -> Result<i64, ProviderError>;
}

/// 1-based column number to letter: 1 → A, 26 → Z, 27 → AA.
pub fn column_number_to_letter(mut n: usize) -> String {
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Column letter to 1-based number: A → 1, AA → 27. None for non-letters.
pub fn column_letter_to_number(s: &str) -> Option<usize> {
    if s.is_empty() {
        return None;
    }
    let mut n = 0usize;
    for c in s.chars() {
        let c = c.to_ascii_uppercase();
        if !c.is_ascii_uppercase() {
            return None;
        }
        n = n * 26 + (c as usize - 'A' as usize + 1);
    }
    Some(n)
}

pub struct HttpSheetsClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone)]
struct SheetProps {
    sheet_id: i64,
    title: String,
    column_count: usize,
}

impl HttpSheetsClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn sheet_props(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
    ) -> Result<Vec<SheetProps>, ProviderError> {
        let url = format!(
            "{}/{}?fields=sheets.properties(sheetId,title,gridProperties.columnCount)",
            self.base_url, spreadsheet
        );
        let resp = self.http.get(&url).bearer_auth(token.secret()).send().await?;
        let body = check(resp).await?;
        let sheets = body
            .get("sheets")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::Decode("spreadsheet metadata missing sheets".into()))?;
        let mut props = Vec::with_capacity(sheets.len());
        for s in sheets {
            let p = s
                .get("properties")
                .ok_or_else(|| ProviderError::Decode("sheet missing properties".into()))?;
            props.push(SheetProps {
                sheet_id: p.get("sheetId").and_then(Value::as_i64).unwrap_or(0),
                title: p
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                column_count: p
                    .get("gridProperties")
                    .and_then(|g| g.get("columnCount"))
                    .and_then(Value::as_u64)
                    .unwrap_or(26) as usize,
            });
        }
        Ok(props)
    }

    async fn find_sheet(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
    ) -> Result<SheetProps, ProviderError> {
        let props = self.sheet_props(token, spreadsheet).await?;
        props
            .into_iter()
            .find(|p| match sheet {
                SheetRef::Id(id) => p.sheet_id == *id,
                SheetRef::Name(name) => p.title == *name,
            })
            .ok_or_else(|| ProviderError::api(404, format!("sheet {sheet:?} not found")))
    }

    async fn qualified_range(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        range: &str,
    ) -> Result<String, ProviderError> {
        let title = self.find_sheet(token, spreadsheet, sheet).await?.title;
        Ok(format!("'{}'!{}", title.replace('\'', "''"), range))
    }

    async fn batch_update(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        requests: Vec<Value>,
    ) -> Result<(), ProviderError> {
        let url = format!("{}/{}:batchUpdate", self.base_url, spreadsheet);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token.secret())
            .json(&json!({ "requests": requests }))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }
}

impl Default for HttpSheetsClient {
    fn default() -> Self {
        Self::new()
    }
}

fn api_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            let status_str = err.get("status").and_then(Value::as_str).unwrap_or("");
            let msg = err.get("message").and_then(Value::as_str)?;
            Some(if status_str.is_empty() {
                msg.to_string()
            } else {
                format!("{status_str}: {msg}")
            })
        })
        .unwrap_or_else(|| body.chars().take(200).collect());
    ProviderError::api(status, message)
}

async fn check(resp: reqwest::Response) -> Result<Value, ProviderError> {
    let status = resp.status().as_u16();
    let body = resp.text().await?;
    if !(200..300).contains(&status) {
        return Err(api_error(status, &body));
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn rows_to_api(values: &[SheetRow]) -> Vec<Vec<Value>> {
    values
        .iter()
        .map(|row| row.iter().map(|c| c.to_api_value()).collect())
        .collect()
}

#[async_trait]
impl SheetsClient for HttpSheetsClient {
    async fn get_sheet_data(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        range: &str,
    ) -> Result<Vec<SheetRow>, ProviderError> {
        let full_range = self.qualified_range(token, spreadsheet, sheet, range).await?;
        let url = format!(
            "{}/{}/values/{}?valueRenderOption=UNFORMATTED_VALUE",
            self.base_url,
            spreadsheet,
            urlencoding::encode(&full_range)
        );
        let resp = self.http.get(&url).bearer_auth(token.secret()).send().await?;
        let body = check(resp).await?;
        let values = body
            .get("values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(values
            .iter()
            .map(|row| row_from_api(row.as_array().map(Vec::as_slice).unwrap_or(&[])))
            .collect())
    }

    async fn update_sheet_data(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        range: &str,
        values: &[SheetRow],
    ) -> Result<(), ProviderError> {
        let full_range = self.qualified_range(token, spreadsheet, sheet, range).await?;
        let url = format!(
            "{}/{}/values/{}?valueInputOption=RAW",
            self.base_url,
            spreadsheet,
            urlencoding::encode(&full_range)
        );
        let resp = self
            .http
            .put(&url)
            .bearer_auth(token.secret())
            .json(&json!({ "range": full_range, "values": rows_to_api(values) }))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn append_rows(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
        values: &[SheetRow],
    ) -> Result<(), ProviderError> {
        let full_range = self.qualified_range(token, spreadsheet, sheet, "A1").await?;
        let url = format!(
            "{}/{}/values/{}:append?valueInputOption=RAW&insertDataOption=INSERT_ROWS",
            self.base_url,
            spreadsheet,
            urlencoding::encode(&full_range)
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token.secret())
            .json(&json!({ "values": rows_to_api(values) }))
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn delete_rows(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet_id: i64,
        start_row: usize,
        count: usize,
    ) -> Result<(), ProviderError> {
        self.batch_update(
            token,
            spreadsheet,
            vec![json!({
                "deleteDimension": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "ROWS",
                        "startIndex": start_row,
                        "endIndex": start_row + count,
                    }
                }
            })],
        )
        .await
    }

    async fn ensure_columns_exist(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet_id: i64,
        min_columns: usize,
    ) -> Result<(), ProviderError> {
        let props = self.sheet_props(token, spreadsheet).await?;
        let current = props
            .iter()
            .find(|p| p.sheet_id == sheet_id)
            .map(|p| p.column_count)
            .ok_or_else(|| ProviderError::api(404, format!("sheet id {sheet_id} not found")))?;
        if current >= min_columns {
            return Ok(());
        }
        self.batch_update(
            token,
            spreadsheet,
            vec![json!({
                "appendDimension": {
                    "sheetId": sheet_id,
                    "dimension": "COLUMNS",
                    "length": min_columns - current,
                }
            })],
        )
        .await
    }

    async fn hide_column(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet_id: i64,
        column_index: usize,
    ) -> Result<(), ProviderError> {
        self.batch_update(
            token,
            spreadsheet,
            vec![json!({
                "updateDimensionProperties": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "COLUMNS",
                        "startIndex": column_index,
                        "endIndex": column_index + 1,
                    },
                    "properties": { "hiddenByUser": true },
                    "fields": "hiddenByUser",
                }
            })],
        )
        .await
    }

    async fn resolve_sheet_id(
        &self,
        token: &AccessToken,
        spreadsheet: &str,
        sheet: &SheetRef,
    ) -> Result<i64, ProviderError> {
        Ok(self.find_sheet(token, spreadsheet, sheet).await?.sheet_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_number_to_letter() {
        assert_eq!(column_number_to_letter(1), "A");
        assert_eq!(column_number_to_letter(26), "Z");
        assert_eq!(column_number_to_letter(27), "AA");
        assert_eq!(column_number_to_letter(28), "AB");
        assert_eq!(column_number_to_letter(52), "AZ");
        assert_eq!(column_number_to_letter(703), "AAA");
    }

    #[test]
    fn test_column_letter_to_number() {
        assert_eq!(column_letter_to_number("A"), Some(1));
        assert_eq!(column_letter_to_number("Z"), Some(26));
        assert_eq!(column_letter_to_number("AA"), Some(27));
        assert_eq!(column_letter_to_number("aa"), Some(27));
        assert_eq!(column_letter_to_number(""), None);
        assert_eq!(column_letter_to_number("A1"), None);
    }

    #[test]
    fn test_round_trip_letters() {
        for n in 1..=1000 {
            assert_eq!(column_letter_to_number(&column_number_to_letter(n)), Some(n));
        }
    }

    #[test]
    fn test_sheets_api_error_message() {
        let err = api_error(
            429,
            r#"{"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#,
        );
        assert!(err.is_rate_limit());
        assert!(err.is_resource_exhausted());
    }
}
