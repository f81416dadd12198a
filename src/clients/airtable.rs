//! Airtable REST client.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::ProviderError;
use crate::models::record::{AirtableRecord, TableSchema};
use crate::tokens::AccessToken;

const DEFAULT_BASE_URL: &str = "https://api.airtable.com/v0";
const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub view: Option<String>,
    pub filter_formula: Option<String>,
    pub max_records: Option<usize>,
}

/// The record operations the engine needs from Airtable. Mutation batches
/// must not exceed 10 records; callers chunk before invoking.
#[async_trait]
pub trait AirtableClient: Send + Sync {
    /// Fetch records, following pagination internally.
    async fn list_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        opts: &ListOptions,
    ) -> Result<Vec<AirtableRecord>, ProviderError>;

    async fn get_base_schema(
        &self,
        token: &AccessToken,
        base: &str,
    ) -> Result<Vec<TableSchema>, ProviderError>;

    /// Create up to 10 records; returns them with their new ids, in order.
    async fn create_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        fields: &[Map<String, Value>],
    ) -> Result<Vec<AirtableRecord>, ProviderError>;

    /// Update up to 10 records by id.
    async fn update_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        updates: &[(String, Map<String, Value>)],
    ) -> Result<(), ProviderError>;

    /// Delete up to 10 records by id.
    async fn delete_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        ids: &[String],
    ) -> Result<(), ProviderError>;
}

pub struct HttpAirtableClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAirtableClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn records_url(&self, base: &str, table: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            urlencoding::encode(base),
            urlencoding::encode(table)
        )
    }
}

impl Default for HttpAirtableClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull a useful message out of an Airtable error body; they nest it under
/// `error.message` or send `error` as a bare string.
fn api_error(status: u16, body: &str) -> ProviderError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            let err = v.get("error")?;
            err.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| err.as_str().map(str::to_string))
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

#[async_trait]
impl AirtableClient for HttpAirtableClient {
    async fn list_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        opts: &ListOptions,
    ) -> Result<Vec<AirtableRecord>, ProviderError> {
        let url = self.records_url(base, table);
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut query: Vec<(String, String)> =
                vec![("pageSize".into(), PAGE_SIZE.to_string())];
            if let Some(ref view) = opts.view {
                query.push(("view".into(), view.clone()));
            }
            if let Some(ref formula) = opts.filter_formula {
                query.push(("filterByFormula".into(), formula.clone()));
            }
            if let Some(max) = opts.max_records {
                query.push(("maxRecords".into(), max.to_string()));
            }
            if let Some(ref o) = offset {
                query.push(("offset".into(), o.clone()));
            }

            let resp = self
                .http
                .get(&url)
                .bearer_auth(token.secret())
                .query(&query)
                .send()
                .await?;
            let body = check(resp).await?;

            let page: Vec<AirtableRecord> = body
                .get("records")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| ProviderError::Decode(e.to_string()))?
                .unwrap_or_default();
            records.extend(page);

            if let Some(max) = opts.max_records {
                if records.len() >= max {
                    records.truncate(max);
                    break;
                }
            }
            match body.get("offset").and_then(Value::as_str) {
                Some(o) => offset = Some(o.to_string()),
                None => break,
            }
        }
        Ok(records)
    }

    async fn get_base_schema(
        &self,
        token: &AccessToken,
        base: &str,
    ) -> Result<Vec<TableSchema>, ProviderError> {
        let url = format!(
            "{}/meta/bases/{}/tables",
            self.base_url,
            urlencoding::encode(base)
        );
        let resp = self.http.get(&url).bearer_auth(token.secret()).send().await?;
        let body = check(resp).await?;
        body.get("tables")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProviderError::Decode(e.to_string()))?
            .ok_or_else(|| ProviderError::Decode("schema response missing tables".into()))
    }

    async fn create_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        fields: &[Map<String, Value>],
    ) -> Result<Vec<AirtableRecord>, ProviderError> {
        let payload = json!({
            "records": fields.iter().map(|f| json!({"fields": f})).collect::<Vec<_>>(),
            "typecast": true,
        });
        let resp = self
            .http
            .post(self.records_url(base, table))
            .bearer_auth(token.secret())
            .json(&payload)
            .send()
            .await?;
        let body = check(resp).await?;
        body.get("records")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ProviderError::Decode(e.to_string()))?
            .ok_or_else(|| ProviderError::Decode("create response missing records".into()))
    }

    async fn update_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        updates: &[(String, Map<String, Value>)],
    ) -> Result<(), ProviderError> {
        let payload = json!({
            "records": updates
                .iter()
                .map(|(id, f)| json!({"id": id, "fields": f}))
                .collect::<Vec<_>>(),
            "typecast": true,
        });
        let resp = self
            .http
            .patch(self.records_url(base, table))
            .bearer_auth(token.secret())
            .json(&payload)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }

    async fn delete_records(
        &self,
        token: &AccessToken,
        base: &str,
        table: &str,
        ids: &[String],
    ) -> Result<(), ProviderError> {
        let query: Vec<(String, String)> =
            ids.iter().map(|id| ("records[]".to_string(), id.clone())).collect();
        let resp = self
            .http
            .delete(self.records_url(base, table))
            .bearer_auth(token.secret())
            .query(&query)
            .send()
            .await?;
        check(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_extracts_nested_message() {
        let err = api_error(422, r#"{"error": {"type": "INVALID_VALUE", "message": "Field X is bad"}}"#);
        assert_eq!(err.status(), Some(422));
        assert!(err.to_string().contains("Field X is bad"));
    }

    #[test]
    fn test_api_error_handles_bare_string() {
        let err = api_error(404, r#"{"error": "NOT_FOUND"}"#);
        assert!(err.to_string().contains("NOT_FOUND"));
    }

    #[test]
    fn test_api_error_falls_back_to_body() {
        let err = api_error(500, "internal server error");
        assert!(err.to_string().contains("internal server error"));
    }
}
