//! The sync engine facade: loads config, tokens and state, runs the
//! direction-appropriate pipeline, and persists the outcome.

use std::sync::Arc;

use chrono::Utc;

use crate::clients::airtable::AirtableClient;
use crate::clients::sheets::SheetsClient;
use crate::config::SyncDirection;
use crate::error::SyncError;
use crate::invoker::CancelToken;
use crate::models::outcome::{RunReport, SyncResult};
use crate::models::state::SyncState;
use crate::pipelines::{self, RunContext};
use crate::resolver::LinkedRecordResolver;
use crate::stores::{ConfigStore, LogSink, StateStore};
use crate::tokens::{Provider, TokenProvider};

pub struct SyncEngine {
    config_store: Arc<dyn ConfigStore>,
    token_provider: Arc<dyn TokenProvider>,
    airtable: Arc<dyn AirtableClient>,
    sheets: Arc<dyn SheetsClient>,
    state_store: Arc<dyn StateStore>,
    log_sink: Arc<dyn LogSink>,
    resolver: Arc<LinkedRecordResolver>,
}

impl SyncEngine {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        token_provider: Arc<dyn TokenProvider>,
        airtable: Arc<dyn AirtableClient>,
        sheets: Arc<dyn SheetsClient>,
        state_store: Arc<dyn StateStore>,
        log_sink: Arc<dyn LogSink>,
        resolver: Arc<LinkedRecordResolver>,
    ) -> Self {
        Self {
            config_store,
            token_provider,
            airtable,
            sheets,
            state_store,
            log_sink,
            resolver,
        }
    }

    /// Run one sync to completion. Always yields a `SyncResult`; the state
    /// store is only advanced when the pipeline finishes without a fatal
    /// error. Callers must not run the same config concurrently.
    pub async fn run_sync(&self, config_id: &str, cancel: &CancelToken) -> SyncResult {
        let config = match self.config_store.get(config_id) {
            Ok(Some(config)) => config,
            Ok(None) => {
                let mut report = RunReport::new(config_id, SyncDirection::AirtableToSheets);
                report.error(SyncError::fetch(format!("sync config {config_id} not found")));
                return self.finish(report);
            }
            Err(e) => {
                let mut report = RunReport::new(config_id, SyncDirection::AirtableToSheets);
                report.error(SyncError::fetch(format!("failed to load config: {e}")));
                return self.finish(report);
            }
        };

        let mut report = RunReport::new(config_id, config.direction);
        if let Err(e) = config.validate() {
            report.error(SyncError::validation(format!("invalid config: {e}")));
            return self.finish(report);
        }

        let airtable_token = match self
            .token_provider
            .for_user(&config.user_id, Provider::Airtable)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                report.error(SyncError::auth(format!("no Airtable token: {e}")));
                return self.finish(report);
            }
        };
        let sheets_token = match self
            .token_provider
            .for_user(&config.user_id, Provider::GoogleSheets)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                report.error(SyncError::auth(format!("no Google token: {e}")));
                return self.finish(report);
            }
        };

        let previous = match self.state_store.get(config_id) {
            Ok(state) => state.unwrap_or_else(|| SyncState::new(config_id)),
            Err(e) => {
                report.error(SyncError::fetch(format!("failed to load sync state: {e}")));
                return self.finish(report);
            }
        };
        let mut state = previous.clone();

        // Stale linked-table entries must not survive into this run.
        self.resolver.clear_expired();

        let ctx = RunContext {
            config: &config,
            airtable: self.airtable.as_ref(),
            sheets: self.sheets.as_ref(),
            airtable_token: &airtable_token,
            sheets_token: &sheets_token,
            resolver: &self.resolver,
            cancel,
        };

        tracing::info!(config = config_id, direction = ?config.direction, "sync started");
        let outcome = match config.direction {
            SyncDirection::AirtableToSheets => {
                pipelines::airtable_to_sheets::run(&ctx, &mut report, &mut state).await
            }
            SyncDirection::SheetsToAirtable => {
                pipelines::sheets_to_airtable::run(&ctx, &mut report, &mut state).await
            }
            SyncDirection::Bidirectional => {
                pipelines::bidirectional::run(&ctx, &mut report, &mut state).await
            }
        };

        match outcome {
            Ok(()) => {
                state.last_sync_time =
                    Some(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
                if let Err(e) = self.state_store.put(config_id, &state) {
                    report.error(SyncError::write(format!("failed to persist sync state: {e}")));
                }
            }
            Err(fatal) => {
                // Terminated: report with partial counts, state untouched.
                report.error(fatal);
            }
        }

        self.finish(report)
    }

    fn finish(&self, report: RunReport) -> SyncResult {
        let result = report.finish();
        if let Err(e) = self.log_sink.write(&result) {
            tracing::warn!("failed to write sync log: {e}");
        }
        tracing::info!(
            config = %result.config_id,
            added = result.added,
            updated = result.updated,
            deleted = result.deleted,
            errors = result.errors.len(),
            duration_ms = result.duration_ms,
            "sync finished"
        );
        result
    }
}
