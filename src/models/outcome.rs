use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SyncDirection;
use crate::error::SyncError;

/// Cap on errors/warnings kept in a result; everything past the cap is
/// counted but not stored.
pub const MAX_REPORTED: usize = 100;

/// The only observable surface from one engine run: counts, a bounded list
/// of errors and warnings, and timing.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub run_id: String,
    pub config_id: String,
    pub direction: SyncDirection,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub total: usize,
    pub conflicts: usize,
    pub errors: Vec<SyncError>,
    pub warnings: Vec<String>,
    pub errors_truncated: usize,
    pub warnings_truncated: usize,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: i64,
}

impl SyncResult {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty() && self.errors_truncated == 0
    }
}

/// Mutable accumulator threaded through a pipeline; finalized into a
/// `SyncResult` exactly once per run.
#[derive(Debug)]
pub struct RunReport {
    run_id: String,
    config_id: String,
    direction: SyncDirection,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub total: usize,
    pub conflicts: usize,
    errors: Vec<SyncError>,
    warnings: Vec<String>,
    errors_truncated: usize,
    warnings_truncated: usize,
    started: DateTime<Utc>,
}

impl RunReport {
    pub fn new(config_id: impl Into<String>, direction: SyncDirection) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            config_id: config_id.into(),
            direction,
            added: 0,
            updated: 0,
            deleted: 0,
            total: 0,
            conflicts: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            errors_truncated: 0,
            warnings_truncated: 0,
            started: Utc::now(),
        }
    }

    pub fn error(&mut self, err: SyncError) {
        tracing::warn!(config = %self.config_id, "sync error: {err}");
        if self.errors.len() < MAX_REPORTED {
            self.errors.push(err);
        } else {
            self.errors_truncated += 1;
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(config = %self.config_id, "sync warning: {message}");
        if self.warnings.len() < MAX_REPORTED {
            self.warnings.push(message);
        } else {
            self.warnings_truncated += 1;
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.errors_truncated > 0
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.errors_truncated
    }

    pub fn finish(self) -> SyncResult {
        let finished = Utc::now();
        SyncResult {
            run_id: self.run_id,
            config_id: self.config_id,
            direction: self.direction,
            added: self.added,
            updated: self.updated,
            deleted: self.deleted,
            total: self.total,
            conflicts: self.conflicts,
            errors: self.errors,
            warnings: self.warnings,
            errors_truncated: self.errors_truncated,
            warnings_truncated: self.warnings_truncated,
            started_at: self.started.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            finished_at: finished.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            duration_ms: (finished - self.started).num_milliseconds(),
        }
    }
}
