//! Error types for the sync engine.

use serde::Serialize;

/// Classification of everything that can go wrong during a run. Per-row
/// failures (Transform/Validation/LinkedRecord) are recoverable in lenient
/// mode; Fetch and Auth always terminate the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Transform,
    Validation,
    LinkedRecord,
    RateLimit,
    Write,
    Auth,
    Cancelled,
    Unknown,
}

/// A single error surfaced in a `SyncResult`. Carries enough context to point
/// the owner at the offending row or record.
#[derive(Debug, Clone, Serialize)]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            row: None,
            record_id: None,
            field: None,
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fetch, message)
    }

    pub fn transform(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transform, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn linked_record(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LinkedRecord, message)
    }

    pub fn write(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Write, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Map a provider failure observed while reading into the taxonomy.
    pub fn from_fetch_failure(err: &ProviderError) -> Self {
        Self::new(classify_provider(err, ErrorKind::Fetch), err.to_string())
    }

    /// Map a provider failure observed while mutating into the taxonomy.
    pub fn from_write_failure(err: &ProviderError) -> Self {
        Self::new(classify_provider(err, ErrorKind::Write), err.to_string())
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(row) = self.row {
            write!(f, " (row {row})")?;
        }
        if let Some(ref id) = self.record_id {
            write!(f, " (record {id})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

fn classify_provider(err: &ProviderError, fallback: ErrorKind) -> ErrorKind {
    if matches!(err, ProviderError::Cancelled) {
        ErrorKind::Cancelled
    } else if err.is_auth() {
        ErrorKind::Auth
    } else if err.is_rate_limit() {
        ErrorKind::RateLimit
    } else if err.is_validation() {
        ErrorKind::Validation
    } else {
        fallback
    }
}

/// Raw failure from one of the provider HTTP clients, before the engine maps
/// it into a `SyncError`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn message_contains(&self, needles: &[&str]) -> bool {
        let msg = match self {
            Self::Api { message, .. } => message,
            Self::Transport(m) | Self::Decode(m) => m,
            Self::Cancelled => return false,
        };
        let lower = msg.to_lowercase();
        needles.iter().any(|n| lower.contains(n))
    }

    pub fn is_rate_limit(&self) -> bool {
        self.status() == Some(429) || self.message_contains(&["rate limit", "quota"])
    }

    /// Google signals hard quota exhaustion with this status string; it gets
    /// a longer backoff than an ordinary 429.
    pub fn is_resource_exhausted(&self) -> bool {
        self.message_contains(&["resource_exhausted"])
    }

    pub fn is_validation(&self) -> bool {
        self.status() == Some(422) || self.message_contains(&["invalid", "validation"])
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}
