//! Retry-with-backoff wrapper for provider calls, plus batch sizing and run
//! cancellation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::ProviderError;

pub const MAX_BACKOFF_MS: u64 = 30_000;
pub const JITTER_MS: u64 = 1_000;

/// Cooperative cancellation for one run: an explicit flag plus an optional
/// deadline. Checked between batches; in-flight requests are allowed to
/// finish so updates are never left half-applied.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InvokeOptions<'a> {
    pub max_retries: usize,
    pub op_name: &'a str,
}

/// Backoff before retry `attempt` (zero-based): `min(1000 * 2^attempt,
/// 30000)` ms plus uniform jitter in `[0, 1000)` ms. Hard quota exhaustion
/// triples the base delay.
pub fn backoff_delay(attempt: usize, resource_exhausted: bool) -> Duration {
    let exp = 2u64.saturating_pow(attempt.min(16) as u32);
    let mut base = (1_000 * exp).min(MAX_BACKOFF_MS);
    if resource_exhausted {
        base = base.saturating_mul(3);
    }
    let jitter = rand::rng().random_range(0..JITTER_MS);
    Duration::from_millis(base + jitter)
}

/// Run `op`, retrying per the provider's failure class:
/// - rate limiting (429, "rate limit", "quota"): exponential backoff up to
///   `max_retries` attempts;
/// - validation failures (422, "invalid"): no retry;
/// - auth failures (401/403): no retry, surfaced immediately so the caller
///   can refresh tokens;
/// - anything else: at most one retry.
pub async fn invoke<T, F, Fut>(
    op: F,
    opts: &InvokeOptions<'_>,
    cancel: &CancelToken,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if err.is_auth() || err.is_validation() {
            return Err(err);
        }
        let retry_budget = if err.is_rate_limit() {
            opts.max_retries
        } else {
            opts.max_retries.min(1)
        };
        if attempt >= retry_budget {
            return Err(err);
        }

        let delay = backoff_delay(attempt, err.is_resource_exhausted());
        tracing::warn!(
            op = opts.op_name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying after error: {err}"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Chunk a work list into provider-sized batches. Airtable mutations take at
/// most 10 items; sheet updates default to 100.
pub fn batch_operations<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
