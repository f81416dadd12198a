//! Periodic runner: ticks on an interval, launches due syncs, and serializes
//! runs per config so no two invocations of the same sync overlap. Overlap
//! would let a run start before the previous run's id write-back landed,
//! which produces duplicate records.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::SyncEngine;
use crate::invoker::CancelToken;
use crate::stores::ConfigStore;

/// Hard per-run budget; a wedged run frees its slot after this.
const RUN_BUDGET: Duration = Duration::from_secs(15 * 60);

pub fn spawn_scheduler(
    engine: Arc<SyncEngine>,
    config_store: Arc<dyn ConfigStore>,
    interval_secs: u64,
) {
    tokio::spawn(async move {
        let running: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        tracing::info!(interval_secs, "sync scheduler started");
        loop {
            interval.tick().await;
            let configs = match config_store.list_enabled() {
                Ok(configs) => configs,
                Err(e) => {
                    tracing::error!("scheduler: failed to list configs: {e}");
                    continue;
                }
            };
            for config in configs {
                let id = config.id.clone();
                {
                    let mut guard = running.lock().unwrap();
                    if !guard.insert(id.clone()) {
                        tracing::debug!(config = %id, "previous run still active, skipping");
                        continue;
                    }
                }
                let engine = engine.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    let cancel = CancelToken::with_deadline(RUN_BUDGET);
                    let result = engine.run_sync(&id, &cancel).await;
                    if !result.succeeded() {
                        tracing::warn!(
                            config = %id,
                            errors = result.errors.len() + result.errors_truncated,
                            "sync completed with errors"
                        );
                    }
                    running.lock().unwrap().remove(&id);
                });
            }
        }
    });
}
