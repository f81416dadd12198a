//! Persistence seams consumed by the engine. The engine only reads configs,
//! reads/writes per-config state at run boundaries, and appends run logs;
//! anything richer belongs to the implementation.

use crate::config::SyncConfig;
use crate::models::outcome::SyncResult;
use crate::models::state::SyncState;

pub trait ConfigStore: Send + Sync {
    fn get(&self, id: &str) -> anyhow::Result<Option<SyncConfig>>;

    /// Configs the scheduler should run. Disabled configs are excluded.
    fn list_enabled(&self) -> anyhow::Result<Vec<SyncConfig>>;
}

pub trait StateStore: Send + Sync {
    fn get(&self, config_id: &str) -> anyhow::Result<Option<SyncState>>;

    fn put(&self, config_id: &str, state: &SyncState) -> anyhow::Result<()>;

    fn clear(&self, config_id: &str) -> anyhow::Result<()>;
}

pub trait LogSink: Send + Sync {
    fn write(&self, result: &SyncResult) -> anyhow::Result<()>;
}
