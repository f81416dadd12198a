pub mod clients;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod field_mapper;
pub mod hashing;
pub mod invoker;
pub mod models;
pub mod pipelines;
pub mod resolver;
pub mod scheduler;
pub mod stores;
pub mod sync_db;
pub mod tokens;
pub mod validator;

pub use config::{ConflictPolicy, SyncConfig, SyncDirection, ValidationMode};
pub use engine::SyncEngine;
pub use invoker::CancelToken;
pub use models::outcome::SyncResult;
