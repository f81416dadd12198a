use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use basesync::clients::{HttpAirtableClient, HttpSheetsClient};
use basesync::config::RunnerConfig;
use basesync::engine::SyncEngine;
use basesync::invoker::CancelToken;
use basesync::resolver::LinkedRecordResolver;
use basesync::scheduler::spawn_scheduler;
use basesync::sync_db::SyncDb;
use basesync::tokens::EnvTokenProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("basesync=debug")),
        )
        .init();

    let config_path =
        std::env::var("BASESYNC_CONFIG").unwrap_or_else(|_| "./basesync.toml".to_string());
    let runner = RunnerConfig::load(&config_path)?;

    let db = Arc::new(SyncDb::open(&runner.db_path)?);
    tracing::info!("sync db opened at {}", runner.db_path);

    let engine = Arc::new(SyncEngine::new(
        db.clone(),
        Arc::new(EnvTokenProvider),
        Arc::new(HttpAirtableClient::new()),
        Arc::new(HttpSheetsClient::new()),
        db.clone(),
        db.clone(),
        Arc::new(LinkedRecordResolver::default()),
    ));

    // `basesync <config-id>` runs a single sync and prints the result.
    if let Some(config_id) = std::env::args().nth(1) {
        let result = engine.run_sync(&config_id, &CancelToken::new()).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.succeeded() {
            std::process::exit(1);
        }
        return Ok(());
    }

    spawn_scheduler(engine, db, runner.interval_secs);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
