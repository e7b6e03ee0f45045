//! docvault - document repository server
//!
//! Long-running service that:
//! - Commits document versions, statuses, ACL and audit atomically
//! - Archives every record to object storage with chained signatures
//! - Finalises deletes once a document's archive has drained
//! - Fans database change notifications out to subscribers

use std::sync::Arc;

use docvault::archive::{load_or_bootstrap_keys, Archiver};
use docvault::core::{AppState, BackgroundTasks, Config, TaskKind};
use docvault::deleter::Deleter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                std::env::var("LOG_LEVEL")
                    .map(tracing_subscriber::EnvFilter::new)
                    .unwrap_or_else(|_| "docvault=info".into())
            }),
        )
        .init();

    let config = Config::from_env();

    tracing::info!("Starting docvault repository server");

    let state = AppState::new(&config).await?;

    let mut tasks = BackgroundTasks::new();

    // Notification listener feeds the in-process fan-outs.
    {
        let store = state.store.clone();
        let token = tasks.shutdown_token();
        tasks.spawn("notification_listener", TaskKind::Listener, async move {
            store.run_listener(token).await;
        });
    }

    if config.disable_archiver {
        tracing::warn!("Archiver disabled by configuration");
    } else {
        let keys = load_or_bootstrap_keys(&state.pool, config.signing_key.as_deref()).await?;

        let archiver = Archiver::new(
            state.pool.clone(),
            Arc::clone(&state.objects),
            state.archive_prefix.clone(),
            keys,
        );

        let token = tasks.shutdown_token();
        tasks.spawn("archiver", TaskKind::Worker, async move {
            archiver.run(token).await;
        });
    }

    {
        let deleter = Deleter::new(state.pool.clone());
        let token = tasks.shutdown_token();
        tasks.spawn("deleter", TaskKind::Worker, async move {
            deleter.run(token).await;
        });
    }

    tracing::info!("docvault running with {} background tasks", tasks.len());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    tasks.shutdown().await;

    // Don't block on pool teardown; outstanding connections close in
    // the background.
    let pool = state.pool.clone();
    tokio::spawn(async move { pool.close().await });

    Ok(())
}
