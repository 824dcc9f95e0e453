use anyhow::{Context, Result};
use rollcall_attendance::{HttpRemoteStore, SqliteStore, SyncScheduler, SystemClock};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::from_env();
    config.validate()?;

    let store = SqliteStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let remote_url = config.remote_url.as_deref().unwrap_or_default();
    let remote = HttpRemoteStore::new(remote_url, config.remote_auth.clone(), config.remote_timeout())
        .context("building remote store client")?;

    let scheduler = Arc::new(SyncScheduler::new(
        Arc::new(store.clone()),
        Arc::new(remote),
        Arc::new(SystemClock),
        config.sync_options(),
    ));
    let handle = scheduler.spawn(config.sync_interval(), config.retention());

    tracing::info!(
        db = %config.db_path.display(),
        remote = remote_url,
        interval_secs = config.sync_interval_secs,
        batch_limit = config.sync_batch_limit,
        "rollcalld ready"
    );

    // SIGUSR1 forces a sync cycle; Ctrl-C / SIGTERM stop the daemon.
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut term = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = term.recv() => break,
            _ = usr1.recv() => {
                tracing::info!("SIGUSR1 received; triggering sync");
                handle.trigger();
            }
        }
    }

    tracing::info!("rollcalld shutting down");
    handle.shutdown().await;
    store.close().await?;

    Ok(())
}
