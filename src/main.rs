use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tablekeep::clock::SystemClock;
use tablekeep::config::Config;
use tablekeep::engine::Engine;
use tablekeep::notify::{LogNotifier, NotifyHub, spawn_forwarder};
use tablekeep::scheduler::Scheduler;

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    tablekeep::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(
        Engine::new(config.wal_path(), notify.clone(), Arc::new(SystemClock))?
            .with_default_duration(config.default_duration_minutes),
    );
    let scheduler = Arc::new(Scheduler::new(engine.clone(), config.scheduler()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = scheduler.spawn(shutdown_rx.clone());
    tasks.push(spawn_forwarder(&notify, Arc::new(LogNotifier), shutdown_rx));

    info!("tablekeep running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  expiry sweep every {}s, grace {}min", config.expiry_interval.as_secs(), config.grace_minutes);
    info!("  nightly reset at {}", config.reset_at);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    shutdown_signal().await?;
    info!("shutdown signal received, stopping timers");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!("background task ended abnormally: {e}");
        }
    }

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final WAL compaction failed: {e}");
    }
    let status = scheduler.status();
    info!(
        cancelled = status.total_cancelled_since_start,
        reset = status.total_reset_since_start,
        "tablekeep stopped"
    );
    Ok(())
}
