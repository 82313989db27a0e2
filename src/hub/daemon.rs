//! Daemon wiring: build the component graph from configuration and run
//! the process-wide background loops until shutdown.
//!
//! ```text
//! InventorySync ──► SessionSupervisor ──► SolTransport (UDP per BMC)
//!                        │ raw bytes
//!                        ▼
//!       BroadcastHub → ScreenBuffer → LogWriter → Analytics
//!
//! ticks: health check 60 s · retention sweep + cache flush 24 h
//! ```

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::console::{Analytics, LogWriter};
use crate::constants::{DEFAULT_INACTIVITY_TIMEOUT, HEALTH_CHECK_INTERVAL, RETENTION_INTERVAL};
use crate::hub::{BroadcastHub, SessionSupervisor};
use crate::inventory::{HttpInventorySource, InventorySource, InventorySync};

/// Run the aggregator until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;

    let log = Arc::new(LogWriter::new(config.logs_dir(), config.logs.retention_days));
    let analytics = Arc::new(Analytics::load(
        config.analytics_path(),
        &config.reboot_detection.sol_patterns,
    ));
    let hub = Arc::new(BroadcastHub::new());
    let supervisor = Arc::new(SessionSupervisor::new(
        Arc::clone(&log),
        Arc::clone(&analytics),
        Arc::clone(&hub),
        DEFAULT_INACTIVITY_TIMEOUT,
    ));
    let sync = Arc::new(InventorySync::new(
        Arc::clone(&supervisor),
        config.cache_path(),
        &config.ipmi.username,
        &config.ipmi.password,
        config.static_seeds(),
    ));

    let source: Option<Arc<dyn InventorySource>> = if config.discovery.bmh_url.is_empty() {
        info!("discovery.bmhUrl not set; inventory fetching disabled");
        None
    } else {
        let namespace =
            (!config.discovery.namespace.is_empty()).then(|| config.discovery.namespace.clone());
        Some(Arc::new(HttpInventorySource::new(
            &config.discovery.bmh_url,
            namespace,
        )?))
    };

    let cancel = CancellationToken::new();
    let sync_task = tokio::spawn(Arc::clone(&sync).run(source, cancel.clone()));
    let health_task = tokio::spawn(health_loop(Arc::clone(&supervisor), cancel.clone()));
    let retention_task = tokio::spawn(retention_loop(
        Arc::clone(&log),
        Arc::clone(&sync),
        cancel.clone(),
    ));

    info!(
        "solhub up: logs at {}, status surface on port {} (served externally)",
        config.logs_dir().display(),
        config.server.port
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    supervisor.shutdown().await;
    analytics.persist();
    sync.flush_cache();

    for task in [sync_task, health_task, retention_task] {
        if let Err(e) = task.await {
            warn!("background task panicked during shutdown: {e}");
        }
    }
    Ok(())
}

/// Restart sessions whose BMC went quiet (60 s cadence, 90 s threshold).
async fn health_loop(supervisor: Arc<SessionSupervisor>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // the immediate first tick
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => supervisor.run_health_check().await,
        }
    }
}

/// Prune expired logs and flush the inventory snapshot on a daily cadence
/// (and once at startup, which catches up after long downtime).
async fn retention_loop(log: Arc<LogWriter>, sync: Arc<InventorySync>, cancel: CancellationToken) {
    loop {
        log.sweep_expired();
        sync.flush_cache();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(RETENTION_INTERVAL) => {}
        }
    }
}
