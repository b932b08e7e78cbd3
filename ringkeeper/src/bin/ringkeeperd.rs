//! The ringkeeper daemon.
//!
//! Runs the alarm service over the on-disk store with the headless effects
//! backend. SIGINT or SIGTERM is treated as host termination: the watchdog
//! gets its bounded window to schedule reminders or warn before the service
//! shuts down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use ringkeeper::clock::SystemClock;
use ringkeeper::effects::{SideEffects, SimulatedEffects};
use ringkeeper::store::FileStore;
use ringkeeper::tracing::prelude::*;
use ringkeeper::{AlarmService, RingConfig};

/// How long simulated non-looping playback lasts.
const SIMULATED_PLAYBACK: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    ringkeeper::tracing::init();

    let config = RingConfig::from_env()?;
    let store = FileStore::open(&config.store_path)
        .with_context(|| format!("opening alarm store {}", config.store_path.display()))?;
    info!(store = %config.store_path.display(), "Starting ringkeeperd");

    let termination_wait = config.termination.wait;
    let effects = Arc::new(SimulatedEffects::new(SIMULATED_PLAYBACK));
    let (termination_tx, termination_rx) = watch::channel(false);
    let (service, handle) = AlarmService::new(
        config,
        Arc::new(SystemClock),
        Arc::new(store),
        SideEffects::from_backend(effects),
        termination_rx,
    );

    let cancellation = CancellationToken::new();
    let service_task = tokio::spawn(service.run(cancellation.clone()));

    let report = handle.reconcile().await?;
    info!(
        adopted = report.adopted,
        fired_immediately = report.fired_immediately,
        "Startup reconcile complete"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    let snapshot = handle.snapshot();
    if snapshot.is_ringing(None) || snapshot.warn_on_kill {
        let mut outcome = handle.termination_outcome();
        termination_tx.send_replace(true);
        match tokio::time::timeout(termination_wait, outcome.wait_for(Option::is_some)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => warn!("Termination watchdog went away"),
            Err(_) => warn!("Gave up waiting for termination handling"),
        }
    }

    cancellation.cancel();
    if let Err(e) = service_task.await {
        error!(error = %e, "Alarm service task failed");
    }
    info!("Exiting");
    Ok(())
}
