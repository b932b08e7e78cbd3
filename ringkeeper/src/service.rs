//! The alarm service actor and its handle.
//!
//! One task owns the [`RingingStateMachine`]. Commands from the embedding
//! application, fire events from timers, playback completions and the
//! periodic reconcile tick all pass through its select loop, so transitions
//! of any one alarm are totally ordered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::alarm::{AlarmId, AlarmRecord};
use crate::backup::BackupChainManager;
use crate::clock::Clock;
use crate::config::RingConfig;
use crate::effects::SideEffects;
use crate::error::{Error, Result};
use crate::registry::AlarmRegistry;
use crate::ringing::{AlarmSnapshot, Collaborators, RingingStateMachine};
use crate::scheduler::{Armed, ReconcileReport, TriggerEvent};
use crate::stop_request::StopRequestTracker;
use crate::store::KeyValueStore;
use crate::tracing::prelude::*;
use crate::watchdog::{TerminationOutcome, TerminationWatchdog};

const COMMAND_QUEUE: usize = 32;
const TRIGGER_QUEUE: usize = 64;

/// Requests from an [`AlarmHandle`] to the service task.
pub enum AlarmCommand {
    Arm {
        record: AlarmRecord,
        reply: oneshot::Sender<Result<Armed>>,
    },

    Stop {
        id: AlarmId,
        reply: oneshot::Sender<bool>,
    },

    StopAll { reply: oneshot::Sender<usize> },

    Reconcile {
        reply: oneshot::Sender<Result<ReconcileReport>>,
    },
}

pub struct AlarmService {
    machine: RingingStateMachine,
    commands: mpsc::Receiver<AlarmCommand>,
    triggers: mpsc::Receiver<TriggerEvent>,
    reconcile_interval: Duration,
}

impl AlarmService {
    /// Wire up the service over `store` and `effects`.
    ///
    /// `termination` is raised by the embedding application when the host
    /// process is about to go away.
    pub fn new(
        config: RingConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        effects: SideEffects,
        termination: watch::Receiver<bool>,
    ) -> (Self, AlarmHandle) {
        let registry = Arc::new(AlarmRegistry::new(store.clone()));
        let stop_requests = Arc::new(StopRequestTracker::new(config.stop_request_expiry));
        let backup = Arc::new(BackupChainManager::new(
            config.backup.clone(),
            clock.clone(),
            store,
            effects.notifier.clone(),
        ));

        let (snapshot_tx, snapshot_rx) = watch::channel(AlarmSnapshot::default());
        let watchdog = Arc::new(TerminationWatchdog::new(
            config.termination.clone(),
            backup.clone(),
            registry.clone(),
            effects.notifier.clone(),
            termination,
            snapshot_rx.clone(),
        ));

        let (trigger_tx, triggers) = mpsc::channel(TRIGGER_QUEUE);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);

        let machine = RingingStateMachine::new(
            &config,
            clock,
            Collaborators {
                registry,
                stop_requests: stop_requests.clone(),
                effects,
                backup,
                watchdog: watchdog.clone(),
            },
            trigger_tx,
            snapshot_tx,
        );

        let service = Self {
            machine,
            commands,
            triggers,
            reconcile_interval: config.reconcile_interval,
        };
        let handle = AlarmHandle {
            commands: command_tx,
            stop_requests,
            snapshot_rx,
            watchdog,
        };
        (service, handle)
    }

    pub async fn run(mut self, cancellation: CancellationToken) {
        let period = self.reconcile_interval;
        let mut reconcile = tokio::time::interval_at(Instant::now() + period, period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Alarm service started");
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    break;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All alarm handles dropped");
                        break;
                    };
                    self.handle_command(command).await;
                }
                Some(event) = self.triggers.recv() => {
                    if let Some(outcome) = self.machine.handle_trigger(event).await {
                        trace!(?event, ?outcome, "Fire event handled");
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.machine.reconcile().await {
                        error!(error = %e, "Periodic reconcile failed");
                    }
                }
            }
        }
        info!("Alarm service stopped");
    }

    async fn handle_command(&mut self, command: AlarmCommand) {
        match command {
            AlarmCommand::Arm { record, reply } => {
                let result = self.machine.arm(record).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Arm rejected");
                }
                let _ = reply.send(result);
            }
            AlarmCommand::Stop { id, reply } => {
                let _ = reply.send(self.machine.stop(id).await);
            }
            AlarmCommand::StopAll { reply } => {
                let _ = reply.send(self.machine.stop_all().await);
            }
            AlarmCommand::Reconcile { reply } => {
                let _ = reply.send(self.machine.reconcile().await);
            }
        }
    }
}

/// Cheap, cloneable access to a running [`AlarmService`].
#[derive(Clone)]
pub struct AlarmHandle {
    commands: mpsc::Sender<AlarmCommand>,
    stop_requests: Arc<StopRequestTracker>,
    snapshot_rx: watch::Receiver<AlarmSnapshot>,
    watchdog: Arc<TerminationWatchdog>,
}

impl AlarmHandle {
    /// Persist and schedule `record`, replacing any alarm with the same id.
    pub async fn arm(&self, record: AlarmRecord) -> Result<Armed> {
        self.request(|reply| AlarmCommand::Arm { record, reply })
            .await?
    }

    /// Stop `id`. Returns whether anything was stopped.
    ///
    /// The request is recorded before it is queued, so a fire event for `id`
    /// that is already waiting in the service is suppressed.
    pub async fn stop(&self, id: AlarmId) -> Result<bool> {
        self.stop_requests.mark_stop_requested(id);
        self.request(|reply| AlarmCommand::Stop { id, reply }).await
    }

    pub async fn stop_all(&self) -> Result<usize> {
        self.request(|reply| AlarmCommand::StopAll { reply }).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.request(|reply| AlarmCommand::Reconcile { reply })
            .await?
    }

    /// Whether `id` is ringing, or with `None`, whether any alarm is.
    pub fn is_ringing(&self, id: Option<AlarmId>) -> bool {
        self.snapshot_rx.borrow().is_ringing(id)
    }

    pub fn snapshot(&self) -> AlarmSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AlarmSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn termination_outcome(&self) -> watch::Receiver<Option<TerminationOutcome>> {
        self.watchdog.outcome()
    }

    pub fn watchdog(&self) -> &Arc<TerminationWatchdog> {
        &self.watchdog
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> AlarmCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        response.await.map_err(|_| Error::ServiceStopped)
    }
}
