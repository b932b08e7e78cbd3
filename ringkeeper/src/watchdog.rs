//! Reaction to the host process being terminated.
//!
//! While any alarm is ringing, or a scheduled alarm asked for a warning, a
//! monitor task waits on the termination signal supplied by the embedding
//! application. When it is raised the watchdog decides what the user gets
//! instead of an in-process ring:
//!
//! | ringing alarms left           | scheduled `warn_on_kill` | outcome        |
//! |-------------------------------|--------------------------|----------------|
//! | yes                           | any                      | reminder burst |
//! | no                            | yes                      | warning        |
//! | no                            | no                       | nothing        |
//!
//! Ringing alarms that asked to stop on host termination are forgotten first
//! and do not count as left. The host may kill the process soon after
//! signalling, so all of this runs under a bounded wait.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupChainManager, BurstStart};
use crate::config::TerminationConfig;
use crate::effects::{Notifier, log_failure};
use crate::registry::AlarmRegistry;
use crate::ringing::AlarmSnapshot;
use crate::tracing::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// This many reminders were scheduled.
    ReminderBurst(usize),
    /// A burst from an earlier termination is still active.
    BurstAlreadyActive,
    Warned,
    Nothing,
    /// Handling did not finish within the configured wait.
    TimedOut,
    Failed(String),
}

pub struct TerminationWatchdog {
    config: TerminationConfig,
    backup: Arc<BackupChainManager>,
    registry: Arc<AlarmRegistry>,
    notifier: Arc<dyn Notifier>,
    termination_rx: watch::Receiver<bool>,
    snapshot_rx: watch::Receiver<AlarmSnapshot>,
    outcome_tx: watch::Sender<Option<TerminationOutcome>>,
    monitor: Mutex<MonitorSlot>,
}

#[derive(Default)]
struct MonitorSlot {
    current: Option<(u64, CancellationToken)>,
    started: u64,
}

impl TerminationWatchdog {
    pub fn new(
        config: TerminationConfig,
        backup: Arc<BackupChainManager>,
        registry: Arc<AlarmRegistry>,
        notifier: Arc<dyn Notifier>,
        termination_rx: watch::Receiver<bool>,
        snapshot_rx: watch::Receiver<AlarmSnapshot>,
    ) -> Self {
        let (outcome_tx, _) = watch::channel(None);
        Self {
            config,
            backup,
            registry,
            notifier,
            termination_rx,
            snapshot_rx,
            outcome_tx,
            monitor: Mutex::new(MonitorSlot::default()),
        }
    }

    /// Start waiting for the termination signal. No-op if already waiting.
    ///
    /// Each raise of the signal is handled once. If the host clears it again
    /// and the process lives on, the next raise is handled too.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.current.is_some() {
            return;
        }

        monitor.started += 1;
        let epoch = monitor.started;
        let cancel = CancellationToken::new();
        monitor.current = Some((epoch, cancel.clone()));
        debug!("Termination monitoring started");

        let watchdog = Arc::clone(self);
        let mut termination_rx = self.termination_rx.clone();
        tokio::spawn(async move {
            loop {
                let raised = tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = termination_rx.wait_for(|terminating| *terminating) => signal.is_ok(),
                };
                if !raised {
                    debug!("Termination signal source gone");
                    break;
                }
                let snapshot = watchdog.snapshot_rx.borrow().clone();
                watchdog.handle_termination(&snapshot).await;

                let cleared = tokio::select! {
                    _ = cancel.cancelled() => break,
                    signal = termination_rx.wait_for(|terminating| !*terminating) => signal.is_ok(),
                };
                if !cleared {
                    break;
                }
                debug!("Termination signal cleared; still monitoring");
            }
            watchdog.monitor_exited(epoch);
        });
    }

    pub fn stop_monitoring(&self) {
        if let Some((_, cancel)) = self.monitor.lock().current.take() {
            cancel.cancel();
            debug!("Termination monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().current.is_some()
    }

    /// Forget the monitor started as `epoch`, unless a newer one replaced it.
    fn monitor_exited(&self, epoch: u64) {
        let mut monitor = self.monitor.lock();
        if monitor.current.as_ref().is_some_and(|(current, _)| *current == epoch) {
            monitor.current = None;
        }
    }

    /// Resolves to `Some` once termination has been handled.
    pub fn outcome(&self) -> watch::Receiver<Option<TerminationOutcome>> {
        self.outcome_tx.subscribe()
    }

    /// Act on termination given the alarms in `snapshot`. Never takes longer
    /// than the configured wait.
    pub async fn handle_termination(&self, snapshot: &AlarmSnapshot) -> TerminationOutcome {
        info!(
            ringing = snapshot.ringing.len(),
            scheduled = snapshot.scheduled.len(),
            "Host terminating"
        );

        let outcome = match tokio::time::timeout(self.config.wait, self.decide(snapshot)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(wait_ms = self.config.wait.as_millis(), "Termination handling timed out");
                TerminationOutcome::TimedOut
            }
        };
        info!(?outcome, "Termination handled");
        self.outcome_tx.send_replace(Some(outcome.clone()));
        outcome
    }

    /// Same as [`handle_termination`](Self::handle_termination) for a
    /// synchronous termination hook running outside the runtime. Blocks the
    /// calling thread for at most the configured wait.
    pub fn handle_termination_blocking(self: &Arc<Self>, runtime: &Handle) -> TerminationOutcome {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        let watchdog = Arc::clone(self);
        runtime.spawn(async move {
            let snapshot = watchdog.snapshot_rx.borrow().clone();
            let outcome = watchdog.handle_termination(&snapshot).await;
            let _ = tx.send(outcome);
        });

        // The async side is bounded by the same wait; the margin only covers
        // scheduling of the spawned task.
        match rx.recv_timeout(self.config.wait + Duration::from_millis(50)) {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Termination hook gave up waiting");
                TerminationOutcome::TimedOut
            }
        }
    }

    async fn decide(&self, snapshot: &AlarmSnapshot) -> TerminationOutcome {
        let mut remaining = Vec::new();
        for alarm in &snapshot.ringing {
            if alarm.stop_on_termination {
                debug!(id = %alarm.id, "Forgetting alarm that stops with the host");
                if let Err(e) = self.registry.remove(alarm.id) {
                    error!(id = %alarm.id, error = %e, "Failed to remove alarm record");
                }
            } else {
                remaining.push((alarm.id, alarm.notification.clone()));
            }
        }

        if !remaining.is_empty() {
            return match self.backup.start_reminder_burst(&remaining).await {
                Ok(BurstStart::Started(count)) => TerminationOutcome::ReminderBurst(count),
                Ok(BurstStart::AlreadyActive) => TerminationOutcome::BurstAlreadyActive,
                Err(e) => {
                    error!(error = %e, "Failed to start reminder burst");
                    TerminationOutcome::Failed(e.to_string())
                }
            };
        }

        if snapshot.warn_on_kill {
            let result = self
                .notifier
                .send_warning(&self.config.warning_title, &self.config.warning_body)
                .await;
            log_failure(None, "send warning", result);
            return TerminationOutcome::Warned;
        }

        TerminationOutcome::Nothing
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::alarm::AlarmId;
    use crate::alarm::fixtures::record;
    use crate::clock::TokioClock;
    use crate::config::{BackupConfig, RingConfig};
    use crate::effects::{EffectCall, SimulatedEffects};
    use crate::ringing::RingingAlarm;
    use crate::store::MemoryStore;

    struct Fixture {
        watchdog: Arc<TerminationWatchdog>,
        effects: Arc<SimulatedEffects>,
        registry: Arc<AlarmRegistry>,
        termination_tx: watch::Sender<bool>,
        snapshot_tx: watch::Sender<AlarmSnapshot>,
    }

    fn fixture() -> Fixture {
        let config = RingConfig::default();
        let store = Arc::new(MemoryStore::new());
        let effects = Arc::new(SimulatedEffects::new(Duration::from_secs(5)));
        let registry = Arc::new(AlarmRegistry::new(store.clone()));
        let clock = Arc::new(TokioClock::starting_at(datetime!(2026-03-01 07:00 UTC)));
        let backup = Arc::new(BackupChainManager::new(
            BackupConfig::default(),
            clock,
            store,
            effects.clone(),
        ));
        let (termination_tx, termination_rx) = watch::channel(false);
        let (snapshot_tx, snapshot_rx) = watch::channel(AlarmSnapshot::default());
        let watchdog = Arc::new(TerminationWatchdog::new(
            config.termination,
            backup,
            registry.clone(),
            effects.clone(),
            termination_rx,
            snapshot_rx,
        ));
        Fixture {
            watchdog,
            effects,
            registry,
            termination_tx,
            snapshot_tx,
        }
    }

    fn ringing(id: i64, stop_on_termination: bool) -> RingingAlarm {
        RingingAlarm {
            id: AlarmId(id),
            stop_on_termination,
            notification: record(id, datetime!(2026-03-01 07:00 UTC)).notification,
        }
    }

    fn warnings(effects: &SimulatedEffects) -> usize {
        effects
            .calls()
            .iter()
            .filter(|c| matches!(c, EffectCall::Warning { .. }))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn ringing_alarm_starts_reminder_burst() {
        let f = fixture();
        let snapshot = AlarmSnapshot {
            ringing: vec![ringing(1, false)],
            scheduled: vec![AlarmId(2)],
            warn_on_kill: true,
        };

        let outcome = f.watchdog.handle_termination(&snapshot).await;

        assert_eq!(outcome, TerminationOutcome::ReminderBurst(10));
        assert_eq!(warnings(&f.effects), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_termination_does_not_duplicate_burst() {
        let f = fixture();
        let snapshot = AlarmSnapshot {
            ringing: vec![ringing(1, false)],
            ..Default::default()
        };
        f.watchdog.handle_termination(&snapshot).await;

        assert_eq!(
            f.watchdog.handle_termination(&snapshot).await,
            TerminationOutcome::BurstAlreadyActive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn alarms_stopping_with_host_are_forgotten() {
        let f = fixture();
        f.registry
            .save(&record(1, datetime!(2026-03-01 07:00 UTC)))
            .unwrap();
        let snapshot = AlarmSnapshot {
            ringing: vec![ringing(1, true)],
            scheduled: vec![],
            warn_on_kill: true,
        };

        let outcome = f.watchdog.handle_termination(&snapshot).await;

        assert_eq!(outcome, TerminationOutcome::Warned);
        assert!(!f.registry.exists(AlarmId(1)).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_alarm_gets_one_warning() {
        let f = fixture();
        let snapshot = AlarmSnapshot {
            ringing: vec![],
            scheduled: vec![AlarmId(3)],
            warn_on_kill: true,
        };

        assert_eq!(
            f.watchdog.handle_termination(&snapshot).await,
            TerminationOutcome::Warned
        );
        assert_eq!(
            f.effects.calls().last(),
            Some(&EffectCall::Warning {
                title: "Your alarms may not ring".to_string(),
                body: "You killed the app. Please reopen so your alarms can be rescheduled."
                    .to_string(),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_pending_does_nothing() {
        let f = fixture();
        let snapshot = AlarmSnapshot {
            ringing: vec![],
            scheduled: vec![AlarmId(3)],
            warn_on_kill: false,
        };

        assert_eq!(
            f.watchdog.handle_termination(&snapshot).await,
            TerminationOutcome::Nothing
        );
        assert!(f.effects.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_notifier_times_out() {
        let f = fixture();
        f.effects.set_notifier_latency(Duration::from_secs(10));
        let snapshot = AlarmSnapshot {
            warn_on_kill: true,
            ..Default::default()
        };

        let started = tokio::time::Instant::now();
        let outcome = f.watchdog.handle_termination(&snapshot).await;

        assert_eq!(outcome, TerminationOutcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_handles_signal_and_publishes_outcome() {
        let f = fixture();
        f.snapshot_tx.send_replace(AlarmSnapshot {
            ringing: vec![ringing(1, false)],
            ..Default::default()
        });
        let mut outcome = f.watchdog.outcome();

        f.watchdog.start_monitoring();
        f.watchdog.start_monitoring();
        f.termination_tx.send_replace(true);

        let handled = outcome.wait_for(Option::is_some).await.unwrap().clone();
        assert_eq!(handled, Some(TerminationOutcome::ReminderBurst(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_handles_each_raise_of_the_signal() {
        let f = fixture();
        f.snapshot_tx.send_replace(AlarmSnapshot {
            warn_on_kill: true,
            ..Default::default()
        });
        f.watchdog.start_monitoring();

        f.termination_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(warnings(&f.effects), 1);
        assert!(f.watchdog.is_monitoring());

        f.termination_tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.termination_tx.send_replace(true);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(warnings(&f.effects), 2);
        assert!(f.watchdog.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_is_released_when_signal_source_goes_away() {
        let f = fixture();
        f.watchdog.start_monitoring();
        assert!(f.watchdog.is_monitoring());

        drop(f.termination_tx);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!f.watchdog.is_monitoring());
        assert_eq!(*f.watchdog.outcome().borrow(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_monitor_ignores_signal() {
        let f = fixture();
        f.snapshot_tx.send_replace(AlarmSnapshot {
            warn_on_kill: true,
            ..Default::default()
        });
        f.watchdog.start_monitoring();
        assert!(f.watchdog.is_monitoring());
        f.watchdog.stop_monitoring();
        assert!(!f.watchdog.is_monitoring());

        f.termination_tx.send_replace(true);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(*f.watchdog.outcome().borrow(), None);
        assert_eq!(warnings(&f.effects), 0);
    }

    #[test]
    fn blocking_hook_waits_for_outcome() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let f = runtime.block_on(async { fixture() });
        f.snapshot_tx.send_replace(AlarmSnapshot {
            warn_on_kill: true,
            ..Default::default()
        });

        let outcome = f.watchdog.handle_termination_blocking(runtime.handle());

        assert_eq!(outcome, TerminationOutcome::Warned);
        assert_eq!(warnings(&f.effects), 1);
    }
}
