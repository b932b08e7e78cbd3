//! The scheduler turns "ring at time T" into one pending wake-up per alarm.
//!
//! Each wake-up is a tokio task that sleeps until the alarm is due and then
//! sends a [`TriggerEvent::Fire`] to the alarm service. The task is only a
//! cache of the persisted fire time: if it is lost (the process restarted) or
//! finished, [`Scheduler::reconcile`] derives a new one from the record.
//!
//! Every armed wake-up carries a generation number. A fire event whose
//! generation is not the alarm's current one was overtaken by a re-arm or a
//! disarm and is ignored, so a timer from a superseded arm can never ring the
//! new one early.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::alarm::{AlarmId, AlarmRecord};
use crate::clock::Clock;
use crate::tracing::prelude::*;

/// Asynchronous inputs to the state machine that do not come from the
/// embedding application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerEvent {
    /// An alarm's wake-up elapsed.
    Fire { id: AlarmId, generation: u64 },

    /// Non-looping playback of ring `ring` reached its end.
    PlaybackComplete { id: AlarmId, ring: u64 },
}

/// How an alarm was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Armed {
    /// A wake-up was registered for this far in the future.
    Timer(Duration),
    /// Due (nearly) now; fired after the short grace delay.
    Immediate,
}

/// Outcome of a reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Persisted records with no in-memory state, now scheduled.
    pub adopted: usize,
    /// Alarms whose wake-up was missing and was registered again.
    pub rescheduled: usize,
    /// Alarms found past due and fired on the immediate path.
    pub fired_immediately: usize,
}

struct PendingTimer {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    immediate_threshold: Duration,
    immediate_grace: Duration,
    trigger_tx: mpsc::Sender<TriggerEvent>,
    pending: HashMap<AlarmId, PendingTimer>,
    next_generation: u64,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        immediate_threshold: Duration,
        immediate_grace: Duration,
        trigger_tx: mpsc::Sender<TriggerEvent>,
    ) -> Self {
        Self {
            clock,
            immediate_threshold,
            immediate_grace,
            trigger_tx,
            pending: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Time left until `fire_time`, zero if it has passed.
    pub fn delay_until(&self, fire_time: OffsetDateTime) -> Duration {
        (fire_time - self.clock.now())
            .try_into()
            .unwrap_or(Duration::ZERO)
    }

    /// Register the wake-up for `record`, replacing any pending one.
    pub fn arm(&mut self, record: &AlarmRecord) -> Armed {
        self.disarm(record.id);

        let delay = self.delay_until(record.fire_time);
        let (armed, wait) = if delay < self.immediate_threshold {
            (Armed::Immediate, delay.max(self.immediate_grace))
        } else {
            (Armed::Timer(delay), delay)
        };

        self.next_generation += 1;
        let generation = self.next_generation;
        let id = record.id;
        let tx = self.trigger_tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if tx
                .send(TriggerEvent::Fire { id, generation })
                .await
                .is_err()
            {
                debug!(id = %id, "Alarm service gone; dropping fire event");
            }
        });
        self.pending.insert(id, PendingTimer { generation, task });

        match armed {
            Armed::Immediate => debug!(id = %id, "Alarm due now; firing immediately"),
            Armed::Timer(delay) => {
                debug!(id = %id, delay_s = delay.as_secs(), "Alarm timer registered")
            }
        }
        armed
    }

    /// Cancel the pending wake-up for `id`. Returns whether one existed.
    pub fn disarm(&mut self, id: AlarmId) -> bool {
        match self.pending.remove(&id) {
            Some(timer) => {
                timer.task.abort();
                trace!(id = %id, "Alarm timer cancelled");
                true
            }
            None => false,
        }
    }

    /// A wake-up is registered for `id` and has not elapsed yet.
    pub fn has_live_timer(&self, id: AlarmId) -> bool {
        self.pending
            .get(&id)
            .is_some_and(|timer| !timer.task.is_finished())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Accept a fire event if it belongs to the current wake-up for its
    /// alarm. The wake-up is consumed either way.
    pub(crate) fn claim(&mut self, id: AlarmId, generation: u64) -> bool {
        match self.pending.get(&id) {
            Some(timer) if timer.generation == generation => {
                self.pending.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Re-register every scheduled alarm whose wake-up is missing or spent.
    ///
    /// `scheduled` must hold only alarms in the `Scheduled` state; ringing
    /// alarms own no wake-up.
    pub fn reconcile<'a>(
        &mut self,
        scheduled: impl IntoIterator<Item = &'a AlarmRecord>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for record in scheduled {
            if self.has_live_timer(record.id) {
                continue;
            }
            match self.arm(record) {
                Armed::Immediate => report.fired_immediately += 1,
                Armed::Timer(_) => report.rescheduled += 1,
            }
        }
        report
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for timer in self.pending.values() {
            timer.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::alarm::fixtures::record;
    use crate::clock::TokioClock;

    const THRESHOLD: Duration = Duration::from_secs(1);
    const GRACE: Duration = Duration::from_millis(100);

    fn scheduler() -> (Scheduler, mpsc::Receiver<TriggerEvent>, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::starting_at(datetime!(2026-03-01 07:00 UTC)));
        let (tx, rx) = mpsc::channel(16);
        (Scheduler::new(clock.clone(), THRESHOLD, GRACE, tx), rx, clock)
    }

    fn due_in(clock: &TokioClock, id: i64, secs: i64) -> AlarmRecord {
        record(id, clock.now() + time::Duration::seconds(secs))
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_when_due() {
        let (mut scheduler, mut rx, clock) = scheduler();
        let armed = scheduler.arm(&due_in(&clock, 1, 30));
        assert_eq!(armed, Armed::Timer(Duration::from_secs(30)));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event, TriggerEvent::Fire { id: AlarmId(1), generation: 1 });
        assert!(scheduler.claim(AlarmId(1), 1));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn near_due_alarm_takes_immediate_path_after_grace() {
        let (mut scheduler, mut rx, clock) = scheduler();
        assert_eq!(scheduler.arm(&due_in(&clock, 1, 0)), Armed::Immediate);

        tokio::time::sleep(GRACE / 2).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(GRACE).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(TriggerEvent::Fire { id: AlarmId(1), .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_alarm_fires_immediately() {
        let (mut scheduler, _rx, clock) = scheduler();
        assert_eq!(scheduler.arm(&due_in(&clock, 1, -10)), Armed::Immediate);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_supersedes_previous_timer() {
        let (mut scheduler, mut rx, clock) = scheduler();
        scheduler.arm(&due_in(&clock, 1, 5));
        scheduler.arm(&due_in(&clock, 1, 10));
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_err(), "first timer must be cancelled");

        tokio::time::sleep(Duration::from_secs(4)).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event, TriggerEvent::Fire { id: AlarmId(1), generation: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_not_claimed() {
        let (mut scheduler, _rx, clock) = scheduler();
        scheduler.arm(&due_in(&clock, 1, 5));
        scheduler.arm(&due_in(&clock, 1, 5));

        assert!(!scheduler.claim(AlarmId(1), 1));
        assert!(scheduler.claim(AlarmId(1), 2));
        assert!(!scheduler.claim(AlarmId(1), 2));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_cancels_and_is_idempotent() {
        let (mut scheduler, mut rx, clock) = scheduler();
        scheduler.arm(&due_in(&clock, 1, 5));

        assert!(scheduler.disarm(AlarmId(1)));
        assert!(!scheduler.disarm(AlarmId(1)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_rebuilds_missing_timers_only() {
        let (mut scheduler, _rx, clock) = scheduler();
        let live = due_in(&clock, 1, 60);
        let lost = due_in(&clock, 2, 60);
        let overdue = due_in(&clock, 3, -10);
        scheduler.arm(&live);

        let report = scheduler.reconcile([&live, &lost, &overdue]);

        assert_eq!(
            report,
            ReconcileReport {
                adopted: 0,
                rescheduled: 1,
                fired_immediately: 1,
            }
        );
        assert_eq!(scheduler.pending_count(), 3);
    }
}
