//! The per-alarm lifecycle.
//!
//! ```text
//!   arm ──► Scheduled ──fire + guards──► Ringing
//!               │                           │
//!               └──stop / rejected──► Stopped ◄──stop / done / re-arm
//! ```
//!
//! A fire event must pass every guard, in order, before an alarm rings:
//!
//! 1. its record is still in the registry (otherwise the event is stale),
//! 2. no stop was requested for it in the last few seconds,
//! 3. no other alarm is ringing, unless the record allows overlap,
//! 4. the host is ready to ring (not checked for backups).
//!
//! Guards 2-4 move the alarm to `Stopped` without touching audio. A backup
//! that fires while its primary rings is pushed back instead, and a primary
//! that fires while its own backup rings takes the ring over from it.
//!
//! Side-effect failures are logged and never leave a transition half done.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::alarm::{AlarmId, AlarmRecord, AlarmState, NotificationContent, VIBRATION_PATTERN};
use crate::backup::BackupChainManager;
use crate::clock::Clock;
use crate::config::RingConfig;
use crate::effects::{Delivery, PlayRequest, PlaybackCompletion, SideEffects, log_failure};
use crate::error::Result;
use crate::registry::AlarmRegistry;
use crate::scheduler::{Armed, ReconcileReport, Scheduler, TriggerEvent};
use crate::stop_request::StopRequestTracker;
use crate::tracing::prelude::*;
use crate::watchdog::TerminationWatchdog;

/// What happened to a fire event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Rang,
    /// Superseded timer, or the alarm no longer exists.
    Stale,
    AlreadyRinging,
    /// A backup fired while its primary was ringing and was pushed back.
    Deferred,
    Rejected(GuardRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum GuardRejection {
    StopRequested,
    Overlap { ringing: AlarmId },
    HostNotReady,
}

/// A ringing alarm as seen from outside the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RingingAlarm {
    pub id: AlarmId,
    pub stop_on_termination: bool,
    pub notification: NotificationContent,
}

/// Published after every transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlarmSnapshot {
    pub ringing: Vec<RingingAlarm>,
    pub scheduled: Vec<AlarmId>,
    /// Some scheduled alarm wants a warning if the process is killed.
    pub warn_on_kill: bool,
}

impl AlarmSnapshot {
    /// Whether `id` is ringing, or with `None`, whether any alarm is.
    pub fn is_ringing(&self, id: Option<AlarmId>) -> bool {
        match id {
            Some(id) => self.ringing.iter().any(|r| r.id == id),
            None => !self.ringing.is_empty(),
        }
    }
}

/// Whether stopping an alarm tells the application about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Always,
    /// Only if it had rung. Used for backups the user never saw.
    IfRinging,
}

#[derive(Debug)]
enum Phase {
    Scheduled,
    Ringing { ring: u64 },
}

#[derive(Debug)]
struct Alarm {
    record: AlarmRecord,
    phase: Phase,
}

impl Alarm {
    fn scheduled(record: AlarmRecord) -> Self {
        Self {
            record,
            phase: Phase::Scheduled,
        }
    }

    fn is_ringing(&self) -> bool {
        matches!(self.phase, Phase::Ringing { .. })
    }
}

/// Shared collaborators of the state machine.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<AlarmRegistry>,
    pub stop_requests: Arc<StopRequestTracker>,
    pub effects: SideEffects,
    pub backup: Arc<BackupChainManager>,
    pub watchdog: Arc<TerminationWatchdog>,
}

pub struct RingingStateMachine {
    registry: Arc<AlarmRegistry>,
    stop_requests: Arc<StopRequestTracker>,
    effects: SideEffects,
    backup: Arc<BackupChainManager>,
    watchdog: Arc<TerminationWatchdog>,
    scheduler: Scheduler,
    trigger_tx: mpsc::Sender<TriggerEvent>,
    snapshot_tx: watch::Sender<AlarmSnapshot>,
    alarms: HashMap<AlarmId, Alarm>,
    next_ring: u64,
    background_audio: bool,
}

impl RingingStateMachine {
    pub fn new(
        config: &RingConfig,
        clock: Arc<dyn Clock>,
        collaborators: Collaborators,
        trigger_tx: mpsc::Sender<TriggerEvent>,
        snapshot_tx: watch::Sender<AlarmSnapshot>,
    ) -> Self {
        let scheduler = Scheduler::new(
            clock,
            config.immediate_threshold,
            config.immediate_grace,
            trigger_tx.clone(),
        );
        Self {
            registry: collaborators.registry,
            stop_requests: collaborators.stop_requests,
            effects: collaborators.effects,
            backup: collaborators.backup,
            watchdog: collaborators.watchdog,
            scheduler,
            trigger_tx,
            snapshot_tx,
            alarms: HashMap::new(),
            next_ring: 0,
            background_audio: false,
        }
    }

    pub fn state(&self, id: AlarmId) -> AlarmState {
        match self.alarms.get(&id).map(|a| &a.phase) {
            Some(Phase::Scheduled) => AlarmState::Scheduled,
            Some(Phase::Ringing { .. }) => AlarmState::Ringing,
            None => AlarmState::Stopped,
        }
    }

    /// Persist `record` and schedule it, replacing any alarm with the same
    /// id.
    pub async fn arm(&mut self, record: AlarmRecord) -> Result<Armed> {
        record.validate()?;
        let id = record.id;

        if self.alarms.contains_key(&id) {
            info!(id = %id, "Replacing existing alarm");
            self.stop_internal(id, Notify::Always).await;
        }
        if let Some(backup) = id.backup() {
            self.stop_internal(backup, Notify::IfRinging).await;
        }

        self.stop_requests.clear(id);
        self.registry.save(&record)?;
        let armed = self.scheduler.arm(&record);
        info!(id = %id, fire_time = %record.fire_time, "Alarm armed");

        let duplicate = self.backup.duplicate_of(&record);
        self.alarms.insert(id, Alarm::scheduled(record));
        if let Some(duplicate) = duplicate {
            self.arm_backup(duplicate);
        }

        self.update_state().await;
        Ok(armed)
    }

    /// Stop an alarm at the user's request. Stopping a backup also stops its
    /// primary. Returns whether anything was stopped.
    pub async fn stop(&mut self, id: AlarmId) -> bool {
        let notify = if id.is_backup() {
            Notify::IfRinging
        } else {
            Notify::Always
        };
        let mut stopped = self.stop_internal(id, notify).await;
        if let Some(primary) = id.primary() {
            stopped |= self.stop_internal(primary, Notify::Always).await;
        }
        if let Some(backup) = id.backup() {
            self.stop_internal(backup, Notify::IfRinging).await;
        }
        if !stopped {
            debug!(id = %id, "Stop for unknown alarm ignored");
        }
        self.settle().await;
        stopped
    }

    /// Stop every known alarm, in memory or only persisted. Returns how many
    /// primaries were stopped.
    pub async fn stop_all(&mut self) -> usize {
        let mut ids: BTreeSet<AlarmId> = self.alarms.keys().copied().collect();
        match self.registry.list_all() {
            Ok(records) => ids.extend(records.iter().map(|r| r.id)),
            Err(e) => error!(error = %e, "Failed to list persisted alarms"),
        }

        for id in &ids {
            self.stop_requests.mark_stop_requested(*id);
        }

        let (backups, primaries): (Vec<AlarmId>, Vec<AlarmId>) =
            ids.into_iter().partition(|id| id.is_backup());
        let mut count = 0;
        for id in primaries {
            if self.stop_internal(id, Notify::Always).await {
                count += 1;
            }
        }
        for id in backups {
            self.stop_internal(id, Notify::IfRinging).await;
        }

        info!(count, "Stopped all alarms");
        self.settle().await;
        count
    }

    pub async fn handle_trigger(&mut self, event: TriggerEvent) -> Option<FireOutcome> {
        match event {
            TriggerEvent::Fire { id, generation } => {
                if !self.scheduler.claim(id, generation) {
                    trace!(id = %id, generation, "Dropping superseded fire event");
                    return Some(FireOutcome::Stale);
                }
                Some(self.fire(id).await)
            }
            TriggerEvent::PlaybackComplete { id, ring } => {
                let current = matches!(
                    self.alarms.get(&id),
                    Some(Alarm { phase: Phase::Ringing { ring: r }, .. }) if *r == ring
                );
                if current {
                    info!(id = %id, "Playback finished");
                    self.finish(id).await;
                } else {
                    trace!(id = %id, ring, "Ignoring completion of an earlier ring");
                }
                None
            }
        }
    }

    /// Rebuild in-memory state from the registry.
    ///
    /// Records with no in-memory alarm are adopted as scheduled; scheduled
    /// alarms whose record vanished are dropped, ringing ones stopped. Every
    /// scheduled alarm without a live timer gets one again, and those already
    /// past due ring now.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let records = self.registry.list_all()?;
        let persisted: HashSet<AlarmId> = records.iter().map(|r| r.id).collect();

        let mut adopted = 0;
        for record in records {
            if let Entry::Vacant(slot) = self.alarms.entry(record.id) {
                debug!(id = %record.id, "Adopting persisted alarm");
                slot.insert(Alarm::scheduled(record));
                adopted += 1;
            }
        }

        let vanished: Vec<(AlarmId, bool)> = self
            .alarms
            .iter()
            .filter(|(id, _)| !persisted.contains(id))
            .map(|(id, alarm)| (*id, alarm.is_ringing()))
            .collect();
        for (id, ringing) in vanished {
            if ringing {
                info!(id = %id, "Record of ringing alarm removed; stopping");
                self.stop_internal(id, Notify::Always).await;
            } else {
                debug!(id = %id, "Record removed; dropping alarm");
                self.scheduler.disarm(id);
                self.alarms.remove(&id);
            }
        }

        let scheduled: Vec<AlarmRecord> = self
            .alarms
            .values()
            .filter(|a| !a.is_ringing())
            .map(|a| a.record.clone())
            .collect();
        let report = ReconcileReport {
            adopted,
            ..self.scheduler.reconcile(&scheduled)
        };
        if report != ReconcileReport::default() {
            info!(
                adopted = report.adopted,
                rescheduled = report.rescheduled,
                fired_immediately = report.fired_immediately,
                "Reconciled alarms"
            );
        }

        self.settle().await;
        Ok(report)
    }

    async fn fire(&mut self, id: AlarmId) -> FireOutcome {
        let Some(alarm) = self.alarms.get(&id) else {
            return FireOutcome::Stale;
        };
        if alarm.is_ringing() {
            return FireOutcome::AlreadyRinging;
        }

        match self.registry.exists(id) {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = %id, "Alarm record gone; dropping fire event");
                self.alarms.remove(&id);
                self.update_state().await;
                return FireOutcome::Stale;
            }
            // Ringing a stale alarm beats missing a live one.
            Err(e) => warn!(id = %id, error = %e, "Cannot read alarm record; ringing anyway"),
        }

        if let Some(guard) = self.check_guards(id) {
            return match guard {
                Guard::Defer => {
                    self.defer_backup(id);
                    FireOutcome::Deferred
                }
                Guard::TakeOver(backup) => {
                    info!(id = %id, backup = %backup, "Primary taking over from its backup");
                    self.stop_internal(backup, Notify::IfRinging).await;
                    self.ring(id).await;
                    FireOutcome::Rang
                }
                Guard::Reject(reason) => {
                    info!(id = %id, %reason, "Alarm rejected");
                    self.finish(id).await;
                    FireOutcome::Rejected(reason)
                }
            };
        }

        self.ring(id).await;
        FireOutcome::Rang
    }

    fn check_guards(&self, id: AlarmId) -> Option<Guard> {
        if self.stop_requests.is_stop_requested(id) {
            return Some(Guard::Reject(GuardRejection::StopRequested));
        }
        if id.primary().is_some_and(|p| self.is_ringing(p)) {
            return Some(Guard::Defer);
        }
        if let Some(backup) = id.backup().filter(|b| self.is_ringing(*b)) {
            return Some(Guard::TakeOver(backup));
        }

        let allow_overlap = self
            .alarms
            .get(&id)
            .is_some_and(|a| a.record.allow_overlap);
        if !allow_overlap {
            let other = self
                .alarms
                .iter()
                .find(|(other, a)| **other != id && a.is_ringing())
                .map(|(other, _)| *other);
            if let Some(ringing) = other {
                return Some(Guard::Reject(GuardRejection::Overlap { ringing }));
            }
        }

        if !id.is_backup() && !self.effects.readiness.is_ready() {
            return Some(Guard::Reject(GuardRejection::HostNotReady));
        }
        None
    }

    async fn ring(&mut self, id: AlarmId) {
        self.next_ring += 1;
        let ring = self.next_ring;
        let Some(alarm) = self.alarms.get_mut(&id) else {
            return;
        };
        alarm.phase = Phase::Ringing { ring };
        let record = alarm.record.clone();
        info!(id = %id, "Alarm ringing");

        let fx = self.effects.clone();
        if let Some(target) = record.volume.volume {
            log_failure(
                Some(id),
                "set volume",
                fx.volume.set(target, record.volume.volume_enforced).await,
            );
        }
        log_failure(Some(id), "request audio focus", fx.volume.request_focus().await);
        log_failure(
            Some(id),
            "show notification",
            fx.notifier.show(id, &record.notification).await,
        );

        let completion = (!record.loop_audio)
            .then(|| PlaybackCompletion::new(id, ring, self.trigger_tx.clone()));
        let request = PlayRequest {
            id,
            path: record.audio_path.clone(),
            looping: record.loop_audio,
            fade: record.volume.fade_plan(),
        };
        log_failure(Some(id), "play audio", fx.audio.play(request, completion).await);

        if record.vibrate {
            log_failure(
                Some(id),
                "start vibration",
                fx.vibrator.start(&VIBRATION_PATTERN).await,
            );
        }

        if id.is_primary() {
            if let Some(duplicate) = self.backup.duplicate_after_ring(&record) {
                self.arm_backup(duplicate);
            }
        }

        self.update_state().await;

        if let Delivery::Failed(reason) = fx.events.alarm_rang(id).await {
            warn!(id = %id, %reason, "Application did not receive ring event");
            if record.stop_on_host_termination {
                info!(id = %id, "Host gone; stopping alarm");
                self.finish(id).await;
            }
        }
    }

    /// Stop an alarm that ended on its own or was rejected, together with
    /// its backup.
    async fn finish(&mut self, id: AlarmId) {
        self.stop_internal(id, Notify::Always).await;
        if let Some(backup) = id.backup() {
            self.stop_internal(backup, Notify::IfRinging).await;
        }
        self.settle().await;
    }

    /// Move `id` to `Stopped`. Returns false if the alarm was unknown both in
    /// memory and in the registry, in which case nothing is emitted.
    async fn stop_internal(&mut self, id: AlarmId, notify: Notify) -> bool {
        self.scheduler.disarm(id);
        let alarm = self.alarms.remove(&id);
        let persisted = self.registry.exists(id).unwrap_or_else(|e| {
            warn!(id = %id, error = %e, "Cannot read alarm record");
            false
        });
        if alarm.is_none() && !persisted {
            return false;
        }

        let was_ringing = alarm.as_ref().is_some_and(Alarm::is_ringing);
        if was_ringing {
            self.release(id).await;
        }
        log_failure(
            Some(id),
            "cancel notification",
            self.effects.notifier.cancel(id).await,
        );
        if let Err(e) = self.registry.remove(id) {
            error!(id = %id, error = %e, "Failed to remove alarm record");
        }
        debug!(id = %id, was_ringing, "Alarm stopped");

        if notify == Notify::Always || was_ringing {
            if let Delivery::Failed(reason) = self.effects.events.alarm_stopped(id).await {
                warn!(id = %id, %reason, "Application did not receive stop event");
            }
        }
        true
    }

    /// Give up the side-effect session held by a ringing alarm. Shared
    /// resources are only released once no alarm audio is left.
    async fn release(&self, id: AlarmId) {
        let fx = &self.effects;
        log_failure(Some(id), "stop audio", fx.audio.stop(id).await);
        if fx.audio.is_idle() {
            log_failure(Some(id), "stop vibration", fx.vibrator.stop().await);
            log_failure(Some(id), "restore volume", fx.volume.restore().await);
            log_failure(Some(id), "abandon audio focus", fx.volume.abandon_focus().await);
        }
    }

    fn arm_backup(&mut self, record: AlarmRecord) {
        if let Err(e) = self.registry.save(&record) {
            warn!(id = %record.id, error = %e, "Failed to persist backup alarm");
            return;
        }
        self.scheduler.arm(&record);
        debug!(id = %record.id, fire_time = %record.fire_time, "Backup armed");
        self.alarms.insert(record.id, Alarm::scheduled(record));
    }

    fn defer_backup(&mut self, id: AlarmId) {
        let fire_time = self.backup.deferred_fire_time();
        let Some(alarm) = self.alarms.get(&id) else {
            return;
        };
        let record = AlarmRecord {
            fire_time,
            ..alarm.record.clone()
        };
        debug!(id = %id, %fire_time, "Primary still ringing; deferring backup");
        self.arm_backup(record);
    }

    fn is_ringing(&self, id: AlarmId) -> bool {
        self.alarms.get(&id).is_some_and(Alarm::is_ringing)
    }

    async fn settle(&mut self) {
        if let Err(e) = self.backup.resolve_reminders(&self.registry).await {
            warn!(error = %e, "Failed to resolve reminder burst");
        }
        self.update_state().await;
    }

    /// Publish the snapshot and bring monitoring and background audio in
    /// line with it.
    async fn update_state(&mut self) {
        let snapshot = self.snapshot();
        let any_ringing = !snapshot.ringing.is_empty();

        if any_ringing || snapshot.warn_on_kill {
            self.watchdog.start_monitoring();
        } else {
            self.watchdog.stop_monitoring();
        }

        let background = !any_ringing
            && self
                .alarms
                .values()
                .any(|a| !a.is_ringing() && a.record.background_audio);
        if background != self.background_audio {
            self.background_audio = background;
            log_failure(
                None,
                "set background audio",
                self.effects.audio.set_background_audio(background).await,
            );
        }

        self.snapshot_tx.send_replace(snapshot);
    }

    fn snapshot(&self) -> AlarmSnapshot {
        let mut snapshot = AlarmSnapshot::default();
        for (id, alarm) in &self.alarms {
            match alarm.phase {
                Phase::Ringing { .. } => snapshot.ringing.push(RingingAlarm {
                    id: *id,
                    stop_on_termination: alarm.record.stop_on_host_termination,
                    notification: alarm.record.notification.clone(),
                }),
                Phase::Scheduled => {
                    snapshot.scheduled.push(*id);
                    snapshot.warn_on_kill |= alarm.record.warn_on_kill;
                }
            }
        }
        snapshot.ringing.sort_by_key(|r| r.id);
        snapshot.scheduled.sort();
        snapshot
    }
}

enum Guard {
    Defer,
    /// The primary fired while its own backup rings.
    TakeOver(AlarmId),
    Reject(GuardRejection),
}
