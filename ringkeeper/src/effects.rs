//! Side-effect subsystems driven by the state machine.
//!
//! Audio, vibration, volume, notifications and the embedding application
//! are external collaborators. The core reaches them only through the traits
//! here and treats every failure as something to log, never as a reason to
//! leave a transition half done.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::alarm::{AlarmId, FadePlan, NotificationContent};
use crate::scheduler::TriggerEvent;
use crate::tracing::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum EffectError {
    #[error("{subsystem} unavailable: {reason}")]
    Unavailable {
        subsystem: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Failed(String),
}

pub type EffectResult = std::result::Result<(), EffectError>;

/// Outcome of telling the embedding application about a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Acknowledged,
    Failed(String),
}

impl Delivery {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Delivery::Acknowledged)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub id: AlarmId,
    pub path: String,
    pub looping: bool,
    pub fade: FadePlan,
}

/// Handed to the audio backend for non-looping playback. Completing it moves
/// the alarm to `Stopped`.
#[derive(Debug)]
pub struct PlaybackCompletion {
    id: AlarmId,
    ring: u64,
    tx: mpsc::Sender<TriggerEvent>,
}

impl PlaybackCompletion {
    pub(crate) fn new(id: AlarmId, ring: u64, tx: mpsc::Sender<TriggerEvent>) -> Self {
        Self { id, ring, tx }
    }

    pub fn id(&self) -> AlarmId {
        self.id
    }

    /// Report that playback reached its natural end.
    pub async fn complete(self) {
        let event = TriggerEvent::PlaybackComplete {
            id: self.id,
            ring: self.ring,
        };
        if self.tx.send(event).await.is_err() {
            debug!(id = %self.id, "Alarm service gone; dropping playback completion");
        }
    }
}

#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(
        &self,
        request: PlayRequest,
        completion: Option<PlaybackCompletion>,
    ) -> EffectResult;

    async fn stop(&self, id: AlarmId) -> EffectResult;

    /// No alarm audio is playing.
    fn is_idle(&self) -> bool;

    /// Silent keep-alive audio while alarms are pending.
    async fn set_background_audio(&self, enabled: bool) -> EffectResult;
}

#[async_trait]
pub trait Vibrator: Send + Sync {
    async fn start(&self, pattern: &[Duration]) -> EffectResult;

    async fn stop(&self) -> EffectResult;
}

#[async_trait]
pub trait VolumeControl: Send + Sync {
    async fn set(&self, target: f32, enforced: bool) -> EffectResult;

    /// Return to the volume in effect before the last `set`.
    async fn restore(&self) -> EffectResult;

    async fn request_focus(&self) -> EffectResult;

    async fn abandon_focus(&self) -> EffectResult;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, id: AlarmId, content: &NotificationContent) -> EffectResult;

    async fn cancel(&self, id: AlarmId) -> EffectResult;

    async fn send_warning(&self, title: &str, body: &str) -> EffectResult;

    /// Schedule a notification delivered by the host even if this process
    /// is gone by then.
    async fn schedule_reminder(
        &self,
        id: AlarmId,
        at: OffsetDateTime,
        content: &NotificationContent,
    ) -> EffectResult;

    async fn cancel_reminder(&self, id: AlarmId) -> EffectResult;
}

/// Whether the embedding application is in a state where ringing makes
/// sense.
pub trait HostReadiness: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Outbound notifications to the embedding application.
#[async_trait]
pub trait AppEvents: Send + Sync {
    async fn alarm_rang(&self, id: AlarmId) -> Delivery;

    async fn alarm_stopped(&self, id: AlarmId) -> Delivery;
}

/// The collaborators one state machine drives.
#[derive(Clone)]
pub struct SideEffects {
    pub audio: Arc<dyn AudioPlayer>,
    pub vibrator: Arc<dyn Vibrator>,
    pub volume: Arc<dyn VolumeControl>,
    pub notifier: Arc<dyn Notifier>,
    pub readiness: Arc<dyn HostReadiness>,
    pub events: Arc<dyn AppEvents>,
}

impl SideEffects {
    /// Use one backend for every subsystem.
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: AudioPlayer + Vibrator + VolumeControl + Notifier + HostReadiness + AppEvents + 'static,
    {
        Self {
            audio: backend.clone(),
            vibrator: backend.clone(),
            volume: backend.clone(),
            notifier: backend.clone(),
            readiness: backend.clone(),
            events: backend,
        }
    }
}

/// Log a failed side effect and carry on.
pub(crate) fn log_failure(id: Option<AlarmId>, action: &'static str, result: EffectResult) {
    if let Err(e) = result {
        match id {
            Some(id) => warn!(id = %id, action, error = %e, "Side effect failed"),
            None => warn!(action, error = %e, "Side effect failed"),
        }
    }
}

/// One call made against [`SimulatedEffects`].
#[derive(Debug, Clone, PartialEq)]
pub enum EffectCall {
    Play { id: AlarmId, looping: bool },
    StopAudio(AlarmId),
    BackgroundAudio(bool),
    StartVibration,
    StopVibration,
    SetVolume { target: f32, enforced: bool },
    RestoreVolume,
    RequestFocus,
    AbandonFocus,
    ShowNotification(AlarmId),
    CancelNotification(AlarmId),
    Warning { title: String, body: String },
    ScheduleReminder { id: AlarmId, at: OffsetDateTime },
    CancelReminder(AlarmId),
    Rang(AlarmId),
    Stopped(AlarmId),
}

/// Headless backend for every side-effect trait.
///
/// Logs and records each call instead of touching hardware. Non-looping
/// playback "ends" after a fixed duration. Used by the daemon when no real
/// backend is attached, and by tests to observe what the core did.
#[derive(Debug)]
pub struct SimulatedEffects {
    playback: Duration,
    notifier_latency: Mutex<Duration>,
    calls: Mutex<Vec<EffectCall>>,
    playing: Arc<Mutex<HashSet<AlarmId>>>,
    host_ready: AtomicBool,
    host_attached: AtomicBool,
    audio_broken: AtomicBool,
}

impl SimulatedEffects {
    /// `playback` is how long a non-looping sound plays before completing.
    pub fn new(playback: Duration) -> Self {
        Self {
            playback,
            notifier_latency: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            playing: Arc::new(Mutex::new(HashSet::new())),
            host_ready: AtomicBool::new(true),
            host_attached: AtomicBool::new(true),
            audio_broken: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<EffectCall> {
        self.calls.lock().clone()
    }

    pub fn rang(&self) -> Vec<AlarmId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                EffectCall::Rang(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn stopped(&self) -> Vec<AlarmId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                EffectCall::Stopped(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub fn playing(&self) -> Vec<AlarmId> {
        let mut ids: Vec<_> = self.playing.lock().iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn set_host_ready(&self, ready: bool) {
        self.host_ready.store(ready, Ordering::SeqCst);
    }

    /// When detached, outbound app events report delivery failure.
    pub fn set_host_attached(&self, attached: bool) {
        self.host_attached.store(attached, Ordering::SeqCst);
    }

    /// Make every audio call fail.
    pub fn set_audio_broken(&self, broken: bool) {
        self.audio_broken.store(broken, Ordering::SeqCst);
    }

    /// Delay every warning and reminder call by `latency`.
    pub fn set_notifier_latency(&self, latency: Duration) {
        *self.notifier_latency.lock() = latency;
    }

    fn record(&self, call: EffectCall) {
        self.calls.lock().push(call);
    }

    fn audio_check(&self) -> EffectResult {
        if self.audio_broken.load(Ordering::SeqCst) {
            return Err(EffectError::Unavailable {
                subsystem: "audio",
                reason: "simulated driver failure".to_string(),
            });
        }
        Ok(())
    }

    async fn notifier_delay(&self) {
        let latency = *self.notifier_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn delivery(&self) -> Delivery {
        if self.host_attached.load(Ordering::SeqCst) {
            Delivery::Acknowledged
        } else {
            Delivery::Failed("host not attached".to_string())
        }
    }
}

#[async_trait]
impl AudioPlayer for SimulatedEffects {
    async fn play(
        &self,
        request: PlayRequest,
        completion: Option<PlaybackCompletion>,
    ) -> EffectResult {
        self.audio_check()?;
        info!(id = %request.id, path = %request.path, looping = request.looping, "Playing alarm audio");
        self.record(EffectCall::Play {
            id: request.id,
            looping: request.looping,
        });
        self.playing.lock().insert(request.id);

        if let Some(completion) = completion {
            let playing = self.playing.clone();
            let playback = self.playback;
            tokio::spawn(async move {
                tokio::time::sleep(playback).await;
                if playing.lock().remove(&completion.id()) {
                    completion.complete().await;
                }
            });
        }
        Ok(())
    }

    async fn stop(&self, id: AlarmId) -> EffectResult {
        self.audio_check()?;
        debug!(id = %id, "Stopping alarm audio");
        self.record(EffectCall::StopAudio(id));
        self.playing.lock().remove(&id);
        Ok(())
    }

    fn is_idle(&self) -> bool {
        self.playing.lock().is_empty()
    }

    async fn set_background_audio(&self, enabled: bool) -> EffectResult {
        debug!(enabled, "Background audio");
        self.record(EffectCall::BackgroundAudio(enabled));
        Ok(())
    }
}

#[async_trait]
impl Vibrator for SimulatedEffects {
    async fn start(&self, pattern: &[Duration]) -> EffectResult {
        debug!(?pattern, "Vibration started");
        self.record(EffectCall::StartVibration);
        Ok(())
    }

    async fn stop(&self) -> EffectResult {
        debug!("Vibration stopped");
        self.record(EffectCall::StopVibration);
        Ok(())
    }
}

#[async_trait]
impl VolumeControl for SimulatedEffects {
    async fn set(&self, target: f32, enforced: bool) -> EffectResult {
        debug!(target, enforced, "System volume set");
        self.record(EffectCall::SetVolume { target, enforced });
        Ok(())
    }

    async fn restore(&self) -> EffectResult {
        self.record(EffectCall::RestoreVolume);
        Ok(())
    }

    async fn request_focus(&self) -> EffectResult {
        self.record(EffectCall::RequestFocus);
        Ok(())
    }

    async fn abandon_focus(&self) -> EffectResult {
        self.record(EffectCall::AbandonFocus);
        Ok(())
    }
}

#[async_trait]
impl Notifier for SimulatedEffects {
    async fn show(&self, id: AlarmId, content: &NotificationContent) -> EffectResult {
        info!(id = %id, title = %content.title, "Showing alarm notification");
        self.record(EffectCall::ShowNotification(id));
        Ok(())
    }

    async fn cancel(&self, id: AlarmId) -> EffectResult {
        self.record(EffectCall::CancelNotification(id));
        Ok(())
    }

    async fn send_warning(&self, title: &str, body: &str) -> EffectResult {
        self.notifier_delay().await;
        warn!(title, body, "Warning notification");
        self.record(EffectCall::Warning {
            title: title.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn schedule_reminder(
        &self,
        id: AlarmId,
        at: OffsetDateTime,
        content: &NotificationContent,
    ) -> EffectResult {
        self.notifier_delay().await;
        debug!(id = id.0, %at, title = %content.title, "Reminder scheduled");
        self.record(EffectCall::ScheduleReminder { id, at });
        Ok(())
    }

    async fn cancel_reminder(&self, id: AlarmId) -> EffectResult {
        self.record(EffectCall::CancelReminder(id));
        Ok(())
    }
}

impl HostReadiness for SimulatedEffects {
    fn is_ready(&self) -> bool {
        self.host_ready.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppEvents for SimulatedEffects {
    async fn alarm_rang(&self, id: AlarmId) -> Delivery {
        info!(id = %id, "Alarm rang");
        self.record(EffectCall::Rang(id));
        self.delivery()
    }

    async fn alarm_stopped(&self, id: AlarmId) -> Delivery {
        info!(id = %id, "Alarm stopped");
        self.record(EffectCall::Stopped(id));
        self.delivery()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn non_looping_playback_completes_after_duration() {
        let effects = SimulatedEffects::new(Duration::from_secs(4));
        let (tx, mut rx) = mpsc::channel(4);

        let request = PlayRequest {
            id: AlarmId(1),
            path: "assets/alarm.mp3".to_string(),
            looping: false,
            fade: FadePlan::Immediate,
        };
        effects
            .play(request, Some(PlaybackCompletion::new(AlarmId(1), 9, tx)))
            .await
            .unwrap();
        assert!(!effects.is_idle());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            rx.recv().await,
            Some(TriggerEvent::PlaybackComplete {
                id: AlarmId(1),
                ring: 9
            })
        );
        assert!(effects.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_playback_never_completes() {
        let effects = SimulatedEffects::new(Duration::from_secs(4));
        let (tx, mut rx) = mpsc::channel(4);

        let request = PlayRequest {
            id: AlarmId(1),
            path: "assets/alarm.mp3".to_string(),
            looping: false,
            fade: FadePlan::Immediate,
        };
        effects
            .play(request, Some(PlaybackCompletion::new(AlarmId(1), 1, tx)))
            .await
            .unwrap();
        AudioPlayer::stop(&effects, AlarmId(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broken_audio_reports_failure() {
        let effects = SimulatedEffects::new(Duration::from_secs(1));
        effects.set_audio_broken(true);

        let err = AudioPlayer::stop(&effects, AlarmId(1)).await.unwrap_err();
        assert!(matches!(err, EffectError::Unavailable { subsystem: "audio", .. }));
    }

    #[tokio::test]
    async fn detached_host_fails_delivery() {
        let effects = SimulatedEffects::new(Duration::from_secs(1));
        assert!(effects.alarm_rang(AlarmId(1)).await.is_acknowledged());

        effects.set_host_attached(false);
        assert_eq!(
            effects.alarm_stopped(AlarmId(1)).await,
            Delivery::Failed("host not attached".to_string())
        );
    }
}
