//! Alarm records and the identifiers that name them.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// Backup alarms live at `BACKUP_ID_OFFSET + primary`.
pub const BACKUP_ID_OFFSET: i64 = 1 << 32;

/// Reminder notifications live at `REMINDER_ID_OFFSET + n`. They are never
/// alarms.
pub const REMINDER_ID_OFFSET: i64 = 2 << 32;

/// Vibration pattern while ringing: off/on/off durations, repeated from the
/// second element.
pub const VIBRATION_PATTERN: [Duration; 3] = [
    Duration::ZERO,
    Duration::from_millis(500),
    Duration::from_millis(500),
];

/// Caller-assigned alarm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(pub i64);

impl AlarmId {
    /// Whether this id is in the range callers may assign.
    pub fn is_primary(self) -> bool {
        (1..BACKUP_ID_OFFSET).contains(&self.0)
    }

    pub fn is_backup(self) -> bool {
        (BACKUP_ID_OFFSET..REMINDER_ID_OFFSET).contains(&self.0)
    }

    /// The backup derived from this primary, if this is a primary.
    pub fn backup(self) -> Option<AlarmId> {
        self.is_primary().then(|| AlarmId(BACKUP_ID_OFFSET + self.0))
    }

    /// The primary this backup was derived from, if this is a backup.
    pub fn primary(self) -> Option<AlarmId> {
        self.is_backup().then(|| AlarmId(self.0 - BACKUP_ID_OFFSET))
    }

    pub fn reminder(index: u32) -> AlarmId {
        AlarmId(REMINDER_ID_OFFSET + i64::from(index))
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary() {
            Some(primary) => write!(f, "{}(backup)", primary.0),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<i64> for AlarmId {
    fn from(id: i64) -> Self {
        AlarmId(id)
    }
}

/// Lifecycle state of one alarm.
///
/// ```text
///             fire + guards pass
///  Scheduled ───────────────────► Ringing
///      │                             │
///      │ stop / guard rejected       │ stop / playback done / re-arm
///      ▼                             ▼
///   Stopped ◄────────────────────────┘
/// ```
///
/// `Stopped` is terminal: the record is gone and the id is free to be armed
/// again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AlarmState {
    Scheduled,
    Ringing,
    Stopped,
}

/// Everything needed to ring one alarm.
///
/// Records are never edited in place. Re-arming an id replaces the whole
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: AlarmId,

    #[serde(with = "time::serde::rfc3339")]
    pub fire_time: OffsetDateTime,

    pub audio_path: String,

    pub loop_audio: bool,

    pub volume: VolumeSettings,

    pub vibrate: bool,

    /// May ring while another alarm is already ringing.
    pub allow_overlap: bool,

    /// Stop ringing (and forget the alarm) when the host process goes away.
    pub stop_on_host_termination: bool,

    /// Warn the user if the process is killed while this alarm is pending.
    pub warn_on_kill: bool,

    /// Keep background audio running while this alarm is pending, so the
    /// host is less likely to suspend the process.
    pub background_audio: bool,

    pub notification: NotificationContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeSettings {
    /// System volume while ringing, in `[0, 1]`. `None` leaves the volume
    /// alone.
    pub volume: Option<f32>,

    /// Hold the system volume at `volume` while ringing.
    pub volume_enforced: bool,

    /// Ramp from silence to full over this long.
    pub fade_duration: Option<Duration>,

    /// Explicit fade envelope. Takes precedence over `fade_duration`.
    pub fade_steps: Vec<FadeStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FadeStep {
    /// Offset from the start of playback.
    pub time: Duration,
    pub volume: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub stop_button: Option<String>,
}

/// Playback volume envelope handed to the audio backend.
#[derive(Debug, Clone, PartialEq)]
pub enum FadePlan {
    /// Full volume from the first sample.
    Immediate,
    /// Move through these points, starting at the first.
    Steps(Vec<FadeStep>),
}

impl VolumeSettings {
    pub fn fade_plan(&self) -> FadePlan {
        if !self.fade_steps.is_empty() {
            FadePlan::Steps(self.fade_steps.clone())
        } else if let Some(duration) = self.fade_duration {
            FadePlan::Steps(vec![
                FadeStep {
                    time: Duration::ZERO,
                    volume: 0.0,
                },
                FadeStep {
                    time: duration,
                    volume: 1.0,
                },
            ])
        } else {
            FadePlan::Immediate
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(volume) = self.volume {
            check_unit("volume", volume)?;
        }
        if self.fade_duration == Some(Duration::ZERO) {
            return Err(invalid("fade duration must be positive"));
        }
        for step in &self.fade_steps {
            check_unit("fade step volume", step.volume)?;
        }
        if self.fade_steps.windows(2).any(|w| w[1].time < w[0].time) {
            return Err(invalid("fade steps must be ordered by time"));
        }
        Ok(())
    }
}

impl AlarmRecord {
    /// Reject records that cannot be armed.
    pub fn validate(&self) -> Result<()> {
        if !self.id.is_primary() {
            return Err(invalid(format!(
                "alarm id {} is outside 1..{BACKUP_ID_OFFSET}",
                self.id.0
            )));
        }
        if self.audio_path.trim().is_empty() {
            return Err(invalid("audio path is empty"));
        }
        if self.notification.title.trim().is_empty() {
            return Err(invalid("notification title is empty"));
        }
        self.volume.validate()
    }

    /// Copy of this record under its backup id, due at `fire_time`.
    pub(crate) fn as_backup(&self, fire_time: OffsetDateTime) -> Option<AlarmRecord> {
        Some(AlarmRecord {
            id: self.id.backup()?,
            fire_time,
            ..self.clone()
        })
    }
}

fn check_unit(what: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{what} {value} is outside [0, 1]")))
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}
