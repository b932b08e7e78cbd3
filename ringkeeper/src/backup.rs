//! Redundancy against the process going away.
//!
//! Two mechanisms live here:
//!
//! - An optional duplicate alarm armed a fixed offset behind each primary.
//!   It is resolved together with its primary and never chains further.
//! - The reminder burst: when the process is terminated while an alarm
//!   rings, a bounded series of host-delivered notifications is scheduled so
//!   the user still gets woken. The burst is persisted, so starting it twice
//!   is a no-op and a later process can cancel it once the alarms it covers
//!   are resolved.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::alarm::{AlarmId, AlarmRecord, NotificationContent};
use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::effects::{Notifier, log_failure};
use crate::registry::AlarmRegistry;
use crate::store::{KeyValueStore, StoreResult};
use crate::tracing::prelude::*;

const BURST_KEY: &str = "__reminder_burst__";

/// A reminder burst in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderBurst {
    /// Alarms that were ringing when the burst started.
    pub alarm_ids: Vec<AlarmId>,
    pub reminder_ids: Vec<AlarmId>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstStart {
    /// This many reminders were scheduled.
    Started(usize),
    /// A burst was already active; nothing new was scheduled.
    AlreadyActive,
}

pub struct BackupChainManager {
    config: BackupConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn Notifier>,
    // Held across the check-then-schedule of a burst.
    burst: Mutex<()>,
}

impl BackupChainManager {
    pub fn new(
        config: BackupConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            clock,
            store,
            notifier,
            burst: Mutex::new(()),
        }
    }

    /// The duplicate to arm alongside a freshly armed primary.
    pub fn duplicate_of(&self, primary: &AlarmRecord) -> Option<AlarmRecord> {
        if !self.config.duplicate_alarms {
            return None;
        }
        primary.as_backup(primary.fire_time + self.config.duplicate_offset)
    }

    /// The duplicate to re-arm once a primary has started ringing.
    pub fn duplicate_after_ring(&self, primary: &AlarmRecord) -> Option<AlarmRecord> {
        if !self.config.duplicate_alarms {
            return None;
        }
        primary.as_backup(self.deferred_fire_time())
    }

    /// When a backup that cannot ring yet should try again.
    pub fn deferred_fire_time(&self) -> OffsetDateTime {
        self.clock.now() + self.config.duplicate_offset
    }

    pub fn active_burst(&self) -> StoreResult<Option<ReminderBurst>> {
        self.store
            .get(BURST_KEY)?
            .map(|raw| serde_json::from_str(&raw).map_err(Into::into))
            .transpose()
    }

    /// Schedule the reminder burst for the alarms ringing at termination.
    ///
    /// The burst is persisted before the reminders are handed to the
    /// notifier, so a second call while the first is still scheduling sees
    /// it and stands down.
    pub async fn start_reminder_burst(
        &self,
        ringing: &[(AlarmId, NotificationContent)],
    ) -> StoreResult<BurstStart> {
        let _guard = self.burst.lock().await;

        if self.active_burst()?.is_some() {
            debug!("Reminder burst already active");
            return Ok(BurstStart::AlreadyActive);
        }
        let Some((_, content)) = ringing.first() else {
            return Ok(BurstStart::Started(0));
        };

        let started_at = self.clock.now();
        let burst = ReminderBurst {
            alarm_ids: ringing.iter().map(|(id, _)| *id).collect(),
            reminder_ids: (0..self.config.reminder_count)
                .map(AlarmId::reminder)
                .collect(),
            started_at,
        };
        self.store.put(BURST_KEY, &serde_json::to_string(&burst)?)?;

        let spacing = self.config.reminder_spacing;
        let schedules = burst.reminder_ids.iter().zip(1u32..).map(|(id, n)| {
            let at = started_at + spacing * n;
            async move {
                let result = self.notifier.schedule_reminder(*id, at, content).await;
                log_failure(Some(*id), "schedule reminder", result);
            }
        });
        futures::future::join_all(schedules).await;

        info!(
            alarms = ?burst.alarm_ids,
            reminders = burst.reminder_ids.len(),
            "Reminder burst scheduled"
        );
        Ok(BurstStart::Started(burst.reminder_ids.len()))
    }

    /// Cancel the active burst once none of the alarms it covers has a
    /// record left. Returns whether a burst was cleared.
    pub async fn resolve_reminders(&self, registry: &AlarmRegistry) -> StoreResult<bool> {
        let _guard = self.burst.lock().await;

        let Some(burst) = self.active_burst()? else {
            return Ok(false);
        };
        for id in &burst.alarm_ids {
            if registry.exists(*id)? {
                return Ok(false);
            }
        }

        for id in &burst.reminder_ids {
            log_failure(
                Some(*id),
                "cancel reminder",
                self.notifier.cancel_reminder(*id).await,
            );
        }
        self.store.remove(BURST_KEY)?;
        info!(alarms = ?burst.alarm_ids, "Reminder burst resolved");
        Ok(true)
    }
}
