use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Location of the persisted alarm store.
    pub store_path: PathBuf,

    /// Alarms due sooner than this skip timer registration and take the
    /// immediate path.
    pub immediate_threshold: Duration,

    /// Minimum delay before an immediate fire is delivered. A stop issued
    /// right after arming still lands inside it.
    pub immediate_grace: Duration,

    /// How long a stop request suppresses fire events for the same id.
    pub stop_request_expiry: Duration,

    /// Period of the background reconcile pass.
    pub reconcile_interval: Duration,

    pub backup: BackupConfig,

    pub termination: TerminationConfig,
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Arm a duplicate alarm alongside every primary.
    pub duplicate_alarms: bool,

    /// Distance of a duplicate alarm past its primary.
    pub duplicate_offset: Duration,

    /// Number of reminders scheduled when the process terminates mid-ring.
    pub reminder_count: u32,

    /// Spacing between consecutive reminders.
    pub reminder_spacing: Duration,
}

#[derive(Debug, Clone)]
pub struct TerminationConfig {
    /// Upper bound on termination handling. The host may kill the process
    /// outright if its termination hook runs longer.
    pub wait: Duration,

    pub warning_title: String,

    pub warning_body: String,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("ringkeeper-alarms.json"),
            immediate_threshold: Duration::from_secs(1),
            immediate_grace: Duration::from_millis(100),
            stop_request_expiry: Duration::from_secs(5),
            reconcile_interval: Duration::from_secs(60),
            backup: BackupConfig::default(),
            termination: TerminationConfig::default(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            duplicate_alarms: false,
            duplicate_offset: Duration::from_secs(20),
            reminder_count: 10,
            reminder_spacing: Duration::from_secs(30),
        }
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(3),
            warning_title: "Your alarms may not ring".to_string(),
            warning_body: "You killed the app. Please reopen so your alarms can be rescheduled."
                .to_string(),
        }
    }
}

impl RingConfig {
    /// Defaults overridden by `RINGKEEPER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup("RINGKEEPER_STORE") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(secs) = parse::<u64>(&lookup, "RINGKEEPER_RECONCILE_SECS")? {
            if secs == 0 {
                return Err(Error::Configuration(
                    "RINGKEEPER_RECONCILE_SECS must be positive".to_string(),
                ));
            }
            config.reconcile_interval = Duration::from_secs(secs);
        }
        if let Some(enabled) = parse_flag(&lookup, "RINGKEEPER_BACKUP_DUPLICATES")? {
            config.backup.duplicate_alarms = enabled;
        }
        if let Some(ms) = parse::<u64>(&lookup, "RINGKEEPER_TERMINATION_WAIT_MS")? {
            config.termination.wait = Duration::from_millis(ms);
        }
        if let Some(title) = lookup("RINGKEEPER_WARNING_TITLE") {
            config.termination.warning_title = title;
        }
        if let Some(body) = lookup("RINGKEEPER_WARNING_BODY") {
            config.termination.warning_body = body;
        }

        Ok(config)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| Error::Configuration(format!("{key}: cannot parse {raw:?}")))
        })
        .transpose()
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|raw| match raw.trim() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::Configuration(format!(
                "{key}: expected a boolean, got {other:?}"
            ))),
        })
        .transpose()
}
