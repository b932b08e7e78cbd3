//! Alarm lifecycle service.
//!
//! Keeps user-scheduled alarms ringing at their target time even when the
//! hosting process is suspended, killed or restarted. The persisted record of
//! each alarm is the source of truth; in-memory timers are a cache rebuilt by
//! [`service::AlarmHandle::reconcile`].
//!
//! The pieces, leaves first:
//!
//! - [`registry`]: durable alarm records over a [`store::KeyValueStore`]
//! - [`stop_request`]: windowed stop-request tracking for the stop/start race
//! - [`scheduler`]: one pending wake-up per alarm
//! - [`ringing`]: the per-alarm state machine and its fire guards
//! - [`backup`]: duplicate alarms and the termination reminder burst
//! - [`watchdog`]: process-termination handling
//! - [`service`]: the actor that serializes every trigger

pub mod alarm;
pub mod backup;
pub mod clock;
pub mod config;
pub mod effects;
pub mod error;
pub mod registry;
pub mod ringing;
pub mod scheduler;
pub mod service;
pub mod stop_request;
pub mod store;
pub mod tracing;
pub mod watchdog;

pub use alarm::{AlarmId, AlarmRecord, AlarmState, NotificationContent, VolumeSettings};
pub use config::RingConfig;
pub use error::{Error, Result};
pub use service::{AlarmHandle, AlarmService};
