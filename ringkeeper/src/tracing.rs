//! Logging setup.
//!
//! Modules log through the [`prelude`] so the macros read the same
//! everywhere. Binaries call [`init`] once at startup.

use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt,
};

pub mod prelude {
    pub use ::tracing::{debug, error, info, trace, warn};
}

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber.
///
/// Logs go to the systemd journal when the process was started by systemd
/// (`JOURNAL_STREAM` is set) and to stdout otherwise.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald) => {
                registry.with(journald).init();
                return;
            }
            Err(e) => eprintln!("journald unavailable, logging to stdout: {e}"),
        }
    }

    registry
        .with(fmt::layer().with_timer(LocalTime::rfc_3339()))
        .init();
}
