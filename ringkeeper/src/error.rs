//! Crate-wide error type.

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The alarm record or service configuration is malformed. Nothing was
    /// created.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("alarm store: {0}")]
    Store(#[from] StoreError),

    /// The service actor has exited and no longer accepts commands.
    #[error("alarm service is not running")]
    ServiceStopped,
}

pub type Result<T> = std::result::Result<T, Error>;
