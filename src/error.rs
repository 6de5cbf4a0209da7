//! Error types for procpool.

use thiserror::Error;

use crate::spawn::SpawnError;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("cannot spawn application '{app_root}': {source}")]
    Spawn {
        app_root: String,
        source: SpawnError,
    },

    #[error("cannot connect to an existing application instance for '{app_root}': {source}")]
    Connect {
        app_root: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to retrieve the system time: {0}")]
    TimeRetrieval(#[from] std::time::SystemTimeError),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
