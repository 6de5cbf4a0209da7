//! The spawn service contract and its process-backed implementation.
//!
//! The pool itself never forks anything; it asks a [`SpawnService`] for
//! worker handles and opens sessions through them. [`CommandSpawner`] is
//! the bundled implementation that launches real worker processes; tests
//! and embedders are free to provide their own.

mod command;

pub use command::{CommandSpawner, CommandSpawnerConfig};

use std::io;

use thiserror::Error;

use crate::options::PoolOptions;
use crate::session::{CloseHook, Session};

/// Error produced when a spawn service cannot deliver a worker.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to launch worker process: {0}")]
    Io(#[from] io::Error),

    #[error("worker for '{app_root}' did not open its socket within {timeout_ms} ms")]
    NotReady { app_root: String, timeout_ms: u64 },

    #[error("{0}")]
    Service(String),
}

/// Produces and manages worker processes on behalf of the pool.
pub trait SpawnService: Send + Sync {
    /// Spawn a worker for `options.app_root`. May block.
    fn spawn(&self, options: &PoolOptions) -> Result<Box<dyn WorkerHandle>, SpawnError>;

    /// Discard any cached metadata for `app_root`, so the next spawn
    /// observes the application as currently deployed.
    fn reload(&self, app_root: &str);

    /// Process id of the spawn service itself.
    fn server_pid(&self) -> u32;
}

/// Handle to one live worker process.
///
/// Dropping the handle terminates the worker.
pub trait WorkerHandle: Send + std::fmt::Debug {
    /// Process id of the worker.
    fn pid(&self) -> u32;

    /// Root path of the application this worker serves.
    fn app_root(&self) -> &str;

    /// Open a new session against this worker.
    ///
    /// `on_close` must be invoked exactly once, when the returned session
    /// closes. It must not be invoked during `connect` itself: the hook
    /// re-enters the pool lock, which the caller holds. Fails with an I/O
    /// error if the worker has died.
    fn connect(&self, on_close: CloseHook) -> io::Result<Session>;
}
