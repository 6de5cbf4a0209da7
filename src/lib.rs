//! procpool - a thread-safe pool of per-application worker processes.
//!
//! The pool caches long-lived worker processes grouped by application root
//! and hands out [`Session`]s against them. Acquisition reuses an idle
//! worker when one exists, spawns a new worker while capacity permits,
//! evicts the least-recently-used idle worker of another application when
//! the global cap is reached, and otherwise either multiplexes onto the
//! least-busy worker or blocks the caller until a slot frees up. Closing a
//! session returns its worker to the pool or retires it, per group policy.
//! A background reaper retires workers idle beyond a threshold, and
//! restart sentinel files (`restart.txt`, `always_restart.txt`) force an
//! application's workers to be respawned.
//!
//! Workers are produced by a [`SpawnService`]; [`CommandSpawner`] is the
//! bundled implementation that launches real OS processes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use procpool::{CommandSpawner, CommandSpawnerConfig, Pool, PoolOptions};
//!
//! fn main() -> procpool::Result<()> {
//!     let spawner = CommandSpawner::new(CommandSpawnerConfig::new(vec![
//!         "/usr/local/bin/app-worker".to_string(),
//!     ]));
//!     let pool = Pool::new(Arc::new(spawner))?;
//!
//!     let session = pool.get(&PoolOptions::new("/var/www/app"))?;
//!     // ... talk to the worker over session.stream() ...
//!     drop(session); // returns the worker to the pool
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod fs_check;
pub mod logging;
pub mod options;
pub mod pool;
pub mod session;
pub mod spawn;

pub use error::{PoolError, Result};
pub use options::PoolOptions;
pub use pool::{Pool, PoolConfig};
pub use session::{CloseHook, Session};
pub use spawn::{
    CommandSpawner, CommandSpawnerConfig, SpawnError, SpawnService, WorkerHandle,
};
