//! The application-instance pool.
//!
//! The pool caches long-lived worker processes per application and hands
//! out sessions against them:
//!
//! ```text
//!                    ┌──────────────────────────┐
//!        get() ─────▶│  Pool (mutex + condvars) │────▶ Session
//!                    │                          │
//!                    │  groups: "/app/a" ─ W1 W2│
//!                    │          "/app/b" ─ W3   │
//!                    │  inactive: W3 (LRU→MRU)  │
//!                    └──────────┬───────────────┘
//!                               │ retires idle workers
//!                          reaper thread
//! ```
//!
//! Acquisition reuses an idle worker of the requested application when one
//! exists, spawns a new worker while capacity permits, evicts the globally
//! least-recently-used idle worker when the pool is full, and otherwise
//! either multiplexes onto the least-busy worker or blocks the caller.

mod acquire;
mod callback;
mod group;
mod reaper;
mod state;
mod worker;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{PoolError, Result};
use crate::options::PoolOptions;
use crate::session::{CloseHook, Session};
use crate::spawn::SpawnService;

use callback::SessionCloseCallback;
use state::PoolShared;

/// How often `get` retries when a freshly selected worker refuses the
/// session connection.
const MAX_GET_ATTEMPTS: u32 = 10;

/// Pool-wide limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global cap on workers across all applications.
    pub max: usize,
    /// Per-application cap; 0 disables.
    pub max_per_app: usize,
    /// Idle time after which the reaper retires a worker; zero disables.
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 20,
            max_per_app: 0,
            max_idle_time: Duration::from_secs(120),
        }
    }
}

/// A thread-safe, in-process pool of per-application worker processes.
///
/// Fully thread-safe for concurrent `get`, `clear`, setters, and
/// inspection. The pool lives inside one process: it owns threads and
/// heap state, so it is unusable after `fork`.
pub struct Pool {
    shared: Arc<PoolShared>,
    spawner: Arc<dyn SpawnService>,
    reaper: Option<JoinHandle<()>>,
}

impl Pool {
    /// Create a pool with default limits.
    pub fn new(spawner: Arc<dyn SpawnService>) -> Result<Self> {
        Self::with_config(spawner, PoolConfig::default())
    }

    /// Create a pool with the given limits and start its reaper thread.
    pub fn with_config(spawner: Arc<dyn SpawnService>, config: PoolConfig) -> Result<Self> {
        let shared = Arc::new(PoolShared::new(config));
        let reaper_shared = Arc::clone(&shared);
        let reaper = std::thread::Builder::new()
            .name("procpool-reaper".to_string())
            .stack_size(reaper::REAPER_STACK_SIZE)
            .spawn(move || reaper::run(reaper_shared))?;
        Ok(Self {
            shared,
            spawner,
            reaper: Some(reaper),
        })
    }

    /// Obtain a session on a worker of `options.app_root`.
    ///
    /// Blocks while the pool is saturated (see [`PoolOptions`] for the
    /// queueing policy). A worker that fails to accept the connection is
    /// retired and the acquisition retried; after `MAX_GET_ATTEMPTS`
    /// consecutive failures the last error surfaces as
    /// [`PoolError::Connect`].
    pub fn get(&self, options: &PoolOptions) -> Result<Session> {
        let mut attempt = 0;
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        loop {
            attempt += 1;

            let (guard, id) = self.spawn_or_use_existing(state, options)?;
            state = guard;
            debug_assert!(
                state.verify_state(),
                "pool state invalid:\n{}",
                state.inspect_unlocked()
            );

            let callback = SessionCloseCallback::new(Arc::clone(&self.shared), id);
            let hook: CloseHook = Box::new(move || callback.invoke());
            let connected = state.worker(id).handle.connect(hook);
            match connected {
                Ok(session) => return Ok(session),
                Err(source) => {
                    // The worker is unusable; retire it and try again.
                    {
                        let state = &mut *state;
                        state
                            .workers
                            .remove(&id)
                            .expect("worker record missing from arena");
                        state.remove_from_group(&options.app_root, id);
                        state.count -= 1;
                        state.active -= 1;
                    }
                    self.shared.change.notify_all();
                    debug_assert!(
                        state.verify_state(),
                        "pool state invalid:\n{}",
                        state.inspect_unlocked()
                    );
                    tracing::warn!(
                        app_root = %options.app_root,
                        attempt,
                        error = %source,
                        "failed to connect to worker, retiring it"
                    );
                    if attempt == MAX_GET_ATTEMPTS {
                        return Err(PoolError::Connect {
                            app_root: options.app_root.clone(),
                            source,
                        });
                    }
                }
            }
        }
    }

    /// Terminate every worker and forget all groups.
    ///
    /// Also resets the restart-sentinel observations and tells the spawn
    /// service to drop its cached metadata for every cleared application.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        let app_roots: Vec<String> = state.groups.keys().cloned().collect();
        state.groups.clear();
        state.inactive.clear();
        state.workers.clear(); // handle drops terminate the worker processes
        state.count = 0;
        state.active = 0;
        state.reset_file_checks();
        for app_root in &app_roots {
            self.spawner.reload(app_root);
        }
        self.shared.change.notify_all();
        tracing::debug!(groups = app_roots.len(), "cleared pool");
    }

    /// Change the idle threshold and wake the reaper so it takes effect.
    pub fn set_max_idle_time(&self, max_idle_time: Duration) {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        state.max_idle_time = max_idle_time;
        self.shared.reaper_wakeup.notify_one();
    }

    /// Change the global worker cap; may unblock queued callers.
    pub fn set_max(&self, max: usize) {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        state.max = max;
        self.shared.change.notify_all();
    }

    /// Change the per-application cap; may unblock queued callers.
    pub fn set_max_per_app(&self, max_per_app: usize) {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        state.max_per_app = max_per_app;
        self.shared.change.notify_all();
    }

    /// Number of workers with outstanding sessions, as a point-in-time
    /// snapshot.
    pub fn active(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .active
    }

    /// Total number of workers, as a point-in-time snapshot.
    pub fn count(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .count
    }

    /// Number of callers currently blocked on the global queue.
    pub fn waiting_on_global_queue(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .waiting_on_global_queue
    }

    /// Process id of the spawn service.
    pub fn spawn_server_pid(&self) -> u32 {
        self.spawner.server_pid()
    }

    /// Textual report of counters and per-group worker summaries.
    pub fn inspect(&self) -> String {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .inspect_unlocked()
    }

    /// XML report of the same information as [`Pool::inspect`].
    pub fn to_xml(&self, include_sensitive: bool) -> String {
        self.shared
            .state
            .lock()
            .expect("pool state lock poisoned")
            .to_xml_unlocked(include_sensitive)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("pool state lock poisoned");
            state.shutdown = true;
            self.shared.reaper_wakeup.notify_one();
        }
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
        // The shared state (and with it every worker handle) drops once
        // the last outstanding session is gone.
    }
}
