//! Acquisition options for [`Pool::get`](crate::Pool::get).

use std::path::{Path, PathBuf};

/// Options controlling a single acquisition and, where noted, the group
/// created on behalf of it.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Root path of the application; the key under which its workers are
    /// grouped.
    pub app_root: String,
    /// Directory holding the restart sentinels. `None` means
    /// `<app_root>/tmp`; a relative path is joined with `app_root`.
    pub restart_dir: Option<PathBuf>,
    /// Minimum seconds between real `stat` calls on the sentinel files.
    pub stat_throttle_rate: u64,
    /// When the application's group is saturated, wait for a slot instead
    /// of multiplexing onto a busy worker.
    pub use_global_queue: bool,
    /// Retire a worker after this many completed sessions; 0 disables.
    /// Fixed at group creation.
    pub max_requests: u64,
}

impl PoolOptions {
    /// Create options for `app_root` with all other settings at their
    /// defaults.
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            restart_dir: None,
            stat_throttle_rate: 0,
            use_global_queue: false,
            max_requests: 0,
        }
    }

    /// Set a custom restart-sentinel directory.
    pub fn with_restart_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.restart_dir = Some(dir.into());
        self
    }

    /// Set the sentinel `stat` throttle in seconds.
    pub fn with_stat_throttle_rate(mut self, seconds: u64) -> Self {
        self.stat_throttle_rate = seconds;
        self
    }

    /// Enable or disable waiting on the global queue.
    pub fn with_global_queue(mut self, enabled: bool) -> Self {
        self.use_global_queue = enabled;
        self
    }

    /// Set the per-worker session retirement threshold.
    pub fn with_max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Resolve the directory that holds `restart.txt` and
    /// `always_restart.txt` for this acquisition.
    pub(crate) fn resolved_restart_dir(&self) -> PathBuf {
        match &self.restart_dir {
            None => Path::new(&self.app_root).join("tmp"),
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => Path::new(&self.app_root).join(dir),
        }
    }
}
