//! Shared pool state: the locked heart of the pool.
//!
//! Everything here is mutated only while holding [`PoolShared::state`].
//! Session close callbacks and the reaper thread keep the shared state
//! alive through an `Arc`, so it can outlive the [`Pool`](super::Pool)
//! facade itself.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::fs_check::{CachedFileStat, FileChangeChecker};
use crate::options::PoolOptions;

use super::PoolConfig;
use super::group::Group;
use super::worker::{WorkerId, WorkerRecord};

/// State shared between the pool facade, session close callbacks, and the
/// reaper thread.
pub(super) struct PoolShared {
    pub state: Mutex<PoolState>,
    /// Signalled whenever a worker goes idle, a cap changes, or a group is
    /// purged. All `get` waiters re-evaluate on wake.
    pub change: Condvar,
    /// Wakes the reaper early: shutdown, or `max_idle_time` changed.
    pub reaper_wakeup: Condvar,
}

impl PoolShared {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState::new(config)),
            change: Condvar::new(),
            reaper_wakeup: Condvar::new(),
        }
    }
}

pub(super) struct PoolState {
    /// Groups keyed by application root.
    pub groups: BTreeMap<String, Group>,
    /// Arena of worker records; group member lists and `inactive` hold ids
    /// into it.
    pub workers: HashMap<WorkerId, WorkerRecord>,
    /// Idle workers across all groups; front = least recently used.
    pub inactive: VecDeque<WorkerId>,
    /// Global worker cap.
    pub max: usize,
    /// Total workers across all groups.
    pub count: usize,
    /// Workers with outstanding sessions.
    pub active: usize,
    /// Per-application cap; 0 disables.
    pub max_per_app: usize,
    /// Idle time after which the reaper retires a worker; zero disables.
    pub max_idle_time: Duration,
    /// Callers currently blocked on the global queue.
    pub waiting_on_global_queue: usize,
    pub shutdown: bool,
    next_id: u64,
    cstat: CachedFileStat,
    change_checker: FileChangeChecker,
}

/// Current time as Unix seconds.
pub(super) fn unix_now() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

impl PoolState {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            groups: BTreeMap::new(),
            workers: HashMap::new(),
            inactive: VecDeque::new(),
            max: config.max,
            count: 0,
            active: 0,
            max_per_app: config.max_per_app,
            max_idle_time: config.max_idle_time,
            waiting_on_global_queue: 0,
            shutdown: false,
            next_id: 0,
            cstat: CachedFileStat::new(config.max.max(1)),
            change_checker: FileChangeChecker::new(),
        }
    }

    pub fn alloc_id(&mut self) -> WorkerId {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn worker(&self, id: WorkerId) -> &WorkerRecord {
        self.workers.get(&id).expect("worker record missing from arena")
    }

    pub fn worker_mut(&mut self, id: WorkerId) -> &mut WorkerRecord {
        self.workers
            .get_mut(&id)
            .expect("worker record missing from arena")
    }

    /// Remove `id` from the inactive list, wherever it sits.
    pub fn remove_inactive(&mut self, id: WorkerId) {
        if let Some(pos) = self.inactive.iter().position(|&w| w == id) {
            self.inactive.remove(pos);
        }
    }

    /// Remove `id` from its group's member list, dropping the group entry
    /// when it becomes empty.
    pub fn remove_from_group(&mut self, app_root: &str, id: WorkerId) {
        let now_empty = match self.groups.get_mut(app_root) {
            Some(group) => {
                group.remove(id);
                group.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove(app_root);
        }
    }

    /// Whether the application's workers must be discarded before the
    /// current acquisition proceeds.
    pub fn needs_restart(&mut self, options: &PoolOptions) -> Result<bool> {
        let restart_dir = options.resolved_restart_dir();
        let now = unix_now()?;
        let always_restart_file = restart_dir.join("always_restart.txt");
        let restart_file = restart_dir.join("restart.txt");
        Ok(self
            .cstat
            .exists(&always_restart_file, options.stat_throttle_rate, now)?
            || self
                .change_checker
                .changed(&restart_file, options.stat_throttle_rate, now)?)
    }

    /// Discard every worker of `app_root` along with the group entry.
    pub fn purge_group(&mut self, app_root: &str) {
        let Some(group) = self.groups.remove(app_root) else {
            return;
        };
        for id in group.members {
            let record = self
                .workers
                .remove(&id)
                .expect("worker record missing from arena");
            if record.sessions == 0 {
                self.remove_inactive(id);
            } else {
                self.active -= 1;
            }
            self.count -= 1;
            tracing::debug!(app_root, pid = record.handle.pid(), "purged worker");
        }
    }

    /// Evict the globally least-recently-used idle worker to make room.
    pub fn evict_lru(&mut self) {
        let id = self
            .inactive
            .pop_front()
            .expect("inactive list empty during eviction");
        let record = self
            .workers
            .remove(&id)
            .expect("worker record missing from arena");
        let app_root = record.handle.app_root().to_string();
        tracing::debug!(
            app_root = %app_root,
            pid = record.handle.pid(),
            "evicting least recently used idle worker"
        );
        self.remove_from_group(&app_root, id);
        self.count -= 1;
    }

    /// Forget all recorded sentinel observations.
    pub fn reset_file_checks(&mut self) {
        self.cstat.clear();
        self.change_checker.clear();
    }

    /// Check every invariant linking the groups, the arena, the inactive
    /// list, and the counters. Only called from debug assertions.
    pub fn verify_state(&self) -> bool {
        let mut total_size = 0;
        for group in self.groups.values() {
            if group.members.is_empty() {
                return false;
            }
            total_size += group.size();

            // Idle workers precede busy workers.
            let mut seen_busy = false;
            for &id in &group.members {
                let busy = self.worker(id).sessions > 0;
                if seen_busy && !busy {
                    return false;
                }
                seen_busy = seen_busy || busy;
            }
        }

        let idle_count = self.workers.values().filter(|w| w.sessions == 0).count();
        total_size == self.count
            && self.workers.len() == self.count
            && self.active <= self.count
            && self.inactive.len() == self.count - self.active
            && self.inactive.len() == idle_count
            && self
                .inactive
                .iter()
                .all(|&id| self.workers.get(&id).is_some_and(|w| w.sessions == 0))
    }

    /// Textual report for operators; caller holds the lock.
    pub fn inspect_unlocked(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(result, "----------- General information -----------");
        let _ = writeln!(result, "max      = {}", self.max);
        let _ = writeln!(result, "count    = {}", self.count);
        let _ = writeln!(result, "active   = {}", self.active);
        let _ = writeln!(result, "inactive = {}", self.inactive.len());
        let _ = writeln!(
            result,
            "Waiting on global queue: {}",
            self.waiting_on_global_queue
        );
        let _ = writeln!(result);
        let _ = writeln!(result, "----------- Groups -----------");
        for (app_root, group) in &self.groups {
            let _ = writeln!(result, "{app_root}:");
            for &id in &group.members {
                let record = self.worker(id);
                let _ = writeln!(
                    result,
                    "  PID: {:<5}   Sessions: {:<2}   Processed: {:<5}   Uptime: {}",
                    record.handle.pid(),
                    record.sessions,
                    record.processed,
                    record.uptime()
                );
            }
            let _ = writeln!(result);
        }
        result
    }

    /// XML report for operators; caller holds the lock.
    pub fn to_xml_unlocked(&self, include_sensitive: bool) -> String {
        let mut result = String::new();
        result.push_str("<?xml version=\"1.0\" encoding=\"iso8859-1\" ?>\n");
        result.push_str("<info>");
        if include_sensitive {
            result.push_str("<includes_sensitive_information/>");
        }
        result.push_str("<groups>");
        for (app_root, group) in &self.groups {
            result.push_str("<group>");
            let _ = write!(result, "<name>{}</name>", escape_xml(app_root));
            result.push_str("<processes>");
            for &id in &group.members {
                let record = self.worker(id);
                let _ = write!(
                    result,
                    "<process><pid>{}</pid><sessions>{}</sessions>\
                     <processed>{}</processed><uptime>{}</uptime></process>",
                    record.handle.pid(),
                    record.sessions,
                    record.processed,
                    record.uptime()
                );
            }
            result.push_str("</processes>");
            result.push_str("</group>");
        }
        result.push_str("</groups>");
        result.push_str("</info>");
        result
    }
}

fn escape_xml(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
