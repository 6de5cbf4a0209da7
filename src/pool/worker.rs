//! Per-worker bookkeeping records.

use std::time::SystemTime;

use crate::spawn::WorkerHandle;

/// Identifier of a worker record in the pool's arena.
///
/// Ids are never reused, so a stale id held by a session close callback
/// simply fails to resolve once the worker has been retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct WorkerId(pub(super) u64);

/// State tracked for one worker process.
pub(super) struct WorkerRecord {
    pub handle: Box<dyn WorkerHandle>,
    pub start_time: SystemTime,
    /// Updated on acquisition and when the worker goes idle.
    pub last_used: SystemTime,
    /// Outstanding sessions against this worker.
    pub sessions: u32,
    /// Total completed sessions.
    pub processed: u64,
}

impl WorkerRecord {
    pub fn new(handle: Box<dyn WorkerHandle>) -> Self {
        let now = SystemTime::now();
        Self {
            handle,
            start_time: now,
            last_used: now,
            sessions: 0,
            processed: 0,
        }
    }

    /// Uptime of the worker process so far, as a human string.
    pub fn uptime(&self) -> String {
        let elapsed = SystemTime::now()
            .duration_since(self.start_time)
            .unwrap_or_default();
        format_uptime(elapsed.as_secs())
    }
}

/// Render a second count as `2h 3m 4s`, `5m 10s`, or `30s`.
pub(super) fn format_uptime(total_seconds: u64) -> String {
    let mut seconds = total_seconds;
    let mut result = String::new();
    if seconds >= 60 {
        let mut minutes = seconds / 60;
        if minutes >= 60 {
            let hours = minutes / 60;
            minutes %= 60;
            result.push_str(&format!("{hours}h "));
        }
        seconds %= 60;
        result.push_str(&format!("{minutes}m "));
    }
    result.push_str(&format!("{seconds}s"));
    result
}
