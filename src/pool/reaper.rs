//! Background reaper retiring workers idle beyond the configured threshold.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::state::{PoolShared, PoolState};
use super::worker::WorkerId;

/// Stack size for the reaper thread; the loop owns almost nothing.
pub(super) const REAPER_STACK_SIZE: usize = 64 * 1024;

/// Main loop of the reaper thread.
///
/// Sleeps on the reaper condition for `max_idle_time + 1` seconds; a
/// signal means shutdown or a changed `max_idle_time`, a timeout means it
/// is time to scan the inactive list.
pub(super) fn run(shared: Arc<PoolShared>) {
    tracing::debug!("reaper thread started");
    let mut state = shared.state.lock().expect("pool state lock poisoned");
    while !state.shutdown {
        let timeout = state.max_idle_time + Duration::from_secs(1);
        let (guard, wait) = shared
            .reaper_wakeup
            .wait_timeout(state, timeout)
            .expect("pool state lock poisoned");
        state = guard;
        if !wait.timed_out() {
            // Woken by a signal; the loop condition re-checks shutdown, and
            // a max_idle_time change just takes effect on the next sleep.
            continue;
        }
        reap(&mut state);
    }
    tracing::debug!("reaper thread stopped");
}

/// Retire every inactive worker idle for longer than `max_idle_time`.
fn reap(state: &mut PoolState) {
    if state.max_idle_time.is_zero() {
        return;
    }
    let now = SystemTime::now();
    let expired: Vec<WorkerId> = state
        .inactive
        .iter()
        .copied()
        .filter(|&id| {
            let record = state.worker(id);
            match now.duration_since(record.last_used) {
                Ok(idle) => idle > state.max_idle_time,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to compute worker idle time");
                    false
                }
            }
        })
        .collect();

    for id in expired {
        let record = state
            .workers
            .remove(&id)
            .expect("worker record missing from arena");
        let app_root = record.handle.app_root().to_string();
        tracing::debug!(
            app_root = %app_root,
            pid = record.handle.pid(),
            "retiring idle worker"
        );
        state.remove_inactive(id);
        state.remove_from_group(&app_root, id);
        state.count -= 1;
    }
}
