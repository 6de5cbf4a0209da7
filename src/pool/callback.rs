//! Session close callbacks.

use std::sync::Arc;
use std::time::SystemTime;

use super::state::PoolShared;
use super::worker::WorkerId;

/// Returns a worker to the pool (or retires it) when its session ends.
///
/// Holds the shared state strongly and the worker only by id, so a
/// callback firing after the worker was retired, its group purged, or the
/// whole pool dropped is a no-op.
pub(super) struct SessionCloseCallback {
    shared: Arc<PoolShared>,
    worker: WorkerId,
}

impl SessionCloseCallback {
    pub fn new(shared: Arc<PoolShared>, worker: WorkerId) -> Self {
        Self { shared, worker }
    }

    pub fn invoke(self) {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        let state = &mut *state;

        let Some(record) = state.workers.get(&self.worker) else {
            return;
        };
        let app_root = record.handle.app_root().to_string();
        let Some(max_requests) = state.groups.get(&app_root).map(|g| g.max_requests) else {
            return;
        };

        let record = state
            .workers
            .get_mut(&self.worker)
            .expect("worker record missing from arena");
        record.processed += 1;

        if max_requests > 0 && record.processed >= max_requests {
            let record = state
                .workers
                .remove(&self.worker)
                .expect("worker record missing from arena");
            tracing::debug!(
                app_root = %app_root,
                pid = record.handle.pid(),
                processed = record.processed,
                "retiring worker after max requests"
            );
            state.remove_from_group(&app_root, self.worker);
            state.count -= 1;
            state.active -= 1;
            self.shared.change.notify_all();
        } else {
            record.last_used = SystemTime::now();
            record.sessions -= 1;
            if record.sessions == 0 {
                let group = state
                    .groups
                    .get_mut(&app_root)
                    .expect("group missing for live worker");
                group.move_to_front(self.worker);
                state.inactive.push_back(self.worker);
                state.active -= 1;
                self.shared.change.notify_all();
            }
        }
    }
}
