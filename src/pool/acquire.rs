//! The spawn-or-reuse acquisition algorithm.

use std::sync::MutexGuard;
use std::time::SystemTime;

use crate::error::{PoolError, Result};
use crate::options::PoolOptions;

use super::Pool;
use super::group::Group;
use super::state::PoolState;
use super::worker::{WorkerId, WorkerRecord};

/// Outcome of one pass over the decision tree, computed under shared
/// borrows before any mutation.
enum Decision {
    /// The group's front worker is idle; reuse it.
    ReuseFront(WorkerId),
    /// The group is saturated and the caller opted into the global queue.
    WaitGlobal,
    /// The group is saturated; multiplex onto its least-busy worker.
    Multiplex(WorkerId),
    /// The group has room and the pool has capacity; grow it.
    SpawnInGroup,
    /// No group and no capacity for one; wait for a slot.
    WaitCapacity,
    /// No group; spawn one, evicting the global LRU idle worker if full.
    SpawnNewGroup,
}

impl Pool {
    /// Select an existing worker or spawn a new one for `options.app_root`.
    ///
    /// Called with the state lock held; returns with it held. May release
    /// the lock while blocked on the change condition, re-evaluating the
    /// whole tree on every wake (wakeups are spurious-safe).
    pub(super) fn spawn_or_use_existing<'a>(
        &self,
        mut state: MutexGuard<'a, PoolState>,
        options: &PoolOptions,
    ) -> Result<(MutexGuard<'a, PoolState>, WorkerId)> {
        let app_root = options.app_root.as_str();

        let selected = loop {
            if state.needs_restart(options)? {
                if state.groups.contains_key(app_root) {
                    tracing::debug!(app_root, "restart sentinel triggered, purging group");
                    state.purge_group(app_root);
                }
                self.spawner.reload(app_root);
                self.shared.change.notify_all();
            }

            let decision = match state.groups.get(app_root) {
                Some(group) => {
                    let front = *group.members.front().expect("group has no workers");
                    if state.worker(front).sessions == 0 {
                        Decision::ReuseFront(front)
                    } else if state.count >= state.max
                        || (state.max_per_app != 0 && group.size() >= state.max_per_app)
                    {
                        if options.use_global_queue {
                            Decision::WaitGlobal
                        } else {
                            let smallest = group
                                .members
                                .iter()
                                .copied()
                                .min_by_key(|&id| state.worker(id).sessions)
                                .expect("group has no workers");
                            Decision::Multiplex(smallest)
                        }
                    } else {
                        Decision::SpawnInGroup
                    }
                }
                None => {
                    if state.active >= state.max {
                        Decision::WaitCapacity
                    } else {
                        Decision::SpawnNewGroup
                    }
                }
            };

            match decision {
                Decision::ReuseFront(id) => {
                    let group = state.groups.get_mut(app_root).expect("group disappeared");
                    group.move_to_back(id);
                    state.remove_inactive(id);
                    state.active += 1;
                    self.shared.change.notify_all();
                    tracing::trace!(app_root, "reusing idle worker");
                    break id;
                }
                Decision::WaitGlobal => {
                    state.waiting_on_global_queue += 1;
                    state = self
                        .shared
                        .change
                        .wait(state)
                        .expect("pool state lock poisoned");
                    state.waiting_on_global_queue -= 1;
                }
                Decision::Multiplex(id) => {
                    let group = state.groups.get_mut(app_root).expect("group disappeared");
                    group.move_to_back(id);
                    tracing::trace!(app_root, "multiplexing onto least-busy worker");
                    break id;
                }
                Decision::SpawnInGroup => {
                    let handle = self.spawner.spawn(options).map_err(|source| {
                        PoolError::Spawn {
                            app_root: app_root.to_string(),
                            source,
                        }
                    })?;
                    tracing::debug!(app_root, pid = handle.pid(), "spawned additional worker");
                    let id = state.alloc_id();
                    state.workers.insert(id, WorkerRecord::new(handle));
                    let group = state.groups.get_mut(app_root).expect("group disappeared");
                    group.members.push_back(id);
                    state.count += 1;
                    state.active += 1;
                    self.shared.change.notify_all();
                    break id;
                }
                Decision::WaitCapacity => {
                    state = self
                        .shared
                        .change
                        .wait(state)
                        .expect("pool state lock poisoned");
                }
                Decision::SpawnNewGroup => {
                    if state.count == state.max {
                        state.evict_lru();
                    }
                    let handle = self.spawner.spawn(options).map_err(|source| {
                        PoolError::Spawn {
                            app_root: app_root.to_string(),
                            source,
                        }
                    })?;
                    tracing::debug!(app_root, pid = handle.pid(), "spawned worker for new group");
                    let id = state.alloc_id();
                    state.workers.insert(id, WorkerRecord::new(handle));
                    let mut group = Group::new(options.max_requests);
                    group.members.push_back(id);
                    state.groups.insert(app_root.to_string(), group);
                    state.count += 1;
                    state.active += 1;
                    self.shared.change.notify_all();
                    break id;
                }
            }
        };

        let record = state.worker_mut(selected);
        record.last_used = SystemTime::now();
        record.sessions += 1;
        Ok((state, selected))
    }
}
