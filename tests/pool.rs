//! End-to-end pool behavior tests, driven through an in-memory spawn
//! service so no real worker processes are involved.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use procpool::{
    CloseHook, Pool, PoolConfig, PoolError, PoolOptions, Session, SpawnError, SpawnService,
    WorkerHandle,
};

/// Observable history shared between the spawner and its workers.
#[derive(Default, Debug)]
struct SpawnLog {
    /// (app_root, pid) in spawn order.
    spawned: Mutex<Vec<(String, u32)>>,
    /// App roots passed to `reload`, in order.
    reloads: Mutex<Vec<String>>,
    /// Pids of workers whose handles have been dropped (terminated).
    dropped: Mutex<Vec<u32>>,
    /// Number of upcoming `connect` calls that should fail.
    fail_connects: AtomicUsize,
}

impl SpawnLog {
    fn take_connect_failure(&self) -> bool {
        self.fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct MockSpawner {
    log: Arc<SpawnLog>,
    next_pid: AtomicU32,
    fail_spawn: AtomicBool,
}

impl MockSpawner {
    fn new() -> Self {
        Self {
            log: Arc::new(SpawnLog::default()),
            next_pid: AtomicU32::new(1000),
            fail_spawn: AtomicBool::new(false),
        }
    }

    fn spawned(&self) -> Vec<(String, u32)> {
        self.log.spawned.lock().unwrap().clone()
    }

    fn reloads(&self) -> Vec<String> {
        self.log.reloads.lock().unwrap().clone()
    }

    fn dropped(&self) -> Vec<u32> {
        self.log.dropped.lock().unwrap().clone()
    }
}

impl SpawnService for MockSpawner {
    fn spawn(&self, options: &PoolOptions) -> Result<Box<dyn WorkerHandle>, SpawnError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SpawnError::Service("mock spawn failure".into()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.log
            .spawned
            .lock()
            .unwrap()
            .push((options.app_root.clone(), pid));
        Ok(Box::new(MockWorker {
            pid,
            app_root: options.app_root.clone(),
            log: Arc::clone(&self.log),
        }))
    }

    fn reload(&self, app_root: &str) {
        self.log.reloads.lock().unwrap().push(app_root.to_string());
    }

    fn server_pid(&self) -> u32 {
        std::process::id()
    }
}

#[derive(Debug)]
struct MockWorker {
    pid: u32,
    app_root: String,
    log: Arc<SpawnLog>,
}

impl WorkerHandle for MockWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn app_root(&self) -> &str {
        &self.app_root
    }

    fn connect(&self, on_close: CloseHook) -> io::Result<Session> {
        if self.log.take_connect_failure() {
            return Err(io::Error::other("mock worker refused connection"));
        }
        Ok(Session::new(self.pid, None, on_close))
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.log.dropped.lock().unwrap().push(self.pid);
    }
}

fn pool_with(config: PoolConfig) -> (Arc<Pool>, Arc<MockSpawner>) {
    let spawner = Arc::new(MockSpawner::new());
    let pool = Pool::with_config(
        Arc::clone(&spawner) as Arc<dyn SpawnService>,
        config,
    )
    .expect("failed to create pool");
    (Arc::new(pool), spawner)
}

fn default_pool() -> (Arc<Pool>, Arc<MockSpawner>) {
    pool_with(PoolConfig::default())
}

fn small_pool(max: usize) -> (Arc<Pool>, Arc<MockSpawner>) {
    pool_with(PoolConfig {
        max,
        ..PoolConfig::default()
    })
}

#[test]
fn test_fresh_spawn_creates_one_busy_worker() {
    let (pool, spawner) = default_pool();
    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();

    assert_eq!(pool.count(), 1);
    assert_eq!(pool.active(), 1);
    assert_eq!(spawner.spawned().len(), 1);
    assert!(pool.inspect().contains("/app/a:"));
    drop(session);
}

#[test]
fn test_released_worker_is_reused() {
    let (pool, spawner) = default_pool();
    let options = PoolOptions::new("/app/a");

    let first = pool.get(&options).unwrap();
    let pid = first.pid();
    drop(first);

    assert_eq!(pool.count(), 1);
    assert_eq!(pool.active(), 0);

    let second = pool.get(&options).unwrap();
    assert_eq!(second.pid(), pid);
    assert_eq!(spawner.spawned().len(), 1, "no new spawn for a reuse");
}

#[test]
fn test_full_pool_evicts_global_lru_idle_worker() {
    let (pool, spawner) = small_pool(2);

    let a = pool.get(&PoolOptions::new("/app/a")).unwrap();
    let pid_a = a.pid();
    drop(a); // /app/a's worker becomes LRU first
    let b = pool.get(&PoolOptions::new("/app/b")).unwrap();
    drop(b);
    assert_eq!(pool.count(), 2);

    let c = pool.get(&PoolOptions::new("/app/c")).unwrap();
    assert_eq!(pool.count(), 2);
    assert_eq!(pool.active(), 1);
    assert!(spawner.dropped().contains(&pid_a), "LRU worker terminated");
    assert!(!pool.inspect().contains("/app/a:"));
    assert!(pool.inspect().contains("/app/b:"));
    assert!(pool.inspect().contains("/app/c:"));
    drop(c);
}

#[test]
fn test_global_queue_blocks_until_worker_freed() {
    let (pool, _spawner) = small_pool(1);
    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();
    let pid = session.pid();

    let (tx, rx) = mpsc::channel();
    let waiter_pool = Arc::clone(&pool);
    let waiter = thread::spawn(move || {
        let options = PoolOptions::new("/app/a").with_global_queue(true);
        let session = waiter_pool.get(&options).unwrap();
        tx.send(session.pid()).unwrap();
        session
    });

    // The waiter must block rather than multiplex.
    assert_eq!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Timeout)
    );
    assert_eq!(pool.waiting_on_global_queue(), 1);

    drop(session);
    let woken_pid = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(woken_pid, pid, "freed worker goes to the queued caller");
    drop(waiter.join().unwrap());
    assert_eq!(pool.waiting_on_global_queue(), 0);
}

#[test]
fn test_saturated_group_multiplexes_without_global_queue() {
    let (pool, spawner) = small_pool(1);
    let options = PoolOptions::new("/app/a");

    let first = pool.get(&options).unwrap();
    let second = pool.get(&options).unwrap();
    assert_eq!(first.pid(), second.pid());
    assert_eq!(spawner.spawned().len(), 1);
    assert!(pool.to_xml(false).contains("<sessions>2</sessions>"));

    drop(first);
    assert_eq!(pool.active(), 1, "one session still outstanding");
    drop(second);
    assert_eq!(pool.active(), 0);
    assert!(pool.inspect().contains("Processed: 2"));
}

#[test]
fn test_least_busy_selection_prefers_earliest_on_ties() {
    let (pool, _spawner) = small_pool(2);
    let options = PoolOptions::new("/app/a");

    let s1 = pool.get(&options).unwrap(); // spawns W1
    let s2 = pool.get(&options).unwrap(); // spawns W2
    assert_ne!(s1.pid(), s2.pid());

    // Both carry one session; the tie goes to the earliest in the group.
    let s3 = pool.get(&options).unwrap();
    assert_eq!(s3.pid(), s1.pid());

    // W1 now carries two sessions, so W2 is the least busy.
    let s4 = pool.get(&options).unwrap();
    assert_eq!(s4.pid(), s2.pid());

    drop((s1, s2, s3, s4));
}

#[test]
fn test_per_app_cap_limits_group_growth() {
    let (pool, spawner) = pool_with(PoolConfig {
        max_per_app: 1,
        ..PoolConfig::default()
    });
    let options = PoolOptions::new("/app/a");

    let first = pool.get(&options).unwrap();
    let second = pool.get(&options).unwrap();
    assert_eq!(first.pid(), second.pid(), "per-app cap forces multiplexing");
    assert_eq!(pool.count(), 1);

    // Lifting the cap lets the group grow again.
    pool.set_max_per_app(0);
    let third = pool.get(&options).unwrap();
    assert_ne!(third.pid(), first.pid());
    assert_eq!(spawner.spawned().len(), 2);

    drop((first, second, third));
}

#[test]
fn test_caller_without_group_waits_for_capacity_then_evicts() {
    let (pool, _spawner) = small_pool(1);
    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();
    let pid_a = session.pid();

    let (tx, rx) = mpsc::channel();
    let waiter_pool = Arc::clone(&pool);
    let waiter = thread::spawn(move || {
        let session = waiter_pool.get(&PoolOptions::new("/app/b")).unwrap();
        tx.send(session.pid()).unwrap();
        session
    });

    assert_eq!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Timeout)
    );

    // Releasing /app/a's worker lets the waiter evict it and spawn its own.
    drop(session);
    let pid_b = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_ne!(pid_b, pid_a);
    drop(waiter.join().unwrap());
    assert_eq!(pool.count(), 1);
    assert!(!pool.inspect().contains("/app/a:"));
}

#[test]
fn test_raising_max_unblocks_queued_caller() {
    let (pool, _spawner) = small_pool(1);
    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();

    let (tx, rx) = mpsc::channel();
    let waiter_pool = Arc::clone(&pool);
    let waiter = thread::spawn(move || {
        let session = waiter_pool.get(&PoolOptions::new("/app/b")).unwrap();
        tx.send(session.pid()).unwrap();
        session
    });

    assert_eq!(
        rx.recv_timeout(Duration::from_millis(200)),
        Err(RecvTimeoutError::Timeout)
    );

    pool.set_max(2);
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    drop(waiter.join().unwrap());
    assert_eq!(pool.count(), 2);
    drop(session);
}

#[test]
fn test_max_requests_retires_worker_after_threshold() {
    let (pool, spawner) = default_pool();
    let options = PoolOptions::new("/app/a").with_max_requests(3);

    let mut pid = None;
    for _ in 0..3 {
        let session = pool.get(&options).unwrap();
        let current = session.pid();
        assert_eq!(*pid.get_or_insert(current), current);
        drop(session);
    }

    // The third close crossed the threshold.
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.active(), 0);
    assert!(spawner.dropped().contains(&pid.unwrap()));
    assert!(!pool.inspect().contains("/app/a:"));

    let session = pool.get(&options).unwrap();
    assert_ne!(session.pid(), pid.unwrap());
    assert_eq!(spawner.spawned().len(), 2);
    drop(session);
}

#[test]
fn test_restart_sentinel_purges_whole_group_and_reloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let app_root = dir.path().to_str().unwrap().to_string();
    std::fs::create_dir(dir.path().join("tmp")).unwrap();

    let (pool, spawner) = default_pool();
    let options = PoolOptions::new(&app_root);

    let s1 = pool.get(&options).unwrap(); // W1, baseline sentinel check
    let s2 = pool.get(&options).unwrap(); // W2
    let (pid1, pid2) = (s1.pid(), s2.pid());
    drop(s1); // W1 idle, W2 stays busy
    assert_eq!(pool.count(), 2);

    std::fs::write(dir.path().join("tmp/restart.txt"), "deploy").unwrap();

    let s3 = pool.get(&options).unwrap();
    assert_eq!(spawner.reloads(), vec![app_root.clone()]);
    assert_eq!(pool.count(), 1);
    assert_eq!(pool.active(), 1);
    let dropped = spawner.dropped();
    assert!(dropped.contains(&pid1) && dropped.contains(&pid2));
    assert_ne!(s3.pid(), pid2);

    // The closing callback of a purged worker's session is a no-op.
    drop(s2);
    assert_eq!(pool.count(), 1);
    assert_eq!(pool.active(), 1);
    drop(s3);
}

#[test]
fn test_always_restart_sentinel_restarts_every_acquisition() {
    let dir = tempfile::tempdir().unwrap();
    let app_root = dir.path().to_str().unwrap().to_string();
    std::fs::create_dir(dir.path().join("tmp")).unwrap();
    let sentinel = dir.path().join("tmp/always_restart.txt");

    let (pool, spawner) = default_pool();
    let options = PoolOptions::new(&app_root);

    let s1 = pool.get(&options).unwrap();
    let pid1 = s1.pid();
    drop(s1);

    std::fs::write(&sentinel, "").unwrap();

    let s2 = pool.get(&options).unwrap();
    let pid2 = s2.pid();
    assert_ne!(pid2, pid1);
    drop(s2);

    let s3 = pool.get(&options).unwrap();
    let pid3 = s3.pid();
    assert_ne!(pid3, pid2);
    assert_eq!(spawner.reloads().len(), 2);
    drop(s3);

    // Removing the sentinel stops the churn.
    std::fs::remove_file(&sentinel).unwrap();
    let s4 = pool.get(&options).unwrap();
    assert_eq!(s4.pid(), pid3);
    drop(s4);
}

#[test]
fn test_custom_relative_restart_dir_is_honored() {
    let dir = tempfile::tempdir().unwrap();
    let app_root = dir.path().to_str().unwrap().to_string();
    std::fs::create_dir(dir.path().join("deploy")).unwrap();

    let (pool, spawner) = default_pool();
    let options = PoolOptions::new(&app_root).with_restart_dir("deploy");

    let s1 = pool.get(&options).unwrap();
    let pid1 = s1.pid();
    drop(s1);

    std::fs::write(dir.path().join("deploy/restart.txt"), "x").unwrap();
    let s2 = pool.get(&options).unwrap();
    assert_ne!(s2.pid(), pid1);
    assert_eq!(spawner.reloads().len(), 1);
    drop(s2);
}

#[test]
fn test_reaper_retires_idle_worker() {
    let (pool, spawner) = pool_with(PoolConfig {
        max_idle_time: Duration::from_secs(1),
        ..PoolConfig::default()
    });

    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();
    let pid = session.pid();
    drop(session);
    assert_eq!(pool.count(), 1);

    // Idle threshold 1s, reaper tick 2s: gone well within 5s.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.active(), 0);
    assert!(spawner.dropped().contains(&pid));
    assert!(!pool.inspect().contains("/app/a:"));
}

#[test]
fn test_lowering_max_idle_time_wakes_reaper() {
    let (pool, _spawner) = default_pool(); // 120s idle threshold

    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();
    drop(session);

    pool.set_max_idle_time(Duration::from_secs(1));
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(100));
    }
    assert_eq!(pool.count(), 0);
}

#[test]
fn test_connect_failures_retry_then_surface() {
    let (pool, spawner) = default_pool();
    spawner.log.fail_connects.store(100, Ordering::SeqCst);

    let err = pool.get(&PoolOptions::new("/app/a")).unwrap_err();
    match err {
        PoolError::Connect { app_root, .. } => assert_eq!(app_root, "/app/a"),
        other => panic!("expected Connect error, got {other}"),
    }
    assert_eq!(spawner.spawned().len(), 10, "one spawn per attempt");
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.active(), 0);
}

#[test]
fn test_connect_failure_recovers_before_attempts_exhausted() {
    let (pool, spawner) = default_pool();
    spawner.log.fail_connects.store(2, Ordering::SeqCst);

    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();
    assert_eq!(spawner.spawned().len(), 3);
    assert_eq!(pool.count(), 1);
    assert_eq!(pool.active(), 1);
    drop(session);
}

#[test]
fn test_spawn_failure_names_the_application() {
    let (pool, spawner) = default_pool();
    spawner.fail_spawn.store(true, Ordering::SeqCst);

    let err = pool.get(&PoolOptions::new("/app/a")).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("cannot spawn application '/app/a'"));
    assert!(message.contains("mock spawn failure"));
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.active(), 0);
}

#[test]
fn test_clear_terminates_workers_and_reloads_spawner() {
    let (pool, spawner) = default_pool();
    let a = pool.get(&PoolOptions::new("/app/a")).unwrap();
    let b = pool.get(&PoolOptions::new("/app/b")).unwrap();
    let (pid_a, pid_b) = (a.pid(), b.pid());
    drop(a);

    pool.clear();
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.active(), 0);
    assert!(!pool.inspect().contains("/app/"));
    let dropped = spawner.dropped();
    assert!(dropped.contains(&pid_a) && dropped.contains(&pid_b));
    let mut reloads = spawner.reloads();
    reloads.sort();
    assert_eq!(reloads, vec!["/app/a".to_string(), "/app/b".to_string()]);

    // A session closed after the purge is a no-op.
    drop(b);
    assert_eq!(pool.active(), 0);
}

#[test]
fn test_session_outliving_pool_is_harmless() {
    let (pool, _spawner) = default_pool();
    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();
    drop(pool);
    drop(session); // close callback fires against the orphaned shared state
}

#[test]
fn test_introspection_reports() {
    let (pool, spawner) = default_pool();
    let session = pool.get(&PoolOptions::new("/app/a")).unwrap();

    let report = pool.inspect();
    assert!(report.contains("max      = 20"));
    assert!(report.contains("count    = 1"));
    assert!(report.contains("active   = 1"));
    assert!(report.contains("Waiting on global queue: 0"));
    assert!(report.contains(&format!("PID: {}", session.pid())));

    let xml = pool.to_xml(true);
    assert!(xml.contains("<info>"));
    assert!(xml.contains("<groups><group><name>/app/a</name>"));
    assert!(xml.contains(&format!("<pid>{}</pid>", session.pid())));
    assert!(xml.contains("<includes_sensitive_information/>"));

    assert_eq!(pool.spawn_server_pid(), spawner.server_pid());
    drop(session);
}

#[test]
fn test_concurrent_gets_stay_within_cap() {
    let (pool, spawner) = small_pool(4);
    let mut handles = Vec::new();
    for i in 0..8 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            let options = PoolOptions::new(format!("/app/{}", i % 2));
            for _ in 0..10 {
                let session = pool.get(&options).unwrap();
                thread::sleep(Duration::from_millis(1));
                drop(session);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(pool.active(), 0);
    assert!(pool.count() <= 4);
    assert!(!spawner.spawned().is_empty());
}
