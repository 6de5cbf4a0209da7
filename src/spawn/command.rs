//! Process-backed spawn service.
//!
//! Workers are launched with `std::process::Command`. Each worker receives
//! a unique Unix socket path through `PROCPOOL_WORKER_SOCKET` and is
//! expected to bind it once ready; sessions are stream connections to that
//! socket. Worker stderr is forwarded through `tracing`.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{ChildStderr, Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::{SpawnError, SpawnService, WorkerHandle};
use crate::options::PoolOptions;
use crate::session::{CloseHook, Session};

/// Counter for unique socket names and stderr logging threads.
static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// How long a terminated worker gets to exit before SIGKILL.
const TERM_GRACE: Duration = Duration::from_millis(200);

/// Configuration for [`CommandSpawner`].
#[derive(Debug, Clone)]
pub struct CommandSpawnerConfig {
    /// argv template for worker processes; the first element is the
    /// executable.
    pub command: Vec<String>,
    /// Directory where worker sockets are created.
    pub socket_dir: PathBuf,
    /// How long to wait for a freshly spawned worker to bind its socket.
    pub ready_timeout: Duration,
}

impl CommandSpawnerConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            socket_dir: std::env::temp_dir(),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

/// Spawn service that launches one OS process per worker.
pub struct CommandSpawner {
    config: CommandSpawnerConfig,
    /// Canonicalized application roots, resolved once per app. Symlink-flip
    /// deploys change what a root points at; [`SpawnService::reload`] drops
    /// the entry so the next spawn re-resolves it.
    roots: Mutex<HashMap<String, PathBuf>>,
}

impl CommandSpawner {
    pub fn new(config: CommandSpawnerConfig) -> Self {
        Self {
            config,
            roots: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_root(&self, app_root: &str) -> io::Result<PathBuf> {
        let mut roots = self.roots.lock().expect("spawner root cache poisoned");
        if let Some(root) = roots.get(app_root) {
            return Ok(root.clone());
        }
        let resolved = std::fs::canonicalize(app_root)?;
        roots.insert(app_root.to_string(), resolved.clone());
        Ok(resolved)
    }
}

impl SpawnService for CommandSpawner {
    fn spawn(&self, options: &PoolOptions) -> Result<Box<dyn WorkerHandle>, SpawnError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| SpawnError::Service("worker command is empty".into()))?;
        let root = self.resolve_root(&options.app_root)?;

        let seq = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
        let socket_path = self
            .config
            .socket_dir
            .join(format!("procpool-{}-{}.sock", std::process::id(), seq));
        let _ = std::fs::remove_file(&socket_path);

        let mut child = Command::new(program)
            .args(args)
            .current_dir(&root)
            .env("PROCPOOL_APP_ROOT", &options.app_root)
            .env("PROCPOOL_WORKER_SOCKET", &socket_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            std::thread::Builder::new()
                .name(format!("procpool-worker-{seq}-stderr"))
                .spawn(move || log_worker_stderr(pid, stderr))
                .ok(); // stderr forwarding is best-effort
        }

        // Wait for the worker to bind its socket.
        let start = Instant::now();
        while !socket_path.exists() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(SpawnError::Service(format!(
                    "worker for '{}' exited during startup: {}",
                    options.app_root, status
                )));
            }
            if start.elapsed() >= self.config.ready_timeout {
                terminate(Pid::from_raw(pid as i32));
                return Err(SpawnError::NotReady {
                    app_root: options.app_root.clone(),
                    timeout_ms: self.config.ready_timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(app_root = %options.app_root, pid, "spawned worker process");
        Ok(Box::new(CommandWorker {
            pid: Pid::from_raw(pid as i32),
            app_root: options.app_root.clone(),
            socket_path,
        }))
    }

    fn reload(&self, app_root: &str) {
        let mut roots = self.roots.lock().expect("spawner root cache poisoned");
        if roots.remove(app_root).is_some() {
            tracing::debug!(app_root, "discarded cached application root");
        }
    }

    fn server_pid(&self) -> u32 {
        std::process::id()
    }
}

#[derive(Debug)]
struct CommandWorker {
    pid: Pid,
    app_root: String,
    socket_path: PathBuf,
}

impl WorkerHandle for CommandWorker {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn app_root(&self) -> &str {
        &self.app_root
    }

    fn connect(&self, on_close: CloseHook) -> io::Result<Session> {
        let stream = UnixStream::connect(&self.socket_path)?;
        Ok(Session::new(self.pid(), Some(stream), on_close))
    }
}

impl Drop for CommandWorker {
    fn drop(&mut self) {
        terminate(self.pid);
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::debug!(
            pid = self.pid.as_raw(),
            app_root = %self.app_root,
            "worker process terminated"
        );
    }
}

/// SIGTERM, a short grace poll, then SIGKILL. Reaps the process either way.
fn terminate(pid: Pid) {
    if signal::kill(pid, Signal::SIGTERM).is_err() {
        // Already gone, or not ours; nothing to reap.
        return;
    }
    let deadline = Instant::now() + TERM_GRACE;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            _ => return, // exited and reaped, or already reaped elsewhere
        }
        if Instant::now() >= deadline {
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Forward worker stderr lines through tracing until the pipe closes.
fn log_worker_stderr(pid: u32, stderr: ChildStderr) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break, // pipe closed
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.to_lowercase().contains("error") {
            tracing::warn!(worker_pid = pid, "{}", line);
        } else {
            tracing::debug!(worker_pid = pid, "{}", line);
        }
    }
}
