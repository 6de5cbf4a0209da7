//! Session handles returned by the pool.

use std::fmt;
use std::os::unix::net::UnixStream;

/// Callback invoked exactly once when a session closes.
pub type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// A single client's transient attachment to a worker.
///
/// Dropping the session fires its close hook, which returns the worker to
/// the pool (or retires it, depending on group policy). A session may
/// outlive the pool that produced it; the hook then does nothing.
pub struct Session {
    pid: u32,
    stream: Option<UnixStream>,
    on_close: Option<CloseHook>,
}

impl Session {
    /// Create a session against the worker with process id `pid`.
    ///
    /// `stream` is the transport to the worker, if the spawn service uses
    /// one.
    pub fn new(pid: u32, stream: Option<UnixStream>, on_close: CloseHook) -> Self {
        Self {
            pid,
            stream,
            on_close: Some(on_close),
        }
    }

    /// Process id of the worker serving this session.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The stream connected to the worker, if any.
    pub fn stream(&self) -> Option<&UnixStream> {
        self.stream.as_ref()
    }

    /// Mutable access to the worker stream, if any.
    pub fn stream_mut(&mut self) -> Option<&mut UnixStream> {
        self.stream.as_mut()
    }

    /// Close the session, firing the close hook.
    pub fn close(self) {}
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("pid", &self.pid)
            .field("has_stream", &self.stream.is_some())
            .finish()
    }
}
