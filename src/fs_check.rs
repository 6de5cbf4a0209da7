//! Throttled filesystem checks for restart sentinels.
//!
//! Sentinel files are polled on every acquisition, so the real `stat`
//! syscalls are rate-limited per path. Both helpers take the current time
//! as a plain Unix timestamp so callers control the clock.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identity of a file at a point in time; `None` means the file is absent.
type Signature = Option<(u64, SystemTime, u64)>;

fn signature_of(path: &Path) -> io::Result<Signature> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some((meta.ino(), meta.modified()?, meta.len()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Existence checks with a per-path `stat` throttle and a bounded cache.
pub struct CachedFileStat {
    entries: HashMap<PathBuf, StatEntry>,
    capacity: usize,
}

struct StatEntry {
    checked_at: u64,
    exists: bool,
}

impl CachedFileStat {
    /// Create a cache holding results for at most `capacity` paths.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Whether `path` exists, performing a real `stat` at most once per
    /// `throttle_rate` seconds per path.
    ///
    /// A missing file is not an error; any other `stat` failure is.
    pub fn exists(&mut self, path: &Path, throttle_rate: u64, now: u64) -> io::Result<bool> {
        if let Some(entry) = self.entries.get(path)
            && throttle_rate > 0
            && now < entry.checked_at.saturating_add(throttle_rate)
        {
            return Ok(entry.exists);
        }

        let exists = match fs::metadata(path) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        if !self.entries.contains_key(path) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            path.to_path_buf(),
            StatEntry {
                checked_at: now,
                exists,
            },
        );
        Ok(exists)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.checked_at)
            .map(|(path, _)| path.clone());
        if let Some(path) = oldest {
            self.entries.remove(&path);
        }
    }

    /// Forget all cached results.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Detects changes to a file between observations.
///
/// A file counts as changed when its inode, mtime, or size differs from the
/// previously recorded signature, including appearing or disappearing. The
/// first observation of a path records a baseline and reports no change.
#[derive(Default)]
pub struct FileChangeChecker {
    entries: HashMap<PathBuf, ChangeEntry>,
}

struct ChangeEntry {
    checked_at: u64,
    signature: Signature,
}

impl FileChangeChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `path` changed since the last observation, re-`stat`ing at
    /// most once per `throttle_rate` seconds.
    pub fn changed(&mut self, path: &Path, throttle_rate: u64, now: u64) -> io::Result<bool> {
        if let Some(entry) = self.entries.get(path)
            && throttle_rate > 0
            && now < entry.checked_at.saturating_add(throttle_rate)
        {
            return Ok(false);
        }

        let signature = signature_of(path)?;
        match self.entries.get_mut(path) {
            Some(entry) => {
                let changed = entry.signature != signature;
                entry.signature = signature;
                entry.checked_at = now;
                Ok(changed)
            }
            None => {
                self.entries.insert(
                    path.to_path_buf(),
                    ChangeEntry {
                        checked_at: now,
                        signature,
                    },
                );
                Ok(false)
            }
        }
    }

    /// Forget all recorded signatures.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
