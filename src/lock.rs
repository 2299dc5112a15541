//! Named, timeout-bounded mutual exclusion across OS processes.
//!
//! A lock is a file created with `create_new` in the lock directory. The
//! holder writes its pid and a per-acquisition token; release removes the
//! file only if the token still matches. A lock file whose pid no longer
//! exists is reclaimed, one reclaimer at a time.

use crate::error::NdirError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Budget for simple reads and writes.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(1);
/// Budget for operations whose device-side duration varies: reset, EEPROM writes.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(4);

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// A reclaim marker older than this belongs to a reclaimer that died.
const STUCK_RECLAIM: Duration = Duration::from_secs(1);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Lock directory, in priority order: `NDIRBUS_LOCK_DIR`, `/run/lock/ndirbus`
/// when `/run/lock` exists, otherwise the system temp directory.
pub fn default_lock_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("NDIRBUS_LOCK_DIR") {
        return PathBuf::from(dir);
    }

    let run_lock = Path::new("/run/lock");
    if run_lock.is_dir() {
        return run_lock.join("ndirbus");
    }

    std::env::temp_dir().join("ndirbus-locks")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBudget {
    Short,
    Long,
}

impl LockBudget {
    pub fn timeout(self) -> Duration {
        match self {
            LockBudget::Short => SHORT_TIMEOUT,
            LockBudget::Long => LONG_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusLock {
    dir: PathBuf,
}

impl BusLock {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    /// Waits until `name` is free or `timeout` elapses.
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard, NdirError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path(name);
        let token = format!("{} {}", std::process::id(), NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        let deadline = Instant::now() + timeout;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(token.as_bytes())?;
                    debug!(lock = name, "acquired");
                    return Ok(LockGuard {
                        path,
                        name: name.to_string(),
                        token,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if reclaim_if_abandoned(&path) {
                        continue;
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(NdirError::LockTimeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Releases `name` if this process holds it. Safe to call at any time.
    pub fn release(&self, name: &str) {
        let path = self.path(name);
        if let Some(pid) = holder_pid(&path) {
            if pid == std::process::id() {
                let _ = fs::remove_file(&path);
            }
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.path(name).exists()
    }
}

/// Holds a named lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    name: String,
    token: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(content) if content == self.token => {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!(lock = %self.name, "release failed: {}", e);
                } else {
                    debug!(lock = %self.name, "released");
                }
            }
            Ok(_) => warn!(lock = %self.name, "lock was reclaimed by another holder"),
            Err(e) => warn!(lock = %self.name, "lock file vanished before release: {}", e),
        }
    }
}

fn holder_pid(path: &Path) -> Option<u32> {
    parse_pid(&fs::read_to_string(path).ok()?)
}

fn parse_pid(content: &str) -> Option<u32> {
    content.split_whitespace().next()?.parse().ok()
}

fn process_alive(pid: u32) -> bool {
    if cfg!(target_os = "linux") {
        Path::new(&format!("/proc/{}", pid)).exists()
    } else {
        true
    }
}

/// Marks a reclaim in progress. Removed on drop.
struct Reclaiming(PathBuf);

impl Drop for Reclaiming {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

// a reclaimer that died mid-reclaim leaves its marker behind
fn clear_stuck_reclaim(marker: &Path) {
    let age = fs::metadata(marker)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok());

    if age.map_or(false, |age| age > STUCK_RECLAIM) {
        warn!(path = %marker.display(), "clearing stuck reclaim marker");
        let _ = fs::remove_file(marker);
    }
}

/// Removes a lock file whose holder is dead. Reclaimers take turns through a
/// marker file and re-read the lock under it: a lock that changed hands
/// since it was first read is left alone.
///
/// An empty file is a holder between create and write, so it counts as live.
fn reclaim_if_abandoned(path: &Path) -> bool {
    let stale = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return false,
    };
    let pid = match parse_pid(&stale) {
        Some(pid) if !process_alive(pid) => pid,
        _ => return false,
    };

    let marker = path.with_extension("lock.reclaim");
    let _reclaiming = match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => Reclaiming(marker),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            clear_stuck_reclaim(&marker);
            return false;
        }
        Err(_) => return false,
    };

    if fs::read_to_string(path).ok().as_deref() != Some(stale.as_str()) {
        return false;
    }

    warn!(path = %path.display(), pid, "reclaiming lock abandoned by dead process");
    fs::remove_file(path).is_ok()
}
