//! Single-writer lock for the historical store.
//!
//! Acquired without blocking at startup. When another live process holds it
//! the caller degrades to read-only history access instead of refusing to
//! start.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Held lock file; removed on drop
#[derive(Debug)]
pub struct HistoryLock {
    path: PathBuf,
}

impl HistoryLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HistoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove history lock {}: {}", self.path.display(), e);
        }
    }
}

/// Outcome of [`acquire`]
#[derive(Debug)]
pub enum HistoryAccess {
    ReadWrite(HistoryLock),
    ReadOnly,
}

impl HistoryAccess {
    pub fn is_writable(&self) -> bool {
        matches!(self, HistoryAccess::ReadWrite(_))
    }
}

/// Try to take the lock at `path` without waiting.
///
/// A lock left behind by a process that no longer exists is reclaimed once.
pub fn acquire(path: impl Into<PathBuf>) -> HistoryAccess {
    let path = path.into();
    for attempt in 0..2 {
        match try_create(&path) {
            Ok(lock) => {
                info!("Acquired history lock {}", path.display());
                return HistoryAccess::ReadWrite(lock);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if attempt == 0 && is_stale(&path) {
                    warn!("Reclaiming stale history lock {}", path.display());
                    if fs::remove_file(&path).is_ok() {
                        continue;
                    }
                }
                warn!(
                    "History lock {} held by another process, history is read-only",
                    path.display()
                );
                return HistoryAccess::ReadOnly;
            }
            Err(e) => {
                warn!(
                    "Could not create history lock {}: {}, history is read-only",
                    path.display(),
                    e
                );
                return HistoryAccess::ReadOnly;
            }
        }
    }
    HistoryAccess::ReadOnly
}

fn try_create(path: &Path) -> std::io::Result<HistoryLock> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(HistoryLock {
        path: path.to_path_buf(),
    })
}

/// True when the recorded owner pid is provably gone
fn is_stale(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(pid) = contents.trim().parse::<u32>() else {
        return false;
    };
    !process_alive(pid)
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // no portable liveness check: assume the owner is alive
    true
}
