//! Process-level lock for the modstats reporter.
//!
//! Host-OS events (boot, connectivity) can launch modstats concurrently. The
//! state machine already guarantees single-flight within one process; this
//! advisory flock extends that to concurrently launched processes. The lock
//! is scoped to the preference store path so isolated test environments never
//! contend, and it is held for process lifetime.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "modstats-reporter.lock";

/// Guard marking this process as the active reporter.
pub struct ReporterGuard {
    file: File,
    path: PathBuf,
}

impl Drop for ReporterGuard {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        // Best-effort cleanup of lock file itself (not required for correctness).
        let _ = fs::remove_file(&self.path);
    }
}

/// Try to become the active reporter for the given preference store.
///
/// Returns `None` when another modstats process already holds the lock; the
/// caller should exit quietly without dispatching, letting the running
/// process finish its submission.
pub fn try_acquire_reporter(prefs_path: &Path) -> Result<Option<ReporterGuard>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = dir.join(scoped_lock_filename(prefs_path));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Write basic owner info for debugging.
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();

            Ok(Some(ReporterGuard { file, path }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("modstats");
    dir
}

fn scoped_lock_filename(prefs_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    prefs_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{LOCK_FILE}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
unsafe extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("modstats process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_while_guard_held() {
        let dir = TempDir::new().unwrap();
        let prefs = dir.path().join("prefs.db");

        let guard = try_acquire_reporter(&prefs).unwrap();
        assert!(guard.is_some());

        // A second open file description contends on the same flock.
        assert!(try_acquire_reporter(&prefs).unwrap().is_none());

        // Dropping the guard frees the lock.
        drop(guard);
        assert!(try_acquire_reporter(&prefs).unwrap().is_some());
    }

    #[test]
    fn locks_are_scoped_to_prefs_path() {
        let dir = TempDir::new().unwrap();
        let a = try_acquire_reporter(&dir.path().join("a.db")).unwrap();
        let b = try_acquire_reporter(&dir.path().join("b.db")).unwrap();
        assert!(a.is_some());
        assert!(b.is_some());
    }
}
