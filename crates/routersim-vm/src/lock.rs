//! Per-instance lock file.
//!
//! The lock file marks an instance identity as controlled by a live process.
//! It holds the owner's PID and an exclusive advisory `flock`. A file whose
//! lock is free is stale (its owner exited) and is reclaimed.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{Result, VmError};

const ACQUIRE_ATTEMPTS: u32 = 8;

/// Exclusive hold on an instance lock file. Dropping it releases the lock
/// but leaves the file in place.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    file: Option<File>,
}

impl InstanceLock {
    /// Acquires the lock file at `path`, creating it if needed, and records
    /// this process's PID in it.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRunning` if another open handle holds the lock, or
    /// `Io` on file errors.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut attempt = 0;
        let mut file = loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;

            // SAFETY: the descriptor is owned by `file` and stays open for the
            // duration of the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                    let pid = read_pid(&mut file)
                        .map_or_else(|| "unknown".to_string(), |p| p.to_string());
                    return Err(VmError::AlreadyRunning {
                        pid,
                        path: path.display().to_string(),
                    });
                }
                return Err(err.into());
            }

            // The previous holder may have unlinked the file between our open
            // and our flock, leaving us locking an orphaned inode.
            if is_current(&file, &path)? {
                break file;
            }
            attempt += 1;
            if attempt >= ACQUIRE_ATTEMPTS {
                return Err(VmError::Io(std::io::Error::other(format!(
                    "lock file {} keeps being replaced",
                    path.display()
                ))));
            }
            tracing::debug!("Lock file {} was replaced, retrying", path.display());
        };

        let ours = std::process::id();
        if let Some(previous) = read_pid(&mut file) {
            if previous != ours {
                if process_is_running(previous) {
                    tracing::warn!(
                        "Lock file {} names live PID {} without holding the lock, reclaiming",
                        path.display(),
                        previous
                    );
                } else {
                    tracing::warn!(
                        "Reclaiming stale lock file {} (PID {} is gone)",
                        path.display(),
                        previous
                    );
                }
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", ours)?;
        file.sync_data()?;

        tracing::debug!("Acquired lock {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock. The file is deleted only if `erase` is set;
    /// otherwise it is left for inspection.
    ///
    /// The file is unlinked before the lock is dropped so a waiter never
    /// wins a lock on a path that is about to disappear.
    pub fn release(mut self, erase: bool) -> Result<()> {
        let removed = if erase {
            match std::fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };
        if let Some(file) = self.file.take() {
            unlock(&file);
        }
        removed?;
        tracing::debug!("Released lock {} (erase: {})", self.path.display(), erase);
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            unlock(&file);
        }
    }
}

fn unlock(file: &File) {
    // SAFETY: the descriptor belongs to `file`, which is still open.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc != 0 {
        tracing::warn!(
            "Failed to unlock instance lock: {}",
            std::io::Error::last_os_error()
        );
    }
}

/// True if `file` is still the file `path` names.
fn is_current(file: &File, path: &Path) -> Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(named) => Ok(held.dev() == named.dev() && held.ino() == named.ino()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// PID recorded in the lock file at `path`, if any.
#[must_use]
pub fn holder_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<u32>()
        .ok()
}

/// Returns true if the lock file at `path` still names this process.
#[must_use]
pub fn is_owned_by_us(path: &Path) -> bool {
    holder_pid(path) == Some(std::process::id())
}

fn process_is_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 only performs existence and permission checks.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }

    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c7200_R1_lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(holder_pid(&path), Some(std::process::id()));
        assert!(is_owned_by_us(&path));

        lock.release(true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_second_holder_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let _held = InstanceLock::acquire(&path).unwrap();
        match InstanceLock::acquire(&path) {
            Err(VmError::AlreadyRunning { pid, .. }) => {
                assert_eq!(pid, std::process::id().to_string());
            }
            other => panic!("expected AlreadyRunning, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        // Left behind by a process that no longer holds the flock.
        std::fs::write(&path, "4194302\n").unwrap();

        let lock = InstanceLock::acquire(&path).unwrap();
        assert!(is_owned_by_us(&path));
        drop(lock);
    }

    #[test]
    fn test_release_without_erase_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        InstanceLock::acquire(&path).unwrap().release(false).unwrap();
        assert!(path.exists());

        // The lock itself is free again.
        InstanceLock::acquire(&path).unwrap().release(true).unwrap();
    }

    #[test]
    fn test_unlinked_file_is_not_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        let held = File::open(&path).unwrap();
        assert!(is_current(&held, &path).unwrap());

        lock.release(true).unwrap();
        assert!(!is_current(&held, &path).unwrap());

        // A new holder gets a new inode, not the one still open above.
        let next = InstanceLock::acquire(&path).unwrap();
        assert!(!is_current(&held, &path).unwrap());
        assert!(is_current(next.file.as_ref().unwrap(), &path).unwrap());
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");

        drop(InstanceLock::acquire(&path).unwrap());
        let again = InstanceLock::acquire(&path).unwrap();
        assert!(path.exists());
        drop(again);
    }
}
