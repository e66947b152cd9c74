//! Per-instance log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Result;

struct LogInner {
    instance: String,
    path: PathBuf,
    enabled: bool,
    file: Mutex<Option<File>>,
    failure_reported: AtomicBool,
}

/// Append-only text log of one instance.
///
/// Cloning yields another handle to the same file, so devices and the
/// monitor task can log without holding the instance.
#[derive(Clone)]
pub struct InstanceLog {
    inner: Arc<LogInner>,
}

impl std::fmt::Debug for InstanceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLog")
            .field("path", &self.inner.path)
            .field("open", &self.is_open())
            .finish()
    }
}

impl InstanceLog {
    /// Creates a closed log for `instance` at `path`.
    ///
    /// A disabled log accepts every call and writes nothing.
    pub fn new(instance: &str, path: &Path, enabled: bool) -> Self {
        Self {
            inner: Arc::new(LogInner {
                instance: instance.to_string(),
                path: path.to_path_buf(),
                enabled,
                file: Mutex::new(None),
                failure_reported: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    fn open(&self, truncate: bool) -> Result<()> {
        if !self.inner.enabled {
            return Ok(());
        }
        let mut opts = OpenOptions::new();
        opts.create(true);
        if truncate {
            opts.write(true).truncate(true);
        } else {
            opts.append(true);
        }
        let file = opts.open(&self.inner.path)?;
        *self.inner.file.lock().unwrap_or_else(|e| e.into_inner()) = Some(file);
        self.inner.failure_reported.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Opens the log, discarding previous contents.
    pub fn create(&self) -> Result<()> {
        self.open(true)
    }

    /// Opens the log in append mode.
    pub fn reopen(&self) -> Result<()> {
        self.open(false)
    }

    pub fn close(&self) {
        let mut file = self.inner.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut f) = file.take() {
            let _ = f.flush();
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner
            .file
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Appends `MODULE: message` with a timestamp.
    ///
    /// Write failures never reach the caller. The first one after each open
    /// is reported through `tracing`; later ones are dropped silently.
    pub fn log(&self, module: &str, message: &str) {
        let mut guard = self.inner.file.lock().unwrap_or_else(|e| e.into_inner());
        let Some(file) = guard.as_mut() else {
            return;
        };
        let stamp = chrono::Local::now().format("%b %d %H:%M:%S%.3f");
        if let Err(e) = writeln!(file, "{} {}: {}", stamp, module, message) {
            self.report_failure(&e);
        }
    }

    /// Reports an error for this instance on stderr-backed tracing and in the
    /// log file.
    pub fn error(&self, message: &str) {
        tracing::error!("{}: {}", self.inner.instance, message);
        self.log("ERROR", message);
    }

    /// Checks that the log file can still be written.
    ///
    /// A disabled log is always healthy. An enabled log that was closed is not.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        if !self.inner.enabled {
            return true;
        }
        let mut guard = self.inner.file.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(file) => file.flush().is_ok() && self.inner.path.exists(),
            None => false,
        }
    }

    fn report_failure(&self, err: &std::io::Error) {
        if !self.inner.failure_reported.swap(true, Ordering::SeqCst) {
            tracing::error!(
                "{}: cannot write log {}: {}",
                self.inner.instance,
                self.inner.path.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c7200_R1_log.txt");
        let log = InstanceLog::new("R1", &path, true);

        log.create().unwrap();
        log.log("VM", "hello");
        log.log("NVRAM", "world");
        log.close();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" VM: hello"));
        assert!(lines[1].ends_with(" NVRAM: world"));
    }

    #[test]
    fn test_create_truncates_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let log = InstanceLog::new("R1", &path, true);

        log.create().unwrap();
        log.log("VM", "first");
        log.close();

        log.reopen().unwrap();
        log.log("VM", "second");
        log.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);

        log.create().unwrap();
        log.close();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn test_closed_log_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let log = InstanceLog::new("R1", &path, true);

        log.log("VM", "dropped");
        assert!(!path.exists());
        assert!(!log.is_writable());
    }

    #[test]
    fn test_disabled_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let log = InstanceLog::new("R1", &path, false);

        log.create().unwrap();
        log.log("VM", "nothing");
        assert!(!path.exists());
        assert!(log.is_writable());
    }

    #[test]
    fn test_deleted_file_not_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let log = InstanceLog::new("R1", &path, true);

        log.create().unwrap();
        assert!(log.is_writable());
        std::fs::remove_file(&path).unwrap();
        assert!(!log.is_writable());
    }
}
