//! Process-wide simulator settings.
//!
//! Settings are shared by every instance created through a
//! [`Registry`](crate::registry::Registry) and may be loaded from a TOML file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

/// How per-instance file names are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileNaming {
    /// `<machine>_<name>_<kind>`.
    #[default]
    Name,
    /// `<machine>_i<id>_<kind>`.
    InstanceId,
}

/// Simulator settings (maps to `routersim.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Directory holding lock, log, NVRAM and saved configuration files.
    pub working_dir: PathBuf,
    /// File naming scheme.
    pub file_naming: FileNaming,
    /// Whether instances keep a log file.
    pub log_enabled: bool,
    /// Wall-clock period of the monitor task, in milliseconds.
    pub monitor_poll_ms: u64,
    /// Bounded wait for a suspend acknowledgement, in milliseconds.
    pub suspend_timeout_ms: u64,
    /// Bounded wait for CPU termination during stop, in milliseconds.
    pub stop_timeout_ms: u64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            file_naming: FileNaming::Name,
            log_enabled: true,
            monitor_poll_ms: 10,
            suspend_timeout_ms: 1000,
            stop_timeout_ms: 2000,
        }
    }
}

impl SimSettings {
    /// Settings rooted at `dir`, everything else default.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: dir.into(),
            ..Default::default()
        }
    }

    /// Load settings from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|e| VmError::Config(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content).map_err(|e| VmError::Config(e.to_string()))?;
        if settings.monitor_poll_ms == 0 {
            return Err(VmError::Config("monitor_poll_ms must be > 0".to_string()));
        }
        Ok(settings)
    }

    #[must_use]
    pub fn monitor_poll(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_ms)
    }

    #[must_use]
    pub fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = SimSettings::default();
        assert_eq!(s.file_naming, FileNaming::Name);
        assert!(s.log_enabled);
        assert_eq!(s.stop_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let s = SimSettings::from_toml(
            r#"
            working_dir = "/tmp/sim"
            file_naming = "instance_id"
            "#,
        )
        .unwrap();
        assert_eq!(s.working_dir, PathBuf::from("/tmp/sim"));
        assert_eq!(s.file_naming, FileNaming::InstanceId);
        assert_eq!(s.monitor_poll_ms, 10);
    }

    #[test]
    fn test_zero_poll_rejected() {
        assert!(SimSettings::from_toml("monitor_poll_ms = 0").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routersim.toml");
        std::fs::write(&path, "log_enabled = false\nstop_timeout_ms = 50\n").unwrap();

        let s = SimSettings::from_file(&path).unwrap();
        assert!(!s.log_enabled);
        assert_eq!(s.stop_timeout(), Duration::from_millis(50));
        assert!(SimSettings::from_file(dir.path().join("missing.toml")).is_err());
    }
}
