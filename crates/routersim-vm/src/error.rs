//! Error types for the instance core.

use thiserror::Error;

/// Result type alias for instance operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while managing a simulated instance.
#[derive(Debug, Error)]
pub enum VmError {
    /// A name is already registered (instance, object or device).
    #[error("already exists: {0}")]
    DuplicateName(String),

    /// The requested instance, object or device does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A mandatory hardware object was never attached.
    #[error("missing mandatory object: {0}")]
    MissingObject(String),

    /// Every device slot of the instance is occupied.
    #[error("device table full ({0} slots)")]
    SlotExhausted(usize),

    /// A physical range overlaps one that is already mapped.
    #[error("address conflict: [{base:#x}, {end:#x}) overlaps device '{other}'")]
    AddressConflict {
        /// Base of the rejected range.
        base: u64,
        /// Exclusive end of the rejected range.
        end: u64,
        /// Device already occupying part of the range.
        other: String,
    },

    /// A value is outside the range the instance can address.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The instance is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The instance identity is held by a live process.
    #[error("instance already running (pid {pid}), lock file {path}")]
    AlreadyRunning {
        /// Holder PID as recorded in the lock file, if readable.
        pid: String,
        /// Lock file path.
        path: String,
    },

    /// NVRAM holds no valid configuration.
    #[error("no configuration data: {0}")]
    NoConfigData(String),

    /// The machine type is not one of the supported models.
    #[error("unsupported machine type: {0}")]
    UnsupportedMachine(String),

    /// A bounded wait expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// CPU execution group failure.
    #[error("CPU error: {0}")]
    Cpu(String),

    /// Settings file error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Saved instance directives could not be parsed.
    #[error("parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Description of the problem.
        message: String,
    },

    /// An internal invariant was violated (refcount underflow, double free).
    #[error("fatal invariant violation: {0}")]
    FatalInvariantViolation(String),

    /// File operation failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmError {
    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Returns true if this is a fatal invariant violation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalInvariantViolation(_))
    }

    /// Returns true if this is an I/O error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: VmError = io_err.into();
        assert!(err.is_io());
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_address_conflict_message() {
        let err = VmError::AddressConflict {
            base: 0x1000,
            end: 0x2000,
            other: "nvram".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "address conflict: [0x1000, 0x2000) overlaps device 'nvram'"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(VmError::FatalInvariantViolation("refcount".into()).is_fatal());
        assert!(!VmError::invalid_state("halted").is_fatal());
    }
}
