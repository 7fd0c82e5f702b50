use crate::model::MigrationStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Broad classification of a [`FerryError`], used by callers that only
/// care whether the caller, the system or the data is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; rejected synchronously without touching any state.
    Validation,
    /// A workflow step, command or subprocess failed or timed out.
    Execution,
    /// Sample verification found a mismatch.
    Integrity,
    /// Metadata or backup files could not be read or written.
    Persistence,
}

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("Invalid filesystem on {device}: expected {expected}, found {found}")]
    InvalidFilesystem {
        device: String,
        expected: String,
        found: String,
    },

    #[error("Migration not found: {0}")]
    NotFound(String),

    #[error("Migration {id} is {actual}, expected {expected}")]
    WrongState {
        id: String,
        actual: MigrationStatus,
        expected: MigrationStatus,
    },

    #[error("Rollback not available for migration {0}")]
    RollbackUnavailable(String),

    #[error("Migration id already in use: {0}")]
    DuplicateId(String),

    #[error("Target {device} is reserved by running migration {migration_id}")]
    TargetInUse {
        device: String,
        migration_id: String,
    },

    #[error("Migration {id} is being worked on by another process{}", .owner.map(|pid| format!(" (pid {})", pid)).unwrap_or_default())]
    MigrationBusy { id: String, owner: Option<u32> },

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Device is not safe to format: {0}")]
    UnsafeDevice(String),

    #[error("Assessment failed: {0}")]
    Assessment(#[source] Box<FerryError>),

    #[error("{step} failed: {message}")]
    Execution { step: String, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Integrity check failed: {}", .0.join("; "))]
    Integrity(Vec<String>),

    #[error("Persistence error at {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl FerryError {
    pub fn execution(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFilesystem { .. }
            | Self::NotFound(_)
            | Self::WrongState { .. }
            | Self::RollbackUnavailable(_)
            | Self::DuplicateId(_)
            | Self::TargetInUse { .. }
            | Self::MigrationBusy { .. }
            | Self::DeviceNotFound(_)
            | Self::InvalidInput(_)
            | Self::UnsafeDevice(_)
            | Self::Configuration(_) => ErrorKind::Validation,
            Self::Assessment(inner) => inner.kind(),
            Self::Execution { .. }
            | Self::Timeout(_)
            | Self::ToolNotFound(_)
            | Self::TaskFailed(_) => ErrorKind::Execution,
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::Persistence { .. } | Self::IoError(_) | Self::SerializationError(_) => {
                ErrorKind::Persistence
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FerryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assessment_error_reports_inner_kind() {
        let err = FerryError::Assessment(Box::new(FerryError::InvalidFilesystem {
            device: "/dev/sdb1".to_string(),
            expected: "ntfs".to_string(),
            found: "vfat".to_string(),
        }));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("expected ntfs"));
    }

    #[test]
    fn test_integrity_error_lists_every_problem() {
        let err = FerryError::Integrity(vec!["a missing".into(), "b size".into()]);
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.to_string(), "Integrity check failed: a missing; b size");
    }

    #[test]
    fn test_io_errors_are_persistence() {
        let err: FerryError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }
}
