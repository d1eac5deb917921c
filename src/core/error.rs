use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Duplicate command '{0}' already queued")]
    DuplicateCommand(Uuid),

    #[error("No handler registered for '{module}/{command_type}'")]
    UnroutableCommand {
        module: String,
        command_type: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serde(String),

    #[error("Execution error: {0}")]
    Execution(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification of an error, used by the sync engine to decide
/// between automatic retry and surfacing the failure to the user, and by the
/// HTTP surface to pick a status code. Serialized into envelope retry
/// bookkeeping so the classification survives restarts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    Transient,
    Fatal,
}

impl ErrorKind {
    /// A definite rejection will never succeed by resending the same
    /// envelope; it waits for an explicit user retry or discard.
    pub fn is_definite_rejection(&self) -> bool {
        !self.is_transient()
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Authorization(_) => ErrorKind::Authorization,
            SyncError::Conflict(_) => ErrorKind::Conflict,
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::DuplicateCommand(_)
            | SyncError::UnroutableCommand { .. }
            | SyncError::Io(_)
            | SyncError::Serde(_)
            | SyncError::Execution(_) => ErrorKind::Fatal,
        }
    }
}

/// Classified error stored on an envelope after a failed delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn from_error(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
