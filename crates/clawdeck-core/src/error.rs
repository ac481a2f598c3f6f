//! Error types for the reconciliation engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for reconciliation operations.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors raised while reading, reconciling or persisting runtime configuration.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A proposed write was rejected by the internal schema check or by the runtime.
    #[error("validation failed for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    /// A stored key violates the normalization invariants.
    #[error("corrupt key `{key}`: {reason}")]
    Corruption { key: String, reason: String },

    /// Two stores disagree on a profile's attributes.
    #[error("profile `{profile_id}` differs across stores: {detail}")]
    MergeConflict { profile_id: String, detail: String },

    /// The runtime process could not be invoked or reported a failure.
    #[error("runtime collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// The runtime process did not answer within the configured bound.
    #[error("runtime collaborator timed out after {0:?}")]
    CollaboratorTimeout(Duration),

    /// The write landed but the persisted state does not reflect it.
    #[error("read-back mismatch for `{key}`: {reason}")]
    ReadBackMismatch { key: String, reason: String },

    /// A mutation overlapped another writer.
    #[error("concurrent mutation detected: {0}")]
    ConcurrencyViolation(String),

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

/// Coarse classification used by the request surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Corruption,
    MergeConflict,
    CollaboratorUnavailable,
    CollaboratorTimeout,
    ReadBackMismatch,
    ConcurrencyViolation,
    NotFound,
    Storage,
}

impl ReconcileError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ReconcileError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn read_back(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ReconcileError::ReadBackMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Adapter for `map_err` on filesystem calls.
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Adapter for `map_err` on JSON (de)serialization.
    pub fn json(path: &Path) -> impl FnOnce(serde_json::Error) -> Self + '_ {
        move |source| ReconcileError::Json {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Validation { .. } => ErrorKind::Validation,
            ReconcileError::Corruption { .. } => ErrorKind::Corruption,
            ReconcileError::MergeConflict { .. } => ErrorKind::MergeConflict,
            ReconcileError::CollaboratorUnavailable(_) => ErrorKind::CollaboratorUnavailable,
            ReconcileError::CollaboratorTimeout(_) => ErrorKind::CollaboratorTimeout,
            ReconcileError::ReadBackMismatch { .. } => ErrorKind::ReadBackMismatch,
            ReconcileError::ConcurrencyViolation(_) => ErrorKind::ConcurrencyViolation,
            ReconcileError::BackupNotFound(_) => ErrorKind::NotFound,
            ReconcileError::Io { .. } | ReconcileError::Json { .. } | ReconcileError::Settings(_) => {
                ErrorKind::Storage
            }
        }
    }

    /// Conditions that are logged and handled locally instead of propagated.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Corruption | ErrorKind::MergeConflict | ErrorKind::CollaboratorUnavailable
        )
    }

    /// The key or field the failure is about, when there is one.
    pub fn subject(&self) -> Option<&str> {
        match self {
            ReconcileError::Validation { field, .. } => Some(field),
            ReconcileError::Corruption { key, .. } | ReconcileError::ReadBackMismatch { key, .. } => {
                Some(key)
            }
            ReconcileError::MergeConflict { profile_id, .. } => Some(profile_id),
            ReconcileError::BackupNotFound(name) => Some(name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_subject() {
        let err = ReconcileError::validation("maxConcurrent", "must be at least 1");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.subject(), Some("maxConcurrent"));
        assert!(!err.is_recoverable());

        let err = ReconcileError::CollaboratorTimeout(Duration::from_secs(3));
        assert_eq!(err.kind(), ErrorKind::CollaboratorTimeout);
        assert!(err.subject().is_none());
        assert!(!err.is_recoverable());

        let err = ReconcileError::CollaboratorUnavailable("spawn failed".into());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_display_names_the_key() {
        let err = ReconcileError::read_back("openai/gpt-4o", "missing after write");
        assert_eq!(
            err.to_string(),
            "read-back mismatch for `openai/gpt-4o`: missing after write"
        );
    }
}
