use haven_core::{ExportJobId, ExportJobState, HavenError};
use haven_policy::PolicyError;
use haven_vault::VaultError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    /// Malformed queue input. Nothing has been recorded.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("illegal transition {from} -> {to}")]
    StateTransition {
        from: ExportJobState,
        to: ExportJobState,
    },

    #[error("invalid completion: {0}")]
    InvalidCompletion(String),

    #[error("invalid event log: {0}")]
    InvalidEventLog(String),

    #[error("concurrent modification of job {job_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        job_id: ExportJobId,
        expected: u64,
        actual: u64,
    },

    #[error("job not found: {0}")]
    NotFound(ExportJobId),

    #[error("job {0} has no completed package")]
    NotComplete(ExportJobId),

    #[error("format error: {0}")]
    Format(String),

    #[error(transparent)]
    Collaborator(#[from] HavenError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Failure codes carried by a FAILED job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    PolicyError,
    FormatError,
    PackagingError,
    StorageError,
    UserCancelled,
    PhaseTimeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::PolicyError => "POLICY_ERROR",
            ErrorCode::FormatError => "FORMAT_ERROR",
            ErrorCode::PackagingError => "PACKAGING_ERROR",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::UserCancelled => "USER_CANCELLED",
            ErrorCode::PhaseTimeout => "PHASE_TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display_joins_messages() {
        let err = ExportError::Validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "validation failed: a; b");
    }

    #[test]
    fn test_transition_display() {
        let err = ExportError::StateTransition {
            from: ExportJobState::Complete,
            to: ExportJobState::Failed,
        };
        assert_eq!(err.to_string(), "illegal transition COMPLETE -> FAILED");
    }

    #[test]
    fn test_error_code_serde_matches_display() {
        for code in [
            ErrorCode::ValidationError,
            ErrorCode::PolicyError,
            ErrorCode::FormatError,
            ErrorCode::PackagingError,
            ErrorCode::StorageError,
            ErrorCode::UserCancelled,
            ErrorCode::PhaseTimeout,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code));
        }
    }
}
