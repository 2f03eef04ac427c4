use haven_core::HavenError;
use thiserror::Error;

/// Errors raised while building policy inputs.
///
/// A denial is never an error: it is a `PolicyDecision` with
/// `allowed == false`.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown visibility scope: {0}")]
    UnknownScope(String),

    #[error("unknown resource category: {0}")]
    UnknownCategory(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] HavenError),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_display() {
        let err = PolicyError::UnknownScope("EVERYONE".into());
        assert_eq!(err.to_string(), "unknown visibility scope: EVERYONE");
    }

    #[test]
    fn test_from_haven_error() {
        let err: PolicyError = HavenError::Identity("ldap down".into()).into();
        assert!(matches!(err, PolicyError::Collaborator(_)));
        assert!(err.to_string().contains("ldap down"));
    }
}
