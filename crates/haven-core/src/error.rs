use thiserror::Error;

/// Error type shared by collaborator traits and core helpers.
///
/// Messages never include salts, keys, or raw subject identifiers.
#[derive(Debug, Error)]
pub enum HavenError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("consent ledger error: {0}")]
    Consent(String),

    #[error("identity provider error: {0}")]
    Identity(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("audit persistence failure: {0}")]
    AuditPersistence(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for HavenError {
    fn from(e: serde_json::Error) -> Self {
        HavenError::Serialization(e.to_string())
    }
}

pub type HavenResult<T> = Result<T, HavenError>;
