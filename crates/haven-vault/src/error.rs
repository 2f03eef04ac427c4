use thiserror::Error;

/// Reasons a package is rejected by `SecurePackager::verify`.
///
/// Any one of them rejects the whole package.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("bundle could not be decrypted")]
    Undecryptable,

    #[error("bundle is malformed: {0}")]
    MalformedBundle(String),

    #[error("artifact listed in manifest is missing: {0}")]
    MissingArtifact(String),

    #[error("artifact not listed in manifest: {0}")]
    UnexpectedArtifact(String),

    #[error("hash mismatch for artifact: {0}")]
    HashMismatch(String),

    #[error("manifest signature mismatch")]
    SignatureMismatch,
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("invalid package input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<VaultError> for haven_core::HavenError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Storage(msg) => haven_core::HavenError::Storage(msg),
            VaultError::Crypto(msg) | VaultError::KeyMaterial(msg) => {
                haven_core::HavenError::Crypto(msg)
            }
            other => haven_core::HavenError::Internal(other.to_string()),
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_display() {
        let err = VaultError::from(IntegrityError::HashMismatch("Client.csv".into()));
        assert_eq!(
            err.to_string(),
            "integrity check failed: hash mismatch for artifact: Client.csv"
        );
    }

    #[test]
    fn test_into_haven_error() {
        let err: haven_core::HavenError = VaultError::Storage("disk full".into()).into();
        assert!(matches!(err, haven_core::HavenError::Storage(_)));
        let err: haven_core::HavenError = VaultError::KeyMaterial("too short".into()).into();
        assert!(matches!(err, haven_core::HavenError::Crypto(_)));
    }
}
