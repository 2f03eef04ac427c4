use thiserror::Error;

/// Error type for the Haven service and binary, aggregating the errors of
/// every subsystem crate.
#[derive(Debug, Error)]
pub enum RootError {
    #[error("export error: {0}")]
    Export(#[from] haven_export::ExportError),

    #[error("vault error: {0}")]
    Vault(#[from] haven_vault::VaultError),

    #[error("policy error: {0}")]
    Policy(#[from] haven_policy::PolicyError),

    #[error("collaborator error: {0}")]
    Core(#[from] haven_core::HavenError),

    /// The actor is neither the job's requester nor an administrator.
    #[error("access denied: {actor} may not {operation}")]
    AccessDenied { actor: String, operation: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for RootError {
    fn from(e: serde_json::Error) -> Self {
        RootError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for RootError {
    fn from(e: toml::de::Error) -> Self {
        RootError::Config(format!("TOML parse error: {}", e))
    }
}

pub type RootResult<T> = Result<T, RootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_denied_display() {
        let err = RootError::AccessDenied {
            actor: "mallory".into(),
            operation: "download".into(),
        };
        assert_eq!(err.to_string(), "access denied: mallory may not download");
    }

    #[test]
    fn test_root_error_from_export() {
        let export_err = haven_export::ExportError::Validation(vec!["Export reason is required".into()]);
        let root_err: RootError = export_err.into();
        assert!(matches!(root_err, RootError::Export(_)));
        assert!(root_err.to_string().contains("Export reason is required"));
    }

    #[test]
    fn test_root_error_from_vault() {
        let vault_err = haven_vault::VaultError::KeyMaterial("too short".into());
        let root_err: RootError = vault_err.into();
        assert!(root_err.to_string().contains("too short"));
    }

    #[test]
    fn test_root_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let root_err: RootError = json_err.into();
        assert!(matches!(root_err, RootError::Serialization(_)));
    }

    #[test]
    fn test_root_error_from_toml() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let root_err: RootError = toml_err.into();
        assert!(matches!(root_err, RootError::Config(_)));
    }
}
