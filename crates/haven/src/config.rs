use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use haven_export::{HashMode, SuppressionAggregator, DEFAULT_MARKER, DEFAULT_REQUIRED_SECTIONS};

use crate::error::{RootError, RootResult};

/// Where the encryption key comes from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    /// HKDF-derived from the signing key.
    #[default]
    Derived,
    /// A separate key injected through its own environment variable.
    Distinct,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Csv,
    Jsonl,
}

/// On-disk locations for the event log, packaged blobs and the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    dirs_or_default(".haven/data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn events_dir(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Shown in place of counts from 1 to 4. The threshold itself is fixed.
    #[serde(default = "default_marker")]
    pub suppression_marker: String,

    #[serde(default = "default_encrypt")]
    pub encrypt: bool,

    #[serde(default)]
    pub hash_mode: HashMode,

    #[serde(default)]
    pub format: OutputFormat,

    #[serde(default = "default_required_sections")]
    pub required_sections: Vec<String>,

    /// Per-phase deadline in seconds. 0 disables it.
    #[serde(default)]
    pub phase_timeout_secs: u64,
}

fn default_marker() -> String {
    DEFAULT_MARKER.to_string()
}

fn default_encrypt() -> bool {
    true
}

fn default_required_sections() -> Vec<String> {
    DEFAULT_REQUIRED_SECTIONS.iter().map(|s| s.to_string()).collect()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            suppression_marker: default_marker(),
            encrypt: default_encrypt(),
            hash_mode: HashMode::default(),
            format: OutputFormat::default(),
            required_sections: default_required_sections(),
            phase_timeout_secs: 0,
        }
    }
}

impl ExportConfig {
    pub fn phase_timeout(&self) -> Option<Duration> {
        (self.phase_timeout_secs > 0).then(|| Duration::from_secs(self.phase_timeout_secs))
    }
}

/// Names of the environment variables carrying secrets. The secrets
/// themselves never appear in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    #[serde(default)]
    pub key_mode: KeyMode,

    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,

    #[serde(default = "default_encryption_key_env")]
    pub encryption_key_env: String,

    #[serde(default = "default_salt_env")]
    pub salt_env: String,
}

fn default_signing_key_env() -> String {
    "HAVEN_EXPORT_SIGNING_KEY".to_string()
}

fn default_encryption_key_env() -> String {
    "HAVEN_EXPORT_ENCRYPTION_KEY".to_string()
}

fn default_salt_env() -> String {
    "HAVEN_PSEUDONYM_SALT".to_string()
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_mode: KeyMode::default(),
            signing_key_env: default_signing_key_env(),
            encryption_key_env: default_encryption_key_env(),
            salt_env: default_salt_env(),
        }
    }
}

/// Top-level configuration for the Haven binary.
///
/// Loaded from a TOML file (typically `~/.haven/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub export: ExportConfig,

    #[serde(default)]
    pub crypto: CryptoConfig,
}

/// Returns `$HOME/<suffix>` if HOME is available, otherwise `./<suffix>`.
fn dirs_or_default(suffix: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(suffix))
        .unwrap_or_else(|_| PathBuf::from(suffix))
}

impl RootConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> RootResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(RootError::Io)?;
        let config: RootConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> RootResult<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| RootError::Config(format!("TOML serialize error: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(RootError::Io)?;
        }
        std::fs::write(path, contents).map_err(RootError::Io)?;
        Ok(())
    }

    pub fn validate(&self) -> RootResult<()> {
        if SuppressionAggregator::with_marker(self.export.suppression_marker.clone()).is_none() {
            return Err(RootError::Config(format!(
                "suppression_marker must be non-empty and non-numeric, got '{}'",
                self.export.suppression_marker
            )));
        }
        if self
            .export
            .required_sections
            .iter()
            .any(|s| s.trim().is_empty())
        {
            return Err(RootError::Config(
                "required_sections must not contain blank names".into(),
            ));
        }
        for (field, value) in [
            ("signing_key_env", &self.crypto.signing_key_env),
            ("salt_env", &self.crypto.salt_env),
        ] {
            if value.trim().is_empty() {
                return Err(RootError::Config(format!("{field} must not be empty")));
            }
        }
        if self.crypto.key_mode == KeyMode::Distinct
            && self.crypto.encryption_key_env.trim().is_empty()
        {
            return Err(RootError::Config(
                "encryption_key_env is required when key_mode = \"distinct\"".into(),
            ));
        }
        Ok(())
    }

    pub fn default_config_path() -> PathBuf {
        dirs_or_default(".haven/config.toml")
    }
}
