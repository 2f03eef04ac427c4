use haven_core::DeterministicHasher;
use haven_vault::{EncryptionKey, SecurePackager, SigningKey, MIN_KEY_LEN};
use zeroize::Zeroizing;

use crate::config::{CryptoConfig, KeyMode};
use crate::error::{RootError, RootResult};

/// Development salt that shipped in an early build. Any deployment still
/// using it shares pseudonyms with every other such deployment.
const REJECTED_SALTS: &[&str] = &["haven-hmis-personal-id-salt-2024"];

pub const MIN_SALT_LEN: usize = 16;

/// Runtime-injected key material. Never read from the config file and never
/// defaulted.
pub struct Secrets {
    pub signing_key: SigningKey,
    pub encryption_key: Option<EncryptionKey>,
    pub hasher: DeterministicHasher,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("encryption_key", &self.encryption_key.is_some())
            .finish_non_exhaustive()
    }
}

impl Secrets {
    pub fn from_env(config: &CryptoConfig) -> RootResult<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Resolve secrets through `lookup`, which maps a variable name to its
    /// value.
    pub fn from_lookup<F>(config: &CryptoConfig, lookup: F) -> RootResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let signing_raw = require(&lookup, &config.signing_key_env)?;
        let signing_bytes = decode(&signing_raw)?;
        if signing_bytes.len() < MIN_KEY_LEN {
            return Err(RootError::Config(format!(
                "{} must be at least {} bytes",
                config.signing_key_env, MIN_KEY_LEN
            )));
        }
        let signing_key = SigningKey::from_bytes(&signing_bytes)
            .map_err(|e| RootError::Config(format!("{}: {}", config.signing_key_env, e)))?;

        let encryption_key = match config.key_mode {
            KeyMode::Derived => None,
            KeyMode::Distinct => {
                let raw = require(&lookup, &config.encryption_key_env)?;
                let bytes = decode(&raw)?;
                if bytes.as_slice() == signing_bytes.as_slice() {
                    return Err(RootError::Config(format!(
                        "{} must differ from {}",
                        config.encryption_key_env, config.signing_key_env
                    )));
                }
                Some(
                    EncryptionKey::from_bytes(&bytes).map_err(|e| {
                        RootError::Config(format!("{}: {}", config.encryption_key_env, e))
                    })?,
                )
            }
        };

        let salt = require(&lookup, &config.salt_env)?;
        if REJECTED_SALTS.contains(&salt.as_str()) {
            return Err(RootError::Config(format!(
                "{} is set to the development salt; configure a deployment-specific value",
                config.salt_env
            )));
        }
        if salt.len() < MIN_SALT_LEN {
            return Err(RootError::Config(format!(
                "{} must be at least {} bytes",
                config.salt_env, MIN_SALT_LEN
            )));
        }
        let hasher = DeterministicHasher::new(salt.as_bytes())
            .map_err(|e| RootError::Config(format!("{}: {}", config.salt_env, e)))?;

        Ok(Self {
            signing_key,
            encryption_key,
            hasher,
        })
    }

    pub fn packager(&self) -> RootResult<SecurePackager> {
        match &self.encryption_key {
            Some(key) => Ok(SecurePackager::new(self.signing_key.clone(), key.clone())),
            None => Ok(SecurePackager::with_derived_encryption(
                self.signing_key.clone(),
            )?),
        }
    }
}

fn require<F>(lookup: &F, name: &str) -> RootResult<Zeroizing<String>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(v) if !v.is_empty() => Ok(Zeroizing::new(v)),
        _ => Err(RootError::Config(format!("environment variable {name} is not set"))),
    }
}

/// `hex:`-prefixed values are hex-decoded; anything else is taken as raw
/// bytes.
fn decode(value: &str) -> RootResult<Zeroizing<Vec<u8>>> {
    match value.strip_prefix("hex:") {
        Some(h) => hex::decode(h.trim())
            .map(Zeroizing::new)
            .map_err(|e| RootError::Config(format!("invalid hex key: {}", e))),
        None => Ok(Zeroizing::new(value.as_bytes().to_vec())),
    }
}
