use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::envelope;
use crate::error::{IntegrityError, VaultError, VaultResult};
use crate::keys::{EncryptionKey, SigningKey};
use crate::manifest::{signed_body, ExportManifest};

type HmacSha256 = Hmac<Sha256>;

/// One generated export file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub content: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Output of `SecurePackager::package`.
#[derive(Debug, Clone)]
pub struct PackagedExport {
    /// Stored bytes: the canonical bundle, encrypted when requested.
    pub bundle: Vec<u8>,
    pub manifest: ExportManifest,
    /// SHA-256 hex of `bundle`.
    pub content_hash: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Signs and optionally encrypts finished artifact sets.
///
/// Packaging and verification run to completion or fail as a whole. No
/// partially signed or partially encrypted package is ever returned.
#[derive(Debug, Clone)]
pub struct SecurePackager {
    signing_key: SigningKey,
    encryption_key: EncryptionKey,
}

impl SecurePackager {
    pub fn new(signing_key: SigningKey, encryption_key: EncryptionKey) -> Self {
        Self {
            signing_key,
            encryption_key,
        }
    }

    /// Encryption key derived from the signing key.
    pub fn with_derived_encryption(signing_key: SigningKey) -> VaultResult<Self> {
        let encryption_key = EncryptionKey::derive_from(&signing_key)?;
        Ok(Self::new(signing_key, encryption_key))
    }

    fn mac(&self) -> VaultResult<HmacSha256> {
        HmacSha256::new_from_slice(self.signing_key.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("HMAC init failed: {}", e)))
    }

    /// Hex HMAC-SHA256 over `message`.
    pub fn sign(&self, message: &[u8]) -> VaultResult<String> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time check of a hex signature over `message`.
    pub fn verify_signature(&self, message: &[u8], signature_hex: &str) -> VaultResult<bool> {
        let signature = match hex::decode(signature_hex) {
            Ok(s) => s,
            Err(_) => return Ok(false),
        };
        let mut mac = self.mac()?;
        mac.update(message);
        let expected = mac.finalize().into_bytes();
        Ok(expected.as_slice().ct_eq(&signature).into())
    }

    pub fn package(&self, artifacts: &[Artifact], encrypt: bool) -> VaultResult<PackagedExport> {
        if artifacts.is_empty() {
            return Err(VaultError::InvalidInput(
                "at least one artifact is required".to_string(),
            ));
        }

        let mut files = BTreeMap::new();
        let mut contents = BTreeMap::new();
        for artifact in artifacts {
            if artifact.name.trim().is_empty() {
                return Err(VaultError::InvalidInput("artifact name is empty".to_string()));
            }
            if files
                .insert(artifact.name.clone(), sha256_hex(&artifact.content))
                .is_some()
            {
                return Err(VaultError::InvalidInput(format!(
                    "duplicate artifact name: {}",
                    artifact.name
                )));
            }
            contents.insert(artifact.name.clone(), BASE64.encode(&artifact.content));
        }

        let signature = self.sign(&signed_body(&files, encrypt)?)?;

        let plain = serde_json::to_vec(&contents)
            .map_err(|e| VaultError::Serialization(format!("bundle: {}", e)))?;
        let bundle = if encrypt {
            envelope::encrypt(self.encryption_key.material(), &plain)?
        } else {
            plain
        };
        let content_hash = sha256_hex(&bundle);

        debug!(
            artifacts = files.len(),
            encrypted = encrypt,
            content_hash = %content_hash,
            "packaged export"
        );

        Ok(PackagedExport {
            bundle,
            manifest: ExportManifest {
                files,
                signature,
                encrypted: encrypt,
            },
            content_hash,
        })
    }

    /// Check a stored bundle against its manifest and return the artifacts.
    ///
    /// Decrypts when the manifest says so, then requires the artifact set to
    /// equal the manifest's file set, every hash to match and the signature
    /// to verify.
    pub fn verify(
        &self,
        bundle: &[u8],
        manifest: &ExportManifest,
    ) -> VaultResult<BTreeMap<String, Vec<u8>>> {
        let result = self.verify_inner(bundle, manifest);
        if let Err(VaultError::Integrity(ref reason)) = result {
            warn!(%reason, "package rejected");
        }
        result
    }

    fn verify_inner(
        &self,
        bundle: &[u8],
        manifest: &ExportManifest,
    ) -> VaultResult<BTreeMap<String, Vec<u8>>> {
        let plain = if manifest.encrypted {
            envelope::decrypt(self.encryption_key.material(), bundle)
                .map_err(|_| IntegrityError::Undecryptable)?
        } else {
            bundle.to_vec()
        };

        let encoded: BTreeMap<String, String> = serde_json::from_slice(&plain)
            .map_err(|e| IntegrityError::MalformedBundle(e.to_string()))?;

        for name in manifest.files.keys() {
            if !encoded.contains_key(name) {
                return Err(IntegrityError::MissingArtifact(name.clone()).into());
            }
        }
        for name in encoded.keys() {
            if !manifest.files.contains_key(name) {
                return Err(IntegrityError::UnexpectedArtifact(name.clone()).into());
            }
        }

        let mut artifacts = BTreeMap::new();
        for (name, b64) in encoded {
            let content = BASE64
                .decode(b64.as_bytes())
                .map_err(|e| IntegrityError::MalformedBundle(format!("{name}: {e}")))?;
            let expected = manifest.files.get(&name).map(String::as_str).unwrap_or("");
            if sha256_hex(&content) != expected {
                return Err(IntegrityError::HashMismatch(name).into());
            }
            artifacts.insert(name, content);
        }

        if !self.verify_signature(&manifest.signed_bytes()?, &manifest.signature)? {
            return Err(IntegrityError::SignatureMismatch.into());
        }

        Ok(artifacts)
    }
}
