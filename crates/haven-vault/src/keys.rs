use crate::error::{VaultError, VaultResult};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use zeroize::Zeroizing;

/// Minimum length of an injected signing key.
pub const MIN_KEY_LEN: usize = 32;

const ENCRYPTION_SALT: &[u8] = b"haven-export-package";
const ENCRYPTION_INFO: &[u8] = b"haven-export-encryption";

fn reject_weak(bytes: &[u8], what: &str) -> VaultResult<()> {
    if bytes.len() < MIN_KEY_LEN {
        return Err(VaultError::KeyMaterial(format!(
            "{what} must be at least {MIN_KEY_LEN} bytes"
        )));
    }
    if bytes.iter().all(|b| *b == 0) {
        return Err(VaultError::KeyMaterial(format!("{what} must not be all zero")));
    }
    Ok(())
}

/// HMAC key for manifest signatures. Always injected at runtime.
#[derive(Clone)]
pub struct SigningKey(Zeroizing<Vec<u8>>);

impl SigningKey {
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        reject_weak(bytes, "signing key")?;
        Ok(Self(Zeroizing::new(bytes.to_vec())))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// AES-256-GCM key for bundle encryption.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; 32]>);

impl EncryptionKey {
    /// A distinct injected key. Exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        reject_weak(bytes, "encryption key")?;
        if bytes.len() != 32 {
            return Err(VaultError::KeyMaterial(
                "encryption key must be exactly 32 bytes".to_string(),
            ));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// HKDF-SHA256 over the signing key with a fixed label, so the two keys
    /// never coincide.
    pub fn derive_from(signing: &SigningKey) -> VaultResult<Self> {
        let hk = Hkdf::<Sha256>::new(Some(ENCRYPTION_SALT), signing.as_bytes());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(ENCRYPTION_INFO, &mut *okm)
            .map_err(|e| VaultError::KeyMaterial(format!("HKDF expand failed: {}", e)))?;
        Ok(Self(okm))
    }

    pub(crate) fn material(&self) -> &Zeroizing<[u8; 32]> {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}
