use crate::error::{VaultError, VaultResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use rand::RngCore;
use zeroize::Zeroizing;

// AES-256-GCM with a fresh random 96-bit nonce per call.
// Wire layout: nonce (12 bytes) || ciphertext || tag (16 bytes).

pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

pub fn encrypt(key: &Zeroizing<[u8; 32]>, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&**key)
        .map_err(|e| VaultError::Crypto(format!("cipher init failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = AesNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::Crypto(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Fails closed: a wrong key or any modified byte yields an error and no
/// plaintext.
pub fn decrypt(key: &Zeroizing<[u8; 32]>, sealed: &[u8]) -> VaultResult<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(VaultError::Crypto("ciphertext too short".to_string()));
    }
    let cipher = Aes256Gcm::new_from_slice(&**key)
        .map_err(|e| VaultError::Crypto(format!("cipher init failed: {}", e)))?;

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = AesNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| VaultError::Crypto("decryption failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Zeroizing<[u8; 32]> {
        Zeroizing::new([0x42; 32])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = test_key();
        let sealed = encrypt(&key, b"Client.csv contents").unwrap();
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"Client.csv contents");
    }

    #[test]
    fn test_layout_and_fresh_nonce() {
        let key = test_key();
        let a = encrypt(&key, b"same").unwrap();
        let b = encrypt(&key, b"same").unwrap();
        assert_eq!(a.len(), NONCE_SIZE + 4 + TAG_SIZE);
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt(&test_key(), b"secret").unwrap();
        let other = Zeroizing::new([0x43; 32]);
        assert!(decrypt(&other, &sealed).is_err());
    }

    #[test]
    fn test_tampered_byte_fails() {
        let key = test_key();
        let sealed = encrypt(&key, b"integrity check").unwrap();
        for i in 0..sealed.len() {
            let mut copy = sealed.clone();
            copy[i] ^= 0x01;
            assert!(decrypt(&key, &copy).is_err(), "byte {i}");
        }
    }

    #[test]
    fn test_truncated_input_fails() {
        assert!(decrypt(&test_key(), &[0u8; 10]).is_err());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let sealed = encrypt(&key, b"").unwrap();
        assert!(decrypt(&key, &sealed).unwrap().is_empty());
    }
}
