use crate::error::{HavenError, HavenResult};
use crate::types::{PseudonymId, SubjectId};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use std::fmt;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Minimum salt length accepted by `DeterministicHasher::new`.
pub const MIN_SALT_LEN: usize = 16;

/// Number of digest bytes kept in a pseudonym (32 hex characters).
const PSEUDONYM_BYTES: usize = 16;

/// One-way pseudonymization of subject identifiers.
///
/// Formula: UPPER_HEX(HMAC-SHA256(salt, subject_id)[0:16])
///
/// The salt is deployment specific. The same `(subject_id, salt)` pair
/// yields the same pseudonym across processes; different salts yield
/// uncorrelatable pseudonyms.
#[derive(Clone)]
pub struct DeterministicHasher {
    salt: Zeroizing<Vec<u8>>,
}

impl DeterministicHasher {
    pub fn new(salt: &[u8]) -> HavenResult<Self> {
        if salt.len() < MIN_SALT_LEN {
            return Err(HavenError::Crypto(format!(
                "pseudonym salt must be at least {MIN_SALT_LEN} bytes"
            )));
        }
        Ok(Self {
            salt: Zeroizing::new(salt.to_vec()),
        })
    }

    fn digest(&self, subject_id: &SubjectId) -> HavenResult<[u8; PSEUDONYM_BYTES]> {
        let mut mac = HmacSha256::new_from_slice(&self.salt)
            .map_err(|e| HavenError::Crypto(format!("HMAC init failed: {e}")))?;
        mac.update(subject_id.as_str().as_bytes());
        let full = mac.finalize().into_bytes();
        let mut out = [0u8; PSEUDONYM_BYTES];
        out.copy_from_slice(&full[..PSEUDONYM_BYTES]);
        Ok(out)
    }

    /// 32 upper-case hex characters.
    pub fn hash(&self, subject_id: &SubjectId) -> HavenResult<PseudonymId> {
        let digest = self.digest(subject_id)?;
        Ok(PseudonymId(hex::encode_upper(digest)))
    }

    /// Same digest grouped 8-4-4-4-12 for columns that expect an
    /// identifier-shaped value.
    pub fn hash_formatted(&self, subject_id: &SubjectId) -> HavenResult<PseudonymId> {
        let raw = self.hash(subject_id)?;
        let s = raw.as_str();
        Ok(PseudonymId(format!(
            "{}-{}-{}-{}-{}",
            &s[0..8],
            &s[8..12],
            &s[12..16],
            &s[16..20],
            &s[20..32]
        )))
    }

    /// Check a candidate pseudonym against a subject. Only the exact plain
    /// form or the exact 8-4-4-4-12 form is accepted.
    pub fn verify(&self, subject_id: &SubjectId, candidate: &PseudonymId) -> bool {
        let (plain, grouped) = match (self.hash(subject_id), self.hash_formatted(subject_id)) {
            (Ok(p), Ok(g)) => (p, g),
            _ => return false,
        };
        let candidate = candidate.as_str().as_bytes();
        let is_match = |expected: &PseudonymId| {
            let expected = expected.as_str().as_bytes();
            expected.len() == candidate.len() && bool::from(expected.ct_eq(candidate))
        };
        is_match(&plain) | is_match(&grouped)
    }
}

impl fmt::Debug for DeterministicHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeterministicHasher")
            .field("salt", &"<redacted>")
            .finish()
    }
}
