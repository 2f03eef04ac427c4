//! Haven Vault
//!
//! Cryptographic integrity and confidentiality for export packages, plus the
//! append-only audit trail every other component writes to.
//!
//! - `SecurePackager`: SHA-256 manifest, HMAC-SHA256 detached signature,
//!   optional AES-256-GCM bundle encryption, all-or-nothing verification
//! - Key material held in `Zeroizing` buffers and injected at runtime; the
//!   encryption key is HKDF-derived from the signing key or supplied
//!   separately
//! - `AuditTrail`: SHA-256 hash chain with global and per-resource sequence
//!   numbers and a fallback buffer for entries the store could not persist

pub mod audit;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod manifest;
pub mod packager;
pub mod store;

pub use audit::{verify_entries, AuditEntry, AuditStore, AuditTrail};
pub use error::{IntegrityError, VaultError, VaultResult};
pub use keys::{EncryptionKey, SigningKey, MIN_KEY_LEN};
pub use manifest::ExportManifest;
pub use packager::{sha256_hex, Artifact, PackagedExport, SecurePackager};
pub use store::{FileBlobStore, InMemoryAuditStore, InMemoryBlobStore, JsonlAuditStore};
