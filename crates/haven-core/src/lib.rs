//! Haven Core
//!
//! Shared vocabulary for the export pipeline: typed identifiers, the
//! canonical `Timestamp`, export job states, consent ledger types, audit
//! records, the collaborator traits the pipeline consumes, and the
//! deterministic pseudonymization hasher.

pub mod crypto;
pub mod error;
pub mod traits;
pub mod types;

pub use crypto::*;
pub use error::*;
pub use traits::*;
pub use types::*;
