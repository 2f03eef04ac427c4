use crate::error::HavenResult;
use crate::types::{ActorId, AuditRecord, BlobLocator, ConsentState, Role, SubjectId};

// ---------------------------------------------------------------------------
// AuditSink: where every decision and state transition is reported
//
// Recording is infallible from the caller's point of view. Implementations
// route persistence failures to their own fallback channel.
// ---------------------------------------------------------------------------

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

// ---------------------------------------------------------------------------
// BlobStore: opaque storage for packaged bundles
// ---------------------------------------------------------------------------

pub trait BlobStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> HavenResult<BlobLocator>;
    fn get(&self, locator: &BlobLocator) -> HavenResult<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Identity and consent providers: read-only views of external systems
// ---------------------------------------------------------------------------

pub trait IdentityProvider: Send + Sync {
    fn roles_of(&self, actor: &ActorId) -> HavenResult<Vec<Role>>;
}

pub trait ConsentProvider: Send + Sync {
    /// Subjects with no ledger entry yield `ConsentState::none`.
    fn consent_of(&self, subject: &SubjectId) -> HavenResult<ConsentState>;
}
