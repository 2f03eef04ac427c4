//! Haven Policy Engine
//!
//! Record-level confidentiality decisions for the export pipeline. Every
//! evaluation is ordered and short-circuiting:
//!
//! - Sealed resources are visible only to the sealer
//! - An explicit authorized-viewer list overrides every later rule
//! - Privileged counseling notes require a counseling capability or authorship
//! - Visibility scopes map to capabilities through a closed, total table
//! - DV-flagged subjects without sharing consent are visible only to the
//!   subject or the record owner
//!
//! Each call produces one immutable `PolicyDecision` and one audit record.

pub mod engine;
pub mod error;
pub mod scope;
pub mod types;

pub use engine::{ConfidentialityPolicyEngine, InMemoryAuditSink};
pub use error::{PolicyError, PolicyResult};
pub use scope::{capabilities_of, has_capability, Capability, ResourceCategory, ScopeRequirement, VisibilityScope};
pub use types::{AccessControls, AccessRequest, DecisionContext, PolicyDecision, ResourceDescriptor};
