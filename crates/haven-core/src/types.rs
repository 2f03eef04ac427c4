use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Timestamp: canonical time representation (seconds + nanoseconds)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds_since_epoch: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        chrono::Utc::now().into()
    }

    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds_since_epoch: seconds,
            nanoseconds: 0,
        }
    }

    pub fn to_rfc3339(&self) -> String {
        let dt =
            chrono::DateTime::from_timestamp(self.seconds_since_epoch as i64, self.nanoseconds);
        dt.map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "invalid".to_string())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn from(dt: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            seconds_since_epoch: dt.timestamp().max(0) as u64,
            nanoseconds: dt.timestamp_subsec_nanos(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

/// Inclusive time window used to query the audit trail. Open ends match
/// everything on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<Timestamp>,
    pub until: Option<Timestamp>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: Timestamp, until: Timestamp) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    pub fn contains(&self, ts: &Timestamp) -> bool {
        self.from.map_or(true, |f| *ts >= f) && self.until.map_or(true, |u| *ts <= u)
    }
}

// ---------------------------------------------------------------------------
// Typed identifiers: prevent stringly-typed confusion
// ---------------------------------------------------------------------------

macro_rules! define_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

define_id!(ActorId, "Identifier of a staff user or service account.");
define_id!(SubjectId, "Identifier of a data subject (client) in the source system.");
define_id!(ResourceId, "Identifier of a protected resource (note, record, export job).");
define_id!(PseudonymId, "One-way pseudonym derived from a SubjectId.");
define_id!(BlobLocator, "Opaque locator returned by blob storage.");

/// Identity of an export job. Generated once at queue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExportJobId(pub uuid::Uuid);

impl ExportJobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }

    /// The audit trail indexes jobs under this resource id.
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.0.to_string())
    }
}

impl fmt::Display for ExportJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ExportJobState: lifecycle of an export job
// ---------------------------------------------------------------------------

/// QUEUED → MATERIALIZING → VALIDATING → COMPLETE, with FAILED reachable from
/// every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportJobState {
    Queued,
    Materializing,
    Validating,
    Complete,
    Failed,
}

impl ExportJobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExportJobState::Complete | ExportJobState::Failed)
    }

    pub fn can_transition_to(self, target: ExportJobState) -> bool {
        use ExportJobState::*;
        match (self, target) {
            (Queued, Materializing) => true,
            (Materializing, Validating) => true,
            (Validating, Complete) => true,
            (Queued | Materializing | Validating, Failed) => true,
            _ => false,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(ExportJobState::Queued),
            "MATERIALIZING" => Some(ExportJobState::Materializing),
            "VALIDATING" => Some(ExportJobState::Validating),
            "COMPLETE" => Some(ExportJobState::Complete),
            "FAILED" => Some(ExportJobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExportJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportJobState::Queued => write!(f, "QUEUED"),
            ExportJobState::Materializing => write!(f, "MATERIALIZING"),
            ExportJobState::Validating => write!(f, "VALIDATING"),
            ExportJobState::Complete => write!(f, "COMPLETE"),
            ExportJobState::Failed => write!(f, "FAILED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Role: closed set of staff roles supplied by the identity provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    CaseManager,
    Supervisor,
    Clinician,
    LicensedClinician,
    Therapist,
    Counselor,
    DvCounselor,
    CrisisCounselor,
    LegalAdvocate,
    Attorney,
    SafetySpecialist,
    Nurse,
    Doctor,
    MedicalAdvocate,
    Administrator,
}

// ---------------------------------------------------------------------------
// Consent ledger types (read-only for this core)
// ---------------------------------------------------------------------------

/// Closed set of scopes a subject can grant in the consent ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsentScope {
    /// General information sharing with partner agencies.
    DataSharing,
    /// Inclusion of identifiable data in HMIS exports.
    HmisExport,
    DvView,
    LegalView,
    MedicalView,
    ResearchView,
    CourtTestimony,
}

/// A subject's consent as reported by the consent ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentState {
    pub subject_id: SubjectId,
    #[serde(default)]
    pub granted_scopes: BTreeSet<ConsentScope>,
    /// False once the consent has expired or been revoked.
    pub active: bool,
    #[serde(default)]
    pub dv_victim: bool,
}

impl ConsentState {
    /// No consent on record.
    pub fn none(subject_id: SubjectId) -> Self {
        Self {
            subject_id,
            granted_scopes: BTreeSet::new(),
            active: false,
            dv_victim: false,
        }
    }

    /// Whether `scope` is granted and the consent is still in force.
    pub fn grants(&self, scope: ConsentScope) -> bool {
        self.active && self.granted_scopes.contains(&scope)
    }
}

// ---------------------------------------------------------------------------
// Audit records
// ---------------------------------------------------------------------------

/// What happened. Written by the policy engine, the job state machine and
/// the service façade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventKind {
    PolicyDecision {
        decision_id: String,
        allowed: bool,
        rule_id: String,
        reason: String,
    },
    JobStateChanged {
        from: Option<ExportJobState>,
        to: ExportJobState,
        detail: String,
    },
    ExportDownloaded {
        content_hash: String,
    },
    PackageVerified {
        valid: bool,
    },
    AccessDenied {
        operation: String,
    },
}

impl AuditEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            AuditEventKind::PolicyDecision { allowed: true, .. } => "POLICY_ALLOW",
            AuditEventKind::PolicyDecision { allowed: false, .. } => "POLICY_DENY",
            AuditEventKind::JobStateChanged { .. } => "JOB_STATE_CHANGED",
            AuditEventKind::ExportDownloaded { .. } => "EXPORT_DOWNLOADED",
            AuditEventKind::PackageVerified { .. } => "PACKAGE_VERIFIED",
            AuditEventKind::AccessDenied { .. } => "ACCESS_DENIED",
        }
    }
}

/// A single fact handed to an `AuditSink`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub resource_id: ResourceId,
    pub actor_id: Option<ActorId>,
    pub kind: AuditEventKind,
    pub occurred_at: Timestamp,
}

impl AuditRecord {
    pub fn new(resource_id: ResourceId, actor_id: Option<ActorId>, kind: AuditEventKind) -> Self {
        Self {
            resource_id,
            actor_id,
            kind,
            occurred_at: Timestamp::now(),
        }
    }
}
