use std::sync::Mutex;

use haven_core::{AuditEventKind, AuditRecord, AuditSink, ConsentScope};
use tracing::{debug, warn};

use crate::scope::{has_capability, Capability, ResourceCategory, ScopeRequirement};
use crate::types::{AccessRequest, PolicyDecision};

// ---------------------------------------------------------------------------
// Rule identifiers recorded on every decision
// ---------------------------------------------------------------------------

pub const RULE_INVALID_ACTOR: &str = "INVALID_ACTOR";
pub const RULE_SEALED: &str = "SEALED_NOTE_RESTRICTION";
pub const RULE_AUTHORIZED_VIEWERS: &str = "CUSTOM_AUTHORIZED_VIEWERS";
pub const RULE_PRIVILEGED_COUNSELING: &str = "PRIVILEGED_COUNSELING_ACCESS";
pub const RULE_CUSTOM_NO_VIEWERS: &str = "SCOPE_CUSTOM_NO_VIEWERS";
pub const RULE_VAWA: &str = "VAWA_DV_CONSENT_REQUIRED";

/// In-memory audit sink for testing.
#[derive(Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

// ---------------------------------------------------------------------------
// ConfidentialityPolicyEngine
// ---------------------------------------------------------------------------

/// Stateless evaluator. Holds only a reference to the audit sink, so a
/// single engine can be shared across threads without locking.
///
/// Evaluation order:
/// 1. sealed resource, actor is not the sealer: deny
/// 2. non-empty authorized-viewer list: membership decides
/// 3. privileged counseling: counseling capability or author
/// 4. visibility scope table
/// 5. DV-flagged subject without sharing consent: only the subject or the
///    record owner, regardless of role
pub struct ConfidentialityPolicyEngine<'a> {
    audit_sink: &'a dyn AuditSink,
}

impl<'a> ConfidentialityPolicyEngine<'a> {
    pub fn new(audit_sink: &'a dyn AuditSink) -> Self {
        Self { audit_sink }
    }

    /// Evaluate one access request. Emits exactly one audit record.
    pub fn decide(&self, request: &AccessRequest) -> PolicyDecision {
        let decision = evaluate(request);
        self.emit(&decision);
        decision
    }

    fn emit(&self, decision: &PolicyDecision) {
        if decision.allowed() {
            debug!(
                actor = %decision.actor(),
                resource = %decision.resource().resource_id,
                rule = decision.rule_id(),
                "policy allow"
            );
        } else {
            warn!(
                actor = %decision.actor(),
                resource = %decision.resource().resource_id,
                rule = decision.rule_id(),
                "policy deny"
            );
        }
        self.audit_sink.record(AuditRecord {
            resource_id: decision.resource().resource_id.clone(),
            actor_id: Some(decision.actor().clone()),
            kind: AuditEventKind::PolicyDecision {
                decision_id: decision.decision_id().to_string(),
                allowed: decision.allowed(),
                rule_id: decision.rule_id().to_string(),
                reason: decision.reason().to_string(),
            },
            occurred_at: decision.decided_at(),
        });
    }
}

fn evaluate(request: &AccessRequest) -> PolicyDecision {
    let actor = &request.actor;
    let resource = &request.resource;
    let controls = &request.controls;

    if actor.as_str().trim().is_empty() {
        return PolicyDecision::new(request, false, RULE_INVALID_ACTOR, "Actor id is empty");
    }

    if controls.sealed && controls.sealed_by.as_ref() != Some(actor) {
        return PolicyDecision::new(
            request,
            false,
            RULE_SEALED,
            "Resource is sealed and only accessible to the sealer",
        );
    }

    if !controls.authorized_viewers.is_empty() {
        let listed = controls.authorized_viewers.contains(actor);
        let reason = if listed {
            "Actor is on the authorized viewer list"
        } else {
            "Actor is not on the authorized viewer list"
        };
        return PolicyDecision::new(request, listed, RULE_AUTHORIZED_VIEWERS, reason);
    }

    let (rule_id, reason) = match resource.category {
        ResourceCategory::PrivilegedCounseling => {
            let allowed = has_capability(&request.roles, Capability::PrivilegedCounseling)
                || resource.is_author(actor);
            if !allowed {
                return PolicyDecision::new(
                    request,
                    false,
                    RULE_PRIVILEGED_COUNSELING,
                    "Privileged counseling requires a counseling role or authorship",
                );
            }
            (
                RULE_PRIVILEGED_COUNSELING.to_string(),
                "Counseling privilege satisfied".to_string(),
            )
        }
        ResourceCategory::General => {
            let scope = resource.scope;
            let scope_rule = format!("SCOPE_{}", scope.as_str());
            let allowed = match scope.requirement() {
                ScopeRequirement::Anyone => true,
                ScopeRequirement::Capability(cap) => has_capability(&request.roles, cap),
                ScopeRequirement::Author => resource.is_author(actor),
                ScopeRequirement::CapabilityOrAuthor(cap) => {
                    has_capability(&request.roles, cap) || resource.is_author(actor)
                }
                ScopeRequirement::ExplicitList => {
                    return PolicyDecision::new(
                        request,
                        false,
                        RULE_CUSTOM_NO_VIEWERS,
                        "Custom scope requires an explicit authorized viewer list",
                    );
                }
            };
            if !allowed {
                return PolicyDecision::new(
                    request,
                    false,
                    scope_rule,
                    format!("Actor does not satisfy the {scope} scope"),
                );
            }
            (scope_rule, format!("Actor satisfies the {scope} scope"))
        }
    };

    let consent = &request.consent;
    if consent.dv_victim
        && !consent.grants(ConsentScope::DataSharing)
        && !resource.is_subject(actor)
        && !resource.is_owner(actor)
    {
        return PolicyDecision::new(
            request,
            false,
            RULE_VAWA,
            "DV-flagged subject has not consented to sharing",
        );
    }

    PolicyDecision::new(request, true, rule_id, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::VisibilityScope;
    use crate::types::{AccessControls, ResourceDescriptor};
    use haven_core::{ActorId, ConsentState, Role, SubjectId};

    fn make_consent() -> ConsentState {
        ConsentState::none(SubjectId::new("client-1"))
    }

    fn make_dv_consent(sharing: bool) -> ConsentState {
        let mut c = make_consent();
        c.dv_victim = true;
        c.active = true;
        if sharing {
            c.granted_scopes.insert(ConsentScope::DataSharing);
        }
        c
    }

    fn make_request(actor: &str, roles: &[Role], scope: VisibilityScope) -> AccessRequest {
        AccessRequest {
            actor: ActorId::new(actor),
            roles: roles.to_vec(),
            resource: ResourceDescriptor::new("note-1", scope)
                .with_author("author")
                .with_owner("owner")
                .with_subject("client-1"),
            consent: make_consent(),
            controls: AccessControls::default(),
        }
    }

    fn decide(request: &AccessRequest) -> PolicyDecision {
        let sink = InMemoryAuditSink::new();
        ConfidentialityPolicyEngine::new(&sink).decide(request)
    }

    #[test]
    fn test_public_allows_anyone() {
        let d = decide(&make_request("x", &[], VisibilityScope::Public));
        assert!(d.allowed());
        assert_eq!(d.rule_id(), "SCOPE_PUBLIC");
    }

    #[test]
    fn test_scope_table() {
        let cases = [
            (VisibilityScope::CaseTeam, Role::CaseManager, Role::Nurse),
            (VisibilityScope::ClinicalOnly, Role::Therapist, Role::CaseManager),
            (VisibilityScope::ClinicalOnly, Role::DvCounselor, Role::LicensedClinician),
            (VisibilityScope::LegalTeam, Role::LegalAdvocate, Role::Doctor),
            (VisibilityScope::SafetyTeam, Role::CrisisCounselor, Role::Attorney),
            (VisibilityScope::MedicalTeam, Role::Nurse, Role::Therapist),
            (VisibilityScope::AdminOnly, Role::Supervisor, Role::CaseManager),
        ];
        for (scope, ok, bad) in cases {
            assert!(decide(&make_request("x", &[ok], scope)).allowed(), "{scope}");
            assert!(!decide(&make_request("x", &[bad], scope)).allowed(), "{scope}");
        }
    }

    #[test]
    fn test_author_only() {
        let scope = VisibilityScope::AuthorOnly;
        assert!(decide(&make_request("author", &[], scope)).allowed());
        assert!(!decide(&make_request("x", &[Role::Administrator], scope)).allowed());
    }

    #[test]
    fn test_attorney_client() {
        let scope = VisibilityScope::AttorneyClient;
        assert!(decide(&make_request("x", &[Role::Attorney], scope)).allowed());
        assert!(decide(&make_request("author", &[], scope)).allowed());
        assert!(!decide(&make_request("x", &[Role::LegalAdvocate], scope)).allowed());
    }

    #[test]
    fn test_custom_without_viewers_denies() {
        let d = decide(&make_request("x", &[Role::Administrator], VisibilityScope::Custom));
        assert!(!d.allowed());
        assert_eq!(d.rule_id(), RULE_CUSTOM_NO_VIEWERS);
    }

    #[test]
    fn test_sealed_denies_everyone_but_sealer() {
        let mut req = make_request("x", &[Role::Administrator], VisibilityScope::Public);
        req.controls.sealed = true;
        req.controls.sealed_by = Some(ActorId::new("sealer"));
        let d = decide(&req);
        assert!(!d.allowed());
        assert_eq!(d.rule_id(), RULE_SEALED);

        req.actor = ActorId::new("sealer");
        assert!(decide(&req).allowed());
    }

    #[test]
    fn test_authorized_viewers_override_scope() {
        let mut req = make_request("viewer", &[], VisibilityScope::AdminOnly);
        req.controls.authorized_viewers = vec![ActorId::new("viewer")];
        let d = decide(&req);
        assert!(d.allowed());
        assert_eq!(d.rule_id(), RULE_AUTHORIZED_VIEWERS);

        req.actor = ActorId::new("admin");
        req.roles = vec![Role::Administrator];
        let d = decide(&req);
        assert!(!d.allowed());
        assert_eq!(d.rule_id(), RULE_AUTHORIZED_VIEWERS);
    }

    #[test]
    fn test_authorized_viewers_satisfy_custom() {
        let mut req = make_request("viewer", &[], VisibilityScope::Custom);
        req.controls.authorized_viewers = vec![ActorId::new("viewer")];
        assert!(decide(&req).allowed());
    }

    #[test]
    fn test_privileged_counseling() {
        let mut req = make_request("x", &[Role::DvCounselor], VisibilityScope::Public);
        req.resource.category = ResourceCategory::PrivilegedCounseling;
        assert!(decide(&req).allowed());

        req.roles = vec![Role::CaseManager];
        let d = decide(&req);
        assert!(!d.allowed());
        assert_eq!(d.rule_id(), RULE_PRIVILEGED_COUNSELING);

        req.actor = ActorId::new("author");
        assert!(decide(&req).allowed());
    }

    #[test]
    fn test_vawa_denies_without_sharing_consent() {
        let mut req = make_request("x", &[Role::Administrator], VisibilityScope::Public);
        req.consent = make_dv_consent(false);
        let d = decide(&req);
        assert!(!d.allowed());
        assert_eq!(d.rule_id(), RULE_VAWA);
    }

    #[test]
    fn test_vawa_not_satisfied_by_role() {
        let mut req = make_request(
            "x",
            &[Role::DvCounselor, Role::Administrator, Role::Supervisor],
            VisibilityScope::CaseTeam,
        );
        req.consent = make_dv_consent(false);
        assert!(!decide(&req).allowed());
    }

    #[test]
    fn test_vawa_allows_owner_subject_or_consent() {
        let mut req = make_request("owner", &[Role::CaseManager], VisibilityScope::CaseTeam);
        req.consent = make_dv_consent(false);
        assert!(decide(&req).allowed());

        let mut req = make_request("client-1", &[], VisibilityScope::Public);
        req.consent = make_dv_consent(false);
        assert!(decide(&req).allowed());

        let mut req = make_request("x", &[Role::CaseManager], VisibilityScope::CaseTeam);
        req.consent = make_dv_consent(true);
        assert!(decide(&req).allowed());
    }

    #[test]
    fn test_vawa_expired_consent_denies() {
        let mut req = make_request("x", &[Role::CaseManager], VisibilityScope::CaseTeam);
        req.consent = make_dv_consent(true);
        req.consent.active = false;
        assert!(!decide(&req).allowed());
    }

    #[test]
    fn test_empty_actor_denied() {
        let d = decide(&make_request("", &[], VisibilityScope::Public));
        assert!(!d.allowed());
        assert_eq!(d.rule_id(), RULE_INVALID_ACTOR);
    }

    #[test]
    fn test_every_decision_audited_once() {
        let sink = InMemoryAuditSink::new();
        let engine = ConfidentialityPolicyEngine::new(&sink);
        let allow = engine.decide(&make_request("x", &[], VisibilityScope::Public));
        let deny = engine.decide(&make_request("x", &[], VisibilityScope::Custom));
        let records = sink.records();
        assert_eq!(records.len(), 2);
        match (&records[0].kind, &records[1].kind) {
            (
                AuditEventKind::PolicyDecision {
                    decision_id: a,
                    allowed: true,
                    ..
                },
                AuditEventKind::PolicyDecision {
                    decision_id: b,
                    allowed: false,
                    ..
                },
            ) => {
                assert_eq!(a, allow.decision_id());
                assert_eq!(b, deny.decision_id());
            }
            other => panic!("unexpected audit kinds: {other:?}"),
        }
    }

    #[test]
    fn test_decision_captures_context() {
        let mut req = make_request("x", &[Role::Nurse], VisibilityScope::MedicalTeam);
        req.consent = make_dv_consent(true);
        let d = decide(&req);
        assert_eq!(d.context().roles, vec![Role::Nurse]);
        assert!(d.context().dv_victim);
        assert!(d.context().sharing_consent);
        assert_eq!(d.resource().resource_id.as_str(), "note-1");
    }

    #[test]
    fn test_engine_shared_across_threads() {
        let sink = InMemoryAuditSink::new();
        let engine = ConfidentialityPolicyEngine::new(&sink);
        std::thread::scope(|s| {
            for i in 0..4 {
                let engine = &engine;
                s.spawn(move || {
                    let req = make_request(&format!("a{i}"), &[], VisibilityScope::Public);
                    assert!(engine.decide(&req).allowed());
                });
            }
        });
        assert_eq!(sink.records().len(), 4);
    }
}
