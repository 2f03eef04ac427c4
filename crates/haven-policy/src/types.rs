use haven_core::{ActorId, ConsentScope, ConsentState, ResourceId, Role, SubjectId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::scope::{ResourceCategory, VisibilityScope};

// ---------------------------------------------------------------------------
// ResourceDescriptor: what is being accessed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub category: ResourceCategory,
    pub scope: VisibilityScope,
    /// Staff member who wrote the resource.
    pub author: Option<ActorId>,
    /// Staff member responsible for the record.
    pub owner: Option<ActorId>,
    /// Data subject the resource is about.
    pub subject: Option<SubjectId>,
}

impl ResourceDescriptor {
    pub fn new(resource_id: impl Into<ResourceId>, scope: VisibilityScope) -> Self {
        Self {
            resource_id: resource_id.into(),
            category: ResourceCategory::General,
            scope,
            author: None,
            owner: None,
            subject: None,
        }
    }

    pub fn with_category(mut self, category: ResourceCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_author(mut self, author: impl Into<ActorId>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<ActorId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<SubjectId>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn is_author(&self, actor: &ActorId) -> bool {
        self.author.as_ref() == Some(actor)
    }

    pub fn is_owner(&self, actor: &ActorId) -> bool {
        self.owner.as_ref() == Some(actor)
    }

    pub fn is_subject(&self, actor: &ActorId) -> bool {
        self.subject
            .as_ref()
            .map_or(false, |s| s.as_str() == actor.as_str())
    }
}

/// Per-resource access controls that sit outside the scope table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControls {
    #[serde(default)]
    pub authorized_viewers: Vec<ActorId>,
    #[serde(default)]
    pub sealed: bool,
    #[serde(default)]
    pub sealed_by: Option<ActorId>,
}

// ---------------------------------------------------------------------------
// AccessRequest: full input to a single evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub actor: ActorId,
    pub roles: Vec<Role>,
    pub resource: ResourceDescriptor,
    pub consent: ConsentState,
    pub controls: AccessControls,
}

// ---------------------------------------------------------------------------
// PolicyDecision: immutable outcome of one evaluation
// ---------------------------------------------------------------------------

/// Snapshot of the inputs that produced a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub roles: Vec<Role>,
    pub sealed: bool,
    pub sealed_by: Option<ActorId>,
    pub authorized_viewers: Vec<ActorId>,
    pub dv_victim: bool,
    pub sharing_consent: bool,
    pub consent_active: bool,
}

impl DecisionContext {
    pub(crate) fn from_request(request: &AccessRequest) -> Self {
        Self {
            roles: request.roles.clone(),
            sealed: request.controls.sealed,
            sealed_by: request.controls.sealed_by.clone(),
            authorized_viewers: request.controls.authorized_viewers.clone(),
            dv_victim: request.consent.dv_victim,
            sharing_consent: request.consent.grants(ConsentScope::DataSharing),
            consent_active: request.consent.active,
        }
    }
}

/// Fields are private so a decision cannot be edited after it was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    decision_id: String,
    allowed: bool,
    reason: String,
    rule_id: String,
    actor: ActorId,
    resource: ResourceDescriptor,
    context: DecisionContext,
    decided_at: Timestamp,
}

impl PolicyDecision {
    pub(crate) fn new(
        request: &AccessRequest,
        allowed: bool,
        rule_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            allowed,
            reason: reason.into(),
            rule_id: rule_id.into(),
            actor: request.actor.clone(),
            resource: request.resource.clone(),
            context: DecisionContext::from_request(request),
            decided_at: Timestamp::now(),
        }
    }

    pub fn decision_id(&self) -> &str {
        &self.decision_id
    }

    pub fn allowed(&self) -> bool {
        self.allowed
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn rule_id(&self) -> &str {
        &self.rule_id
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn resource(&self) -> &ResourceDescriptor {
        &self.resource
    }

    pub fn context(&self) -> &DecisionContext {
        &self.context
    }

    pub fn decided_at(&self) -> Timestamp {
        self.decided_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_relations() {
        let r = ResourceDescriptor::new("note-1", VisibilityScope::CaseTeam)
            .with_author("alice")
            .with_owner("bob")
            .with_subject("client-9");
        assert!(r.is_author(&ActorId::new("alice")));
        assert!(!r.is_author(&ActorId::new("bob")));
        assert!(r.is_owner(&ActorId::new("bob")));
        assert!(r.is_subject(&ActorId::new("client-9")));
    }

    #[test]
    fn test_descriptor_deserialize_defaults() {
        let json = r#"{"resource_id":"n-1","scope":"PUBLIC","author":null,"owner":null,"subject":null}"#;
        let r: ResourceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(r.category, ResourceCategory::General);
        assert_eq!(r.scope, VisibilityScope::Public);
    }
}
