use haven_core::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PolicyError;

// ---------------------------------------------------------------------------
// Capability: what a role lets an actor see
// ---------------------------------------------------------------------------

/// Closed set of capabilities derived from roles. Scopes require
/// capabilities, never role names, so adding a role only touches
/// `capabilities_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    CaseTeam,
    Clinical,
    PrivilegedCounseling,
    Legal,
    AttorneyPrivilege,
    Safety,
    Medical,
    Admin,
}

/// Total mapping from role to the capabilities it confers.
pub fn capabilities_of(role: Role) -> &'static [Capability] {
    use Capability::*;
    match role {
        Role::CaseManager => &[CaseTeam],
        Role::Supervisor => &[CaseTeam, Admin],
        Role::Clinician | Role::Therapist | Role::Counselor => &[Clinical],
        Role::DvCounselor => &[Clinical, PrivilegedCounseling],
        Role::LicensedClinician => &[PrivilegedCounseling],
        Role::CrisisCounselor | Role::SafetySpecialist => &[Safety],
        Role::LegalAdvocate => &[Legal],
        Role::Attorney => &[Legal, AttorneyPrivilege],
        Role::Nurse | Role::Doctor | Role::MedicalAdvocate => &[Medical],
        Role::Administrator => &[Admin],
    }
}

pub fn has_capability(roles: &[Role], capability: Capability) -> bool {
    roles
        .iter()
        .any(|r| capabilities_of(*r).contains(&capability))
}

// ---------------------------------------------------------------------------
// VisibilityScope: named audience of a resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VisibilityScope {
    Public,
    CaseTeam,
    ClinicalOnly,
    LegalTeam,
    SafetyTeam,
    MedicalTeam,
    AdminOnly,
    AuthorOnly,
    AttorneyClient,
    Custom,
}

/// What an actor must have to pass a scope check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeRequirement {
    Anyone,
    Capability(Capability),
    Author,
    CapabilityOrAuthor(Capability),
    /// Only an explicit authorized-viewer list can grant access.
    ExplicitList,
}

impl VisibilityScope {
    pub fn requirement(self) -> ScopeRequirement {
        match self {
            VisibilityScope::Public => ScopeRequirement::Anyone,
            VisibilityScope::CaseTeam => ScopeRequirement::Capability(Capability::CaseTeam),
            VisibilityScope::ClinicalOnly => ScopeRequirement::Capability(Capability::Clinical),
            VisibilityScope::LegalTeam => ScopeRequirement::Capability(Capability::Legal),
            VisibilityScope::SafetyTeam => ScopeRequirement::Capability(Capability::Safety),
            VisibilityScope::MedicalTeam => ScopeRequirement::Capability(Capability::Medical),
            VisibilityScope::AdminOnly => ScopeRequirement::Capability(Capability::Admin),
            VisibilityScope::AuthorOnly => ScopeRequirement::Author,
            VisibilityScope::AttorneyClient => {
                ScopeRequirement::CapabilityOrAuthor(Capability::AttorneyPrivilege)
            }
            VisibilityScope::Custom => ScopeRequirement::ExplicitList,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VisibilityScope::Public => "PUBLIC",
            VisibilityScope::CaseTeam => "CASE_TEAM",
            VisibilityScope::ClinicalOnly => "CLINICAL_ONLY",
            VisibilityScope::LegalTeam => "LEGAL_TEAM",
            VisibilityScope::SafetyTeam => "SAFETY_TEAM",
            VisibilityScope::MedicalTeam => "MEDICAL_TEAM",
            VisibilityScope::AdminOnly => "ADMIN_ONLY",
            VisibilityScope::AuthorOnly => "AUTHOR_ONLY",
            VisibilityScope::AttorneyClient => "ATTORNEY_CLIENT",
            VisibilityScope::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for VisibilityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisibilityScope {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let all = [
            VisibilityScope::Public,
            VisibilityScope::CaseTeam,
            VisibilityScope::ClinicalOnly,
            VisibilityScope::LegalTeam,
            VisibilityScope::SafetyTeam,
            VisibilityScope::MedicalTeam,
            VisibilityScope::AdminOnly,
            VisibilityScope::AuthorOnly,
            VisibilityScope::AttorneyClient,
            VisibilityScope::Custom,
        ];
        let wanted = s.trim().to_ascii_uppercase();
        all.into_iter()
            .find(|scope| scope.as_str() == wanted)
            .ok_or_else(|| PolicyError::UnknownScope(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ResourceCategory: categories with their own rule ahead of the scope table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceCategory {
    General,
    /// Counseling notes protected by counselor privilege.
    PrivilegedCounseling,
}

impl Default for ResourceCategory {
    fn default() -> Self {
        ResourceCategory::General
    }
}

impl FromStr for ResourceCategory {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GENERAL" => Ok(ResourceCategory::General),
            "PRIVILEGED_COUNSELING" => Ok(ResourceCategory::PrivilegedCounseling),
            _ => Err(PolicyError::UnknownCategory(s.to_string())),
        }
    }
}
