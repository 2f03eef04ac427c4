use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use haven_core::{
    ActorId, ConsentProvider, ConsentState, HavenResult, IdentityProvider, Role, SubjectId,
};
use haven_policy::{AccessControls, ResourceDescriptor};
use serde::{Deserialize, Serialize};

use crate::job::{ExportFilters, ExportJob, ExportType, ReportingPeriod};
use crate::responses::{
    DisabilityResponse, DomesticViolenceResponse, FivePointResponse, IncomeResponse,
};

// ---------------------------------------------------------------------------
// FieldValue: typed source values
// ---------------------------------------------------------------------------

/// Each HUD response scale has its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Date(NaiveDate),
    Flag(bool),
    Response(FivePointResponse),
    Income(IncomeResponse),
    Disability(DisabilityResponse),
    DomesticViolence(DomesticViolenceResponse),
    Missing,
}

impl FieldValue {
    /// Text as written into export files. Response scales use their HUD
    /// codes.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            FieldValue::Flag(b) => (if *b { "1" } else { "0" }).to_string(),
            FieldValue::Response(r) => r.code().to_string(),
            FieldValue::Income(r) => r.code().to_string(),
            FieldValue::Disability(r) => r.code().to_string(),
            FieldValue::DomesticViolence(r) => r.code().to_string(),
            FieldValue::Missing => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SourceRecord and RecordSource
// ---------------------------------------------------------------------------

/// One row from the case-management system, with everything the policy
/// engine needs to decide whether it may leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Target file, e.g. `Client` or `Enrollment`.
    pub section: String,
    pub subject_id: SubjectId,
    pub resource: ResourceDescriptor,
    #[serde(default)]
    pub controls: AccessControls,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub coc_code: Option<String>,
    #[serde(default)]
    pub effective_date: Option<NaiveDate>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// What a job asks its record source for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub export_type: ExportType,
    pub period: ReportingPeriod,
    pub filters: ExportFilters,
}

impl SourceQuery {
    pub fn for_job(job: &ExportJob) -> Self {
        Self {
            export_type: job.export_type(),
            period: *job.period(),
            filters: job.filters().clone(),
        }
    }

    pub fn matches(&self, record: &SourceRecord) -> bool {
        if let Some(date) = record.effective_date {
            if !self.period.contains(date) {
                return false;
            }
        }
        if !self.filters.project_ids.is_empty() {
            match &record.project_id {
                Some(p) if self.filters.project_ids.contains(p) => {}
                _ => return false,
            }
        }
        if let Some(coc) = &self.filters.coc_code {
            if record.coc_code.as_deref() != Some(coc.as_str()) {
                return false;
            }
        }
        true
    }
}

pub trait RecordSource: Send + Sync {
    fn fetch(&self, query: &SourceQuery) -> HavenResult<Vec<SourceRecord>>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryRecordSource {
    records: Vec<SourceRecord>,
}

impl InMemoryRecordSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self { records }
    }
}

impl RecordSource for InMemoryRecordSource {
    fn fetch(&self, query: &SourceQuery) -> HavenResult<Vec<SourceRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// InMemoryDirectory: roles and consent for tests and fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryDirectory {
    roles: HashMap<ActorId, Vec<Role>>,
    consents: HashMap<SubjectId, ConsentState>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_roles(mut self, actor: impl Into<ActorId>, roles: Vec<Role>) -> Self {
        self.roles.insert(actor.into(), roles);
        self
    }

    pub fn with_consent(mut self, consent: ConsentState) -> Self {
        self.consents.insert(consent.subject_id.clone(), consent);
        self
    }
}

impl IdentityProvider for InMemoryDirectory {
    fn roles_of(&self, actor: &ActorId) -> HavenResult<Vec<Role>> {
        Ok(self.roles.get(actor).cloned().unwrap_or_default())
    }
}

impl ConsentProvider for InMemoryDirectory {
    fn consent_of(&self, subject: &SubjectId) -> HavenResult<ConsentState> {
        Ok(self
            .consents
            .get(subject)
            .cloned()
            .unwrap_or_else(|| ConsentState::none(subject.clone())))
    }
}
