use std::collections::{BTreeMap, BTreeSet};

use haven_core::{
    ActorId, AuditSink, ConsentProvider, ConsentScope, ConsentState, DeterministicHasher,
    IdentityProvider, SubjectId,
};
use haven_policy::{AccessRequest, ConfidentialityPolicyEngine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ExportResult;
use crate::formatter::NormalizedTable;
use crate::record::SourceRecord;
use crate::suppression::SuppressionAggregator;

pub const PERSONAL_ID_COLUMN: &str = "PersonalID";

/// How subject identifiers are written to export files. DV-flagged subjects
/// are hashed under every mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashMode {
    #[default]
    AlwaysHash,
    /// Raw identifiers only for subjects who granted `HmisExport`.
    ConsentBased,
    NeverHash,
}

/// Policy-filtered, pseudonymized rows for one job.
#[derive(Debug, Clone, Default)]
pub struct Materialized {
    /// Section name to table.
    pub tables: BTreeMap<String, NormalizedTable>,
    /// Rendered fields of every included record, for aggregation.
    pub included: Vec<BTreeMap<String, String>>,
    pub records_processed: u64,
    pub records_suppressed: u64,
}

impl Materialized {
    pub fn has_section(&self, section: &str) -> bool {
        self.tables.contains_key(section)
    }
}

pub struct Materializer<'a> {
    pub audit: &'a dyn AuditSink,
    pub identity: &'a dyn IdentityProvider,
    pub consent: &'a dyn ConsentProvider,
    pub hasher: &'a DeterministicHasher,
    pub hash_mode: HashMode,
}

impl<'a> Materializer<'a> {
    /// Run every record through the policy engine on behalf of `requester`.
    /// Denied records are counted as suppressed and dropped.
    pub fn materialize(
        &self,
        requester: &ActorId,
        records: Vec<SourceRecord>,
    ) -> ExportResult<Materialized> {
        let engine = ConfidentialityPolicyEngine::new(self.audit);
        let roles = self.identity.roles_of(requester)?;

        let mut sections: BTreeMap<String, Vec<BTreeMap<String, String>>> = BTreeMap::new();
        let mut out = Materialized::default();

        for record in records {
            out.records_processed += 1;
            let consent = self.consent.consent_of(&record.subject_id)?;

            let mut resource = record.resource;
            if resource.subject.is_none() {
                resource.subject = Some(record.subject_id.clone());
            }
            let request = AccessRequest {
                actor: requester.clone(),
                roles: roles.clone(),
                resource,
                consent,
                controls: record.controls,
            };
            let decision = engine.decide(&request);
            if !decision.allowed() {
                out.records_suppressed += 1;
                continue;
            }

            let fields: BTreeMap<String, String> = record
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.render()))
                .collect();
            let mut row = fields.clone();
            row.insert(
                PERSONAL_ID_COLUMN.to_string(),
                self.personal_id(&record.subject_id, &request.consent)?,
            );
            out.included.push(fields);
            sections.entry(record.section).or_default().push(row);
        }

        for (section, rows) in sections {
            debug!(section = %section, rows = rows.len(), "materialized section");
            out.tables.insert(section, build_table(rows)?);
        }

        info!(
            requester = %requester,
            processed = out.records_processed,
            suppressed = out.records_suppressed,
            "materialization finished"
        );
        Ok(out)
    }

    fn personal_id(&self, subject: &SubjectId, consent: &ConsentState) -> ExportResult<String> {
        let hash = consent.dv_victim
            || match self.hash_mode {
                HashMode::AlwaysHash => true,
                HashMode::ConsentBased => !consent.grants(ConsentScope::HmisExport),
                HashMode::NeverHash => false,
            };
        if hash {
            Ok(self.hasher.hash_formatted(subject)?.0)
        } else {
            Ok(subject.as_str().to_string())
        }
    }
}

/// `PersonalID` first, then the union of field names in sorted order.
fn build_table(rows: Vec<BTreeMap<String, String>>) -> ExportResult<NormalizedTable> {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for row in &rows {
        names.extend(row.keys().filter(|k| *k != PERSONAL_ID_COLUMN).cloned());
    }
    let mut columns = vec![PERSONAL_ID_COLUMN.to_string()];
    columns.extend(names);

    let mut table = NormalizedTable::new(columns);
    for mut row in rows {
        let values = table
            .columns
            .iter()
            .map(|c| row.remove(c).unwrap_or_default())
            .collect();
        table.push_row(values)?;
    }
    Ok(table)
}

/// Count included records by value for each field and mask small cells.
pub fn aggregate(
    aggregator: &SuppressionAggregator,
    included: &[BTreeMap<String, String>],
    fields: &[String],
) -> ExportResult<NormalizedTable> {
    let mut table = NormalizedTable::new(vec![
        "Field".to_string(),
        "Value".to_string(),
        "Count".to_string(),
    ]);
    for field in fields {
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for row in included {
            if let Some(value) = row.get(field) {
                *counts.entry(value.as_str()).or_insert(0) += 1;
            }
        }
        for (value, count) in counts {
            table.push_row(vec![
                field.clone(),
                value.to_string(),
                aggregator.suppress_display(count),
            ])?;
        }
    }
    Ok(table)
}
