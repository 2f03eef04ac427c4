use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use haven_core::{ActorId, BlobLocator, ExportJobId, ExportJobState, Timestamp};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ExportError, ExportResult};
use crate::event::ExportJobEvent;

// ---------------------------------------------------------------------------
// Queue parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportType {
    /// HMIS CSV data exchange.
    HmisCsv,
    /// CoC Annual Performance Report.
    CocApr,
    /// ESG Consolidated Annual Performance and Evaluation Report.
    EsgCaper,
    /// System Performance Measures.
    Spm,
    /// Point-in-Time / Housing Inventory Count.
    PitHic,
}

impl ExportType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportType::HmisCsv => "HMIS_CSV",
            ExportType::CocApr => "COC_APR",
            ExportType::EsgCaper => "ESG_CAPER",
            ExportType::Spm => "SPM",
            ExportType::PitHic => "PIT_HIC",
        }
    }
}

impl fmt::Display for ExportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportType {
    type Err = ExportError;

    /// Accepts `HMIS_CSV` and `hmis-csv` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        [
            ExportType::HmisCsv,
            ExportType::CocApr,
            ExportType::EsgCaper,
            ExportType::Spm,
            ExportType::PitHic,
        ]
        .into_iter()
        .find(|t| t.as_str() == normalized)
        .ok_or_else(|| ExportError::Validation(vec![format!("Unknown export type: {s}")]))
    }
}

/// Inclusive reporting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ReportingPeriod {
    pub fn new(start: NaiveDate, end: NaiveDate) -> ExportResult<Self> {
        if start > end {
            return Err(ExportError::Validation(vec![
                "Reporting period start must not be after end".to_string(),
            ]));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportFilters {
    #[serde(default)]
    pub project_ids: Vec<String>,
    #[serde(default)]
    pub coc_code: Option<String>,
    /// Fields to count for the aggregate artifact.
    #[serde(default)]
    pub aggregate_by: Vec<String>,
}

// ---------------------------------------------------------------------------
// Terminal metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub storage_locator: BlobLocator,
    pub manifest_locator: BlobLocator,
    pub content_hash: String,
    pub total_records: u64,
    pub suppressed_records: u64,
    pub artifacts: Vec<String>,
}

impl CompletionRecord {
    /// Every field is required; an empty locator, hash or artifact list is
    /// rejected.
    pub fn new(
        storage_locator: BlobLocator,
        manifest_locator: BlobLocator,
        content_hash: impl Into<String>,
        total_records: u64,
        suppressed_records: u64,
        artifacts: Vec<String>,
    ) -> ExportResult<Self> {
        let content_hash = content_hash.into();
        if storage_locator.as_str().is_empty() || manifest_locator.as_str().is_empty() {
            return Err(ExportError::InvalidCompletion(
                "storage locator is required".to_string(),
            ));
        }
        if content_hash.is_empty() {
            return Err(ExportError::InvalidCompletion(
                "content hash is required".to_string(),
            ));
        }
        if artifacts.is_empty() {
            return Err(ExportError::InvalidCompletion(
                "at least one artifact is required".to_string(),
            ));
        }
        if suppressed_records > total_records {
            return Err(ExportError::InvalidCompletion(
                "suppressed records exceed total records".to_string(),
            ));
        }
        Ok(Self {
            storage_locator,
            manifest_locator,
            content_hash,
            total_records,
            suppressed_records,
            artifacts,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub code: ErrorCode,
    pub message: String,
    pub validation_errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// ExportJob aggregate
// ---------------------------------------------------------------------------

/// Event-sourced export job.
///
/// Only reachable through `queue`, `reconstruct` and the command methods,
/// each of which produces one event and folds it with `apply`. Live
/// application and replay therefore share one code path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportJob {
    id: ExportJobId,
    export_type: ExportType,
    period: ReportingPeriod,
    filters: ExportFilters,
    requested_by: ActorId,
    reason: String,
    state: ExportJobState,
    records_processed: u64,
    records_suppressed: u64,
    artifacts: Vec<String>,
    completion: Option<CompletionRecord>,
    failure: Option<FailureRecord>,
    queued_at: Timestamp,
    updated_at: Timestamp,
    version: u64,
}

impl ExportJob {
    /// Validate queue input and produce the new job with its first event.
    /// On error no event exists.
    pub fn queue(
        export_type: ExportType,
        period: ReportingPeriod,
        filters: ExportFilters,
        requested_by: ActorId,
        reason: &str,
    ) -> ExportResult<(Self, ExportJobEvent)> {
        let mut errors = Vec::new();
        if requested_by.as_str().trim().is_empty() {
            errors.push("Requester is required".to_string());
        }
        let reason = reason.trim();
        if reason.is_empty() {
            errors.push("Export reason is required".to_string());
        }
        if period.start > period.end {
            errors.push("Reporting period start must not be after end".to_string());
        }
        if let Some(coc) = &filters.coc_code {
            if coc.trim().is_empty() {
                errors.push("CoC code must not be blank".to_string());
            }
        }
        if filters.project_ids.iter().any(|p| p.trim().is_empty()) {
            errors.push("Project ids must not be blank".to_string());
        }
        if filters.aggregate_by.iter().any(|f| f.trim().is_empty()) {
            errors.push("Aggregate field names must not be blank".to_string());
        }
        if !errors.is_empty() {
            return Err(ExportError::Validation(errors));
        }

        let event = ExportJobEvent::Queued {
            job_id: ExportJobId::generate(),
            export_type,
            period,
            filters,
            requested_by,
            reason: reason.to_string(),
            occurred_at: Timestamp::now(),
        };
        let job = apply(None, &event)?;
        Ok((job, event))
    }

    /// Fold an ordered event log from empty state.
    pub fn reconstruct(id: ExportJobId, events: &[ExportJobEvent]) -> ExportResult<Self> {
        let mut iter = events.iter();
        let first = iter
            .next()
            .ok_or_else(|| ExportError::InvalidEventLog("event log is empty".to_string()))?;
        if first.job_id() != id {
            return Err(ExportError::InvalidEventLog(format!(
                "event for job {} in log of job {}",
                first.job_id(),
                id
            )));
        }
        let mut job = apply(None, first)?;
        for event in iter {
            job = apply(Some(&job), event)?;
        }
        Ok(job)
    }

    fn execute(&mut self, event: ExportJobEvent) -> ExportResult<ExportJobEvent> {
        let next = apply(Some(self), &event)?;
        *self = next;
        Ok(event)
    }

    fn check(&self, target: ExportJobState) -> ExportResult<()> {
        if self.state.can_transition_to(target) {
            Ok(())
        } else {
            Err(ExportError::StateTransition {
                from: self.state,
                to: target,
            })
        }
    }

    pub fn start_materialization(&mut self) -> ExportResult<ExportJobEvent> {
        self.check(ExportJobState::Materializing)?;
        self.execute(ExportJobEvent::StateChanged {
            job_id: self.id,
            from: self.state,
            to: ExportJobState::Materializing,
            records_processed: None,
            occurred_at: Timestamp::now(),
        })
    }

    pub fn start_validation(&mut self, records_processed: u64) -> ExportResult<ExportJobEvent> {
        self.check(ExportJobState::Validating)?;
        self.execute(ExportJobEvent::StateChanged {
            job_id: self.id,
            from: self.state,
            to: ExportJobState::Validating,
            records_processed: Some(records_processed),
            occurred_at: Timestamp::now(),
        })
    }

    pub fn complete(&mut self, completion: CompletionRecord) -> ExportResult<ExportJobEvent> {
        self.check(ExportJobState::Complete)?;
        self.execute(ExportJobEvent::Completed {
            job_id: self.id,
            completion,
            occurred_at: Timestamp::now(),
        })
    }

    /// Allowed from any open state. A terminal job is left untouched.
    pub fn fail(
        &mut self,
        message: impl Into<String>,
        code: ErrorCode,
        validation_errors: Vec<String>,
    ) -> ExportResult<ExportJobEvent> {
        self.check(ExportJobState::Failed)?;
        self.execute(ExportJobEvent::Failed {
            job_id: self.id,
            from: self.state,
            failure: FailureRecord {
                code,
                message: message.into(),
                validation_errors,
            },
            occurred_at: Timestamp::now(),
        })
    }

    /// User cancellation, only before validation starts.
    pub fn cancel(&mut self) -> ExportResult<ExportJobEvent> {
        match self.state {
            ExportJobState::Queued | ExportJobState::Materializing => {
                self.fail("Cancelled by user", ErrorCode::UserCancelled, Vec::new())
            }
            other => Err(ExportError::StateTransition {
                from: other,
                to: ExportJobState::Failed,
            }),
        }
    }

    pub fn id(&self) -> ExportJobId {
        self.id
    }

    pub fn export_type(&self) -> ExportType {
        self.export_type
    }

    pub fn period(&self) -> &ReportingPeriod {
        &self.period
    }

    pub fn filters(&self) -> &ExportFilters {
        &self.filters
    }

    pub fn requested_by(&self) -> &ActorId {
        &self.requested_by
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn state(&self) -> ExportJobState {
        self.state
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed
    }

    pub fn records_suppressed(&self) -> u64 {
        self.records_suppressed
    }

    pub fn artifacts(&self) -> &[String] {
        &self.artifacts
    }

    pub fn completion(&self) -> Option<&CompletionRecord> {
        self.completion.as_ref()
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        self.failure.as_ref()
    }

    pub fn queued_at(&self) -> Timestamp {
        self.queued_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    /// Number of events folded into this state.
    pub fn version(&self) -> u64 {
        self.version
    }
}

// ---------------------------------------------------------------------------
// apply: the single fold function
// ---------------------------------------------------------------------------

/// Fold one event into a job. `None` is the empty initial state. Illegal
/// combinations are rejected and the input is left untouched.
pub fn apply(state: Option<&ExportJob>, event: &ExportJobEvent) -> ExportResult<ExportJob> {
    let job = match (state, event) {
        (
            None,
            ExportJobEvent::Queued {
                job_id,
                export_type,
                period,
                filters,
                requested_by,
                reason,
                occurred_at,
            },
        ) => {
            return Ok(ExportJob {
                id: *job_id,
                export_type: *export_type,
                period: *period,
                filters: filters.clone(),
                requested_by: requested_by.clone(),
                reason: reason.clone(),
                state: ExportJobState::Queued,
                records_processed: 0,
                records_suppressed: 0,
                artifacts: Vec::new(),
                completion: None,
                failure: None,
                queued_at: *occurred_at,
                updated_at: *occurred_at,
                version: 1,
            });
        }
        (None, _) => {
            return Err(ExportError::InvalidEventLog(
                "first event must be Queued".to_string(),
            ))
        }
        (Some(_), ExportJobEvent::Queued { .. }) => {
            return Err(ExportError::InvalidEventLog(
                "job is already queued".to_string(),
            ))
        }
        (Some(job), _) => job,
    };

    if event.job_id() != job.id {
        return Err(ExportError::InvalidEventLog(format!(
            "event for job {} applied to job {}",
            event.job_id(),
            job.id
        )));
    }

    let target = event.target_state();
    if !job.state.can_transition_to(target) {
        return Err(ExportError::StateTransition {
            from: job.state,
            to: target,
        });
    }

    let mut next = job.clone();
    match event {
        ExportJobEvent::Queued { .. } => {
            return Err(ExportError::InvalidEventLog(
                "job is already queued".to_string(),
            ))
        }
        ExportJobEvent::StateChanged {
            from,
            to,
            records_processed,
            ..
        } => {
            if *from != job.state || to.is_terminal() {
                return Err(ExportError::StateTransition {
                    from: job.state,
                    to: *to,
                });
            }
            if let Some(n) = records_processed {
                next.records_processed = *n;
            }
        }
        ExportJobEvent::Completed { completion, .. } => {
            next.records_processed = completion.total_records;
            next.records_suppressed = completion.suppressed_records;
            next.artifacts = completion.artifacts.clone();
            next.completion = Some(completion.clone());
        }
        ExportJobEvent::Failed { from, failure, .. } => {
            if *from != job.state {
                return Err(ExportError::StateTransition {
                    from: job.state,
                    to: ExportJobState::Failed,
                });
            }
            next.failure = Some(failure.clone());
        }
    }
    next.state = target;
    next.updated_at = event.occurred_at();
    next.version += 1;
    Ok(next)
}
