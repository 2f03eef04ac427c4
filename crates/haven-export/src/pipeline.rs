use std::sync::Arc;
use std::time::Duration;

use haven_core::{
    ActorId, AuditEventKind, AuditRecord, AuditSink, BlobLocator, BlobStore, ConsentProvider,
    DeterministicHasher, ExportJobId, ExportJobState, IdentityProvider,
};
use haven_vault::{Artifact, ExportManifest, PackagedExport, SecurePackager};
use tracing::{info, warn};

use crate::cancel::{CancellationFlag, PhaseGuard};
use crate::error::{ErrorCode, ExportError, ExportResult};
use crate::event::ExportJobEvent;
use crate::event_store::EventStore;
use crate::formatter::{CsvFormatter, Formatter};
use crate::job::{CompletionRecord, ExportFilters, ExportJob, ExportType, ReportingPeriod};
use crate::materialize::{aggregate, HashMode, Materialized, Materializer};
use crate::record::{RecordSource, SourceQuery};
use crate::suppression::SuppressionAggregator;
use crate::validation::{CompositeValidator, ExportValidator, DEFAULT_REQUIRED_SECTIONS};

pub const AGGREGATES_SECTION: &str = "Aggregates";

// ---------------------------------------------------------------------------
// Collaborators and settings
// ---------------------------------------------------------------------------

/// External systems a pipeline talks to. Everything except the event store
/// and the blob store is read-only from the pipeline's point of view.
#[derive(Clone)]
pub struct PipelineContext {
    pub records: Arc<dyn RecordSource>,
    pub identity: Arc<dyn IdentityProvider>,
    pub consent: Arc<dyn ConsentProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub audit: Arc<dyn AuditSink>,
    pub events: Arc<dyn EventStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub hash_mode: HashMode,
    pub encrypt: bool,
    /// Applied to each phase separately. `None` disables the deadline.
    pub phase_timeout: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            hash_mode: HashMode::AlwaysHash,
            encrypt: true,
            phase_timeout: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExportPipeline
// ---------------------------------------------------------------------------

/// Drives export jobs through their lifecycle.
///
/// Every command is appended to the event store at the job's current
/// version before the caller sees the new state, and every transition is
/// reported to the audit sink. Callers must hold a per-job lock; the
/// version check only detects a second writer, it does not serialize them.
pub struct ExportPipeline {
    ctx: PipelineContext,
    hasher: DeterministicHasher,
    packager: SecurePackager,
    validator: Box<dyn ExportValidator>,
    formatter: Box<dyn Formatter>,
    aggregator: SuppressionAggregator,
    settings: PipelineSettings,
}

impl ExportPipeline {
    pub fn new(ctx: PipelineContext, hasher: DeterministicHasher, packager: SecurePackager) -> Self {
        Self {
            ctx,
            hasher,
            packager,
            validator: Box::new(CompositeValidator::standard(
                DEFAULT_REQUIRED_SECTIONS.iter().map(|s| s.to_string()).collect(),
            )),
            formatter: Box::new(CsvFormatter),
            aggregator: SuppressionAggregator::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_validator(mut self, validator: impl ExportValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_formatter(mut self, formatter: impl Formatter + 'static) -> Self {
        self.formatter = Box::new(formatter);
        self
    }

    pub fn with_aggregator(mut self, aggregator: SuppressionAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn packager(&self) -> &SecurePackager {
        &self.packager
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    // -- Commands -----------------------------------------------------------

    /// Validate input, record the first event and return the QUEUED job.
    pub fn queue(
        &self,
        export_type: ExportType,
        period: ReportingPeriod,
        filters: ExportFilters,
        requested_by: ActorId,
        reason: &str,
    ) -> ExportResult<ExportJob> {
        let (job, event) = ExportJob::queue(export_type, period, filters, requested_by, reason)?;
        self.ctx.events.append(job.id(), 0, &event)?;
        info!(job_id = %job.id(), export_type = %export_type, "export job queued");
        self.audit_transition(&job, job.requested_by(), None, job.reason().to_string());
        Ok(job)
    }

    /// Rebuild a job from its event log.
    pub fn load(&self, job_id: ExportJobId) -> ExportResult<ExportJob> {
        let events = self.ctx.events.load(job_id)?;
        ExportJob::reconstruct(job_id, &events)
    }

    pub fn cancel(&self, job: &mut ExportJob, actor: &ActorId) -> ExportResult<()> {
        self.transition(job, actor, |j| j.cancel())
    }

    /// Run one QUEUED job to COMPLETE or FAILED.
    ///
    /// Ordinary job failures are recorded on the job and return `Ok`. An
    /// `Err` means the job could not be advanced at all (illegal state,
    /// event store conflict) and is left as it was before the failing step.
    pub fn process(&self, job: &mut ExportJob, cancel: &CancellationFlag) -> ExportResult<()> {
        let actor = job.requested_by().clone();
        self.transition(job, &actor, |j| j.start_materialization())?;

        let guard = PhaseGuard::start(cancel, self.settings.phase_timeout);
        let records = match self.ctx.records.fetch(&SourceQuery::for_job(job)) {
            Ok(records) => records,
            Err(e) => {
                return self.fail(job, ErrorCode::StorageError, format!("Record fetch failed: {e}"))
            }
        };
        let materializer = Materializer {
            audit: &*self.ctx.audit,
            identity: &*self.ctx.identity,
            consent: &*self.ctx.consent,
            hasher: &self.hasher,
            hash_mode: self.settings.hash_mode,
        };
        let data = match materializer.materialize(&actor, records) {
            Ok(data) => data,
            Err(e) => {
                return self.fail(job, ErrorCode::PolicyError, format!("Materialization failed: {e}"))
            }
        };
        if let Err(interrupt) = guard.check() {
            return self.fail(job, interrupt.code(), interrupt.message("materialization"));
        }

        self.transition(job, &actor, |j| j.start_validation(data.records_processed))?;

        let guard = PhaseGuard::start(cancel, self.settings.phase_timeout);
        let errors = self.validator.validate(job, &data);
        if !errors.is_empty() {
            let message = format!("Validation failed with {} errors", errors.len());
            return self.transition(job, &actor, |j| {
                j.fail(message, ErrorCode::ValidationError, errors)
            });
        }
        let artifacts = match self.render(job, &data) {
            Ok(artifacts) => artifacts,
            Err(e) => return self.fail(job, ErrorCode::FormatError, format!("Formatting failed: {e}")),
        };
        if let Err(interrupt) = guard.check() {
            return self.fail(job, interrupt.code(), interrupt.message("validation"));
        }

        let packaged = match self.packager.package(&artifacts, self.settings.encrypt) {
            Ok(packaged) => packaged,
            Err(e) => {
                return self.fail(job, ErrorCode::PackagingError, format!("Packaging failed: {e}"))
            }
        };
        let (bundle_locator, manifest_locator) = match self.store(job.id(), &packaged) {
            Ok(locators) => locators,
            Err(e) => {
                return self.fail(job, ErrorCode::StorageError, format!("Package storage failed: {e}"))
            }
        };

        let completion = CompletionRecord::new(
            bundle_locator,
            manifest_locator,
            packaged.content_hash,
            data.records_processed,
            data.records_suppressed,
            artifacts.into_iter().map(|a| a.name).collect(),
        )?;
        self.transition(job, &actor, |j| j.complete(completion))
    }

    /// Stored bundle bytes and manifest of a COMPLETE job.
    pub fn fetch_package(&self, job: &ExportJob) -> ExportResult<(Vec<u8>, ExportManifest)> {
        let completion = job.completion().ok_or(ExportError::NotComplete(job.id()))?;
        let bundle = self.ctx.blobs.get(&completion.storage_locator)?;
        let manifest_bytes = self.ctx.blobs.get(&completion.manifest_locator)?;
        let manifest = ExportManifest::from_json(&manifest_bytes)?;
        Ok((bundle, manifest))
    }

    // -- Internals ----------------------------------------------------------

    fn fail(&self, job: &mut ExportJob, code: ErrorCode, message: String) -> ExportResult<()> {
        let actor = job.requested_by().clone();
        self.transition(job, &actor, |j| j.fail(message, code, Vec::new()))
    }

    /// Run a command, persist its event at the pre-command version and
    /// audit it. On any error the job is restored.
    fn transition<F>(&self, job: &mut ExportJob, actor: &ActorId, command: F) -> ExportResult<()>
    where
        F: FnOnce(&mut ExportJob) -> ExportResult<ExportJobEvent>,
    {
        let before = job.clone();
        let event = match command(job) {
            Ok(event) => event,
            Err(e) => {
                *job = before;
                return Err(e);
            }
        };
        if let Err(e) = self.ctx.events.append(job.id(), before.version(), &event) {
            *job = before;
            return Err(e);
        }

        let detail = match &event {
            ExportJobEvent::Failed { failure, .. } => {
                warn!(
                    job_id = %job.id(),
                    from = %before.state(),
                    code = %failure.code,
                    message = %failure.message,
                    "export job failed"
                );
                format!("{}: {}", failure.code, failure.message)
            }
            ExportJobEvent::Completed { completion, .. } => {
                info!(job_id = %job.id(), content_hash = %completion.content_hash, "export job complete");
                format!("content_hash={}", completion.content_hash)
            }
            ExportJobEvent::StateChanged {
                records_processed, ..
            } => {
                info!(job_id = %job.id(), from = %before.state(), to = %job.state(), "export job transition");
                records_processed
                    .map(|n| format!("records_processed={n}"))
                    .unwrap_or_default()
            }
            ExportJobEvent::Queued { .. } => String::new(),
        };
        self.audit_transition(job, actor, Some(before.state()), detail);
        Ok(())
    }

    fn audit_transition(
        &self,
        job: &ExportJob,
        actor: &ActorId,
        from: Option<ExportJobState>,
        detail: String,
    ) {
        self.ctx.audit.record(AuditRecord::new(
            job.id().resource_id(),
            Some(actor.clone()),
            AuditEventKind::JobStateChanged {
                from,
                to: job.state(),
                detail,
            },
        ));
    }

    /// One artifact per section, plus the suppressed aggregate table when
    /// the job asks for one.
    fn render(&self, job: &ExportJob, data: &Materialized) -> ExportResult<Vec<Artifact>> {
        let ext = self.formatter.extension();
        let mut artifacts = Vec::with_capacity(data.tables.len() + 1);
        for (section, table) in &data.tables {
            artifacts.push(Artifact::new(
                format!("{section}.{ext}"),
                self.formatter.format(table)?,
            ));
        }
        let fields = &job.filters().aggregate_by;
        if !fields.is_empty() {
            let table = aggregate(&self.aggregator, &data.included, fields)?;
            artifacts.push(Artifact::new(
                format!("{AGGREGATES_SECTION}.{ext}"),
                self.formatter.format(&table)?,
            ));
        }
        Ok(artifacts)
    }

    fn store(
        &self,
        job_id: ExportJobId,
        packaged: &PackagedExport,
    ) -> ExportResult<(BlobLocator, BlobLocator)> {
        let manifest = packaged.manifest.to_json()?;
        let bundle_locator = self
            .ctx
            .blobs
            .put(&format!("{job_id}.bundle"), &packaged.bundle)?;
        let manifest_locator = self
            .ctx
            .blobs
            .put(&format!("{job_id}.manifest.json"), &manifest)?;
        Ok((bundle_locator, manifest_locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::record::{FieldValue, InMemoryDirectory, InMemoryRecordSource, SourceRecord};
    use crate::responses::FivePointResponse;
    use chrono::NaiveDate;
    use haven_core::{HavenError, HavenResult, SubjectId};
    use haven_policy::{AccessControls, InMemoryAuditSink, ResourceDescriptor, VisibilityScope};
    use haven_vault::{InMemoryBlobStore, SigningKey};
    use std::collections::BTreeMap;

    struct FailingBlobStore;

    impl BlobStore for FailingBlobStore {
        fn put(&self, _key: &str, _bytes: &[u8]) -> HavenResult<BlobLocator> {
            Err(HavenError::Storage("disk full".into()))
        }

        fn get(&self, locator: &BlobLocator) -> HavenResult<Vec<u8>> {
            Err(HavenError::NotFound(locator.to_string()))
        }
    }

    fn make_record(section: &str, subject: &str, gender: &str) -> SourceRecord {
        SourceRecord {
            section: section.into(),
            subject_id: SubjectId::new(subject),
            resource: ResourceDescriptor::new(format!("{section}-{subject}"), VisibilityScope::Public),
            controls: AccessControls::default(),
            project_id: None,
            coc_code: None,
            effective_date: NaiveDate::from_ymd_opt(2024, 5, 1),
            fields: BTreeMap::from([
                ("Gender".to_string(), FieldValue::Text(gender.into())),
                (
                    "VeteranStatus".to_string(),
                    FieldValue::Response(FivePointResponse::No),
                ),
            ]),
        }
    }

    fn make_records() -> Vec<SourceRecord> {
        let mut records = Vec::new();
        for i in 0..10 {
            let gender = if i < 3 { "0" } else { "1" };
            records.push(make_record("Client", &format!("c-{i}"), gender));
            records.push(make_record("Enrollment", &format!("c-{i}"), "1"));
        }
        records
    }

    struct Harness {
        pipeline: ExportPipeline,
        audit: Arc<InMemoryAuditSink>,
        events: Arc<InMemoryEventStore>,
    }

    fn make_harness(records: Vec<SourceRecord>, blobs: Arc<dyn BlobStore>) -> Harness {
        let audit = Arc::new(InMemoryAuditSink::new());
        let events = Arc::new(InMemoryEventStore::new());
        let dir = Arc::new(InMemoryDirectory::new());
        let ctx = PipelineContext {
            records: Arc::new(InMemoryRecordSource::new(records)),
            identity: dir.clone(),
            consent: dir,
            blobs,
            audit: audit.clone(),
            events: events.clone(),
        };
        let hasher = DeterministicHasher::new(b"pipeline-test-salt-0001").unwrap();
        let packager =
            SecurePackager::with_derived_encryption(SigningKey::from_bytes(&[9u8; 32]).unwrap())
                .unwrap();
        Harness {
            pipeline: ExportPipeline::new(ctx, hasher, packager),
            audit,
            events,
        }
    }

    fn make_period() -> ReportingPeriod {
        ReportingPeriod::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        )
        .unwrap()
    }

    fn queue(h: &Harness, filters: ExportFilters) -> ExportJob {
        h.pipeline
            .queue(
                ExportType::HmisCsv,
                make_period(),
                filters,
                ActorId::new("alice"),
                "Annual submission",
            )
            .unwrap()
    }

    fn transitions(audit: &InMemoryAuditSink) -> Vec<ExportJobState> {
        audit
            .records()
            .into_iter()
            .filter_map(|r| match r.kind {
                AuditEventKind::JobStateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_happy_path_completes() {
        let h = make_harness(make_records(), Arc::new(InMemoryBlobStore::new()));
        let mut job = queue(&h, ExportFilters::default());
        h.pipeline.process(&mut job, &CancellationFlag::new()).unwrap();

        assert_eq!(job.state(), ExportJobState::Complete);
        let completion = job.completion().unwrap();
        assert_eq!(completion.total_records, 20);
        assert_eq!(completion.suppressed_records, 0);
        assert_eq!(completion.artifacts, vec!["Client.csv", "Enrollment.csv"]);
        assert_eq!(
            transitions(&h.audit),
            vec![
                ExportJobState::Queued,
                ExportJobState::Materializing,
                ExportJobState::Validating,
                ExportJobState::Complete,
            ]
        );
        assert_eq!(h.pipeline.load(job.id()).unwrap(), job);

        let (bundle, manifest) = h.pipeline.fetch_package(&job).unwrap();
        assert!(manifest.encrypted);
        let files = h.pipeline.packager().verify(&bundle, &manifest).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_aggregates_are_suppressed() {
        let h = make_harness(make_records(), Arc::new(InMemoryBlobStore::new()));
        let filters = ExportFilters {
            aggregate_by: vec!["Gender".into()],
            ..Default::default()
        };
        let mut job = queue(&h, filters);
        h.pipeline.process(&mut job, &CancellationFlag::new()).unwrap();

        let (bundle, manifest) = h.pipeline.fetch_package(&job).unwrap();
        let files = h.pipeline.packager().verify(&bundle, &manifest).unwrap();
        let text = String::from_utf8(files["Aggregates.csv"].clone()).unwrap();
        // True counts are 3 and 17.
        assert_eq!(text, "Field,Value,Count\r\nGender,0,*\r\nGender,1,17\r\n");
        assert!(!text.contains(",3\r\n"));
    }

    #[test]
    fn test_validation_failure_carries_errors() {
        let records: Vec<_> = make_records()
            .into_iter()
            .filter(|r| r.section == "Exit")
            .collect();
        let h = make_harness(records, Arc::new(InMemoryBlobStore::new()));
        let mut job = queue(&h, ExportFilters::default());
        h.pipeline.process(&mut job, &CancellationFlag::new()).unwrap();

        assert_eq!(job.state(), ExportJobState::Failed);
        let failure = job.failure().unwrap();
        assert_eq!(failure.code, ErrorCode::ValidationError);
        assert_eq!(
            failure.validation_errors,
            vec![
                "Missing required section: Client".to_string(),
                "Missing required section: Enrollment".to_string(),
            ]
        );
        assert!(job.completion().is_none());
    }

    #[test]
    fn test_cancel_flag_stops_at_phase_boundary() {
        let h = make_harness(make_records(), Arc::new(InMemoryBlobStore::new()));
        let mut job = queue(&h, ExportFilters::default());
        let flag = CancellationFlag::new();
        flag.cancel();
        h.pipeline.process(&mut job, &flag).unwrap();

        assert_eq!(job.state(), ExportJobState::Failed);
        assert_eq!(job.failure().unwrap().code, ErrorCode::UserCancelled);
        // Materialization ran to completion before the check.
        assert_eq!(job.records_processed(), 0);
    }

    #[test]
    fn test_storage_failure_fails_job() {
        let h = make_harness(make_records(), Arc::new(FailingBlobStore));
        let mut job = queue(&h, ExportFilters::default());
        h.pipeline.process(&mut job, &CancellationFlag::new()).unwrap();
        assert_eq!(job.failure().unwrap().code, ErrorCode::StorageError);
        assert!(matches!(
            h.pipeline.fetch_package(&job),
            Err(ExportError::NotComplete(_))
        ));
    }

    #[test]
    fn test_conflicting_writer_leaves_job_unchanged() {
        let h = make_harness(make_records(), Arc::new(InMemoryBlobStore::new()));
        let mut job = queue(&h, ExportFilters::default());
        let mut stale = job.clone();

        h.pipeline.cancel(&mut job, &ActorId::new("alice")).unwrap();
        let before = stale.clone();
        let err = h
            .pipeline
            .process(&mut stale, &CancellationFlag::new())
            .unwrap_err();
        assert!(matches!(err, ExportError::ConcurrencyConflict { .. }));
        assert_eq!(stale, before);
        assert_eq!(h.events.load(job.id()).unwrap().len(), 2);
    }

    #[test]
    fn test_process_requires_queued() {
        let h = make_harness(make_records(), Arc::new(InMemoryBlobStore::new()));
        let mut job = queue(&h, ExportFilters::default());
        h.pipeline.process(&mut job, &CancellationFlag::new()).unwrap();
        let done = job.clone();
        assert!(matches!(
            h.pipeline.process(&mut job, &CancellationFlag::new()),
            Err(ExportError::StateTransition { .. })
        ));
        assert_eq!(job, done);
    }
}
