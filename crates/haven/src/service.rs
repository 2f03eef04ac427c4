use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use haven_core::{
    ActorId, AuditEventKind, AuditRecord, AuditSink, BlobStore, ConsentProvider, DeterministicHasher,
    ExportJobId, ExportJobState, IdentityProvider, ResourceId, Role, TimeRange,
};
use haven_export::{
    CancellationFlag, CompositeValidator, ErrorCode, EventStore, ExportError, ExportFilters,
    ExportJob, ExportPipeline, ExportType, PipelineContext, PipelineSettings, RecordSource,
    ReportingPeriod,
};
use haven_vault::{sha256_hex, AuditEntry, AuditTrail, ExportManifest, SecurePackager};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{RootError, RootResult};

/// External systems the service is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordSource>,
    pub identity: Arc<dyn IdentityProvider>,
    pub consent: Arc<dyn ConsentProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub events: Arc<dyn EventStore>,
}

/// What `get_status` and `list_jobs` report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job_id: ExportJobId,
    pub export_type: ExportType,
    pub state: ExportJobState,
    pub requested_by: ActorId,
    pub records_processed: u64,
    pub records_suppressed: u64,
    pub artifacts: Vec<String>,
    pub content_hash: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub message: Option<String>,
    pub validation_errors: Vec<String>,
}

impl From<&ExportJob> for JobStatus {
    fn from(job: &ExportJob) -> Self {
        Self {
            job_id: job.id(),
            export_type: job.export_type(),
            state: job.state(),
            requested_by: job.requested_by().clone(),
            records_processed: job.records_processed(),
            records_suppressed: job.records_suppressed(),
            artifacts: job.artifacts().to_vec(),
            content_hash: job.completion().map(|c| c.content_hash.clone()),
            error_code: job.failure().map(|f| f.code),
            message: job.failure().map(|f| f.message.clone()),
            validation_errors: job
                .failure()
                .map(|f| f.validation_errors.clone())
                .unwrap_or_default(),
        }
    }
}

/// Stored package of a COMPLETE job.
#[derive(Debug, Clone)]
pub struct DownloadedPackage {
    pub bundle: Vec<u8>,
    pub manifest: ExportManifest,
}

/// The caller-facing export API.
///
/// Each job is processed by one worker at a time: `process`, `cancel_export`
/// and `retry_export` take a per-job lock. Distinct jobs run in parallel and
/// share only the audit trail.
pub struct ExportService {
    pipeline: ExportPipeline,
    trail: Arc<AuditTrail>,
    locks: Mutex<HashMap<ExportJobId, Arc<Mutex<()>>>>,
    running: Mutex<HashMap<ExportJobId, CancellationFlag>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExportService {
    pub fn new(
        collaborators: Collaborators,
        trail: Arc<AuditTrail>,
        hasher: DeterministicHasher,
        packager: SecurePackager,
    ) -> Self {
        let ctx = PipelineContext {
            records: collaborators.records,
            identity: collaborators.identity,
            consent: collaborators.consent,
            blobs: collaborators.blobs,
            audit: trail.clone(),
            events: collaborators.events,
        };
        Self {
            pipeline: ExportPipeline::new(ctx, hasher, packager),
            trail,
            locks: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.pipeline = self.pipeline.with_settings(settings);
        self
    }

    pub fn with_required_sections(mut self, required: Vec<String>) -> Self {
        self.pipeline = self
            .pipeline
            .with_validator(CompositeValidator::standard(required));
        self
    }

    /// Replace any other pipeline option.
    pub fn configure_pipeline(mut self, f: impl FnOnce(ExportPipeline) -> ExportPipeline) -> Self {
        self.pipeline = f(self.pipeline);
        self
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    // -- Operations ---------------------------------------------------------

    pub fn queue_export(
        &self,
        export_type: ExportType,
        period: ReportingPeriod,
        filters: ExportFilters,
        requester: &ActorId,
        reason: &str,
    ) -> RootResult<ExportJobId> {
        let job = self
            .pipeline
            .queue(export_type, period, filters, requester.clone(), reason)?;
        Ok(job.id())
    }

    /// Run a QUEUED job to a terminal state and return it.
    pub fn process(&self, job_id: ExportJobId) -> RootResult<ExportJob> {
        // Registered before the job lock is taken, so whoever finds the lock
        // held by a run also finds its flag.
        let flag = CancellationFlag::new();
        lock(&self.running).insert(job_id, flag.clone());
        let result = {
            let job_lock = self.job_lock(job_id);
            let _guard = lock(&job_lock);
            self.run_locked(job_id, &flag)
        };
        lock(&self.running).remove(&job_id);
        self.release_lock(job_id);
        result
    }

    pub fn get_status(&self, job_id: ExportJobId, actor: &ActorId) -> RootResult<JobStatus> {
        let job = self.pipeline.load(job_id)?;
        self.authorize(&job, actor, "view export status")?;
        Ok(JobStatus::from(&job))
    }

    /// Only for COMPLETE jobs. Every successful download is audited.
    pub fn download(&self, job_id: ExportJobId, actor: &ActorId) -> RootResult<DownloadedPackage> {
        let job = self.pipeline.load(job_id)?;
        self.authorize(&job, actor, "download export")?;
        let (bundle, manifest) = self.pipeline.fetch_package(&job)?;
        let content_hash = job
            .completion()
            .map(|c| c.content_hash.clone())
            .unwrap_or_default();
        self.trail.record(AuditRecord::new(
            job_id.resource_id(),
            Some(actor.clone()),
            AuditEventKind::ExportDownloaded { content_hash },
        ));
        info!(job_id = %job_id, actor = %actor, "export downloaded");
        Ok(DownloadedPackage { bundle, manifest })
    }

    pub fn audit_trail(&self, resource_id: &ResourceId, range: TimeRange) -> Vec<AuditEntry> {
        self.trail.entries_for(resource_id, range)
    }

    /// A running job is stopped at its next phase boundary; an idle one is
    /// cancelled immediately.
    pub fn cancel_export(&self, job_id: ExportJobId, actor: &ActorId) -> RootResult<ExportJob> {
        let job = self.pipeline.load(job_id)?;
        self.authorize(&job, actor, "cancel export")?;

        let job_lock = self.job_lock(job_id);
        let result = self.cancel_locked(job, &job_lock, actor);
        drop(job_lock);
        self.release_lock(job_id);
        result
    }

    /// Queue a new job with the parameters of a FAILED one. The failed job
    /// is left as it is.
    pub fn retry_export(&self, job_id: ExportJobId, actor: &ActorId) -> RootResult<ExportJobId> {
        let job = self.pipeline.load(job_id)?;
        self.authorize(&job, actor, "retry export")?;
        if job.state() != ExportJobState::Failed {
            return Err(ExportError::StateTransition {
                from: job.state(),
                to: ExportJobState::Queued,
            }
            .into());
        }
        let retry = self.pipeline.queue(
            job.export_type(),
            *job.period(),
            job.filters().clone(),
            job.requested_by().clone(),
            job.reason(),
        )?;
        info!(job_id = %job_id, retry_id = %retry.id(), "export retried");
        Ok(retry.id())
    }

    /// Jobs visible to `actor`, oldest first. Administrators see every job.
    pub fn list_jobs(
        &self,
        actor: &ActorId,
        state: Option<ExportJobState>,
    ) -> RootResult<Vec<JobStatus>> {
        let admin = self.is_admin(actor)?;
        let mut jobs = Vec::new();
        for id in self.pipeline.context().events.job_ids()? {
            let job = self.pipeline.load(id)?;
            if !admin && job.requested_by() != actor {
                continue;
            }
            if state.map_or(false, |s| s != job.state()) {
                continue;
            }
            jobs.push(job);
        }
        jobs.sort_by_key(|j| j.queued_at());
        Ok(jobs.iter().map(JobStatus::from).collect())
    }

    /// Check a package against its manifest and return its artifacts. The
    /// outcome is audited either way.
    pub fn verify_package(
        &self,
        bundle: &[u8],
        manifest: &ExportManifest,
        actor: Option<&ActorId>,
    ) -> RootResult<BTreeMap<String, Vec<u8>>> {
        let result = self.pipeline.packager().verify(bundle, manifest);
        self.trail.record(AuditRecord::new(
            ResourceId::new(format!("package:{}", sha256_hex(bundle))),
            actor.cloned(),
            AuditEventKind::PackageVerified {
                valid: result.is_ok(),
            },
        ));
        Ok(result?)
    }

    // -- Internals ----------------------------------------------------------

    fn job_lock(&self, job_id: ExportJobId) -> Arc<Mutex<()>> {
        lock(&self.locks).entry(job_id).or_default().clone()
    }

    /// Drop the lock entry once nobody else holds or waits on it.
    fn release_lock(&self, job_id: ExportJobId) {
        let mut locks = lock(&self.locks);
        if locks
            .get(&job_id)
            .map_or(false, |l| Arc::strong_count(l) == 1)
        {
            locks.remove(&job_id);
        }
    }

    fn run_locked(&self, job_id: ExportJobId, flag: &CancellationFlag) -> RootResult<ExportJob> {
        let mut job = self.pipeline.load(job_id)?;
        self.pipeline.process(&mut job, flag)?;
        Ok(job)
    }

    fn cancel_locked(
        &self,
        job: ExportJob,
        job_lock: &Mutex<()>,
        actor: &ActorId,
    ) -> RootResult<ExportJob> {
        let _guard = match job_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                if let Some(flag) = lock(&self.running).get(&job.id()) {
                    info!(job_id = %job.id(), actor = %actor, "cancellation requested for running job");
                    flag.cancel();
                    return Ok(job);
                }
                lock(job_lock)
            }
        };
        let mut job = self.pipeline.load(job.id())?;
        self.pipeline.cancel(&mut job, actor)?;
        Ok(job)
    }

    fn is_admin(&self, actor: &ActorId) -> RootResult<bool> {
        let roles = self.pipeline.context().identity.roles_of(actor)?;
        Ok(roles.contains(&Role::Administrator))
    }

    fn authorize(&self, job: &ExportJob, actor: &ActorId, operation: &str) -> RootResult<()> {
        if job.requested_by() == actor || self.is_admin(actor)? {
            return Ok(());
        }
        warn!(job_id = %job.id(), actor = %actor, operation, "access denied");
        self.trail.record(AuditRecord::new(
            job.id().resource_id(),
            Some(actor.clone()),
            AuditEventKind::AccessDenied {
                operation: operation.to_string(),
            },
        ));
        Err(RootError::AccessDenied {
            actor: actor.to_string(),
            operation: operation.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use haven_export::{InMemoryDirectory, InMemoryEventStore, InMemoryRecordSource};
    use haven_vault::{InMemoryBlobStore, SigningKey};

    fn make_service(dir: InMemoryDirectory) -> ExportService {
        let dir = Arc::new(dir);
        let collaborators = Collaborators {
            records: Arc::new(InMemoryRecordSource::default()),
            identity: dir.clone(),
            consent: dir,
            blobs: Arc::new(InMemoryBlobStore::new()),
            events: Arc::new(InMemoryEventStore::new()),
        };
        let packager =
            SecurePackager::with_derived_encryption(SigningKey::from_bytes(&[3u8; 32]).unwrap())
                .unwrap();
        ExportService::new(
            collaborators,
            Arc::new(AuditTrail::new()),
            DeterministicHasher::new(b"service-test-salt-01").unwrap(),
            packager,
        )
    }

    fn make_period() -> ReportingPeriod {
        ReportingPeriod::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )
        .unwrap()
    }

    fn queue(service: &ExportService, requester: &str) -> ExportJobId {
        service
            .queue_export(
                ExportType::Spm,
                make_period(),
                ExportFilters::default(),
                &ActorId::new(requester),
                "Quarterly",
            )
            .unwrap()
    }

    #[test]
    fn test_status_restricted_to_requester_and_admin() {
        let dir = InMemoryDirectory::new().with_roles("root", vec![Role::Administrator]);
        let service = make_service(dir);
        let id = queue(&service, "alice");

        assert!(service.get_status(id, &ActorId::new("alice")).is_ok());
        assert!(service.get_status(id, &ActorId::new("root")).is_ok());
        let err = service.get_status(id, &ActorId::new("mallory")).unwrap_err();
        assert!(matches!(err, RootError::AccessDenied { .. }));

        let denied = service
            .audit_trail(&id.resource_id(), TimeRange::all())
            .into_iter()
            .filter(|e| matches!(e.record.kind, AuditEventKind::AccessDenied { .. }))
            .count();
        assert_eq!(denied, 1);
    }

    #[test]
    fn test_download_requires_complete() {
        let service = make_service(InMemoryDirectory::new());
        let id = queue(&service, "alice");
        let err = service.download(id, &ActorId::new("alice")).unwrap_err();
        assert!(matches!(err, RootError::Export(ExportError::NotComplete(_))));
    }

    #[test]
    fn test_cancel_then_retry() {
        let service = make_service(InMemoryDirectory::new());
        let alice = ActorId::new("alice");
        let id = queue(&service, "alice");

        assert!(service.retry_export(id, &alice).is_err());
        let job = service.cancel_export(id, &alice).unwrap();
        assert_eq!(job.state(), ExportJobState::Failed);
        assert_eq!(job.failure().unwrap().code, ErrorCode::UserCancelled);

        let retry = service.retry_export(id, &alice).unwrap();
        assert_ne!(retry, id);
        let status = service.get_status(retry, &alice).unwrap();
        assert_eq!(status.state, ExportJobState::Queued);
        assert_eq!(
            service.get_status(id, &alice).unwrap().state,
            ExportJobState::Failed
        );
    }

    #[test]
    fn test_list_jobs_filters() {
        let dir = InMemoryDirectory::new().with_roles("root", vec![Role::Administrator]);
        let service = make_service(dir);
        let a = queue(&service, "alice");
        queue(&service, "bob");
        service.cancel_export(a, &ActorId::new("alice")).unwrap();

        assert_eq!(service.list_jobs(&ActorId::new("alice"), None).unwrap().len(), 1);
        assert_eq!(service.list_jobs(&ActorId::new("root"), None).unwrap().len(), 2);
        let failed = service
            .list_jobs(&ActorId::new("root"), Some(ExportJobState::Failed))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, a);
    }

    #[test]
    fn test_lock_entries_released_after_use() {
        let service = make_service(InMemoryDirectory::new());
        let alice = ActorId::new("alice");

        let processed = queue(&service, "alice");
        let job = service.process(processed).unwrap();
        assert!(job.state().is_terminal());

        let cancelled = queue(&service, "alice");
        service.cancel_export(cancelled, &alice).unwrap();

        assert!(lock(&service.locks).is_empty());
        assert!(lock(&service.running).is_empty());
    }

    #[test]
    fn test_cancel_while_run_holds_lock_trips_flag() {
        let service = make_service(InMemoryDirectory::new());
        let id = queue(&service, "alice");

        let flag = CancellationFlag::new();
        lock(&service.running).insert(id, flag.clone());
        let job_lock = service.job_lock(id);
        let guard = lock(&job_lock);

        let job = service.cancel_export(id, &ActorId::new("alice")).unwrap();
        assert_eq!(job.state(), ExportJobState::Queued);
        assert!(flag.is_cancelled());

        drop(guard);
        drop(job_lock);
        lock(&service.running).remove(&id);
        service.release_lock(id);
        assert!(lock(&service.locks).is_empty());
    }
}
