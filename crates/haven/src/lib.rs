//! Haven Root Library
//!
//! Wires the export pipeline to its collaborators and exposes the
//! caller-facing `ExportService`: queue, process, status, download, audit
//! queries, cancellation, retry, listing and package verification.
//!
//! Configuration comes from a TOML file; key material and the
//! pseudonymization salt come only from the environment.

pub mod config;
pub mod error;
pub mod fixture;
pub mod secrets;
pub mod service;

pub use config::{CryptoConfig, ExportConfig, KeyMode, OutputFormat, RootConfig, StorageConfig};
pub use error::{RootError, RootResult};
pub use fixture::Fixture;
pub use secrets::Secrets;
pub use service::{Collaborators, DownloadedPackage, ExportService, JobStatus};

use std::sync::Arc;

use haven_core::{ConsentProvider, IdentityProvider};
use haven_export::{
    CsvFormatter, JsonLinesFormatter, JsonlEventStore, PipelineSettings, RecordSource,
    SuppressionAggregator,
};
use haven_vault::{AuditTrail, FileBlobStore, JsonlAuditStore};
use tracing::info;

/// Build a file-backed service from configuration and injected secrets.
///
/// Events, blobs and the audit log live under `config.storage.data_dir`.
/// The audit trail resumes from the existing log.
pub fn initialize_service(
    config: &RootConfig,
    secrets: Secrets,
    records: Arc<dyn RecordSource>,
    identity: Arc<dyn IdentityProvider>,
    consent: Arc<dyn ConsentProvider>,
) -> RootResult<ExportService> {
    config.validate()?;
    let storage = &config.storage;
    info!(data_dir = %storage.data_dir.display(), "initializing haven export service");

    std::fs::create_dir_all(&storage.data_dir).map_err(|e| {
        RootError::Internal(format!(
            "failed to create data directory {}: {}",
            storage.data_dir.display(),
            e
        ))
    })?;

    let events = Arc::new(JsonlEventStore::new(storage.events_dir())?);
    let blobs = Arc::new(FileBlobStore::new(storage.blobs_dir())?);
    let trail = Arc::new(AuditTrail::with_store(Box::new(JsonlAuditStore::new(
        storage.audit_log(),
    )))?);
    if !trail.verify_chain() {
        return Err(RootError::Internal(format!(
            "audit log {} failed hash-chain verification",
            storage.audit_log().display()
        )));
    }

    let aggregator = SuppressionAggregator::with_marker(config.export.suppression_marker.clone())
        .ok_or_else(|| RootError::Config("invalid suppression_marker".into()))?;
    let settings = PipelineSettings {
        hash_mode: config.export.hash_mode,
        encrypt: config.export.encrypt,
        phase_timeout: config.export.phase_timeout(),
    };
    let format = config.export.format;

    let packager = secrets.packager()?;
    let service = ExportService::new(
        Collaborators {
            records,
            identity,
            consent,
            blobs,
            events,
        },
        trail,
        secrets.hasher,
        packager,
    )
    .with_settings(settings)
    .with_required_sections(config.export.required_sections.clone())
    .configure_pipeline(|p| {
        let p = p.with_aggregator(aggregator);
        match format {
            OutputFormat::Csv => p.with_formatter(CsvFormatter),
            OutputFormat::Jsonl => p.with_formatter(JsonLinesFormatter),
        }
    });

    info!("haven export service initialized");
    Ok(service)
}
