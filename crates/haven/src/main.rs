use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

use haven::{initialize_service, ExportService, Fixture, RootConfig, RootError, RootResult, Secrets};
use haven_core::{ActorId, ExportJobId, ExportJobState, ResourceId};
use haven_export::{ExportFilters, ExportType, ReportingPeriod};
use haven_vault::{verify_entries, AuditStore, ExportManifest, JsonlAuditStore};

/// Haven: privacy-compliant HMIS exports
///
/// Queues and runs export jobs against a JSON fixture of source records,
/// verifies signed packages and inspects the audit log.
#[derive(Parser, Debug)]
#[command(name = "haven", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct JobArgs {
    /// JSON fixture with roles, consents and records
    #[arg(long)]
    records: PathBuf,

    /// Export type, e.g. hmis-csv, coc-apr, esg-caper, spm, pit-hic
    #[arg(long = "type", default_value = "hmis-csv")]
    export_type: String,

    /// First day of the reporting period (YYYY-MM-DD)
    #[arg(long)]
    start: NaiveDate,

    /// Last day of the reporting period (YYYY-MM-DD)
    #[arg(long)]
    end: NaiveDate,

    #[arg(long)]
    requester: String,

    #[arg(long)]
    reason: String,

    /// Restrict to these project ids
    #[arg(long = "project")]
    projects: Vec<String>,

    #[arg(long)]
    coc: Option<String>,

    /// Produce a suppressed count table for these fields
    #[arg(long = "aggregate-by")]
    aggregate_by: Vec<String>,

    /// Force bundle encryption on regardless of configuration
    #[arg(long)]
    encrypt: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue and run one export job
    Export(JobArgs),

    /// Run several copies of one export job in parallel
    Batch {
        #[command(flatten)]
        job: JobArgs,

        /// Number of jobs
        #[arg(long, default_value = "4")]
        jobs: usize,
    },

    /// Verify a package against its manifest
    Verify {
        #[arg(long)]
        bundle: PathBuf,

        #[arg(long)]
        manifest: PathBuf,
    },

    /// Show the status of one job
    Status {
        #[arg(long)]
        job: String,

        #[arg(long)]
        actor: String,

        /// Fixture supplying the actor's roles
        #[arg(long)]
        records: Option<PathBuf>,
    },

    /// List jobs visible to an actor
    List {
        #[arg(long)]
        actor: String,

        /// Only jobs in this state
        #[arg(long)]
        state: Option<String>,

        #[arg(long)]
        records: Option<PathBuf>,
    },

    /// Show audit log entries for a resource
    Audit {
        /// Resource id, e.g. an export job id
        #[arg(long)]
        resource: String,

        /// Maximum number of entries to display
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("haven=debug,haven_export=debug,haven_policy=debug,haven_vault=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("haven=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> RootResult<RootConfig> {
    match path {
        Some(p) => RootConfig::load(p),
        None => RootConfig::load(&RootConfig::default_config_path()),
    }
}

fn build_service(config: &RootConfig, fixture: &Fixture) -> RootResult<ExportService> {
    let secrets = Secrets::from_env(&config.crypto)?;
    let directory = Arc::new(fixture.directory());
    initialize_service(
        config,
        secrets,
        Arc::new(fixture.record_source()),
        directory.clone(),
        directory,
    )
}

fn load_fixture(path: Option<&Path>) -> RootResult<Fixture> {
    match path {
        Some(p) => Fixture::load(p),
        None => Ok(Fixture::default()),
    }
}

fn parse_job_id(s: &str) -> RootResult<ExportJobId> {
    ExportJobId::parse(s).ok_or_else(|| RootError::Config(format!("invalid job id: {s}")))
}

fn print_json<T: serde::Serialize>(value: &T) -> RootResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> RootResult<()> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Export(job) => cmd_export(config, job).await,
        Commands::Batch { job, jobs } => cmd_batch(config, job, jobs).await,
        Commands::Verify { bundle, manifest } => cmd_verify(&config, &bundle, &manifest),
        Commands::Status {
            job,
            actor,
            records,
        } => cmd_status(&config, &job, &actor, records.as_deref()),
        Commands::List {
            actor,
            state,
            records,
        } => cmd_list(&config, &actor, state.as_deref(), records.as_deref()),
        Commands::Audit { resource, limit } => cmd_audit(&config, &resource, limit),
    }
}

fn queue_from_args(service: &ExportService, args: &JobArgs) -> RootResult<ExportJobId> {
    let export_type: ExportType = args.export_type.parse()?;
    let period = ReportingPeriod::new(args.start, args.end)?;
    let filters = ExportFilters {
        project_ids: args.projects.clone(),
        coc_code: args.coc.clone(),
        aggregate_by: args.aggregate_by.clone(),
    };
    service.queue_export(
        export_type,
        period,
        filters,
        &ActorId::new(args.requester.as_str()),
        &args.reason,
    )
}

fn with_encrypt_override(mut config: RootConfig, args: &JobArgs) -> RootConfig {
    if args.encrypt {
        config.export.encrypt = true;
    }
    config
}

async fn cmd_export(config: RootConfig, args: JobArgs) -> RootResult<()> {
    let config = with_encrypt_override(config, &args);
    let fixture = Fixture::load(&args.records)?;
    let service = build_service(&config, &fixture)?;

    let job_id = queue_from_args(&service, &args)?;
    info!(job_id = %job_id, "processing export");
    let job = tokio::task::spawn_blocking(move || service.process(job_id).map(|j| (service, j)))
        .await
        .map_err(|e| RootError::Internal(format!("export task failed: {}", e)))?;
    let (service, job) = job?;

    let status = service.get_status(job.id(), job.requested_by())?;
    print_json(&status)
}

async fn cmd_batch(config: RootConfig, args: JobArgs, jobs: usize) -> RootResult<()> {
    let config = with_encrypt_override(config, &args);
    let fixture = Fixture::load(&args.records)?;
    let service = Arc::new(build_service(&config, &fixture)?);

    let mut ids = Vec::with_capacity(jobs);
    for _ in 0..jobs {
        ids.push(queue_from_args(&service, &args)?);
    }

    let mut handles = Vec::with_capacity(jobs);
    for id in ids {
        let service = Arc::clone(&service);
        handles.push(tokio::task::spawn_blocking(move || service.process(id)));
    }

    let mut statuses = Vec::with_capacity(handles.len());
    for handle in handles {
        let job = handle
            .await
            .map_err(|e| RootError::Internal(format!("batch task failed: {}", e)))??;
        statuses.push(service.get_status(job.id(), job.requested_by())?);
    }

    let complete = statuses
        .iter()
        .filter(|s| s.state == ExportJobState::Complete)
        .count();
    info!(jobs = statuses.len(), complete, "batch finished");
    print_json(&statuses)
}

fn cmd_verify(config: &RootConfig, bundle: &Path, manifest: &Path) -> RootResult<()> {
    let bundle_bytes = std::fs::read(bundle)?;
    let manifest = ExportManifest::from_json(&std::fs::read(manifest)?)?;
    let service = build_service(config, &Fixture::default())?;

    match service.verify_package(&bundle_bytes, &manifest, None) {
        Ok(files) => {
            println!("Package valid ({} artifacts):", files.len());
            for (name, content) in &files {
                println!("  {:<24} {} bytes", name, content.len());
            }
            Ok(())
        }
        Err(e) => {
            println!("Package REJECTED: {}", e);
            Err(e)
        }
    }
}

fn cmd_status(
    config: &RootConfig,
    job: &str,
    actor: &str,
    records: Option<&Path>,
) -> RootResult<()> {
    let service = build_service(config, &load_fixture(records)?)?;
    let status = service.get_status(parse_job_id(job)?, &ActorId::new(actor))?;
    print_json(&status)
}

fn cmd_list(
    config: &RootConfig,
    actor: &str,
    state: Option<&str>,
    records: Option<&Path>,
) -> RootResult<()> {
    let state = state
        .map(|s| {
            ExportJobState::parse(s).ok_or_else(|| RootError::Config(format!("unknown state: {s}")))
        })
        .transpose()?;
    let service = build_service(config, &load_fixture(records)?)?;
    print_json(&service.list_jobs(&ActorId::new(actor), state)?)
}

/// Reads the audit log directly; no secrets are needed.
fn cmd_audit(config: &RootConfig, resource: &str, limit: usize) -> RootResult<()> {
    let store = JsonlAuditStore::new(config.storage.audit_log());
    let entries = store.load()?;
    let chain_ok = verify_entries(&entries);
    let resource = ResourceId::new(resource);
    let matching: Vec<_> = entries
        .iter()
        .filter(|e| e.record.resource_id == resource)
        .collect();

    println!(
        "Audit Log for {} ({} entries, chain {}):",
        resource,
        matching.len(),
        if chain_ok { "intact" } else { "BROKEN" }
    );
    if matching.is_empty() {
        println!("  (no entries)");
    }
    for entry in matching.iter().rev().take(limit).rev() {
        println!(
            "  #{:<6} {} {:<18} actor={} {}",
            entry.sequence,
            entry.record.occurred_at,
            entry.record.kind.label(),
            entry
                .record
                .actor_id
                .as_ref()
                .map(|a| a.as_str())
                .unwrap_or("-"),
            serde_json::to_string(&entry.record.kind)?
        );
    }
    Ok(())
}
