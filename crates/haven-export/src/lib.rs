//! Haven Export
//!
//! The event-sourced export job and the pipeline that drives it.
//!
//! - `ExportJob`: QUEUED → MATERIALIZING → VALIDATING → COMPLETE, with
//!   FAILED reachable from any open state. State is the fold of
//!   `ExportJobEvent`s through `apply`, live and on replay alike
//! - Materialization runs every source record through the confidentiality
//!   policy engine and pseudonymizes subject identifiers
//! - `SuppressionAggregator` masks aggregate counts of 1 to 4
//! - `ExportPipeline` validates, formats, packages and stores each job,
//!   appending every transition to an `EventStore` and the audit sink

pub mod cancel;
pub mod error;
pub mod event;
pub mod event_store;
pub mod formatter;
pub mod job;
pub mod materialize;
pub mod pipeline;
pub mod record;
pub mod responses;
pub mod suppression;
pub mod validation;

pub use cancel::{CancellationFlag, Interrupt, PhaseGuard};
pub use error::{ErrorCode, ExportError, ExportResult};
pub use event::ExportJobEvent;
pub use event_store::{EventStore, InMemoryEventStore, JsonlEventStore};
pub use formatter::{CsvFormatter, Formatter, JsonLinesFormatter, NormalizedTable};
pub use job::{
    apply, CompletionRecord, ExportFilters, ExportJob, ExportType, FailureRecord, ReportingPeriod,
};
pub use materialize::{aggregate, HashMode, Materialized, Materializer, PERSONAL_ID_COLUMN};
pub use pipeline::{ExportPipeline, PipelineContext, PipelineSettings, AGGREGATES_SECTION};
pub use record::{
    FieldValue, InMemoryDirectory, InMemoryRecordSource, RecordSource, SourceQuery, SourceRecord,
};
pub use responses::{
    DisabilityResponse, DomesticViolenceResponse, FivePointResponse, IncomeResponse,
};
pub use suppression::{CellValue, SuppressionAggregator, DEFAULT_MARKER, SUPPRESSION_THRESHOLD};
pub use validation::{
    CompositeValidator, ExportValidator, PersonalIdValidator, RequiredSectionsValidator,
    DEFAULT_REQUIRED_SECTIONS,
};
