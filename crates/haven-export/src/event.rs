use haven_core::{ActorId, ExportJobId, ExportJobState, Timestamp};
use serde::{Deserialize, Serialize};

use crate::job::{CompletionRecord, ExportFilters, ExportType, FailureRecord, ReportingPeriod};

/// Everything that can happen to an export job. A job's state is the fold
/// of its events through `job::apply`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExportJobEvent {
    Queued {
        job_id: ExportJobId,
        export_type: ExportType,
        period: ReportingPeriod,
        filters: ExportFilters,
        requested_by: ActorId,
        reason: String,
        occurred_at: Timestamp,
    },
    StateChanged {
        job_id: ExportJobId,
        from: ExportJobState,
        to: ExportJobState,
        records_processed: Option<u64>,
        occurred_at: Timestamp,
    },
    Completed {
        job_id: ExportJobId,
        completion: CompletionRecord,
        occurred_at: Timestamp,
    },
    Failed {
        job_id: ExportJobId,
        from: ExportJobState,
        failure: FailureRecord,
        occurred_at: Timestamp,
    },
}

impl ExportJobEvent {
    pub fn job_id(&self) -> ExportJobId {
        match self {
            ExportJobEvent::Queued { job_id, .. }
            | ExportJobEvent::StateChanged { job_id, .. }
            | ExportJobEvent::Completed { job_id, .. }
            | ExportJobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn occurred_at(&self) -> Timestamp {
        match self {
            ExportJobEvent::Queued { occurred_at, .. }
            | ExportJobEvent::StateChanged { occurred_at, .. }
            | ExportJobEvent::Completed { occurred_at, .. }
            | ExportJobEvent::Failed { occurred_at, .. } => *occurred_at,
        }
    }

    /// State the job is in after this event.
    pub fn target_state(&self) -> ExportJobState {
        match self {
            ExportJobEvent::Queued { .. } => ExportJobState::Queued,
            ExportJobEvent::StateChanged { to, .. } => *to,
            ExportJobEvent::Completed { .. } => ExportJobState::Complete,
            ExportJobEvent::Failed { .. } => ExportJobState::Failed,
        }
    }
}
