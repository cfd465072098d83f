//! Events a running job emits to the presentation layer

use rate_meter::RateSnapshot;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::types::JobKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Human-readable log line, e.g. `downloading K -> L (N bytes)`
    ProgressLine { job_id: u64, text: String },
    /// Throttled batch-wide byte counter
    BatchProgress {
        job_id: u64,
        done_bytes: u64,
        total_bytes: u64,
    },
    /// Smoothed rate and ETA, once per tick
    Rate {
        job_id: u64,
        #[serde(flatten)]
        snapshot: RateSnapshot,
    },
    JobFinished {
        job_id: u64,
        kind: JobKind,
        cancelled: bool,
        error: Option<String>,
    },
    /// A mutating job touched the namespace; re-list once.
    RefreshNeeded { job_id: u64 },
}

impl JobEvent {
    pub fn job_id(&self) -> u64 {
        match self {
            JobEvent::ProgressLine { job_id, .. }
            | JobEvent::BatchProgress { job_id, .. }
            | JobEvent::Rate { job_id, .. }
            | JobEvent::JobFinished { job_id, .. }
            | JobEvent::RefreshNeeded { job_id } => *job_id,
        }
    }

    /// Byte-progress events: the ones that must stop after a cancel.
    pub fn is_progress(&self) -> bool {
        matches!(self, JobEvent::BatchProgress { .. } | JobEvent::Rate { .. })
    }
}

/// Receiver side of job events. Emission must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JobEvent);
}

impl EventSink for UnboundedSender<JobEvent> {
    fn emit(&self, event: JobEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event);
    }
}
