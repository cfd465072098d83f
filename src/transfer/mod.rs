//! Batch transfers: download, upload and delete jobs with cooperative
//! cancellation and throttled progress.

mod aggregator;
mod cancel;
mod engine;
mod events;
mod types;

pub use aggregator::{AggregatorState, ProgressAggregator};
pub use cancel::CancelToken;
pub use engine::{local_target, placeholder_key, JobContext, TransferEngine};
pub use events::{EventSink, JobEvent};
pub use types::{JobKind, JobOutcome, JobState, TransferItem, TransferJob};
