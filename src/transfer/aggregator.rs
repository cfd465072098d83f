//! Batch-wide progress from per-object byte callbacks

use rate_meter::Throttle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use super::cancel::CancelToken;
use super::events::{EventSink, JobEvent};

/// Running totals of one job. Cumulative counts are remembered per transfer
/// (item index plus key) so a repeated or out-of-order callback never counts
/// twice, while the same key appearing in two items still counts for both.
#[derive(Debug, Default)]
pub struct AggregatorState {
    total: u64,
    done: u64,
    last_seen: HashMap<(usize, String), u64>,
    throttle: Throttle,
}

impl AggregatorState {
    pub fn begin(&mut self, total: u64) {
        self.total = total;
    }

    /// Fold in `cumulative` bytes for `key` of item `item`; returns the batch
    /// total when it is time to emit.
    pub fn record(&mut self, item: usize, key: &str, cumulative: u64, now: Instant) -> Option<u64> {
        let last = self.last_seen.entry((item, key.to_string())).or_insert(0);
        if cumulative <= *last {
            return None;
        }
        self.done += cumulative - *last;
        *last = cumulative;
        self.throttle.check(now, self.done).then_some(self.done)
    }

    pub fn done(&self) -> u64 {
        self.done
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Turns byte callbacks into throttled [`JobEvent::BatchProgress`] events.
pub struct ProgressAggregator {
    job_id: u64,
    state: Mutex<AggregatorState>,
    token: CancelToken,
    sink: Arc<dyn EventSink>,
}

impl ProgressAggregator {
    pub fn new(job_id: u64, token: CancelToken, sink: Arc<dyn EventSink>) -> Self {
        Self {
            job_id,
            state: Mutex::new(AggregatorState::default()),
            token,
            sink,
        }
    }

    /// Fix the denominator before any byte moves.
    pub fn begin(&self, total: u64) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).begin(total);
    }

    pub fn record(&self, item: usize, key: &str, cumulative: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = state.record(item, key, cumulative, Instant::now()) {
            self.emit(done, state.total());
        }
    }

    /// Final 100% event for a completed job.
    pub fn finish(&self) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let total = state.total().max(state.done());
        self.emit(total, total);
    }

    /// `(done, total)` right now.
    pub fn snapshot(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (state.done(), state.total())
    }

    fn emit(&self, done_bytes: u64, total_bytes: u64) {
        if self.token.is_cancelled() {
            return;
        }
        self.sink.emit(JobEvent::BatchProgress {
            job_id: self.job_id,
            done_bytes,
            total_bytes,
        });
    }
}
