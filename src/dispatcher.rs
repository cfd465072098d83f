//! Job dispatcher: runs transfer jobs off the caller's task and fans their
//! events out to subscribers.

use log::{info, warn};
use rate_meter::{RateMeter, TICK_INTERVAL};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::binder::BucketHandle;
use crate::config::TransferConfig;
use crate::transfer::{
    CancelToken, EventSink, JobContext, JobEvent, JobKind, JobOutcome, JobState, ProgressAggregator, TransferEngine,
    TransferJob,
};

/// Delivers every event to every live subscriber.
#[derive(Default)]
struct Fanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
}

impl EventSink for Fanout {
    fn emit(&self, event: JobEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// A submitted job.
pub struct JobHandle {
    id: u64,
    kind: JobKind,
    token: CancelToken,
    state: watch::Receiver<JobState>,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_watch(&self) -> watch::Receiver<JobState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        info!("job {}: cancel requested", self.id);
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to end.
    pub async fn wait(self) -> JobOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::Failed(format!("job task failed: {}", e)),
        }
    }
}

/// Running job count per kind. A kind stays active until its last job ends.
#[derive(Default)]
struct ActiveKinds {
    counts: Mutex<HashMap<JobKind, usize>>,
}

impl ActiveKinds {
    /// Count one more job of `kind`; returns how many were already running.
    fn enter(&self, kind: JobKind) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(kind).or_insert(0);
        *count += 1;
        *count - 1
    }

    fn leave(&self, kind: JobKind) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(&kind) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&kind);
            }
        }
    }

    fn contains(&self, kind: JobKind) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }
}

pub struct JobDispatcher {
    fanout: Arc<Fanout>,
    active: Arc<ActiveKinds>,
    next_id: AtomicU64,
    config: TransferConfig,
}

impl Default for JobDispatcher {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

impl JobDispatcher {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            fanout: Arc::new(Fanout::default()),
            active: Arc::new(ActiveKinds::default()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        self.config
    }

    /// Receive every event of every job submitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.fanout
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Whether any job of `kind` is still running.
    pub fn is_active(&self, kind: JobKind) -> bool {
        self.active.contains(kind)
    }

    /// Start `job` on its own task. Callers are expected not to submit a
    /// second job of a kind that is still active; doing so is only logged.
    pub fn submit(&self, handle: BucketHandle, kind: JobKind, job: TransferJob, refresh: bool) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancelToken::new();
        let (state_tx, state_rx) = watch::channel(JobState::Preparing);

        let running = self.active.enter(kind);
        if running > 0 {
            warn!("job {}: {} other {} job(s) still running", id, running, kind);
        }

        let sink: Arc<dyn EventSink> = self.fanout.clone();
        let aggregator = Arc::new(ProgressAggregator::new(id, token.clone(), sink.clone()));
        let ticker = (kind != JobKind::Delete).then(|| {
            tokio::spawn(run_ticker(
                id,
                aggregator.clone(),
                token.clone(),
                state_rx.clone(),
                sink.clone(),
            ))
        });

        let ctx = JobContext {
            job_id: id,
            token: token.clone(),
            sink: sink.clone(),
            aggregator,
            state: state_tx,
            refresh,
        };
        let engine = TransferEngine::new(handle, self.config);
        let active = self.active.clone();

        info!("job {}: starting {} of {} items", id, kind, job.len());
        let task = tokio::spawn(async move {
            ctx.line(format!("starting {}", kind));
            let outcome = engine.run(kind, &job, &ctx).await;

            if let Some(ticker) = ticker {
                // Terminal state stops the ticker; wait so no rate event trails
                // the finish event.
                let _ = ticker.await;
            }
            active.leave(kind);

            let text = match &outcome {
                JobOutcome::Completed => format!("{} completed", kind),
                JobOutcome::Cancelled => format!("{} cancelled", kind),
                JobOutcome::Failed(message) => format!("{} failed: {}", kind, message),
            };
            info!("job {}: {}", id, text);
            sink.emit(JobEvent::ProgressLine { job_id: id, text });
            sink.emit(JobEvent::JobFinished {
                job_id: id,
                kind,
                cancelled: outcome.is_cancelled(),
                error: outcome.error_message().map(str::to_string),
            });
            outcome
        });

        JobHandle {
            id,
            kind,
            token,
            state: state_rx,
            task,
        }
    }

    pub fn cancel(&self, handle: &JobHandle) {
        handle.cancel();
    }
}

/// Emit a smoothed rate snapshot every tick while the job is running.
async fn run_ticker(
    job_id: u64,
    aggregator: Arc<ProgressAggregator>,
    token: CancelToken,
    mut state: watch::Receiver<JobState>,
    sink: Arc<dyn EventSink>,
) {
    let mut meter = RateMeter::default();
    let mut interval = tokio::time::interval(TICK_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = token.cancelled() => break,
        }

        let current = *state.borrow();
        if current.is_terminal() || token.is_cancelled() {
            break;
        }
        if current != JobState::Running {
            continue;
        }

        let (done, total) = aggregator.snapshot();
        let snapshot = meter.snapshot(Instant::now(), done, total);
        sink.emit(JobEvent::Rate { job_id, snapshot });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::memory::MemoryServer;
    use crate::transfer::TransferItem;
    use std::time::Duration;

    fn handle(server: &Arc<MemoryServer>) -> BucketHandle {
        BucketHandle {
            bucket: "bk".to_string(),
            client: server.client("bk"),
        }
    }

    async fn collect_until_finished(rx: &mut mpsc::UnboundedReceiver<JobEvent>, job_id: u64) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            let done = matches!(event, JobEvent::JobFinished { job_id: id, .. } if id == job_id);
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn lines(events: &[JobEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                JobEvent::ProgressLine { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn completed_job_logs_start_and_end() {
        let server = MemoryServer::new();
        server.put("bk", "a", "1");
        let dispatcher = JobDispatcher::default();
        let mut rx = dispatcher.subscribe();

        let job = dispatcher.submit(handle(&server), JobKind::Delete, TransferJob::new(vec![TransferItem::delete("a")]), true);
        let id = job.id();
        let events = collect_until_finished(&mut rx, id).await;

        assert_eq!(lines(&events), vec!["starting delete", "deleting a", "delete completed"]);
        assert!(events.iter().any(|e| matches!(e, JobEvent::RefreshNeeded { .. })));
        assert_eq!(
            events.last(),
            Some(&JobEvent::JobFinished {
                job_id: id,
                kind: JobKind::Delete,
                cancelled: false,
                error: None,
            })
        );
        assert_eq!(job.wait().await, JobOutcome::Completed);
        assert!(!dispatcher.is_active(JobKind::Delete));
    }

    #[tokio::test]
    async fn failure_message_reaches_finish_event() {
        let server = MemoryServer::new();
        server.create_bucket("bk");
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::default();
        let mut rx = dispatcher.subscribe();

        let job = dispatcher.submit(
            handle(&server),
            JobKind::Download,
            TransferJob::new(vec![TransferItem::download("missing", dir.path().join("missing"), Some(1))]),
            false,
        );
        let events = collect_until_finished(&mut rx, job.id()).await;
        match events.last() {
            Some(JobEvent::JobFinished { cancelled, error, .. }) => {
                assert!(!cancelled);
                assert!(error.as_deref().unwrap().contains("NoSuchKey"));
            }
            other => panic!("unexpected last event {:?}", other),
        }
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(*job.state_watch().borrow(), JobState::Failed);
    }

    #[tokio::test]
    async fn cancel_mid_download_stops_progress() {
        // 4-byte chunks keep the download busy long enough to cancel it.
        let server = MemoryServer::with_limits(4, 1000);
        server.put("bk", "big", vec![1u8; 1024 * 1024]);
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = JobDispatcher::default();
        let mut rx = dispatcher.subscribe();

        let job = dispatcher.submit(
            handle(&server),
            JobKind::Download,
            TransferJob::new(vec![TransferItem::download("big", dir.path().join("big"), None)]),
            false,
        );
        let id = job.id();

        // Wait for the first byte progress, then cancel.
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            let started = matches!(event, JobEvent::BatchProgress { .. });
            events.push(event);
            if started {
                break;
            }
        }
        dispatcher.cancel(&job);
        let cancelled_at = events.len();
        events.extend(collect_until_finished(&mut rx, id).await);

        assert_eq!(job.wait().await, JobOutcome::Cancelled);
        let after: Vec<&JobEvent> = events[cancelled_at..].iter().collect();
        // Anything already queued at cancel time may still arrive; nothing after
        // the cancelled line may be progress.
        let cancel_line = after
            .iter()
            .position(|e| matches!(e, JobEvent::ProgressLine { text, .. } if text == "download cancelled"))
            .unwrap();
        assert!(after[cancel_line..].iter().all(|e| !e.is_progress()));
        match events.last() {
            Some(JobEvent::JobFinished { cancelled, error, .. }) => {
                assert!(*cancelled);
                assert_eq!(*error, None);
            }
            other => panic!("unexpected last event {:?}", other),
        }
        let written = std::fs::metadata(dir.path().join("big")).unwrap().len();
        assert!(written < 1024 * 1024);
    }

    #[tokio::test]
    async fn overlapping_jobs_of_one_kind_are_tracked() {
        let server = MemoryServer::new();
        server.put("bk", "a", "1");
        server.put("bk", "b", "1");
        let dispatcher = JobDispatcher::default();

        let first = dispatcher.submit(handle(&server), JobKind::Delete, TransferJob::new(vec![TransferItem::delete("a")]), false);
        assert!(dispatcher.is_active(JobKind::Delete));
        assert!(!dispatcher.is_active(JobKind::Upload));
        let second = dispatcher.submit(handle(&server), JobKind::Delete, TransferJob::new(vec![TransferItem::delete("b")]), false);
        assert_ne!(first.id(), second.id());

        assert_eq!(first.wait().await, JobOutcome::Completed);
        assert_eq!(second.wait().await, JobOutcome::Completed);
        assert!(server.keys("bk").is_empty());
        assert!(!dispatcher.is_active(JobKind::Delete));
    }

    #[test]
    fn kind_stays_active_until_its_last_job_ends() {
        let active = ActiveKinds::default();
        assert_eq!(active.enter(JobKind::Upload), 0);
        assert_eq!(active.enter(JobKind::Upload), 1);
        assert_eq!(active.enter(JobKind::Download), 0);

        active.leave(JobKind::Upload);
        assert!(active.contains(JobKind::Upload));
        active.leave(JobKind::Upload);
        assert!(!active.contains(JobKind::Upload));
        assert!(active.contains(JobKind::Download));

        active.leave(JobKind::Upload);
        assert!(!active.contains(JobKind::Upload));
        assert_eq!(active.enter(JobKind::Upload), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_reports_rate_while_running() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn EventSink> = Arc::new(tx);
        let token = CancelToken::new();
        let aggregator = Arc::new(ProgressAggregator::new(9, token.clone(), sink.clone()));
        aggregator.begin(100);
        let (state_tx, state_rx) = watch::channel(JobState::Running);
        let ticker = tokio::spawn(run_ticker(9, aggregator.clone(), token, state_rx, sink));

        aggregator.record(0, "k", 40);
        tokio::time::sleep(TICK_INTERVAL * 3).await;
        state_tx.send_replace(JobState::Completed);
        ticker.await.unwrap();

        let mut rates = 0;
        while let Ok(event) = rx.try_recv() {
            if let JobEvent::Rate { snapshot, .. } = event {
                assert_eq!(snapshot.total_bytes, 100);
                assert_eq!(snapshot.done_bytes, 40);
                rates += 1;
            }
        }
        assert!(rates >= 2, "{} rate events", rates);
    }
}
