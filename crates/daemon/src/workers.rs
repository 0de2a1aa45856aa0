//! Worker tasks and pools
//!
//! Each probe or encode runs in its own tokio task which owns the child
//! process outright. The scheduler keeps a [`WorkerHandle`] per task in a
//! bounded [`WorkerPool`] and learns the result by joining the task; the
//! outcome is applied to the ledger by the scheduler, never by the task.

use crate::encode::{EncodeRequest, Encoder};
use crate::job::{JobRecord, Uid};
use crate::ledger::Ledger;
use crate::lifecycle::ShutdownSignal;
use crate::probe::Prober;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Kind of work a worker does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Probe,
    Encode,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Probe => write!(f, "probe"),
            WorkerKind::Encode => write!(f, "encode"),
        }
    }
}

/// What a finished worker reports back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Frame count determined
    Probed { frames: u64 },
    /// Output written
    Encoded { size_after: Option<u64> },
    /// The job failed; the text becomes the job's error description
    Failed(String),
    /// Cut short by a forced shutdown
    Interrupted,
}

/// The scheduler's view of one running worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub kind: WorkerKind,
    pub uid: Uid,
    task: JoinHandle<WorkerOutcome>,
    progress: Arc<AtomicU64>,
    started_at: Instant,
}

impl WorkerHandle {
    /// Run `work` as a new task.
    pub fn spawn<F>(kind: WorkerKind, uid: Uid, progress: Arc<AtomicU64>, work: F) -> Self
    where
        F: Future<Output = WorkerOutcome> + Send + 'static,
    {
        Self {
            kind,
            uid,
            task: tokio::spawn(work),
            progress,
            started_at: Instant::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Last progress value the worker reported
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait for the task. A panicked task is reported as a failure and an
    /// aborted one as interrupted, so its job never stays in flight.
    pub async fn join(self) -> WorkerOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => WorkerOutcome::Interrupted,
            Err(e) => WorkerOutcome::Failed(format!("worker fault: {}", e)),
        }
    }

    /// Wait at most `limit` for the task; abort it if it is still running.
    pub async fn join_within(self, limit: Duration) -> WorkerOutcome {
        let kind = self.kind;
        let uid = self.uid;
        let abort = self.task.abort_handle();
        match tokio::time::timeout(limit, self.join()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(uid, kind = %kind, "Worker did not stop in time, aborting");
                abort.abort();
                WorkerOutcome::Interrupted
            }
        }
    }
}

/// Number of workers that may still be started
pub fn free_slots(limit: usize, active: usize) -> usize {
    limit.saturating_sub(active)
}

/// Bounded set of running workers of one kind
#[derive(Debug)]
pub struct WorkerPool {
    kind: WorkerKind,
    limit: usize,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(kind: WorkerKind, limit: usize) -> Self {
        Self {
            kind,
            limit,
            handles: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active(&self) -> usize {
        self.handles.len()
    }

    pub fn free_slots(&self) -> usize {
        free_slots(self.limit, self.active())
    }

    pub fn push(&mut self, handle: WorkerHandle) {
        debug_assert_eq!(handle.kind, self.kind);
        self.handles.push(handle);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.handles.iter()
    }

    pub fn uids(&self) -> Vec<Uid> {
        self.handles.iter().map(|h| h.uid).collect()
    }

    pub fn has_finished_workers(&self) -> bool {
        self.handles.iter().any(WorkerHandle::is_finished)
    }

    /// Remove and return every handle whose task has completed.
    pub fn take_finished(&mut self) -> Vec<WorkerHandle> {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
            .into_iter()
            .partition(WorkerHandle::is_finished);
        self.handles = running;
        finished
    }

    /// Remove and return every handle.
    pub fn drain(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.handles)
    }
}

/// Start a frame-count worker for `job`.
pub fn spawn_probe(uid: Uid, job: &JobRecord, prober: Prober, mut shutdown: ShutdownSignal) -> WorkerHandle {
    let input = job.input_file.clone();
    let progress = Arc::new(AtomicU64::new(0));
    let reported = Arc::clone(&progress);

    WorkerHandle::spawn(WorkerKind::Probe, uid, progress, async move {
        match prober.count_frames(&input, &mut shutdown).await {
            Ok(frames) => {
                reported.store(frames, Ordering::Relaxed);
                WorkerOutcome::Probed { frames }
            }
            Err(e) if e.is_interrupted() => WorkerOutcome::Interrupted,
            Err(e) => WorkerOutcome::Failed(e.to_string()),
        }
    })
}

/// Start an encode worker for `job`.
///
/// Progress reports go to the handle's counter and, under the ledger lock,
/// into the job's `current_frame`.
pub fn spawn_encode(
    uid: Uid,
    job: &JobRecord,
    encoder: Arc<Encoder>,
    ledger: Ledger,
    mut shutdown: ShutdownSignal,
) -> WorkerHandle {
    let request = EncodeRequest {
        uid,
        input: job.input_file.clone(),
        output: job.encoded_file.clone(),
        quality_key: job.quality_key.clone(),
        frames: job.known_frames(),
    };
    let progress = Arc::new(AtomicU64::new(0));
    let reported = Arc::clone(&progress);

    WorkerHandle::spawn(WorkerKind::Encode, uid, progress, async move {
        let on_progress = |frame: u64| {
            reported.fetch_max(frame, Ordering::Relaxed);
            if let Err(e) = ledger.update(uid, |job| job.record_progress(frame)) {
                debug!(uid, "Progress not recorded: {}", e);
            }
        };

        match encoder.encode(&request, on_progress, &mut shutdown).await {
            Ok(size_after) => WorkerOutcome::Encoded { size_after },
            Err(crate::encode::EncodeFailure::Killed(_)) if shutdown.is_forced() => {
                WorkerOutcome::Interrupted
            }
            Err(e) => WorkerOutcome::Failed(e.to_string()),
        }
    })
}
