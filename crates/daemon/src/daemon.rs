//! Scheduler loop for the shipper daemon
//!
//! One control task owns the worker pools and drives every state change:
//! ingest submissions, reconcile finished workers, dispatch new work into free
//! slots, persist the ledger, then sleep until the next cycle.

use crate::encode::Encoder;
use crate::flags::{ControlFlags, FlagState};
use crate::job::{unix_now, JobRecord, JobStatus, Uid};
use crate::ledger::{Ledger, LedgerError};
use crate::lifecycle::{ShutdownController, ShutdownLevel, ShutdownSignal};
use crate::probe::Prober;
use crate::recovery::{remove_stale_outputs, RecoveryReport};
use crate::submissions::SubmissionInbox;
use crate::workers::{spawn_encode, spawn_probe, WorkerKind, WorkerOutcome, WorkerPool};
use shipper_config::{Config, ConfigError};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Extra time, beyond the kill grace period, allowed for worker tasks to
/// report back during shutdown
const WORKER_EXIT_MARGIN: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The ledger could not be loaded or saved
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Filesystem error outside the ledger
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stopped by a forced shutdown; running jobs were terminated
    #[error("Forced shutdown, {0} running job(s) terminated")]
    Forced(usize),
}

/// Whether the scheduler should keep going after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// Stop was requested and no workers remain
    Finished,
}

/// Daemon state: the ledger, the worker pools and the control plane
pub struct Daemon {
    config: Config,
    ledger: Ledger,
    flags: ControlFlags,
    inbox: SubmissionInbox,
    probe_pool: WorkerPool,
    encode_pool: WorkerPool,
    prober: Prober,
    encoder: Arc<Encoder>,
    controller: ShutdownController,
    signal: ShutdownSignal,
    recovered: bool,
    stopping: bool,
}

impl Daemon {
    /// Initialize the daemon with an existing configuration
    ///
    /// Creates the state directory if needed and loads the ledger. Recovery
    /// is not run yet; see [`Daemon::recover`].
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        fs::create_dir_all(&config.paths.state_dir)?;
        let ledger = Ledger::load(config.ledger_path())?;

        let grace = Duration::from_secs(config.scheduler.shutdown_grace_secs);
        let prober = Prober::new(config.tools.ffprobe.clone(), grace);
        let encoder = Arc::new(Encoder::new(
            config.tools.ffmpeg.clone(),
            prober.clone(),
            config.quality_presets.clone(),
            config.disk.buffer_bytes(),
            grace,
        ));

        let controller = ShutdownController::new();
        let signal = controller.subscribe();

        info!(
            ledger = %ledger.path().display(),
            jobs = ledger.len(),
            "Loaded ledger"
        );

        Ok(Self {
            flags: ControlFlags::new(&config.paths.state_dir),
            inbox: SubmissionInbox::new(&config.paths),
            probe_pool: WorkerPool::new(WorkerKind::Probe, config.job_limits.probe),
            encode_pool: WorkerPool::new(WorkerKind::Encode, config.job_limits.encode),
            config,
            ledger,
            prober,
            encoder,
            controller,
            signal,
            recovered: false,
            stopping: false,
        })
    }

    /// Load configuration from file (with environment overrides) and
    /// initialize the daemon
    pub fn from_config_file<P: AsRef<Path>>(path: P) -> Result<Self, DaemonError> {
        let config = Config::load(path)?;
        Self::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn flags(&self) -> &ControlFlags {
        &self.flags
    }

    /// Controller for wiring interrupts into this daemon
    pub fn shutdown_controller(&self) -> ShutdownController {
        self.controller.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn active_workers(&self) -> usize {
        self.probe_pool.active() + self.encode_pool.active()
    }

    /// Startup recovery: clear stale flags, repair interrupted jobs under
    /// the ledger lock, then delete partial outputs outside it.
    pub fn recover(&mut self) -> RecoveryReport {
        self.flags.clear_stale();

        let report = self.ledger.recover(self.config.recovery.error_policy);
        let removed = remove_stale_outputs(&report);

        if report.is_clean() {
            debug!("Ledger needed no recovery");
        } else {
            info!(
                reprobe = report.reprobe,
                requeued = report.requeued,
                pruned = report.pruned,
                errors_reset = report.errors_reset,
                errors_deleted = report.errors_deleted,
                partial_outputs_removed = removed,
                "Recovery pass complete"
            );
        }

        self.recovered = true;
        report
    }

    /// Move pending submission files into the ledger.
    pub fn ingest_submissions(&mut self) -> Result<Vec<Uid>, DaemonError> {
        Ok(self.inbox.ingest(&self.ledger)?)
    }

    /// Apply the outcome of every finished worker and free its slot.
    ///
    /// Returns the number of workers reconciled.
    pub async fn reconcile(&mut self) -> usize {
        if !self.probe_pool.has_finished_workers() && !self.encode_pool.has_finished_workers() {
            return 0;
        }

        let mut finished = self.probe_pool.take_finished();
        finished.extend(self.encode_pool.take_finished());

        let count = finished.len();
        for handle in finished {
            let kind = handle.kind;
            let uid = handle.uid;
            let elapsed = handle.elapsed();
            let outcome = handle.join().await;
            self.apply_outcome(kind, uid, outcome, elapsed);
        }
        count
    }

    fn apply_outcome(&self, kind: WorkerKind, uid: Uid, outcome: WorkerOutcome, elapsed: Duration) {
        let result = match (kind, outcome) {
            (WorkerKind::Probe, WorkerOutcome::Probed { frames }) => {
                info!(uid, frames, "Frame count complete");
                self.ledger.apply(uid, |job| job.complete_probe(frames))
            }
            (WorkerKind::Encode, WorkerOutcome::Encoded { size_after }) => {
                info!(
                    uid,
                    size_after = size_after.unwrap_or(0),
                    elapsed_secs = elapsed.as_secs(),
                    "Encode complete"
                );
                let now = unix_now();
                self.ledger.apply(uid, |job| job.complete_encode(size_after, now))
            }
            (_, WorkerOutcome::Failed(reason)) => {
                error!(uid, kind = %kind, "Job failed: {}", reason);
                self.ledger.apply(uid, |job| job.fail(reason))
            }
            (_, WorkerOutcome::Interrupted) => {
                let target = match kind {
                    WorkerKind::Probe => JobStatus::NotStarted,
                    WorkerKind::Encode => JobStatus::ReadyToEncode,
                };
                warn!(uid, kind = %kind, "Worker interrupted, job returns to {}", target);
                self.ledger.apply(uid, |job| job.transition(target))
            }
            (kind, outcome) => {
                let reason = format!("worker fault: {} worker reported {:?}", kind, outcome);
                error!(uid, "{}", reason);
                self.ledger.apply(uid, |job| job.fail(reason))
            }
        };

        if let Err(e) = result {
            warn!(uid, "Could not record worker outcome: {}", e);
        }
    }

    /// Start workers for waiting jobs, oldest first, up to each pool's free
    /// slots. Returns the number started.
    pub fn dispatch(&mut self) -> usize {
        let mut started = 0;

        let slots = self.probe_pool.free_slots();
        for (uid, job) in self.ledger.claim(JobStatus::NotStarted, slots, JobRecord::begin_probe) {
            info!(uid, name = %job.label(), "Starting frame count");
            let handle = spawn_probe(uid, &job, self.prober.clone(), self.controller.subscribe());
            self.probe_pool.push(handle);
            started += 1;
        }

        let slots = self.encode_pool.free_slots();
        let now = unix_now();
        for (uid, job) in self
            .ledger
            .claim(JobStatus::ReadyToEncode, slots, |job| job.begin_encode(now))
        {
            info!(
                uid,
                name = %job.label(),
                quality = %job.quality_key,
                frames = job.known_frames().unwrap_or(0),
                "Starting encode"
            );
            let handle = spawn_encode(
                uid,
                &job,
                Arc::clone(&self.encoder),
                self.ledger.clone(),
                self.controller.subscribe(),
            );
            self.encode_pool.push(handle);
            started += 1;
        }

        started
    }

    /// Write the ledger to disk
    pub fn persist(&self) -> Result<(), DaemonError> {
        self.ledger.save()?;
        Ok(())
    }

    /// Re-evaluate whether dispatch is suspended.
    fn refresh_stop_state(&mut self) {
        let flag = self.flags.poll();
        if flag == FlagState::Cancelled {
            self.controller.resume();
        }

        let stopping =
            flag == FlagState::Stop || self.controller.level() >= ShutdownLevel::Graceful;

        if stopping && !self.stopping {
            let mut running = self.probe_pool.uids();
            running.extend(self.encode_pool.uids());
            info!(
                ?running,
                "Stop requested: no new jobs will start, waiting for running jobs"
            );
        } else if !stopping && self.stopping {
            info!("Stop withdrawn, resuming dispatch");
        }
        self.stopping = stopping;
    }

    fn log_progress(&self) {
        for handle in self.encode_pool.iter() {
            debug!(
                uid = handle.uid,
                frame = handle.progress(),
                elapsed_secs = handle.elapsed().as_secs(),
                "Encoding"
            );
        }
    }

    /// One scheduling cycle: ingest, reconcile, dispatch unless stopping,
    /// persist.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, DaemonError> {
        self.ingest_submissions()?;
        self.reconcile().await;
        self.refresh_stop_state();

        if !self.stopping {
            self.dispatch();
        }
        self.log_progress();
        self.persist()?;

        if self.stopping && self.active_workers() == 0 {
            Ok(CycleOutcome::Finished)
        } else {
            Ok(CycleOutcome::Continue)
        }
    }

    async fn run_loop(&mut self) -> Result<(), DaemonError> {
        let poll = Duration::from_millis(self.config.scheduler.poll_interval_ms);

        loop {
            if self.signal.is_forced() {
                let terminated = self.shutdown_workers().await;
                return Err(DaemonError::Forced(terminated));
            }

            if self.run_cycle().await? == CycleOutcome::Finished {
                return Ok(());
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.signal.changed() => {}
            }
        }
    }

    /// Run the daemon until a stop completes.
    ///
    /// Runs the recovery pass first if it has not run yet. Whatever ends the
    /// loop, remaining workers are terminated and jobs left in `error` are
    /// listed in the log before returning.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        if !self.recovered {
            self.recover();
        }

        info!(
            probe_limit = self.probe_pool.limit(),
            encode_limit = self.encode_pool.limit(),
            poll_interval_ms = self.config.scheduler.poll_interval_ms,
            "Scheduler started"
        );

        let result = self.run_loop().await;
        match &result {
            Ok(()) => info!("All running jobs finished, shutting down"),
            Err(DaemonError::Forced(terminated)) => {
                warn!(terminated, "Forced shutdown, ledger left for recovery")
            }
            Err(e) => error!("Scheduler stopped: {}", e),
        }

        self.shutdown_workers().await;
        self.log_error_summary();
        result
    }

    /// Force every remaining worker to stop and wait (bounded) for it.
    ///
    /// Returns the number of workers that were still running.
    async fn shutdown_workers(&mut self) -> usize {
        let mut handles = self.probe_pool.drain();
        handles.extend(self.encode_pool.drain());
        if handles.is_empty() {
            return 0;
        }

        self.controller.force();
        let count = handles.len();
        info!(workers = count, "Terminating running workers");

        let deadline = Instant::now()
            + Duration::from_secs(self.config.scheduler.shutdown_grace_secs)
            + WORKER_EXIT_MARGIN;
        for handle in handles {
            let uid = handle.uid;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = handle.join_within(remaining).await;
            debug!(uid, ?outcome, "Worker stopped");
        }
        count
    }

    fn log_error_summary(&self) {
        let errored = self.ledger.errored();
        if errored.is_empty() {
            return;
        }

        error!(count = errored.len(), "Jobs in error state");
        for (uid, job) in errored {
            error!(
                uid,
                name = %job.label(),
                "{}",
                job.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}
