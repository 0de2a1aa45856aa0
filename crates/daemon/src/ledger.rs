//! Persistent job ledger
//!
//! The ledger is the single source of truth for job state. It lives in memory
//! behind a mutex and is written to `<state_dir>/data.json` as one JSON object
//! keyed by uid. Callers never see the raw map: every read returns a clone and
//! every write goes through a synchronous closure, so the lock is never held
//! across an `.await`.
//!
//! The highest uid ever issued is kept beside the ledger in `data.json.seq`,
//! so uids of jobs pruned by recovery are not handed out again after a
//! restart.

use crate::job::{JobRecord, JobStatus, TransitionError, Uid};
use crate::recovery::{recover_jobs, RecoveryReport};
use shipper_config::ErrorPolicy;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading or writing the ledger file failed
    #[error("Ledger IO error: {0}")]
    Io(#[from] io::Error),

    /// The ledger could not be serialized
    #[error("Ledger serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// No job with this uid
    #[error("Unknown job uid {0}")]
    UnknownJob(Uid),

    /// A status change was rejected by the state machine
    #[error("Job {uid}: {source}")]
    Transition {
        uid: Uid,
        #[source]
        source: TransitionError,
    },

    /// The file on disk could neither be read nor backed up
    #[error("Refusing to overwrite unreadable ledger {}", .0.display())]
    Protected(PathBuf),
}

#[derive(Debug, Default)]
struct LedgerState {
    jobs: BTreeMap<Uid, JobRecord>,
    /// Highest uid ever issued for this ledger. Never decreases.
    high_water: Uid,
}

/// Shared handle to the job ledger.
///
/// Cloning is cheap; all clones see the same jobs.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
    state: Arc<Mutex<LedgerState>>,
    /// Set when the file on disk is unreadable and no backup could be made
    protected: bool,
}

impl Ledger {
    /// Load the ledger from `path`.
    ///
    /// A missing file yields an empty ledger. A file that cannot be read or
    /// parsed is copied aside as `<name>.corrupt-<unix-ts>` and an empty ledger
    /// is returned. If even the backup fails, the empty ledger refuses to
    /// `save()` so the original is never overwritten.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();

        let (jobs, problem) = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<Uid, JobRecord>>(&bytes) {
                Ok(jobs) => (jobs, None),
                Err(e) => (BTreeMap::new(), Some(format!("corrupt: {}", e))),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No ledger yet, starting empty");
                (BTreeMap::new(), None)
            }
            Err(e) => (BTreeMap::new(), Some(format!("unreadable: {}", e))),
        };

        let mut protected = false;
        if let Some(problem) = problem {
            match preserve_corrupt(&path) {
                Ok(backup) => warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    "Ledger is {}, starting empty",
                    problem
                ),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        "Ledger is {} and could not be backed up ({}), starting empty without saving",
                        problem,
                        e
                    );
                    protected = true;
                }
            }
        }

        let mut ledger = Self::from_jobs(path, jobs);
        ledger.protected = protected;
        if let Some(issued) = read_high_water(&ledger.seq_path()) {
            let mut state = ledger.lock();
            state.high_water = state.high_water.max(issued);
        }
        Ok(ledger)
    }

    /// Build a ledger around an existing job map.
    pub fn from_jobs(path: impl Into<PathBuf>, jobs: BTreeMap<Uid, JobRecord>) -> Self {
        let high_water = jobs.keys().next_back().copied().unwrap_or(0);
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(LedgerState { jobs, high_water })),
            protected: false,
        }
    }

    /// Location of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock cannot leave a half-applied record:
        // closures mutate one record in place and the map stays well formed.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seq_path(&self) -> PathBuf {
        sibling(&self.path, ".seq")
    }

    /// Write the ledger atomically: serialize under the lock, write a
    /// temporary sibling outside it, then rename over the real file.
    ///
    /// The uid high-water mark is written first, so it is never behind the
    /// uids in the saved ledger.
    pub fn save(&self) -> Result<(), LedgerError> {
        if self.protected {
            return Err(LedgerError::Protected(self.path.clone()));
        }

        let (bytes, high_water) = {
            let state = self.lock();
            (serde_json::to_vec(&state.jobs)?, state.high_water)
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        write_atomic(&self.seq_path(), high_water.to_string().as_bytes())?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().jobs.is_empty()
    }

    /// Clone of one record
    pub fn get(&self, uid: Uid) -> Option<JobRecord> {
        self.lock().jobs.get(&uid).cloned()
    }

    /// Clone of the whole map
    pub fn snapshot(&self) -> BTreeMap<Uid, JobRecord> {
        self.lock().jobs.clone()
    }

    /// Number of jobs in `status`
    pub fn count(&self, status: JobStatus) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.status == status)
            .count()
    }

    /// Mutate one record under the lock.
    pub fn update<R>(
        &self,
        uid: Uid,
        f: impl FnOnce(&mut JobRecord) -> R,
    ) -> Result<R, LedgerError> {
        let mut state = self.lock();
        let job = state.jobs.get_mut(&uid).ok_or(LedgerError::UnknownJob(uid))?;
        Ok(f(job))
    }

    /// Apply a state-machine step to one record under the lock.
    ///
    /// A rejected transition leaves the record unchanged.
    pub fn apply(
        &self,
        uid: Uid,
        f: impl FnOnce(&mut JobRecord) -> Result<(), TransitionError>,
    ) -> Result<(), LedgerError> {
        self.update(uid, f)?
            .map_err(|source| LedgerError::Transition { uid, source })
    }

    /// Select up to `limit` jobs in `status` and move each one with `step`,
    /// all under a single lock acquisition.
    ///
    /// Returns the claimed uids with a clone of their updated records. Jobs
    /// whose step is rejected are skipped and left unchanged.
    pub fn claim(
        &self,
        status: JobStatus,
        limit: usize,
        mut step: impl FnMut(&mut JobRecord) -> Result<(), TransitionError>,
    ) -> Vec<(Uid, JobRecord)> {
        if limit == 0 {
            return Vec::new();
        }

        let mut state = self.lock();
        let mut claimed = Vec::new();
        for (uid, job) in state.jobs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if job.status != status {
                continue;
            }
            match step(job) {
                Ok(()) => claimed.push((*uid, job.clone())),
                Err(e) => warn!(uid = *uid, "Could not claim job: {}", e),
            }
        }
        claimed
    }

    /// Insert new records, assigning each a fresh uid.
    ///
    /// Uids continue from the highest uid this ledger has ever held, so a uid
    /// removed earlier in the process lifetime is never handed out again.
    pub fn ingest(&self, records: Vec<JobRecord>) -> Vec<Uid> {
        let mut state = self.lock();
        let mut uids = Vec::with_capacity(records.len());
        for record in records {
            state.high_water += 1;
            let uid = state.high_water;
            state.jobs.insert(uid, record);
            uids.push(uid);
        }
        uids
    }

    /// Run the startup recovery pass under the lock.
    pub fn recover(&self, policy: ErrorPolicy) -> RecoveryReport {
        let mut state = self.lock();
        recover_jobs(&mut state.jobs, policy)
    }

    /// Every job currently in `error`
    pub fn errored(&self) -> Vec<(Uid, JobRecord)> {
        self.lock()
            .jobs
            .iter()
            .filter(|(_, job)| job.status == JobStatus::Error)
            .map(|(uid, job)| (*uid, job.clone()))
            .collect()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "data.json".into());
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = sibling(path, ".tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Highest uid recorded in the sidecar, if it exists and is readable.
fn read_high_water(path: &Path) -> Option<Uid> {
    match fs::read_to_string(path) {
        Ok(text) => match text.trim().parse() {
            Ok(uid) => Some(uid),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unparseable uid sequence: {}", e);
                None
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), "Ignoring unreadable uid sequence: {}", e);
            None
        }
    }
}

/// Copy an unusable ledger file aside so a later save cannot destroy it.
fn preserve_corrupt(path: &Path) -> Result<PathBuf, LedgerError> {
    let backup = sibling(path, &format!(".corrupt-{}", crate::job::unix_now()));
    fs::copy(path, &backup)?;
    Ok(backup)
}
