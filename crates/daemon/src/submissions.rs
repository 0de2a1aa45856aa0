//! Submission inbox
//!
//! External tools hand new work to the daemon by dropping
//! `input-<unix-ts>.json` files into the state directory. Each file holds a
//! JSON array of job records. Files are ingested oldest first, the ledger is
//! saved, and only then is the submission file deleted.

use crate::job::{JobRecord, JobStatus, Uid};
use crate::ledger::{Ledger, LedgerError};
use shipper_config::PathsConfig;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const SUBMISSION_PREFIX: &str = "input-";
const SUBMISSION_SUFFIX: &str = ".json";

/// A submission file waiting in the state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub path: PathBuf,
    pub timestamp: u64,
}

/// Timestamp encoded in a submission file name, if the name is one.
///
/// Matches `input-<digits>.json` exactly.
pub fn submission_timestamp(file_name: &str) -> Option<u64> {
    let digits = file_name
        .strip_prefix(SUBMISSION_PREFIX)?
        .strip_suffix(SUBMISSION_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Submission files directly inside `dir`, oldest first.
pub fn scan_submissions(dir: &Path) -> Vec<Submission> {
    if !dir.exists() {
        return Vec::new();
    }

    let mut found: Vec<Submission> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let timestamp = entry.file_name().to_str().and_then(submission_timestamp)?;
            Some(Submission {
                path: entry.into_path(),
                timestamp,
            })
        })
        .collect();

    found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));
    found
}

/// Reads submission files and turns them into ledger records.
#[derive(Debug)]
pub struct SubmissionInbox {
    dir: PathBuf,
    input_root: PathBuf,
    output_root: PathBuf,
    /// Files already reported as unparseable
    warned: HashSet<PathBuf>,
    /// Ingested files that could not be deleted
    retired: HashSet<PathBuf>,
}

impl SubmissionInbox {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            dir: paths.state_dir.clone(),
            input_root: paths.input_dir.clone(),
            output_root: paths.output_dir.clone(),
            warned: HashSet::new(),
            retired: HashSet::new(),
        }
    }

    /// Ingest every pending submission into `ledger`.
    ///
    /// Returns the uids assigned. A failed ledger save is returned as an error
    /// and leaves the submission file in place.
    pub fn ingest(&mut self, ledger: &Ledger) -> Result<Vec<Uid>, LedgerError> {
        let mut assigned = Vec::new();

        for submission in scan_submissions(&self.dir) {
            if self.retired.contains(&submission.path) {
                continue;
            }

            let Some(records) = self.read(&submission.path) else {
                continue;
            };

            let count = records.len();
            let uids = ledger.ingest(records);
            ledger.save()?;
            info!(
                file = %submission.path.display(),
                jobs = count,
                "Ingested submission"
            );

            self.retire(&submission.path);
            assigned.extend(uids);
        }

        Ok(assigned)
    }

    /// Parse one submission file. Unparseable files are left where they are.
    fn read(&mut self, path: &Path) -> Option<Vec<JobRecord>> {
        let parsed = fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<Vec<JobRecord>>(&bytes).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(records) => {
                self.warned.remove(path);
                Some(records.into_iter().map(|r| self.normalise(r)).collect())
            }
            Err(e) => {
                if self.warned.insert(path.to_path_buf()) {
                    warn!(file = %path.display(), "Cannot read submission, leaving it in place: {}", e);
                } else {
                    debug!(file = %path.display(), "Submission still unreadable: {}", e);
                }
                None
            }
        }
    }

    /// Make a submitted record fit for the ledger: absolute paths, a
    /// schedulable status and no leftover progress.
    pub fn normalise(&self, mut record: JobRecord) -> JobRecord {
        if record.input_file.is_relative() {
            record.input_file = self.input_root.join(&record.input_file);
        }
        if record.encoded_file.is_relative() {
            record.encoded_file = self.output_root.join(&record.encoded_file);
        }

        match record.status {
            JobStatus::NotStarted | JobStatus::Copied => {}
            other => {
                warn!(
                    name = %record.label(),
                    "Submitted job has status {}, treating it as not_started",
                    other
                );
                record.status = JobStatus::NotStarted;
                record.frames = None;
            }
        }
        record.error = None;
        record.current_frame = 0;

        if record.before_size == 0 {
            if let Ok(meta) = fs::metadata(&record.input_file) {
                record.before_size = meta.len();
            }
        }

        record
    }

    fn retire(&mut self, path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    file = %path.display(),
                    "Ingested submission could not be deleted, it will be ignored: {}",
                    e
                );
                self.retired.insert(path.to_path_buf());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn paths(dir: &Path) -> PathsConfig {
        PathsConfig {
            state_dir: dir.to_path_buf(),
            input_dir: PathBuf::from("/media/in"),
            output_dir: PathBuf::from("/media/out"),
        }
    }

    fn write_submission(dir: &Path, ts: u64, body: &str) -> PathBuf {
        let path = dir.join(format!("input-{}.json", ts));
        fs::write(&path, body).unwrap();
        path
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_submission_name_round_trip(ts in any::<u64>()) {
            let name = format!("input-{}.json", ts);
            prop_assert_eq!(submission_timestamp(&name), Some(ts));
        }

        #[test]
        fn prop_non_digit_names_are_rejected(middle in "[a-z_]{1,12}") {
            let name = format!("input-{}.json", middle);
            prop_assert_eq!(submission_timestamp(&name), None);
        }
    }

    #[test]
    fn test_submission_timestamp_edge_cases() {
        assert_eq!(submission_timestamp("input-1700000000.json"), Some(1_700_000_000));
        assert_eq!(submission_timestamp("input-.json"), None);
        assert_eq!(submission_timestamp("input-12.json.tmp"), None);
        assert_eq!(submission_timestamp("xinput-12.json"), None);
        assert_eq!(submission_timestamp("input-+12.json"), None);
        assert_eq!(submission_timestamp("data.json"), None);
    }

    #[test]
    fn test_scan_orders_by_timestamp_and_ignores_others() {
        let dir = TempDir::new().unwrap();
        write_submission(dir.path(), 300, "[]");
        write_submission(dir.path(), 20, "[]");
        fs::write(dir.path().join("data.json"), "{}").unwrap();
        fs::write(dir.path().join("stop.flag"), "").unwrap();
        fs::create_dir(dir.path().join("input-5.json")).unwrap();

        let found: Vec<u64> = scan_submissions(dir.path())
            .into_iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(found, vec![20, 300]);
    }

    #[test]
    fn test_ingest_saves_before_deleting() {
        let dir = TempDir::new().unwrap();
        let file = write_submission(
            dir.path(),
            1,
            r#"[
                {"name": "A", "status": "notstarted", "quality": "high",
                 "input_file": "a.mkv", "encoded_file": "A/A.mkv"},
                {"name": "B", "status": "encoding", "quality": "low",
                 "input_file": "/abs/b.mkv", "encoded_file": "/abs/out/b.mkv",
                 "frames": 99, "current_frame": 50}
            ]"#,
        );
        let ledger = Ledger::load(dir.path().join("data.json")).unwrap();
        let mut inbox = SubmissionInbox::new(&paths(dir.path()));

        let uids = inbox.ingest(&ledger).unwrap();

        assert_eq!(uids, vec![1, 2]);
        assert!(!file.exists());

        let saved = Ledger::load(dir.path().join("data.json")).unwrap();
        let a = saved.get(1).unwrap();
        assert_eq!(a.status, JobStatus::NotStarted);
        assert_eq!(a.input_file, PathBuf::from("/media/in/a.mkv"));
        assert_eq!(a.encoded_file, PathBuf::from("/media/out/A/A.mkv"));

        let b = saved.get(2).unwrap();
        assert_eq!(b.status, JobStatus::NotStarted);
        assert_eq!(b.frames, None);
        assert_eq!(b.current_frame, 0);
        assert_eq!(b.input_file, PathBuf::from("/abs/b.mkv"));
    }

    #[test]
    fn test_unparseable_submission_is_left_in_place() {
        let dir = TempDir::new().unwrap();
        let bad = write_submission(dir.path(), 1, "[{\"name\": ");
        write_submission(
            dir.path(),
            2,
            r#"[{"quality": "high", "input_file": "/a", "encoded_file": "/b"}]"#,
        );
        let ledger = Ledger::from_jobs(dir.path().join("data.json"), BTreeMap::new());
        let mut inbox = SubmissionInbox::new(&paths(dir.path()));

        let uids = inbox.ingest(&ledger).unwrap();
        assert_eq!(uids.len(), 1);
        assert!(bad.exists());

        // A second pass retries the bad file without ingesting anything new.
        let uids = inbox.ingest(&ledger).unwrap();
        assert!(uids.is_empty());
        assert!(bad.exists());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_copied_status_is_kept() {
        let dir = TempDir::new().unwrap();
        let inbox = SubmissionInbox::new(&paths(dir.path()));
        let mut record = JobRecord::new("/a.mkv", "/b.mkv", "high");
        record.status = JobStatus::Copied;

        assert_eq!(inbox.normalise(record).status, JobStatus::Copied);
    }

    #[test]
    fn test_before_size_filled_from_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mkv");
        fs::write(&input, vec![0u8; 2048]).unwrap();
        let inbox = SubmissionInbox::new(&paths(dir.path()));

        let record = inbox.normalise(JobRecord::new(&input, "/out.mkv", "high"));
        assert_eq!(record.before_size, 2048);
    }
}
