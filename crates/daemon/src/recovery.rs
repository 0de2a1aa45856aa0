//! Startup recovery pass
//!
//! Brings a ledger left behind by an interrupted or crashed run back into a
//! state the scheduler can work from. The pass itself is pure over the job
//! map; removing partial output files is a separate step run after the ledger
//! lock has been released.

use crate::job::{JobRecord, JobStatus, Uid};
use shipper_config::ErrorPolicy;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{info, warn};

/// What the recovery pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `getting_frames` jobs sent back to `not_started`
    pub reprobe: usize,
    /// `encoding` jobs sent back to `ready_to_encode`
    pub requeued: usize,
    /// Finished jobs dropped from the ledger
    pub pruned: usize,
    /// `error` jobs reset under [`ErrorPolicy::Reset`]
    pub errors_reset: usize,
    /// `error` jobs dropped under [`ErrorPolicy::Delete`]
    pub errors_deleted: usize,
    /// `error` jobs left alone under [`ErrorPolicy::Ignore`]
    pub errors_kept: usize,
    /// Partial outputs of interrupted encodes, to be removed
    pub stale_outputs: Vec<PathBuf>,
}

impl RecoveryReport {
    /// Nothing needed fixing
    pub fn is_clean(&self) -> bool {
        self.reprobe == 0
            && self.requeued == 0
            && self.pruned == 0
            && self.errors_reset == 0
            && self.errors_deleted == 0
            && self.stale_outputs.is_empty()
    }
}

/// Apply the recovery rules to every job.
///
/// * `getting_frames` -> `not_started`
/// * `encoding` -> `ready_to_encode`, partial output scheduled for removal
/// * `encoded` / `copied` -> removed
/// * `error` -> handled by `policy`
///
/// Running the pass on its own output changes nothing.
pub fn recover_jobs(jobs: &mut BTreeMap<Uid, JobRecord>, policy: ErrorPolicy) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let mut doomed = Vec::new();

    for (uid, job) in jobs.iter_mut() {
        match job.status {
            JobStatus::Encoded | JobStatus::Copied => {
                doomed.push(*uid);
                report.pruned += 1;
            }
            JobStatus::GettingFrames => {
                if demote(*uid, job, JobStatus::NotStarted) {
                    info!(uid = *uid, name = %job.label(), "Resetting interrupted probe to not_started");
                    report.reprobe += 1;
                }
            }
            JobStatus::Encoding => {
                if demote(*uid, job, JobStatus::ReadyToEncode) {
                    info!(uid = *uid, name = %job.label(), "Resetting interrupted encode to ready_to_encode");
                    report.stale_outputs.push(job.encoded_file.clone());
                    report.requeued += 1;
                }
            }
            JobStatus::Error => match policy {
                ErrorPolicy::Reset => {
                    let target = if job.known_frames().is_some() {
                        JobStatus::ReadyToEncode
                    } else {
                        JobStatus::NotStarted
                    };
                    if demote(*uid, job, target) {
                        info!(uid = *uid, name = %job.label(), "Resetting failed job to {}", target);
                        if target == JobStatus::ReadyToEncode {
                            report.stale_outputs.push(job.encoded_file.clone());
                        }
                        report.errors_reset += 1;
                    }
                }
                ErrorPolicy::Delete => {
                    info!(uid = *uid, name = %job.label(), "Deleting failed job");
                    doomed.push(*uid);
                    report.errors_deleted += 1;
                }
                ErrorPolicy::Ignore => {
                    warn!(
                        uid = *uid,
                        name = %job.label(),
                        error = job.error.as_deref().unwrap_or("unknown"),
                        "Job remains in error"
                    );
                    report.errors_kept += 1;
                }
            },
            JobStatus::NotStarted | JobStatus::ReadyToEncode => {}
        }
    }

    for uid in doomed {
        jobs.remove(&uid);
    }

    report
}

fn demote(uid: Uid, job: &mut JobRecord, target: JobStatus) -> bool {
    match job.transition(target) {
        Ok(()) => true,
        Err(e) => {
            warn!(uid, "Recovery could not reset job: {}", e);
            false
        }
    }
}

/// Delete the partial outputs listed in `report`.
///
/// Files that are already gone are fine; any other failure is logged and
/// skipped. Returns how many files were actually removed.
pub fn remove_stale_outputs(report: &RecoveryReport) -> usize {
    let mut removed = 0;
    for path in &report.stale_outputs {
        match fs::remove_file(path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed partial output");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "Failed to remove partial output: {}", e),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn job(status: JobStatus, frames: Option<u64>) -> JobRecord {
        let mut job = JobRecord::new("/in/a.mkv", "/out/a.mkv", "high");
        job.status = status;
        job.frames = frames;
        if status == JobStatus::Error {
            job.error = Some("encoder exited with code 1".to_string());
        }
        job
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        proptest::sample::select(JobStatus::ALL.to_vec())
    }

    fn policy_strategy() -> impl Strategy<Value = ErrorPolicy> {
        prop_oneof![
            Just(ErrorPolicy::Reset),
            Just(ErrorPolicy::Delete),
            Just(ErrorPolicy::Ignore),
        ]
    }

    fn jobs_strategy() -> impl Strategy<Value = BTreeMap<Uid, JobRecord>> {
        prop::collection::btree_map(
            1u64..500,
            (status_strategy(), prop::option::of(0u64..5000))
                .prop_map(|(status, frames)| job(status, frames)),
            0..30,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_recovery_is_idempotent(
            jobs in jobs_strategy(),
            policy in policy_strategy(),
        ) {
            let mut once = jobs.clone();
            recover_jobs(&mut once, policy);

            let mut twice = once.clone();
            let second = recover_jobs(&mut twice, policy);

            prop_assert_eq!(&once, &twice);
            prop_assert!(second.is_clean());
        }

        // After recovery nothing is in flight or finished, and `error`
        // survives only under the ignore policy.
        #[test]
        fn prop_recovery_leaves_only_schedulable_states(
            jobs in jobs_strategy(),
            policy in policy_strategy(),
        ) {
            let mut jobs = jobs;
            recover_jobs(&mut jobs, policy);

            for job in jobs.values() {
                prop_assert!(!job.status.is_in_flight());
                prop_assert!(!job.status.is_terminal());
                if policy != ErrorPolicy::Ignore {
                    prop_assert_ne!(job.status, JobStatus::Error);
                }
                prop_assert_eq!(job.error.is_some(), job.status == JobStatus::Error);
            }
        }
    }

    #[test]
    fn test_recovery_rules() {
        let mut jobs = BTreeMap::new();
        jobs.insert(1, job(JobStatus::GettingFrames, None));
        jobs.insert(2, job(JobStatus::Encoding, Some(100)));
        jobs.insert(3, job(JobStatus::Encoded, Some(100)));
        jobs.insert(4, job(JobStatus::Copied, None));
        jobs.insert(5, job(JobStatus::ReadyToEncode, Some(100)));
        jobs.insert(6, job(JobStatus::NotStarted, None));

        let report = recover_jobs(&mut jobs, ErrorPolicy::Ignore);

        assert_eq!(jobs[&1].status, JobStatus::NotStarted);
        assert_eq!(jobs[&2].status, JobStatus::ReadyToEncode);
        assert!(!jobs.contains_key(&3));
        assert!(!jobs.contains_key(&4));
        assert_eq!(jobs[&5].status, JobStatus::ReadyToEncode);
        assert_eq!(jobs[&6].status, JobStatus::NotStarted);

        assert_eq!(report.reprobe, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.pruned, 2);
        assert_eq!(report.stale_outputs, vec![PathBuf::from("/out/a.mkv")]);
    }

    #[test]
    fn test_error_policy_reset() {
        let mut jobs = BTreeMap::new();
        jobs.insert(1, job(JobStatus::Error, Some(2400)));
        jobs.insert(2, job(JobStatus::Error, None));

        let report = recover_jobs(&mut jobs, ErrorPolicy::Reset);

        assert_eq!(jobs[&1].status, JobStatus::ReadyToEncode);
        assert_eq!(jobs[&2].status, JobStatus::NotStarted);
        assert!(jobs[&1].error.is_none());
        assert!(jobs[&2].error.is_none());
        assert_eq!(report.errors_reset, 2);
        assert_eq!(report.stale_outputs.len(), 1);
    }

    #[test]
    fn test_error_policy_delete_and_ignore() {
        let mut jobs = BTreeMap::new();
        jobs.insert(1, job(JobStatus::Error, Some(10)));
        let report = recover_jobs(&mut jobs.clone(), ErrorPolicy::Delete);
        assert_eq!(report.errors_deleted, 1);

        let mut deleted = jobs.clone();
        recover_jobs(&mut deleted, ErrorPolicy::Delete);
        assert!(deleted.is_empty());

        let report = recover_jobs(&mut jobs, ErrorPolicy::Ignore);
        assert_eq!(jobs[&1].status, JobStatus::Error);
        assert_eq!(report.errors_kept, 1);
        assert!(report.is_clean());
    }

    #[test]
    fn test_remove_stale_outputs() {
        let dir = TempDir::new().unwrap();
        let partial = dir.path().join("partial.mkv");
        fs::write(&partial, b"half an encode").unwrap();

        let report = RecoveryReport {
            stale_outputs: vec![partial.clone(), dir.path().join("missing.mkv")],
            ..Default::default()
        };

        assert_eq!(remove_stale_outputs(&report), 1);
        assert!(!partial.exists());
    }
}
