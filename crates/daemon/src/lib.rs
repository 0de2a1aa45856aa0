//! Shipper Daemon
//!
//! Background service that probes and encodes submitted media files through
//! a persistent job ledger, with bounded worker pools and crash recovery.

pub mod daemon;
pub mod encode;
pub mod flags;
pub mod job;
pub mod ledger;
pub mod lifecycle;
pub mod probe;
pub mod process;
pub mod recovery;
pub mod submissions;
pub mod workers;

pub use daemon::{CycleOutcome, Daemon, DaemonError};
pub use encode::{EncodeFailure, EncodeRequest, Encoder};
pub use flags::{ControlFlags, FlagState};
pub use job::{JobRecord, JobStatus, TransitionError, Uid};
pub use ledger::{Ledger, LedgerError};
pub use lifecycle::{listen_for_interrupts, ShutdownController, ShutdownLevel, ShutdownSignal};
pub use probe::{ProbeError, Prober};
pub use recovery::RecoveryReport;
pub use shipper_config as config;
pub use shipper_config::Config;
pub use submissions::SubmissionInbox;
pub use workers::{WorkerKind, WorkerOutcome, WorkerPool};
