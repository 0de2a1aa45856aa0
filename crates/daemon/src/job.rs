//! Job records and the job state machine.
//!
//! A [`JobRecord`] is one requested output file. Its `status` only ever moves
//! along the edges accepted by [`JobStatus::can_transition_to`]; every mutation
//! of the status goes through [`JobRecord::transition`].

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Stable identifier of a job within the ledger.
pub type Uid = u64;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, frame count unknown.
    #[serde(alias = "notstarted")]
    NotStarted,
    /// A probe worker is counting frames.
    GettingFrames,
    /// Frame count known, waiting for an encode slot.
    ReadyToEncode,
    /// An encode worker is running.
    Encoding,
    /// Output written successfully.
    Encoded,
    /// Bypassed encoding; the source was copied as-is.
    Copied,
    /// The last probe or encode failed.
    Error,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::NotStarted => write!(f, "not_started"),
            JobStatus::GettingFrames => write!(f, "getting_frames"),
            JobStatus::ReadyToEncode => write!(f, "ready_to_encode"),
            JobStatus::Encoding => write!(f, "encoding"),
            JobStatus::Encoded => write!(f, "encoded"),
            JobStatus::Copied => write!(f, "copied"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl JobStatus {
    /// All states, in pipeline order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::NotStarted,
        JobStatus::GettingFrames,
        JobStatus::ReadyToEncode,
        JobStatus::Encoding,
        JobStatus::Encoded,
        JobStatus::Copied,
        JobStatus::Error,
    ];

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// The demotions `getting_frames -> not_started`, `encoding -> ready_to_encode`
    /// and the two exits from `error` are only taken by the startup recovery pass.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (NotStarted, GettingFrames)
                | (GettingFrames, ReadyToEncode | Error | NotStarted)
                | (ReadyToEncode, Encoding)
                | (Encoding, Encoded | Error | ReadyToEncode)
                | (Error, ReadyToEncode | NotStarted)
        )
    }

    /// Work is finished; nothing more will happen to the job.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Encoded | JobStatus::Copied)
    }

    /// A worker owns the job while it is in this state.
    pub fn is_in_flight(self) -> bool {
        matches!(self, JobStatus::GettingFrames | JobStatus::Encoding)
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Persisted state of one requested transcode.
///
/// Fields the daemon does not interpret (catalog id, year, media type and so
/// on) are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    #[serde(default)]
    pub status: JobStatus,
    pub input_file: PathBuf,
    pub encoded_file: PathBuf,
    /// Key into the configured quality presets.
    #[serde(rename = "quality")]
    pub quality_key: String,
    /// Total frame count, unknown until probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
    #[serde(default)]
    pub current_frame: u64,
    #[serde(
        default,
        deserialize_with = "empty_string_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub before_size: u64,
    #[serde(default)]
    pub after_size: u64,
    #[serde(default)]
    pub job_start_time: i64,
    #[serde(default)]
    pub encode_start_time: i64,
    #[serde(default)]
    pub encode_end_time: i64,
    #[serde(default)]
    pub job_end_time: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

impl JobRecord {
    /// A fresh `not_started` record.
    pub fn new(
        input_file: impl Into<PathBuf>,
        encoded_file: impl Into<PathBuf>,
        quality_key: impl Into<String>,
    ) -> Self {
        Self {
            status: JobStatus::NotStarted,
            input_file: input_file.into(),
            encoded_file: encoded_file.into(),
            quality_key: quality_key.into(),
            frames: None,
            current_frame: 0,
            error: None,
            name: String::new(),
            before_size: 0,
            after_size: 0,
            job_start_time: 0,
            encode_start_time: 0,
            encode_end_time: 0,
            job_end_time: 0,
            extra: serde_json::Map::new(),
        }
    }

    /// Display label for logs: the name if present, otherwise the input file.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.input_file.display().to_string()
        } else {
            self.name.clone()
        }
    }

    /// Frame count if probing produced a usable one.
    pub fn known_frames(&self) -> Option<u64> {
        self.frames.filter(|&f| f > 0)
    }

    /// Move to `next`, enforcing the state machine.
    ///
    /// Leaving `error` clears the stored error description. Leaving
    /// `encoding` for anything but `encoded` discards the attempt's progress.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        match self.status {
            JobStatus::Error => self.error = None,
            JobStatus::Encoding if next != JobStatus::Encoded => self.current_frame = 0,
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    fn require(&self, expected: JobStatus, next: JobStatus) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to: next,
            })
        }
    }

    /// `not_started -> getting_frames`
    pub fn begin_probe(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::GettingFrames)
    }

    /// `getting_frames -> ready_to_encode` with the probed frame count.
    pub fn complete_probe(&mut self, frames: u64) -> Result<(), TransitionError> {
        self.require(JobStatus::GettingFrames, JobStatus::ReadyToEncode)?;
        self.transition(JobStatus::ReadyToEncode)?;
        self.frames = Some(frames);
        Ok(())
    }

    /// `ready_to_encode -> encoding`; resets progress and stamps start times.
    pub fn begin_encode(&mut self, now: i64) -> Result<(), TransitionError> {
        self.transition(JobStatus::Encoding)?;
        self.current_frame = 0;
        self.encode_start_time = now;
        self.encode_end_time = 0;
        if self.job_start_time == 0 {
            self.job_start_time = now;
        }
        Ok(())
    }

    /// `encoding -> encoded`
    pub fn complete_encode(&mut self, after_size: Option<u64>, now: i64) -> Result<(), TransitionError> {
        self.transition(JobStatus::Encoded)?;
        if let Some(frames) = self.known_frames() {
            self.current_frame = frames;
        }
        if let Some(size) = after_size {
            self.after_size = size;
        }
        self.encode_end_time = now;
        self.job_end_time = now;
        Ok(())
    }

    /// Move to `error` with a description.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Error)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Store an encoder progress report.
    ///
    /// Ignored unless the job is encoding. The counter never goes backwards
    /// within an attempt and never passes the known frame count. Returns
    /// whether the stored value changed.
    pub fn record_progress(&mut self, frame: u64) -> bool {
        if self.status != JobStatus::Encoding {
            return false;
        }
        let frame = match self.known_frames() {
            Some(total) => frame.min(total),
            None => frame,
        };
        if frame > self.current_frame {
            self.current_frame = frame;
            true
        } else {
            false
        }
    }
}

/// Current time in seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
