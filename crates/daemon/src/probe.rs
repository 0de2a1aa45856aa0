//! Media probing with ffprobe
//!
//! Two questions are asked of an input file: how many video frames it has
//! (needed before it can be encoded, so progress can be reported) and what
//! audio and subtitle streams it carries (needed to pick tracks).

use crate::lifecycle::ShutdownSignal;
use crate::process::{describe_status, run_captured, tool_command, ToolError, ToolOutput};
use serde::Deserialize;
use shipper_config::ToolCommand;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for probe operations
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Input file not found
    #[error("Input file does not exist: {0}")]
    InputMissing(PathBuf),

    /// ffprobe could not be run or was interrupted
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// ffprobe exited unsuccessfully
    #[error("ffprobe failed with {status}: {stderr}")]
    ToolFailed { status: String, stderr: String },

    /// Neither the stream header nor a frame scan produced a count
    #[error("Failed to retrieve frame data from {0}")]
    NoFrames(PathBuf),

    /// The stream listing was not valid JSON
    #[error("Unreadable stream listing: {0}")]
    StreamListing(#[from] serde_json::Error),
}

impl ProbeError {
    /// The probe was cut short by a forced shutdown
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProbeError::Tool(ToolError::Interrupted))
    }
}

/// One stream reported by ffprobe
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    #[serde(default)]
    pub codec_type: String,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl StreamInfo {
    pub fn language(&self) -> Option<&str> {
        self.tags
            .get("language")
            .or_else(|| self.tags.get("LANGUAGE"))
            .map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct StreamListing {
    #[serde(default)]
    streams: Vec<StreamInfo>,
}

/// Runs ffprobe with a configured command and shutdown grace period.
#[derive(Debug, Clone)]
pub struct Prober {
    tool: ToolCommand,
    grace: Duration,
}

impl Prober {
    pub fn new(tool: ToolCommand, grace: Duration) -> Self {
        Self { tool, grace }
    }

    async fn run(
        &self,
        args: Vec<std::ffi::OsString>,
        shutdown: &mut ShutdownSignal,
    ) -> Result<ToolOutput, ProbeError> {
        let cmd = tool_command(&self.tool, args);
        let output = run_captured(cmd, &self.tool.program, shutdown, self.grace).await?;
        if !output.status.success() {
            return Err(ProbeError::ToolFailed {
                status: describe_status(&output.status),
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Total video frames in `input`.
    ///
    /// Reads `nb_frames` from the first video stream header; when that is
    /// missing or zero, falls back to listing every frame and counting lines.
    pub async fn count_frames(
        &self,
        input: &Path,
        shutdown: &mut ShutdownSignal,
    ) -> Result<u64, ProbeError> {
        if !input.exists() {
            return Err(ProbeError::InputMissing(input.to_path_buf()));
        }

        let header = self
            .run(
                probe_args(&["-show_entries", "stream=nb_frames", "-of", "default=nokey=1:noprint_wrappers=1"], input),
                shutdown,
            )
            .await?;
        if let Some(frames) = parse_nb_frames(&header.stdout) {
            return Ok(frames);
        }

        debug!(input = %input.display(), "No frame count in stream header, counting frames");
        let scan = self
            .run(
                probe_args(&["-show_entries", "frame=pts_time", "-of", "csv=p=0"], input),
                shutdown,
            )
            .await?;
        match count_frame_lines(&scan.stdout) {
            0 => Err(ProbeError::NoFrames(input.to_path_buf())),
            n => Ok(n),
        }
    }

    /// Every stream in `input`.
    pub async fn streams(
        &self,
        input: &Path,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Vec<StreamInfo>, ProbeError> {
        if !input.exists() {
            return Err(ProbeError::InputMissing(input.to_path_buf()));
        }

        let args = vec![
            "-v".into(),
            "error".into(),
            "-show_streams".into(),
            "-of".into(),
            "json".into(),
            input.as_os_str().to_os_string(),
        ];
        let output = self.run(args, shutdown).await?;
        parse_stream_listing(&output.stdout)
    }
}

fn probe_args(entries: &[&str], input: &Path) -> Vec<std::ffi::OsString> {
    let mut args: Vec<std::ffi::OsString> = vec![
        "-v".into(),
        "error".into(),
        "-select_streams".into(),
        "v:0".into(),
    ];
    args.extend(entries.iter().map(|s| (*s).into()));
    args.push(input.as_os_str().to_os_string());
    args
}

/// Frame count from a `stream=nb_frames` listing; `None` unless positive.
pub fn parse_nb_frames(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<u64>().ok())
        .filter(|&n| n > 0)
}

/// Number of non-empty lines in a per-frame listing.
pub fn count_frame_lines(stdout: &str) -> u64 {
    stdout.lines().filter(|line| !line.trim().is_empty()).count() as u64
}

/// Parse `ffprobe -show_streams -of json` output.
pub fn parse_stream_listing(stdout: &str) -> Result<Vec<StreamInfo>, ProbeError> {
    let listing: StreamListing = serde_json::from_str(stdout)?;
    Ok(listing.streams)
}
