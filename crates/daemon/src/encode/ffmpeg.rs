//! ffmpeg encoder invocation
//!
//! Builds the ffmpeg argument list from a quality preset and the selected
//! tracks, runs it with `-progress pipe:1`, and turns `frame=` lines into
//! progress reports.

use super::{prepare_output_dir, preflight, select_track, EncodeFailure, TrackKind};
use crate::job::Uid;
use crate::lifecycle::ShutdownSignal;
use crate::probe::{ProbeError, Prober};
use crate::process::{collect_tail, describe_status, join_text, spawn_piped, terminate, tool_command};
use shipper_config::{QualityPreset, ToolCommand};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::ChildStdout;
use tracing::{debug, info, warn};

/// Time allowed to drain buffered progress lines after ffmpeg exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything an encode worker needs to know about its job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeRequest {
    pub uid: Uid,
    pub input: PathBuf,
    pub output: PathBuf,
    pub quality_key: String,
    pub frames: Option<u64>,
}

/// Tracks chosen for the output, as positions within their kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSelection {
    pub audio: Option<usize>,
    pub subtitle: Option<usize>,
}

/// Build the ffmpeg argument list (without the program itself).
///
/// Video stream 0 is always mapped. Audio is re-encoded with the preset's
/// codec and bitrate, subtitles are copied; either is left out when no track
/// was selected.
pub fn build_ffmpeg_args(
    input: &Path,
    output: &Path,
    preset: &QualityPreset,
    tracks: TrackSelection,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    push(
        &mut args,
        &["-hide_banner", "-nostdin", "-loglevel", "error", "-nostats", "-progress", "pipe:1", "-i"],
    );
    args.push(input.as_os_str().to_os_string());

    push(&mut args, &["-map", "0:v:0"]);
    if let Some(audio) = tracks.audio {
        push(&mut args, &["-map", &format!("0:a:{}", audio)]);
    }
    if let Some(subtitle) = tracks.subtitle {
        push(&mut args, &["-map", &format!("0:s:{}", subtitle)]);
    }

    push(
        &mut args,
        &["-c:v", &preset.codec, "-preset", &preset.preset, "-crf", &preset.crf.to_string()],
    );
    if let Some(aq_mode) = preset.aq_mode {
        if preset.codec == "libx265" {
            push(&mut args, &["-x265-params", &format!("aq-mode={}", aq_mode)]);
        }
    }
    args.extend(preset.extra_args.iter().map(OsString::from));

    if tracks.audio.is_some() {
        push(&mut args, &["-c:a", &preset.audio_codec, "-b:a", &preset.audio_bitrate]);
    }
    if tracks.subtitle.is_some() {
        push(&mut args, &["-c:s", "copy"]);
    }

    args.push(output.as_os_str().to_os_string());
    args
}

fn push(args: &mut Vec<OsString>, items: &[&str]) {
    args.extend(items.iter().map(|s| OsString::from(*s)));
}

/// Frame number from a `-progress` line such as `frame=1234` or `frame= 1234`.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let value = line.trim().strip_prefix("frame=")?.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Runs encodes with a fixed tool setup.
#[derive(Debug, Clone)]
pub struct Encoder {
    ffmpeg: ToolCommand,
    prober: Prober,
    presets: BTreeMap<String, QualityPreset>,
    buffer_bytes: u64,
    grace: Duration,
}

impl Encoder {
    pub fn new(
        ffmpeg: ToolCommand,
        prober: Prober,
        presets: BTreeMap<String, QualityPreset>,
        buffer_bytes: u64,
        grace: Duration,
    ) -> Self {
        Self {
            ffmpeg,
            prober,
            presets,
            buffer_bytes,
            grace,
        }
    }

    /// Run one encode to completion.
    ///
    /// `on_progress` is called with every frame number ffmpeg reports.
    /// Returns the output size on success. A failed or interrupted encode
    /// removes whatever partial output it wrote.
    pub async fn encode<F>(
        &self,
        request: &EncodeRequest,
        mut on_progress: F,
        shutdown: &mut ShutdownSignal,
    ) -> Result<Option<u64>, EncodeFailure>
    where
        F: FnMut(u64) + Send,
    {
        let preset = preflight(request, &self.presets, self.buffer_bytes)?;
        prepare_output_dir(&request.output)?;

        let streams = self
            .prober
            .streams(&request.input, shutdown)
            .await
            .map_err(|e| match e {
                e if e.is_interrupted() => EncodeFailure::Killed("shutdown".to_string()),
                ProbeError::InputMissing(path) => EncodeFailure::InputMissing(path),
                other => EncodeFailure::StreamLayout(other.to_string()),
            })?;
        let tracks = TrackSelection {
            audio: select_track(&streams, TrackKind::Audio),
            subtitle: select_track(&streams, TrackKind::Subtitle),
        };
        debug!(uid = request.uid, ?tracks, "Selected tracks");

        let args = build_ffmpeg_args(&request.input, &request.output, preset, tracks);
        let cmd = tool_command(&self.ffmpeg, args);
        let mut child = spawn_piped(cmd, &self.ffmpeg.program)
            .map_err(|e| EncodeFailure::Launch(e.to_string()))?;

        let stderr = child.stderr.take().map(collect_tail);
        let mut lines = child.stdout.take().map(|out| BufReader::new(out).lines());

        let status = loop {
            tokio::select! {
                line = next_line(&mut lines) => match line {
                    Some(line) => {
                        if let Some(frame) = parse_progress_line(&line) {
                            on_progress(frame);
                        }
                    }
                    None => lines = None,
                },
                status = child.wait() => break status,
                _ = shutdown.forced() => {
                    info!(uid = request.uid, "Terminating encoder for shutdown");
                    terminate(&mut child, self.grace).await;
                    if let Some(handle) = stderr {
                        handle.abort();
                    }
                    remove_partial(&request.output);
                    return Err(EncodeFailure::Killed("shutdown".to_string()));
                }
            }
        };

        let drain = async {
            while let Some(reader) = lines.as_mut() {
                match reader.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(frame) = parse_progress_line(&line) {
                            on_progress(frame);
                        }
                    }
                    _ => break,
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(uid = request.uid, "Encoder output still open after exit");
        }

        let status = status.map_err(|e| EncodeFailure::Launch(e.to_string()))?;
        let stderr = join_text(stderr).await;

        if status.success() {
            let size = fs::metadata(&request.output).ok().map(|m| m.len());
            if let (Some(after), Ok(before)) = (size, fs::metadata(&request.input)) {
                if after > before.len() {
                    warn!(
                        uid = request.uid,
                        before = before.len(),
                        after,
                        "Encoded output is larger than its input"
                    );
                }
            }
            return Ok(size);
        }

        remove_partial(&request.output);
        Err(match status.code() {
            Some(code) => EncodeFailure::from_exit_code(code, request, &stderr),
            None => EncodeFailure::Killed(describe_status(&status)),
        })
    }
}

/// Next stdout line, or pending forever once the stream has ended.
async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(reader) => reader.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn remove_partial(output: &Path) {
    match fs::remove_file(output) {
        Ok(()) => debug!(output = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(output = %output.display(), "Failed to remove partial output: {}", e),
    }
}
