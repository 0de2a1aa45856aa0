//! Encode worker support
//!
//! Pre-flight checks, the failure taxonomy shared by pre-flight and the
//! encoder's exit status, and track selection. The ffmpeg invocation itself
//! lives in [`ffmpeg`].

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_args, parse_progress_line, EncodeRequest, Encoder, TrackSelection};

use crate::probe::StreamInfo;
use shipper_config::QualityPreset;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use thiserror::Error;
use tracing::warn;

/// Why an encode did not produce an output file.
///
/// Pre-flight failures and encoder exit codes map onto the same causes:
///
/// | code | variant |
/// |---|---|
/// | 1 | [`General`](Self::General) |
/// | 2 | [`InputMissing`](Self::InputMissing) |
/// | 3 | [`OutputExists`](Self::OutputExists) |
/// | 4 | [`InvalidQuality`](Self::InvalidQuality) |
/// | 5 | [`InsufficientSpace`](Self::InsufficientSpace) |
/// | 6 | [`OutputDirectory`](Self::OutputDirectory) |
/// | 130, 137, 143, signal | [`Killed`](Self::Killed) |
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeFailure {
    #[error("Encoder reported a general failure: {0}")]
    General(String),

    #[error("Input file does not exist: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("Output file already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("Invalid quality setting '{0}'")]
    InvalidQuality(String),

    #[error("Insufficient disk space: {0}")]
    InsufficientSpace(String),

    #[error("Could not create output directory: {0}")]
    OutputDirectory(String),

    #[error("Encoder was killed or interrupted ({0})")]
    Killed(String),

    #[error("Encoder exited with unrecognised code {0}")]
    Unrecognised(i32),

    /// The encoder could not be started at all
    #[error("Failed to run encoder: {0}")]
    Launch(String),

    /// The stream layout could not be read before encoding
    #[error("Failed to read stream layout: {0}")]
    StreamLayout(String),
}

impl EncodeFailure {
    /// Map a nonzero encoder exit code to a cause.
    pub fn from_exit_code(code: i32, request: &EncodeRequest, stderr: &str) -> Self {
        match code {
            1 => EncodeFailure::General(if stderr.is_empty() {
                "no diagnostic output".to_string()
            } else {
                stderr.to_string()
            }),
            2 => EncodeFailure::InputMissing(request.input.clone()),
            3 => EncodeFailure::OutputExists(request.output.clone()),
            4 => EncodeFailure::InvalidQuality(request.quality_key.clone()),
            5 => EncodeFailure::InsufficientSpace(format!("reported by encoder for {}", request.output.display())),
            6 => EncodeFailure::OutputDirectory(format!("reported by encoder for {}", request.output.display())),
            130 | 137 | 143 => EncodeFailure::Killed(format!("exit code {}", code)),
            other => EncodeFailure::Unrecognised(other),
        }
    }

    /// The exit code this cause corresponds to, if it has one.
    pub fn code(&self) -> Option<i32> {
        match self {
            EncodeFailure::General(_) => Some(1),
            EncodeFailure::InputMissing(_) => Some(2),
            EncodeFailure::OutputExists(_) => Some(3),
            EncodeFailure::InvalidQuality(_) => Some(4),
            EncodeFailure::InsufficientSpace(_) => Some(5),
            EncodeFailure::OutputDirectory(_) => Some(6),
            EncodeFailure::Unrecognised(code) => Some(*code),
            EncodeFailure::Killed(_) | EncodeFailure::Launch(_) | EncodeFailure::StreamLayout(_) => None,
        }
    }
}

/// Check that an encode can start: input present, output absent, preset
/// known and enough free space for the output plus `buffer_bytes`.
///
/// Returns the resolved preset.
pub fn preflight<'a>(
    request: &EncodeRequest,
    presets: &'a BTreeMap<String, QualityPreset>,
    buffer_bytes: u64,
) -> Result<&'a QualityPreset, EncodeFailure> {
    let input_meta = fs::metadata(&request.input)
        .map_err(|_| EncodeFailure::InputMissing(request.input.clone()))?;

    if request.output.exists() {
        return Err(EncodeFailure::OutputExists(request.output.clone()));
    }

    let preset = presets
        .get(&request.quality_key)
        .ok_or_else(|| EncodeFailure::InvalidQuality(request.quality_key.clone()))?;

    let needed = input_meta.len().saturating_add(buffer_bytes);
    match available_space(&request.output) {
        Some(available) if available < needed => {
            return Err(EncodeFailure::InsufficientSpace(format!(
                "{:.1} GiB needed, {:.1} GiB free",
                gib(needed),
                gib(available)
            )));
        }
        Some(_) => {}
        None => warn!(
            output = %request.output.display(),
            "No filesystem found for output, skipping disk space check"
        ),
    }

    Ok(preset)
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1u64 << 30) as f64
}

/// Create the directory tree the output will be written into.
pub fn prepare_output_dir(output: &Path) -> Result<(), EncodeFailure> {
    match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|e| EncodeFailure::OutputDirectory(format!("{}: {}", parent.display(), e))),
        _ => Ok(()),
    }
}

/// Free bytes on the filesystem that will hold `path`.
///
/// The path need not exist yet: its nearest existing ancestor is used, and
/// the disk with the longest matching mount point wins.
pub fn available_space(path: &Path) -> Option<u64> {
    let anchor = path
        .ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let anchor = anchor.canonicalize().unwrap_or(anchor);

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| anchor.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// Kind of track picked by [`select_track`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Subtitle,
}

impl TrackKind {
    fn codec_type(self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Subtitle => "subtitle",
        }
    }
}

const ENGLISH_TAGS: &[&str] = &["eng", "en", "english"];

/// Pick a track of `kind`: the first English-tagged one, else the first one.
///
/// Returns the position among streams of that kind, as used by `-map 0:a:N`.
pub fn select_track(streams: &[StreamInfo], kind: TrackKind) -> Option<usize> {
    let candidates: Vec<&StreamInfo> = streams
        .iter()
        .filter(|s| s.codec_type == kind.codec_type())
        .collect();

    candidates
        .iter()
        .position(|s| {
            s.language()
                .map(|lang| ENGLISH_TAGS.contains(&lang.trim().to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .or(if candidates.is_empty() { None } else { Some(0) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn request(input: PathBuf, output: PathBuf) -> EncodeRequest {
        EncodeRequest {
            uid: 1,
            input,
            output,
            quality_key: "high".to_string(),
            frames: Some(100),
        }
    }

    fn presets() -> BTreeMap<String, QualityPreset> {
        let mut presets = BTreeMap::new();
        presets.insert(
            "high".to_string(),
            QualityPreset {
                codec: "libx265".to_string(),
                preset: "slow".to_string(),
                crf: 20,
                aq_mode: Some(3),
                audio_codec: "aac".to_string(),
                audio_bitrate: "192k".to_string(),
                extra_args: Vec::new(),
            },
        );
        presets
    }

    fn stream(index: u32, kind: &str, lang: Option<&str>) -> StreamInfo {
        let mut tags = HashMap::new();
        if let Some(lang) = lang {
            tags.insert("language".to_string(), lang.to_string());
        }
        StreamInfo {
            index,
            codec_type: kind.to_string(),
            tags,
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Every encoder exit code maps to a cause that reports the same code,
        // except the kill codes which have none.
        #[test]
        fn prop_exit_code_mapping(code in 1i32..256) {
            let req = request(PathBuf::from("/in.mkv"), PathBuf::from("/out.mkv"));
            let failure = EncodeFailure::from_exit_code(code, &req, "");
            match code {
                130 | 137 | 143 => prop_assert!(matches!(failure, EncodeFailure::Killed(_))),
                _ => prop_assert_eq!(failure.code(), Some(code)),
            }
        }
    }

    #[test]
    fn test_exit_code_messages() {
        let req = request(PathBuf::from("/in.mkv"), PathBuf::from("/out.mkv"));
        assert_eq!(
            EncodeFailure::from_exit_code(1, &req, "").to_string(),
            "Encoder reported a general failure: no diagnostic output"
        );
        assert_eq!(
            EncodeFailure::from_exit_code(42, &req, "").to_string(),
            "Encoder exited with unrecognised code 42"
        );
        assert!(EncodeFailure::from_exit_code(2, &req, "")
            .to_string()
            .contains("/in.mkv"));
    }

    #[test]
    fn test_preflight_order() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mkv");
        let output = dir.path().join("out").join("out.mkv");

        let req = request(input.clone(), output.clone());
        assert_eq!(
            preflight(&req, &presets(), 0).unwrap_err(),
            EncodeFailure::InputMissing(input.clone())
        );

        fs::write(&input, b"frames").unwrap();
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        fs::write(&output, b"old").unwrap();
        assert_eq!(
            preflight(&req, &presets(), 0).unwrap_err(),
            EncodeFailure::OutputExists(output.clone())
        );

        fs::remove_file(&output).unwrap();
        let mut unknown = req.clone();
        unknown.quality_key = "ultra".to_string();
        assert_eq!(
            preflight(&unknown, &presets(), 0).unwrap_err(),
            EncodeFailure::InvalidQuality("ultra".to_string())
        );

        let presets = presets();
        let preset = preflight(&req, &presets, 0).unwrap();
        assert_eq!(preset.crf, 20);
    }

    #[test]
    fn test_preflight_rejects_impossible_buffer() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mkv");
        fs::write(&input, b"frames").unwrap();
        let req = request(input, dir.path().join("out.mkv"));

        // Only meaningful when the temp dir's filesystem is visible.
        if available_space(dir.path()).is_some() {
            let err = preflight(&req, &presets(), u64::MAX).unwrap_err();
            assert!(matches!(err, EncodeFailure::InsufficientSpace(_)));
            assert_eq!(err.code(), Some(5));
        }
    }

    #[test]
    fn test_prepare_output_dir() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("Movie (1999)").join("Movie (1999).mkv");
        prepare_output_dir(&output).unwrap();
        assert!(output.parent().unwrap().is_dir());

        let blocker = dir.path().join("file");
        fs::write(&blocker, b"").unwrap();
        let err = prepare_output_dir(&blocker.join("sub").join("x.mkv")).unwrap_err();
        assert_eq!(err.code(), Some(6));
    }

    #[test]
    fn test_select_track_prefers_english() {
        let streams = vec![
            stream(0, "video", None),
            stream(1, "audio", Some("jpn")),
            stream(2, "audio", Some("ENG")),
            stream(3, "subtitle", Some("fre")),
            stream(4, "subtitle", Some("english")),
        ];
        assert_eq!(select_track(&streams, TrackKind::Audio), Some(1));
        assert_eq!(select_track(&streams, TrackKind::Subtitle), Some(1));
    }

    #[test]
    fn test_select_track_falls_back_to_first_or_none() {
        let streams = vec![
            stream(0, "video", None),
            stream(1, "audio", Some("jpn")),
            stream(2, "audio", None),
        ];
        assert_eq!(select_track(&streams, TrackKind::Audio), Some(0));
        assert_eq!(select_track(&streams, TrackKind::Subtitle), None);
        assert_eq!(select_track(&[], TrackKind::Audio), None);
    }
}
