//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem locations used by the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Working directory holding the ledger, submission files and flags
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Root used to resolve relative `input_file` paths in submissions
    #[serde(default = "default_state_dir")]
    pub input_dir: PathBuf,
    /// Root used to resolve relative `encoded_file` paths in submissions
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./Encoded")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            input_dir: default_state_dir(),
            output_dir: default_output_dir(),
        }
    }
}

/// Per-type worker concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobLimitsConfig {
    /// Maximum concurrent encode workers
    #[serde(default = "default_limit")]
    pub encode: usize,
    /// Maximum concurrent frame-count probe workers
    #[serde(default = "default_limit", alias = "frame_count")]
    pub probe: usize,
}

fn default_limit() -> usize {
    1
}

impl Default for JobLimitsConfig {
    fn default() -> Self {
        Self {
            encode: default_limit(),
            probe: default_limit(),
        }
    }
}

/// Scheduler cadence and shutdown timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Sleep between scheduling cycles in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Grace period between terminate and kill during forced shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

/// Disk space safety settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskConfig {
    /// Free space (GiB) that must remain beyond the input file's size
    #[serde(default = "default_buffer_gib")]
    pub buffer_gib: f64,
}

fn default_buffer_gib() -> f64 {
    10.0
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            buffer_gib: default_buffer_gib(),
        }
    }
}

impl DiskConfig {
    /// Buffer expressed in bytes
    pub fn buffer_bytes(&self) -> u64 {
        (self.buffer_gib.max(0.0) * (1u64 << 30) as f64) as u64
    }
}

/// An external tool invocation: a program plus leading arguments.
///
/// In TOML this is either a plain string (`"ffmpeg"`) or an argv array
/// (`["nice", "-n", "19", "ffmpeg"]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawToolCommand", into = "RawToolCommand")]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawToolCommand {
    Program(String),
    Argv(Vec<String>),
}

impl TryFrom<RawToolCommand> for ToolCommand {
    type Error = String;

    fn try_from(raw: RawToolCommand) -> Result<Self, Self::Error> {
        match raw {
            RawToolCommand::Program(program) if !program.trim().is_empty() => {
                Ok(ToolCommand::new(program))
            }
            RawToolCommand::Argv(mut argv) if !argv.is_empty() => {
                let program = argv.remove(0);
                Ok(ToolCommand {
                    program,
                    args: argv,
                })
            }
            _ => Err("tool command must not be empty".to_string()),
        }
    }
}

impl From<ToolCommand> for RawToolCommand {
    fn from(cmd: ToolCommand) -> Self {
        if cmd.args.is_empty() {
            RawToolCommand::Program(cmd.program)
        } else {
            let mut argv = vec![cmd.program];
            argv.extend(cmd.args);
            RawToolCommand::Argv(argv)
        }
    }
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// External tools invoked by the workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: ToolCommand,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: ToolCommand,
}

fn default_ffmpeg() -> ToolCommand {
    ToolCommand::new("ffmpeg")
}

fn default_ffprobe() -> ToolCommand {
    ToolCommand::new("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

/// What the startup recovery pass does with jobs left in `error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Send the job back to `ready_to_encode` or `not_started`
    Reset,
    /// Drop the job from the ledger
    Delete,
    /// Leave the job untouched
    #[default]
    Ignore,
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::Reset => write!(f, "reset"),
            ErrorPolicy::Delete => write!(f, "delete"),
            ErrorPolicy::Ignore => write!(f, "ignore"),
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "reset" | "r" => Ok(ErrorPolicy::Reset),
            "delete" | "d" => Ok(ErrorPolicy::Delete),
            "ignore" | "i" => Ok(ErrorPolicy::Ignore),
            other => Err(ConfigError::Invalid(format!(
                "unknown error policy '{}' (expected reset, delete or ignore)",
                other
            ))),
        }
    }
}

/// Startup recovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RecoveryConfig {
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional append-only log file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// A named set of encoder parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityPreset {
    /// Video codec passed to `-c:v`
    #[serde(default = "default_video_codec")]
    pub codec: String,
    /// Encoder speed preset
    #[serde(default = "default_encoder_preset")]
    pub preset: String,
    /// Constant rate factor
    pub crf: u8,
    /// x265 adaptive quantisation mode, only used with libx265
    #[serde(default)]
    pub aq_mode: Option<u8>,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Audio bitrate, e.g. "192k"
    #[serde(default = "default_audio_bitrate", alias = "bitrate")]
    pub audio_bitrate: String,
    /// Extra encoder arguments inserted before the audio options
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_encoder_preset() -> String {
    "medium".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub job_limits: JobLimitsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub quality_presets: BTreeMap<String, QualityPreset>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - SHIPPER_STATE_DIR -> paths.state_dir
    /// - SHIPPER_MAX_ENCODE_JOBS -> job_limits.encode
    /// - SHIPPER_MAX_PROBE_JOBS -> job_limits.probe
    /// - SHIPPER_DISK_BUFFER_GIB -> disk.buffer_gib
    /// - SHIPPER_ERROR_POLICY -> recovery.error_policy
    /// - SHIPPER_LOG_LEVEL -> logging.level
    ///
    /// Unparseable values are ignored and the existing setting is kept.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("SHIPPER_STATE_DIR") {
            if !val.trim().is_empty() {
                self.paths.state_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("SHIPPER_MAX_ENCODE_JOBS") {
            if let Ok(limit) = val.parse::<usize>() {
                self.job_limits.encode = limit;
            }
        }

        if let Ok(val) = env::var("SHIPPER_MAX_PROBE_JOBS") {
            if let Ok(limit) = val.parse::<usize>() {
                self.job_limits.probe = limit;
            }
        }

        if let Ok(val) = env::var("SHIPPER_DISK_BUFFER_GIB") {
            if let Ok(gib) = val.parse::<f64>() {
                self.disk.buffer_gib = gib;
            }
        }

        if let Ok(val) = env::var("SHIPPER_ERROR_POLICY") {
            if let Ok(policy) = val.parse::<ErrorPolicy>() {
                self.recovery.error_policy = policy;
            }
        }

        if let Ok(val) = env::var("SHIPPER_LOG_LEVEL") {
            if !val.trim().is_empty() {
                self.logging.level = val;
            }
        }
    }

    /// Reject values the daemon cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if !self.disk.buffer_gib.is_finite() || self.disk.buffer_gib < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "disk.buffer_gib must be a non-negative number, got {}",
                self.disk.buffer_gib
            )));
        }

        for (key, preset) in &self.quality_presets {
            if preset.codec.trim().is_empty() || preset.preset.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "quality preset '{}' needs a codec and a preset",
                    key
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Path of the persisted ledger document
    pub fn ledger_path(&self) -> PathBuf {
        self.paths.state_dir.join("data.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        env::remove_var("SHIPPER_STATE_DIR");
        env::remove_var("SHIPPER_MAX_ENCODE_JOBS");
        env::remove_var("SHIPPER_MAX_PROBE_JOBS");
        env::remove_var("SHIPPER_DISK_BUFFER_GIB");
        env::remove_var("SHIPPER_ERROR_POLICY");
        env::remove_var("SHIPPER_LOG_LEVEL");
    }

    fn policy_strategy() -> impl Strategy<Value = ErrorPolicy> {
        prop_oneof![
            Just(ErrorPolicy::Reset),
            Just(ErrorPolicy::Delete),
            Just(ErrorPolicy::Ignore),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            encode in 0usize..16,
            probe in 0usize..16,
            poll in 1u64..10_000,
            grace in 0u64..60,
            buffer in 0u32..500,
            policy in policy_strategy(),
            crf in 0u8..51,
        ) {
            let toml_str = format!(
                r#"
[paths]
state_dir = "/srv/shipper"
output_dir = "/media/encoded"

[job_limits]
encode = {}
probe = {}

[scheduler]
poll_interval_ms = {}
shutdown_grace_secs = {}

[disk]
buffer_gib = {}

[recovery]
error_policy = "{}"

[quality_presets.high]
codec = "libx265"
preset = "slow"
crf = {}
aq_mode = 3
"#,
                encode, probe, poll, grace, buffer, policy, crf
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.paths.state_dir, &PathBuf::from("/srv/shipper"));
            prop_assert_eq!(&config.paths.output_dir, &PathBuf::from("/media/encoded"));
            prop_assert_eq!(config.job_limits.encode, encode);
            prop_assert_eq!(config.job_limits.probe, probe);
            prop_assert_eq!(config.scheduler.poll_interval_ms, poll);
            prop_assert_eq!(config.scheduler.shutdown_grace_secs, grace);
            prop_assert!((config.disk.buffer_gib - buffer as f64).abs() < 1e-9);
            prop_assert_eq!(config.recovery.error_policy, policy);
            let preset = &config.quality_presets["high"];
            prop_assert_eq!(preset.crf, crf);
            prop_assert_eq!(preset.aq_mode, Some(3));
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_job_limits(
            initial_encode in 0usize..8,
            override_encode in 0usize..32,
            override_probe in 0usize..32,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[job_limits]
encode = {}
"#,
                initial_encode
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SHIPPER_MAX_ENCODE_JOBS", override_encode.to_string());
            env::set_var("SHIPPER_MAX_PROBE_JOBS", override_probe.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.job_limits.encode, override_encode);
            prop_assert_eq!(config.job_limits.probe, override_probe);
        }

        #[test]
        fn prop_env_overrides_error_policy(
            initial in policy_strategy(),
            override_policy in policy_strategy(),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                r#"
[recovery]
error_policy = "{}"
"#,
                initial
            );

            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("SHIPPER_ERROR_POLICY", override_policy.to_string().to_uppercase());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.recovery.error_policy, override_policy);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.paths.state_dir, PathBuf::from("."));
        assert_eq!(config.paths.output_dir, PathBuf::from("./Encoded"));
        assert_eq!(config.job_limits.encode, 1);
        assert_eq!(config.job_limits.probe, 1);
        assert_eq!(config.scheduler.poll_interval_ms, 500);
        assert_eq!(config.scheduler.shutdown_grace_secs, 5);
        assert!((config.disk.buffer_gib - 10.0).abs() < 1e-9);
        assert_eq!(config.tools.ffmpeg, ToolCommand::new("ffmpeg"));
        assert_eq!(config.tools.ffprobe, ToolCommand::new("ffprobe"));
        assert_eq!(config.recovery.error_policy, ErrorPolicy::Ignore);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.file.is_none());
        assert!(config.quality_presets.is_empty());
        assert_eq!(config.ledger_path(), PathBuf::from("./data.json"));
    }

    #[test]
    fn test_legacy_frame_count_limit_key() {
        let config = Config::parse_toml(
            r#"
[job_limits]
encode = 2
frame_count = 3
"#,
        )
        .expect("legacy key should parse");

        assert_eq!(config.job_limits.encode, 2);
        assert_eq!(config.job_limits.probe, 3);
    }

    #[test]
    fn test_tool_command_accepts_string_or_argv() {
        let config = Config::parse_toml(
            r#"
[tools]
ffmpeg = "/opt/ffmpeg/bin/ffmpeg"
ffprobe = ["nice", "-n", "19", "ffprobe"]
"#,
        )
        .expect("tools should parse");

        assert_eq!(config.tools.ffmpeg.program, "/opt/ffmpeg/bin/ffmpeg");
        assert!(config.tools.ffmpeg.args.is_empty());
        assert_eq!(config.tools.ffprobe.program, "nice");
        assert_eq!(config.tools.ffprobe.args, vec!["-n", "19", "ffprobe"]);
    }

    #[test]
    fn test_empty_tool_command_is_rejected() {
        assert!(Config::parse_toml("[tools]\nffmpeg = []\n").is_err());
        assert!(Config::parse_toml("[tools]\nffmpeg = \"\"\n").is_err());
    }

    #[test]
    fn test_preset_defaults_and_bitrate_alias() {
        let config = Config::parse_toml(
            r#"
[quality_presets.low]
crf = 28
bitrate = "96k"
"#,
        )
        .expect("preset should parse");

        let preset = &config.quality_presets["low"];
        assert_eq!(preset.codec, "libx265");
        assert_eq!(preset.preset, "medium");
        assert_eq!(preset.audio_codec, "aac");
        assert_eq!(preset.audio_bitrate, "96k");
        assert_eq!(preset.aq_mode, None);
        assert!(preset.extra_args.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.scheduler.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.disk.buffer_gib = -1.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config::parse_toml(
            r#"
[quality_presets.broken]
codec = ""
crf = 20
"#,
        )
        .expect("parses");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_error_policy_from_str() {
        assert_eq!("reset".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Reset);
        assert_eq!(" D ".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Delete);
        assert_eq!("i".parse::<ErrorPolicy>().unwrap(), ErrorPolicy::Ignore);
        assert!("retry".parse::<ErrorPolicy>().is_err());
    }

    #[test]
    fn test_disk_buffer_bytes() {
        let disk = DiskConfig { buffer_gib: 2.0 };
        assert_eq!(disk.buffer_bytes(), 2 * 1024 * 1024 * 1024);
        let disk = DiskConfig { buffer_gib: 0.0 };
        assert_eq!(disk.buffer_bytes(), 0);
    }
}
