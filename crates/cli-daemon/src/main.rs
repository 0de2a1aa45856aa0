//! CLI entry point for the shipper daemon
//!
//! Parses command line arguments, installs logging and either runs the
//! scheduler or drops a control flag for a running instance.

use clap::{Parser, Subcommand};
use shipper::{listen_for_interrupts, ControlFlags, Daemon, DaemonError};
use shipper_config::{Config, ConfigError, ErrorPolicy, LoggingConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// shipperd - transcode orchestration daemon
#[derive(Parser, Debug)]
#[command(name = "shipperd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Run with built-in defaults when the configuration file is missing
    #[arg(long, default_value = "false")]
    defaults: bool,

    /// What startup recovery does with jobs in error (reset, delete, ignore)
    #[arg(long, value_parser = parse_error_policy)]
    error_policy: Option<ErrorPolicy>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the scheduler (default)
    Run,
    /// Ask a running daemon to stop once its current jobs finish
    Stop,
    /// Withdraw a pending stop request
    Resume,
}

fn parse_error_policy(value: &str) -> Result<ErrorPolicy, String> {
    value.parse().map_err(|e: ConfigError| e.to_string())
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = if args.defaults && !args.config.exists() {
        Config::from_env()?
    } else {
        Config::load(&args.config)?
    };

    if let Some(policy) = args.error_policy {
        config.recovery.error_policy = policy;
    }
    Ok(config)
}

/// Install the stderr layer and, if configured, a file layer.
///
/// The returned guard flushes the file writer and must outlive the daemon.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match logging.file.as_deref().and_then(split_log_path) {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

fn split_log_path(path: &Path) -> Option<(PathBuf, PathBuf)> {
    let name = path.file_name()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Some((dir, PathBuf::from(name)))
}

async fn run(config: Config) -> ExitCode {
    let mut daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let interrupts = listen_for_interrupts(daemon.shutdown_controller(), daemon.flags().clone());

    let result = daemon.run().await;
    interrupts.abort();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(DaemonError::Forced(_)) => ExitCode::FAILURE,
        Err(e) => {
            error!("Daemon error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = init_logging(&config.logging);
    let flags = ControlFlags::new(&config.paths.state_dir);

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!(config = %args.config.display(), "shipperd starting");
            run(config).await
        }
        Command::Stop => match flags.request_stop() {
            Ok(()) => {
                info!(flag = %flags.stop_path().display(), "Stop requested");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Could not create {}: {}", flags.stop_path().display(), e);
                ExitCode::FAILURE
            }
        },
        Command::Resume => match flags.request_resume() {
            Ok(()) => {
                info!(flag = %flags.cancel_path().display(), "Resume requested");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Could not create {}: {}", flags.cancel_path().display(), e);
                ExitCode::FAILURE
            }
        },
    }
}
