//! Filesystem control flags
//!
//! `stop.flag` in the state directory asks the daemon to stop dispatching and
//! exit once running workers drain. `cancel.flag` withdraws a pending stop:
//! both flags are removed and dispatch resumes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const STOP_FLAG: &str = "stop.flag";
pub const CANCEL_FLAG: &str = "cancel.flag";

/// Result of polling the flags once per cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    /// No stop requested
    Clear,
    /// A stop is pending
    Stop,
    /// A stop was just withdrawn
    Cancelled,
}

/// The pair of flag files in one state directory
#[derive(Debug, Clone)]
pub struct ControlFlags {
    stop: PathBuf,
    cancel: PathBuf,
}

impl ControlFlags {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            stop: state_dir.join(STOP_FLAG),
            cancel: state_dir.join(CANCEL_FLAG),
        }
    }

    pub fn stop_path(&self) -> &Path {
        &self.stop
    }

    pub fn cancel_path(&self) -> &Path {
        &self.cancel
    }

    /// Create the stop flag
    pub fn request_stop(&self) -> io::Result<()> {
        touch(&self.stop)
    }

    /// Create the cancel flag
    pub fn request_resume(&self) -> io::Result<()> {
        touch(&self.cancel)
    }

    /// Check the flags, consuming a cancel request if one is present.
    pub fn poll(&self) -> FlagState {
        if self.cancel.exists() {
            remove_quietly(&self.stop);
            remove_quietly(&self.cancel);
            info!("Stop request cancelled, resuming dispatch");
            return FlagState::Cancelled;
        }
        if self.stop.exists() {
            FlagState::Stop
        } else {
            FlagState::Clear
        }
    }

    /// Remove flags left over from a previous run.
    pub fn clear_stale(&self) {
        for path in [&self.stop, &self.cancel] {
            if path.exists() {
                info!(path = %path.display(), "Removing stale flag");
                remove_quietly(path);
            }
        }
    }
}

fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(|_| ())
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove flag: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_poll_without_flags() {
        let dir = TempDir::new().unwrap();
        let flags = ControlFlags::new(dir.path());
        assert_eq!(flags.poll(), FlagState::Clear);
        assert!(!flags.stop_path().exists());
    }

    #[test]
    fn test_stop_flag_is_sticky() {
        let dir = TempDir::new().unwrap();
        let flags = ControlFlags::new(dir.path());
        flags.request_stop().unwrap();

        assert_eq!(flags.poll(), FlagState::Stop);
        assert_eq!(flags.poll(), FlagState::Stop);
        assert!(dir.path().join(STOP_FLAG).exists());
    }

    #[test]
    fn test_cancel_removes_both_flags() {
        let dir = TempDir::new().unwrap();
        let flags = ControlFlags::new(dir.path());
        flags.request_stop().unwrap();
        flags.request_resume().unwrap();

        assert_eq!(flags.poll(), FlagState::Cancelled);
        assert!(!flags.stop_path().exists());
        assert!(!flags.cancel_path().exists());
        assert_eq!(flags.poll(), FlagState::Clear);
    }

    #[test]
    fn test_clear_stale() {
        let dir = TempDir::new().unwrap();
        let flags = ControlFlags::new(dir.path());
        flags.request_stop().unwrap();
        flags.request_resume().unwrap();

        flags.clear_stale();

        assert!(!flags.stop_path().exists());
        assert!(!flags.cancel_path().exists());
    }

    #[test]
    fn test_request_stop_twice_is_fine() {
        let dir = TempDir::new().unwrap();
        let flags = ControlFlags::new(&dir.path().join("nested"));
        flags.request_stop().unwrap();
        flags.request_stop().unwrap();
        assert_eq!(flags.poll(), FlagState::Stop);
    }
}
