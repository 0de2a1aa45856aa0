//! Shutdown coordination
//!
//! The daemon moves through three shutdown levels. `Running` dispatches work.
//! `Graceful` stops dispatching and waits for running workers to finish.
//! `Forced` tells every worker to terminate its child process now. The level
//! is broadcast over a `watch` channel so workers can react without polling.

use crate::flags::ControlFlags;
use std::future;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How far shutdown has progressed. Ordered: `Running < Graceful < Forced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownLevel {
    Running,
    Graceful,
    Forced,
}

impl std::fmt::Display for ShutdownLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownLevel::Running => write!(f, "running"),
            ShutdownLevel::Graceful => write!(f, "graceful"),
            ShutdownLevel::Forced => write!(f, "forced"),
        }
    }
}

/// Owner side of the shutdown channel
#[derive(Debug, Clone)]
pub struct ShutdownController {
    tx: Arc<watch::Sender<ShutdownLevel>>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShutdownLevel::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn level(&self) -> ShutdownLevel {
        *self.tx.borrow()
    }

    /// A receiver for workers and the scheduler
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Move one level further and return the new level.
    pub fn escalate(&self) -> ShutdownLevel {
        self.tx.send_if_modified(|level| {
            let next = match *level {
                ShutdownLevel::Running => ShutdownLevel::Graceful,
                _ => ShutdownLevel::Forced,
            };
            let changed = next != *level;
            *level = next;
            changed
        });
        self.level()
    }

    /// Ask for a graceful stop. No effect once shutdown has begun.
    pub fn request_graceful(&self) {
        self.tx.send_if_modified(|level| {
            if *level == ShutdownLevel::Running {
                *level = ShutdownLevel::Graceful;
                true
            } else {
                false
            }
        });
    }

    /// Jump straight to `Forced`.
    pub fn force(&self) {
        self.tx.send_if_modified(|level| {
            let changed = *level != ShutdownLevel::Forced;
            *level = ShutdownLevel::Forced;
            changed
        });
    }

    /// Withdraw a graceful stop. A forced stop cannot be withdrawn.
    pub fn resume(&self) -> bool {
        self.tx.send_if_modified(|level| {
            if *level == ShutdownLevel::Graceful {
                *level = ShutdownLevel::Running;
                true
            } else {
                false
            }
        })
    }
}

/// Receiver side of the shutdown channel
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownLevel>,
}

impl ShutdownSignal {
    pub fn level(&self) -> ShutdownLevel {
        *self.rx.borrow()
    }

    pub fn is_forced(&self) -> bool {
        self.level() == ShutdownLevel::Forced
    }

    /// Resolve on the next level change.
    ///
    /// Never resolves once the controller is gone.
    pub async fn changed(&mut self) {
        if self.rx.changed().await.is_err() {
            future::pending::<()>().await;
        }
    }

    /// Resolve once the level reaches `Forced`.
    pub async fn forced(&mut self) {
        loop {
            if self.is_forced() {
                return;
            }
            self.changed().await;
        }
    }
}

/// Translate SIGINT/SIGTERM into shutdown steps.
///
/// The first interrupt creates the stop flag, so a cancel flag can withdraw
/// it, and moves to `Graceful`. The next one moves to `Forced`.
pub fn listen_for_interrupts(controller: ShutdownController, flags: ControlFlags) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_interrupt().await {
                warn!("Cannot listen for interrupts: {}", e);
                return;
            }

            match controller.escalate() {
                ShutdownLevel::Graceful => {
                    if let Err(e) = flags.request_stop() {
                        warn!(path = %flags.stop_path().display(), "Failed to create stop flag: {}", e);
                    }
                    info!("Interrupt received: no new jobs will start, running jobs will finish. Interrupt again to force.");
                }
                ShutdownLevel::Forced => {
                    warn!("Second interrupt received: terminating running jobs");
                    return;
                }
                ShutdownLevel::Running => {}
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_interrupt() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_levels_are_ordered() {
        assert!(ShutdownLevel::Running < ShutdownLevel::Graceful);
        assert!(ShutdownLevel::Graceful < ShutdownLevel::Forced);
    }

    #[test]
    fn test_escalate_steps_once_per_call() {
        let controller = ShutdownController::new();
        assert_eq!(controller.level(), ShutdownLevel::Running);
        assert_eq!(controller.escalate(), ShutdownLevel::Graceful);
        assert_eq!(controller.escalate(), ShutdownLevel::Forced);
        assert_eq!(controller.escalate(), ShutdownLevel::Forced);
    }

    #[test]
    fn test_resume_only_from_graceful() {
        let controller = ShutdownController::new();
        assert!(!controller.resume());

        controller.request_graceful();
        assert!(controller.resume());
        assert_eq!(controller.level(), ShutdownLevel::Running);

        controller.force();
        assert!(!controller.resume());
        controller.request_graceful();
        assert_eq!(controller.level(), ShutdownLevel::Forced);
    }

    #[test]
    fn test_signal_sees_controller_level() {
        let controller = ShutdownController::new();
        let signal = controller.subscribe();
        controller.request_graceful();
        assert_eq!(signal.level(), ShutdownLevel::Graceful);
        assert!(!signal.is_forced());
    }

    #[tokio::test]
    async fn test_forced_resolves_after_escalation() {
        let controller = ShutdownController::new();
        let mut signal = controller.subscribe();

        let waiter = tokio::spawn(async move {
            signal.forced().await;
        });

        controller.request_graceful();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        controller.force();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("forced() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_forced_resolves_immediately_when_already_forced() {
        let controller = ShutdownController::new();
        controller.force();
        let mut signal = controller.subscribe();
        tokio::time::timeout(Duration::from_millis(200), signal.forced())
            .await
            .expect("already forced");
    }
}
