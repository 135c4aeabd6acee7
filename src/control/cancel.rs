use log::{error, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

use crate::control::Terminator;
use crate::utils::error::{AppError, AppResult};

/// Two interrupts closer than this force termination
pub const FORCE_WINDOW: Duration = Duration::from_secs(1);

/// What an interrupt signal should lead to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// First interrupt: stop dispatching and let running commands finish
    Graceful,
    /// Second interrupt inside the window
    Force,
    /// A late repeat; the window starts over
    Rearm,
}

/// Process-wide run flag and interrupt bookkeeping
#[derive(Debug)]
pub struct RunControl {
    running: AtomicBool,
    interrupts: AtomicU64,
    last_interrupt: Mutex<Option<Instant>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            interrupts: AtomicU64::new(0),
            last_interrupt: Mutex::new(None),
        }
    }

    /// Checked before every dispatch
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Interrupts received so far
    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::SeqCst)
    }

    /// Record an interrupt received at `now` and decide what to do
    pub fn register_interrupt(&self, now: Instant) -> InterruptAction {
        let mut last = self.last_interrupt.lock();
        let previous = self.interrupts.fetch_add(1, Ordering::SeqCst);
        let action = match *last {
            _ if previous == 0 => {
                self.stop();
                InterruptAction::Graceful
            }
            Some(at) if now.saturating_duration_since(at) < FORCE_WINDOW => InterruptAction::Force,
            _ => InterruptAction::Rearm,
        };
        *last = Some(now);
        action
    }
}

/// Turn SIGINT and SIGTERM into graceful stop or forced termination.
///
/// The first signal clears the run flag and gives running commands
/// `grace` to finish before termination is forced.
pub fn watch_signals(terminator: Arc<Terminator>, grace: Duration) -> AppResult<()> {
    let mut interrupt = signal(SignalKind::interrupt())
        .map_err(|e| AppError::ConfigError(format!("cannot watch SIGINT: {}", e)))?;
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| AppError::ConfigError(format!("cannot watch SIGTERM: {}", e)))?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.recv() => {}
                _ = terminate.recv() => {}
            }
            match terminator.control().register_interrupt(Instant::now()) {
                InterruptAction::Graceful => {
                    warn!(
                        "stopping: no new commands are started, running ones get {:?}; interrupt again within {:?} to force",
                        grace, FORCE_WINDOW
                    );
                    let terminator = Arc::clone(&terminator);
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        terminator.force("running commands did not finish in time");
                    });
                }
                InterruptAction::Force => terminator.force("interrupted twice"),
                InterruptAction::Rearm => warn!(
                    "interrupt #{} received, interrupt again within {:?} to force termination",
                    terminator.control().interrupts(),
                    FORCE_WINDOW
                ),
            }
        }
    });
    Ok(())
}

/// Force termination once the run has lasted `limit`
pub fn watch_duration(terminator: Arc<Terminator>, limit: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(limit).await;
        error!("maximum run duration {:?} reached", limit);
        terminator.control().stop();
        terminator.force("run duration exceeded");
    });
}
