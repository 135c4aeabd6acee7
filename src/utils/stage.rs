use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::utils::error::{AppError, AppResult};

/// Observable state of a one-time staging step
#[derive(Debug)]
pub enum StageState<T> {
    Uninitialized,
    Initializing,
    Ready(Arc<T>),
    Failed(String),
}

/// One-shot lazily computed value with a cached failure.
///
/// Exactly one caller runs the initializer. Concurrent callers wait until it
/// settles and then observe the cached value, or the cached failure reason
/// as a `StagingError`. If the initializing future is dropped before it
/// settles, the cell returns to `Uninitialized` so the next caller retries.
pub struct StageCell<T> {
    state: Mutex<StageState<T>>,
    settled: Notify,
}

impl<T> Default for StageCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> StageCell<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StageState::Uninitialized),
            settled: Notify::new(),
        }
    }

    /// The staged value, if staging already succeeded
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.state.lock() {
            StageState::Ready(value) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            &*self.state.lock(),
            StageState::Ready(_) | StageState::Failed(_)
        )
    }

    /// Return the staged value, running `init` if nobody has yet.
    pub async fn get_or_stage<F, Fut>(&self, init: F) -> AppResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        loop {
            // registered before the state check so a settle in between is not missed
            let notified = self.settled.notified();
            let claimed = {
                let mut state = self.state.lock();
                match &*state {
                    StageState::Ready(value) => return Ok(Arc::clone(value)),
                    StageState::Failed(reason) => {
                        return Err(AppError::StagingError(reason.clone()))
                    }
                    StageState::Initializing => false,
                    StageState::Uninitialized => {
                        *state = StageState::Initializing;
                        true
                    }
                }
            };
            if claimed {
                break;
            }
            notified.await;
        }

        let mut reset = ResetOnDrop {
            cell: self,
            armed: true,
        };
        let result = init().await;
        reset.armed = false;

        let (outcome, state) = match result {
            Ok(value) => {
                let value = Arc::new(value);
                (Ok(Arc::clone(&value)), StageState::Ready(value))
            }
            Err(e) => {
                let reason = match e {
                    AppError::StagingError(reason) => reason,
                    other => other.to_string(),
                };
                (
                    Err(AppError::StagingError(reason.clone())),
                    StageState::Failed(reason),
                )
            }
        };
        *self.state.lock() = state;
        self.settled.notify_waiters();
        outcome
    }
}

struct ResetOnDrop<'a, T> {
    cell: &'a StageCell<T>,
    armed: bool,
}

impl<T> Drop for ResetOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *self.cell.state.lock() = StageState::Uninitialized;
            self.cell.settled.notify_waiters();
        }
    }
}
