use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a task as seen from the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Prepared,
    Running,
    WaitingSubtasks,
    Canceled,
    Finished,
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskState, to: TaskState },
    #[error("cannot transition from terminal state {state:?}")]
    FromTerminalState { state: TaskState },
}

/// State transition rules. Terminal states are absorbing: a canceled or
/// finished task never becomes runnable again.
pub struct StateTransition;

impl StateTransition {
    pub fn validate(from: TaskState, to: TaskState) -> Result<(), TransitionError> {
        if from == to {
            return Ok(());
        }

        if Self::is_terminal(from) {
            return Err(TransitionError::FromTerminalState { state: from });
        }

        let is_valid = match (from, to) {
            (TaskState::Created, TaskState::Prepared) => true,

            // Own work dispatched, or straight to report polling.
            (TaskState::Prepared, TaskState::Running) => true,

            // Subtasks were attached during prepare.
            (TaskState::Prepared, TaskState::WaitingSubtasks) => true,

            // All subtasks terminal; own run/report becomes eligible.
            (TaskState::WaitingSubtasks, TaskState::Running) => true,

            (TaskState::Running, TaskState::Finished) => true,

            // Any live state can be canceled.
            (_, TaskState::Canceled) => true,

            _ => false,
        };

        if is_valid {
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition { from, to })
        }
    }

    pub fn is_terminal(state: TaskState) -> bool {
        matches!(state, TaskState::Canceled | TaskState::Finished)
    }
}

/// Shared, thread-safe per-task state: progress percentage, the one-way
/// cancellation flag and the sticky error text.
///
/// Handed out as `Arc<StateInfo>` so work running off the scheduler thread
/// (spawned `run()` futures, cancel handles held by callers) can observe and
/// update it without further coordination.
#[derive(Debug, Default)]
pub struct StateInfo {
    progress: AtomicU32,
    cancel_flag: AtomicBool,
    error: Mutex<Option<String>>,
}

impl StateInfo {
    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Relaxed)
    }

    /// Values above 100 clamp to 100. Monotonicity is by convention, not
    /// enforced.
    pub fn update_progress(&self, value: u32) {
        self.progress.store(value.min(100), Ordering::Relaxed);
    }

    /// Request cancellation. Idempotent; the flag is never cleared.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Record an error. Sticky: the first non-empty error wins and later
    /// calls are ignored, as are empty strings.
    pub fn set_error(&self, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        let mut guard = self.error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(text);
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    pub fn error_text(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }
}
