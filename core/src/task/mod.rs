//! Task model: the lifecycle trait implemented by every schedulable unit,
//! the spec used to attach one to the scheduler, and the snapshots handed to
//! parents when a subtask reaches a terminal state.

pub mod flags;
pub mod state;

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TaskError;

pub use flags::TaskFlags;
pub use state::{StateInfo, TaskState};

pub type TaskId = u64;

/// Opaque result value a task hands to its parent (or the caller) when it
/// finishes. Downcast with [`FinishedSubtask::take_output`].
pub type TaskOutput = Box<dyn Any + Send>;

/// Monotonic task id source, shared between the scheduler and the prepare
/// contexts it hands out.
#[derive(Debug, Default)]
pub struct IdAlloc(AtomicU64);

impl IdAlloc {
    pub fn next(&self) -> TaskId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Outcome of a `report()` invocation. `CallMeAgain` is for polling-style
/// tasks awaiting an external event (typically a worker process exit); the
/// scheduler re-invokes `report()` on its tick cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResult {
    Finished,
    CallMeAgain,
}

/// A task ready for registration: display name, optional correlation key,
/// flags and the handler implementing the lifecycle.
pub struct TaskSpec {
    pub name: String,
    pub key: Option<String>,
    pub flags: TaskFlags,
    pub handler: Box<dyn TaskHandler>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, handler: impl TaskHandler) -> Self {
        Self {
            name: name.into(),
            key: None,
            flags: TaskFlags::default(),
            handler: Box::new(handler),
        }
    }

    /// Correlation key surfaced on the [`FinishedSubtask`] snapshot, so a
    /// parent can tell its subtasks apart without tracking ids.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_flags(mut self, flags: TaskFlags) -> Self {
        self.flags = flags;
        self
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// Context passed to `prepare()`. Subtasks added here are attached before
/// the task's own `run()` becomes eligible.
pub struct PrepareContext<'a> {
    state: &'a Arc<StateInfo>,
    ids: &'a IdAlloc,
    new_subtasks: &'a mut Vec<(TaskId, TaskSpec)>,
}

impl<'a> PrepareContext<'a> {
    pub(crate) fn new(
        state: &'a Arc<StateInfo>,
        ids: &'a IdAlloc,
        new_subtasks: &'a mut Vec<(TaskId, TaskSpec)>,
    ) -> Self {
        Self {
            state,
            ids,
            new_subtasks,
        }
    }

    pub fn add_subtask(&mut self, spec: TaskSpec) -> TaskId {
        let id = self.ids.next();
        self.new_subtasks.push((id, spec));
        id
    }

    pub fn state(&self) -> &StateInfo {
        self.state
    }

    pub fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }

    pub fn set_error(&self, text: impl Into<String>) {
        self.state.set_error(text);
    }
}

/// Context passed to `run()` and `report()`. Cheap to clone; usable from a
/// spawned future.
#[derive(Clone)]
pub struct TaskContext {
    state: Arc<StateInfo>,
}

impl TaskContext {
    pub(crate) fn new(state: Arc<StateInfo>) -> Self {
        Self { state }
    }

    pub fn is_canceled(&self) -> bool {
        self.state.is_canceled()
    }

    pub fn has_error(&self) -> bool {
        self.state.has_error()
    }

    pub fn set_error(&self, text: impl Into<String>) {
        self.state.set_error(text);
    }

    pub fn progress(&self) -> u32 {
        self.state.progress()
    }

    pub fn update_progress(&self, value: u32) {
        self.state.update_progress(value);
    }

    pub fn state(&self) -> &StateInfo {
        &self.state
    }
}

/// Terminal snapshot of a subtask, delivered exactly once to the parent's
/// `on_subtask_finished`.
pub struct FinishedSubtask {
    pub id: TaskId,
    pub key: Option<String>,
    pub name: String,
    pub state: TaskState,
    pub error: Option<String>,
    pub canceled: bool,
    pub progress: u32,
    /// Report text the subtask generated, when its reporting flags are set.
    pub report: Option<String>,
    output: Option<TaskOutput>,
}

impl FinishedSubtask {
    pub(crate) fn new(
        id: TaskId,
        key: Option<String>,
        name: String,
        state: TaskState,
        error: Option<String>,
        canceled: bool,
        progress: u32,
        report: Option<String>,
        output: Option<TaskOutput>,
    ) -> Self {
        Self {
            id,
            key,
            name,
            state,
            error,
            canceled,
            progress,
            report,
            output,
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// True when the subtask finished cleanly: not canceled, no error.
    pub fn ok(&self) -> bool {
        !self.canceled && self.error.is_none()
    }

    pub fn key_is(&self, key: &str) -> bool {
        self.key.as_deref() == Some(key)
    }

    /// Take and downcast the subtask's output value. Returns `None` if the
    /// subtask produced no output, it was already taken, or the type does
    /// not match.
    pub fn take_output<T: 'static>(&mut self) -> Option<Box<T>> {
        match self.output.take() {
            Some(out) => match out.downcast::<T>() {
                Ok(v) => Some(v),
                Err(out) => {
                    self.output = Some(out);
                    None
                }
            },
            None => None,
        }
    }
}

impl std::fmt::Debug for FinishedSubtask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishedSubtask")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("canceled", &self.canceled)
            .finish_non_exhaustive()
    }
}

/// The task lifecycle.
///
/// `prepare` and `on_subtask_finished` execute on the scheduler's driver
/// and must not block; `run` and `report` are spawned, so sibling tasks
/// overlap. Errors returned from any hook become the task's sticky error.
#[async_trait]
pub trait TaskHandler: Send + 'static {
    /// Called once, before the first `run()` or subtask dispatch. May attach
    /// subtasks. Setting an error here means `run()` is never called.
    async fn prepare(&mut self, _ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    /// The task's own work. Skipped when the `no_run` flag is set. Must poll
    /// `ctx.is_canceled()` at suspension points.
    async fn run(&mut self, _ctx: TaskContext) -> Result<(), TaskError> {
        Ok(())
    }

    /// Called exactly once per subtask that reaches a terminal state, in
    /// completion order, never concurrently for one parent. Returned specs
    /// are attached as new subtasks. Must return an empty list without side
    /// effects when this task is already canceled or errored.
    fn on_subtask_finished(
        &mut self,
        _finished: &mut FinishedSubtask,
        _state: &StateInfo,
    ) -> Result<Vec<TaskSpec>, TaskError> {
        Ok(Vec::new())
    }

    /// Final bookkeeping once `run()` (if any) is done and all subtasks are
    /// terminal. Runs for canceled tasks too, so owners can release
    /// resources such as a still-running worker process.
    async fn report(&mut self, _ctx: TaskContext) -> Result<ReportResult, TaskError> {
        Ok(ReportResult::Finished)
    }

    /// Human-readable summary, collected when the reporting flags are set.
    fn generate_report(&self) -> Option<String> {
        None
    }

    /// Result value handed to the parent (or caller) with the terminal
    /// snapshot.
    fn take_output(&mut self) -> Option<TaskOutput> {
        None
    }
}
