/// Behavior switches attached to a task at construction time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    /// Skip `run()`; the task only coordinates subtasks and reports.
    pub no_run: bool,

    /// Inherit cancellation from a canceled subtask, and push cancellation
    /// requests down to live subtasks when this task is canceled.
    pub cancel_on_subtask_cancel: bool,

    /// When aggregating a failed subtree's error text, use the subtask's
    /// message verbatim instead of prefixing it with the subtask name.
    pub minimize_subtask_error_text: bool,

    pub reporting_supported: bool,
    pub reporting_enabled: bool,
}

impl TaskFlags {
    /// Flags for a pure coordinator: no own work, drives subtasks only.
    pub fn coordinator() -> Self {
        Self {
            no_run: true,
            ..Self::default()
        }
    }

    pub fn with_no_run(mut self) -> Self {
        self.no_run = true;
        self
    }

    pub fn with_cancel_on_subtask_cancel(mut self) -> Self {
        self.cancel_on_subtask_cancel = true;
        self
    }

    pub fn with_minimize_subtask_error_text(mut self) -> Self {
        self.minimize_subtask_error_text = true;
        self
    }

    pub fn with_reporting(mut self) -> Self {
        self.reporting_supported = true;
        self.reporting_enabled = true;
        self
    }
}
