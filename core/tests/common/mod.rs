use std::time::Duration;

use async_trait::async_trait;
use seqflow_core::error::TaskError;
use seqflow_core::task::{TaskContext, TaskHandler, TaskOutput, TaskSpec};

/// Leaf task for scheduler tests: optionally sleeps, fails, cancels itself
/// or produces an output value.
#[derive(Default)]
pub struct Leaf {
    pub delay_ms: u64,
    pub fail: Option<String>,
    pub cancel_self: bool,
    pub output: Option<String>,
}

impl Leaf {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failing(msg: &str) -> Self {
        Self {
            fail: Some(msg.to_string()),
            ..Self::default()
        }
    }

    pub fn canceling() -> Self {
        Self {
            cancel_self: true,
            ..Self::default()
        }
    }

    pub fn spec(self, name: &str, key: &str) -> TaskSpec {
        TaskSpec::new(name, self).with_key(key)
    }
}

#[async_trait]
impl TaskHandler for Leaf {
    async fn run(&mut self, ctx: TaskContext) -> Result<(), TaskError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        if ctx.is_canceled() {
            return Ok(());
        }
        if self.cancel_self {
            ctx.state().cancel();
            return Ok(());
        }
        if let Some(msg) = self.fail.take() {
            return Err(TaskError::failed(msg));
        }
        ctx.update_progress(100);
        Ok(())
    }

    fn take_output(&mut self) -> Option<TaskOutput> {
        self.output.take().map(|s| Box::new(s) as TaskOutput)
    }
}

/// Leaf that loops until canceled, polling the cancellation flag.
pub struct PollUntilCanceled;

#[async_trait]
impl TaskHandler for PollUntilCanceled {
    async fn run(&mut self, ctx: TaskContext) -> Result<(), TaskError> {
        while !ctx.is_canceled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}
