use thiserror::Error;

use crate::task::state::TransitionError;
use crate::task::TaskId;

/// Failure of a single task, recorded as the task's sticky error.
///
/// Cancellation is deliberately not represented here: a canceled task is a
/// state, not an error.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("startup failure: {0}")]
    Startup(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("remote server does not respond")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("unknown task id: {0}")]
    UnknownTask(TaskId),
    #[error("scheduler stalled: {0}")]
    Stalled(String),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("stream io error: {stream} {source}")]
    StreamIo {
        stream: &'static str,
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("scheduler failed: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("command failed: {0}")]
    Command(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}
