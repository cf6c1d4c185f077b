//! seqflow-core: hierarchical task trees, the cooperative scheduler that
//! drives them, and the line-oriented progress/error protocol spoken with
//! external worker processes.

pub mod config;
pub mod error;
pub mod process;
pub mod scheduler;
pub mod task;
pub mod util;

pub use error::{CliError, ProcessError, SchedulerError, TaskError};
pub use scheduler::{FinishedTask, TaskScheduler};
pub use task::{
    FinishedSubtask, PrepareContext, ReportResult, TaskContext, TaskFlags, TaskHandler, TaskId,
    TaskSpec, TaskState,
};
