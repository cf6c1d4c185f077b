//! Worker mode: the child side of the wire protocol. All protocol output
//! goes to stdout with plain writes; the parent process parses it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use seqflow_core::error::CliError;
use seqflow_core::process::protocol::{self, ERROR_SENTINEL};
use seqflow_core::process::LogLevel;
use tokio::task::JoinHandle;

use super::cli::{WorkerArgs, WorkerJob};

const PROGRESS_EMIT_INTERVAL_MS: u64 = 500;

struct ProtocolEmitter {
    emit_progress: bool,
    emit_error: bool,
    min_level: LogLevel,
    progress: Arc<AtomicU32>,
}

impl ProtocolEmitter {
    fn new(args: &WorkerArgs) -> Self {
        Self {
            emit_progress: args.emit_progress_state,
            emit_error: args.emit_task_error,
            min_level: args.min_level(),
            progress: Arc::new(AtomicU32::new(0)),
        }
    }

    fn log(&self, level: LogLevel, msg: &str) {
        if level >= self.min_level {
            println!("{}", protocol::format_log_line(level, msg));
        }
    }

    fn set_progress(&self, value: u32) {
        self.progress.store(value.min(100), Ordering::Relaxed);
    }

    /// Periodic progress emission while a job runs.
    fn spawn_progress_timer(&self) -> Option<JoinHandle<()>> {
        if !self.emit_progress {
            return None;
        }
        let progress = self.progress.clone();
        Some(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(PROGRESS_EMIT_INTERVAL_MS));
            loop {
                tick.tick().await;
                println!("{}", protocol::progress_line(progress.load(Ordering::Relaxed)));
            }
        }))
    }

    /// Final progress emission, at job completion.
    fn emit_progress_now(&self) {
        if self.emit_progress {
            println!("{}", protocol::progress_line(self.progress.load(Ordering::Relaxed)));
        }
    }

    fn emit_error_report(&self, message: &str, open: bool) {
        if !self.emit_error {
            return;
        }
        if open {
            println!(
                "{}",
                protocol::format_log_line(LogLevel::Info, &format!("{ERROR_SENTINEL}{message}"))
            );
        } else {
            println!("{}", protocol::error_report(message));
        }
    }
}

pub async fn execute(args: WorkerArgs) -> Result<i32, CliError> {
    let emitter = ProtocolEmitter::new(&args);

    match &args.job {
        WorkerJob::Count { steps, interval_ms } => {
            let steps = (*steps).max(1);
            let timer = emitter.spawn_progress_timer();
            emitter.log(LogLevel::Info, &format!("counting {steps} steps"));

            for i in 1..=steps {
                tokio::time::sleep(Duration::from_millis(*interval_ms)).await;
                emitter.set_progress((i * 100 / steps) as u32);
                emitter.log(LogLevel::Details, &format!("completed step {i} of {steps}"));
                if !args.log_no_task_progress {
                    emitter.log(LogLevel::Info, &format!("progress: {}%", i * 100 / steps));
                }
            }

            if let Some(timer) = timer {
                timer.abort();
            }
            emitter.emit_progress_now();
            emitter.log(LogLevel::Info, "job finished");
            Ok(0)
        }

        WorkerJob::Fail { message, open } => {
            emitter.log(LogLevel::Info, "job starting");
            tokio::time::sleep(Duration::from_millis(100)).await;
            emitter.log(LogLevel::Error, message);
            emitter.emit_error_report(message, *open);
            Ok(1)
        }

        WorkerJob::Hang => {
            emitter.log(LogLevel::Info, "hanging until terminated");
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        WorkerJob::Spam => {
            let timer = emitter.spawn_progress_timer();
            emitter.log(LogLevel::Trace, "trace detail");
            emitter.log(LogLevel::Details, "details message");
            emitter.log(LogLevel::Info, "info message");
            emitter.log(LogLevel::Error, "error-level log line");
            println!("free-form line without a header");
            emitter.set_progress(100);
            if let Some(timer) = timer {
                timer.abort();
            }
            emitter.emit_progress_now();
            Ok(0)
        }
    }
}
