use std::sync::Arc;
use std::time::Duration;

use seqflow_core::config::AppConfig;
use seqflow_core::error::CliError;
use seqflow_core::process::{LogLevel, ProcessRunnerTask, ProcessTaskConfig};
use seqflow_core::TaskScheduler;
use seqflow_plugins::process::TokioProcessLauncher;

use super::cli::RunArgs;
use crate::progress;

pub async fn execute(mut args: RunArgs, cfg: &AppConfig) -> Result<i32, CliError> {
    let command = args.command.remove(0);
    let program = match args.program.take() {
        Some(program) => program,
        None => std::env::current_exe()?.to_string_lossy().to_string(),
    };
    let log_level = LogLevel::parse_flag_name(&args.log_level)
        .ok_or_else(|| CliError::Config(format!("unknown log level: {}", args.log_level)))?;

    let mut config = ProcessTaskConfig::new(program, command);
    config.args = args.command;
    config.log_level = log_level;

    let task = ProcessRunnerTask::new(config, Arc::new(TokioProcessLauncher::new()), &cfg.process);

    let run_id = uuid::Uuid::new_v4();
    tracing::debug!(run_id = %run_id, "run initialized");

    let mut scheduler = TaskScheduler::new(cfg.scheduler.clone());
    let root = scheduler.register(task.into_spec());
    let info = scheduler
        .info_handle(root)
        .ok_or_else(|| CliError::Command("task registration failed".to_string()))?;

    // Ctrl-C requests cooperative cancellation; the scheduler terminates the
    // worker process on the way out.
    {
        let info = info.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested");
                info.cancel();
            }
        });
    }

    let bar = progress::start_bar(!args.quiet);
    let poll_task = {
        let bar = bar.clone();
        let info = info.clone();
        tokio::spawn(async move {
            loop {
                bar.set_position(info.progress() as u64);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    scheduler.drive().await?;
    poll_task.abort();

    let finished = scheduler.take_finished(root)?;
    progress::finish_bar(&bar, finished.ok());

    if let Some(error) = finished.tree_error.as_deref() {
        eprintln!("{error}");
        return Ok(1);
    }
    if finished.canceled {
        return Ok(130);
    }
    Ok(0)
}
