use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use encoding_rs::Encoding;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ProcessConfig;
use crate::error::{ProcessError, TaskError};
use crate::task::{
    PrepareContext, ReportResult, TaskContext, TaskFlags, TaskHandler, TaskOutput, TaskSpec,
};
use crate::util::RingBytes;

use super::abort;
use super::io_pump::{self, LineTap};
use super::protocol::{self, ErrorCapture, LogLevel};
use super::session::{ExitOutcome, ProcessLauncher, ProcessSession, ProcessStartArgs};

#[derive(Debug, Clone)]
pub struct ProcessTaskConfig {
    /// Worker executable path.
    pub program: String,
    /// Worker command, passed as the first argument.
    pub command: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
    /// Minimum level forwarded from the worker log.
    pub log_level: LogLevel,
}

impl ProcessTaskConfig {
    pub fn new(program: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            command: command.into(),
            args: Vec::new(),
            envs: HashMap::new(),
            log_level: LogLevel::Details,
        }
    }
}

/// Task driving an external worker process.
///
/// The worker is launched during `prepare` with flags requesting structured
/// progress/error output; `report` then polls: it drains decoded stdout
/// lines, applies protocol tokens to the task state, forwards ordinary log
/// lines, and asks to be called again while the worker lives. Cancellation
/// terminates the worker, graceful-then-forced.
pub struct ProcessRunnerTask {
    config: ProcessTaskConfig,
    proc_cfg: ProcessConfig,
    launcher: Arc<dyn ProcessLauncher>,
    encoding: &'static Encoding,
    session: Option<Box<dyn ProcessSession>>,
    pump: Option<JoinHandle<Result<u64, ProcessError>>>,
    line_rx: Option<mpsc::Receiver<LineTap>>,
    ring: Option<Arc<RingBytes>>,
    errors: ErrorCapture,
    log_prefix: String,
    exit: Option<ExitOutcome>,
}

impl ProcessRunnerTask {
    pub fn new(
        config: ProcessTaskConfig,
        launcher: Arc<dyn ProcessLauncher>,
        proc_cfg: &ProcessConfig,
    ) -> Self {
        Self {
            encoding: proc_cfg.console_encoding(),
            proc_cfg: proc_cfg.clone(),
            config,
            launcher,
            session: None,
            pump: None,
            line_rx: None,
            ring: None,
            errors: ErrorCapture::new(),
            log_prefix: String::new(),
            exit: None,
        }
    }

    pub fn into_spec(self) -> TaskSpec {
        let name = format!("run worker command line: {}", self.config.command);
        TaskSpec::new(name, self).with_flags(TaskFlags::coordinator())
    }

    fn drain_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(rx) = self.line_rx.as_mut() {
            while let Ok(tap) = rx.try_recv() {
                lines.push(tap.line);
            }
        }
        lines
    }

    fn process_line(&mut self, line: &str, ctx: &TaskContext) {
        if self.errors.feed_line(line) {
            if let Some(err) = self.errors.take_captured() {
                ctx.set_error(err);
            }
            return;
        }

        let progress = protocol::parse_progress_token(line);
        if let Some(p) = progress {
            ctx.update_progress(p);
        }

        match protocol::log_level_candidate(line) {
            Some((level, msg)) => {
                if msg.starts_with(protocol::PROGRESS_TAG) {
                    return;
                }
                if level < self.config.log_level {
                    return;
                }
                self.forward(level, msg);
            }
            None => {
                if progress.is_some() {
                    return;
                }
                // Not a protocol line: passed through unfiltered.
                self.forward(LogLevel::Info, line.trim());
            }
        }
    }

    fn forward(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{}{}", self.log_prefix, msg),
            LogLevel::Details => tracing::debug!("{}{}", self.log_prefix, msg),
            LogLevel::Info => tracing::info!("{}{}", self.log_prefix, msg),
            LogLevel::Error => tracing::error!("{}{}", self.log_prefix, msg),
        }
    }

    async fn drain_to_eof(&mut self, ctx: &TaskContext) {
        if let Some(pump) = self.pump.take() {
            match pump.await {
                Ok(Ok(total)) => tracing::trace!(bytes = total, "worker stdout closed"),
                Ok(Err(e)) => ctx.set_error(format!("error reading worker output: {e}")),
                Err(e) => ctx.set_error(format!("worker output pump failed: {e}")),
            }
        }
        for line in self.drain_lines() {
            self.process_line(&line, ctx);
        }
        if let Some(err) = self.errors.finish() {
            ctx.set_error(err);
        }
        self.line_rx = None;
    }
}

#[async_trait]
impl TaskHandler for ProcessRunnerTask {
    async fn prepare(&mut self, _ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        let args = protocol::worker_args(&self.config.command, &self.config.args, self.config.log_level);
        let start = ProcessStartArgs {
            cmd: self.config.program.clone(),
            args,
            envs: self.config.envs.clone(),
        };
        tracing::debug!(
            program = %start.cmd,
            args = ?start.args,
            "starting worker command line"
        );

        let mut session = self.launcher.start_session(&start).await.map_err(|e| {
            TaskError::Startup(format!("cannot start process '{}': {e}", start.cmd))
        })?;

        let pid = session
            .id()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.log_prefix = format!("process:{pid}>");

        let stdout = session
            .stdout()
            .ok_or_else(|| TaskError::Startup("worker stdout is not piped".to_string()))?;

        let ring = RingBytes::new(self.proc_cfg.capture_bytes);
        let (tx, rx) = mpsc::channel(self.proc_cfg.line_channel_capacity);
        self.pump = Some(io_pump::pump_stdout(stdout, ring.clone(), tx, self.encoding));
        self.ring = Some(ring);
        self.line_rx = Some(rx);
        self.session = Some(session);
        Ok(())
    }

    async fn report(&mut self, ctx: TaskContext) -> Result<ReportResult, TaskError> {
        if self.session.is_none() {
            return Ok(ReportResult::Finished);
        }

        for line in self.drain_lines() {
            self.process_line(&line, &ctx);
        }

        if ctx.has_error() {
            // Never overwrite an already recorded error; the worker exits on
            // its own after reporting one.
            return Ok(ReportResult::Finished);
        }

        if ctx.is_canceled() {
            let grace_ms = self.proc_cfg.abort_grace_ms;
            let session = self.session.as_mut().expect("checked above");
            abort::terminate_session(session, grace_ms).await;
            return Ok(ReportResult::Finished);
        }

        let exited = {
            let session = self.session.as_mut().expect("checked above");
            session
                .try_wait()
                .map_err(|e| TaskError::Transport(format!("wait on worker failed: {e}")))?
        };

        match exited {
            None => Ok(ReportResult::CallMeAgain),
            Some(outcome) => {
                self.exit = Some(outcome);
                self.drain_to_eof(&ctx).await;
                if !outcome.success() && !ctx.has_error() {
                    if let Some(ring) = self.ring.as_ref() {
                        tracing::debug!(tail = %ring.tail_lossy(), "worker output tail");
                    }
                    ctx.set_error("the worker process did not finish successfully");
                }
                Ok(ReportResult::Finished)
            }
        }
    }

    fn take_output(&mut self) -> Option<TaskOutput> {
        self.exit.take().map(|e| Box::new(e) as TaskOutput)
    }
}
