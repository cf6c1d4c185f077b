use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

use seqflow_core::process::{
    ExitOutcome, ProcessLauncher, ProcessSession, ProcessStartArgs, Signal,
};

/// Launches worker processes with piped stdout. `kill_on_drop` backs up the
/// explicit termination sequence so a dropped session cannot orphan a child.
pub struct TokioProcessLauncher;

impl TokioProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    fn name(&self) -> &str {
        "tokio-process"
    }

    async fn start_session(&self, args: &ProcessStartArgs) -> Result<Box<dyn ProcessSession>> {
        let child = Command::new(&args.cmd)
            .args(&args.args)
            .envs(&args.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        Ok(Box::new(TokioProcessSession { child }))
    }
}

struct TokioProcessSession {
    child: Child,
}

impl TokioProcessSession {
    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        match self.child.id() {
            Some(pid) => {
                let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if ret != 0 {
                    anyhow::bail!("SIGTERM failed: {}", std::io::Error::last_os_error());
                }
                Ok(())
            }
            // Already reaped.
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        // No graceful signal on this platform; fall through to a kill.
        self.child.start_kill()?;
        Ok(())
    }
}

#[async_trait]
impl ProcessSession for TokioProcessSession {
    fn stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>)
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn signal(&mut self, signal: Signal) -> Result<()> {
        match signal {
            Signal::Term => self.terminate(),
            Signal::Kill => {
                self.child.kill().await?;
                Ok(())
            }
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(outcome_from_status))
    }

    async fn wait(&mut self) -> Result<ExitOutcome> {
        Ok(outcome_from_status(self.child.wait().await?))
    }
}

fn outcome_from_status(status: std::process::ExitStatus) -> ExitOutcome {
    ExitOutcome {
        exit_code: status.code().unwrap_or(-1),
        // A signal-terminated process has no exit code.
        normal: status.code().is_some(),
    }
}
