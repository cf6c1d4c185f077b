use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Signal {
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy)]
pub struct ExitOutcome {
    pub exit_code: i32,
    /// False when the process was terminated by a signal or otherwise died
    /// abnormally.
    pub normal: bool,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.normal && self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessStartArgs {
    pub cmd: String,
    pub args: Vec<String>,
    pub envs: HashMap<String, String>,
}

/// A live child process. Owned exclusively by the task that launched it.
#[async_trait]
pub trait ProcessSession: Send {
    /// Take the piped stdout reader. Yields `Some` at most once.
    fn stdout(&mut self) -> Option<Box<dyn AsyncRead + Unpin + Send>>;

    fn id(&self) -> Option<u32>;

    async fn signal(&mut self, signal: Signal) -> anyhow::Result<()>;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> anyhow::Result<Option<ExitOutcome>>;

    async fn wait(&mut self) -> anyhow::Result<ExitOutcome>;
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn name(&self) -> &str;

    async fn start_session(
        &self,
        args: &ProcessStartArgs,
    ) -> anyhow::Result<Box<dyn ProcessSession>>;
}
