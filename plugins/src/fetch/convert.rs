use std::sync::Arc;

use async_trait::async_trait;

use seqflow_core::config::FetchConfig;
use seqflow_core::error::TaskError;
use seqflow_core::task::{TaskContext, TaskFlags, TaskHandler, TaskOutput, TaskSpec};

use super::payload;
use super::source::{fetch_guarded, FetchKind, RemoteSource};

/// Result of an accession conversion. `converted` stays `None` when the
/// service had no candidate; callers fall back to the source accession.
#[derive(Debug, Clone)]
pub struct ConvertedId {
    pub source_accession: String,
    pub converted: Option<String>,
}

/// Resolve an external accession to the reference database's canonical id.
pub struct ConvertIdTask {
    accession: String,
    source: Arc<dyn RemoteSource>,
    cfg: FetchConfig,
    converted: Option<String>,
}

impl ConvertIdTask {
    pub fn new(
        accession: impl Into<String>,
        source: Arc<dyn RemoteSource>,
        cfg: &FetchConfig,
    ) -> Self {
        Self {
            accession: accession.into(),
            source,
            cfg: cfg.clone(),
            converted: None,
        }
    }

    pub fn spec(self, key: impl Into<String>) -> TaskSpec {
        let name = format!("convert accession id: {}", self.accession);
        TaskSpec::new(name, self)
            .with_key(key)
            .with_flags(TaskFlags::default().with_minimize_subtask_error_text())
    }
}

#[async_trait]
impl TaskHandler for ConvertIdTask {
    async fn run(&mut self, ctx: TaskContext) -> Result<(), TaskError> {
        if ctx.is_canceled() {
            return Ok(());
        }
        ctx.update_progress(0);

        let data = match fetch_guarded(
            &self.source,
            &self.accession,
            FetchKind::ConvertId,
            &self.cfg,
            &ctx,
        )
        .await?
        {
            Some(data) => data,
            None => return Ok(()),
        };

        self.converted = payload::parse_convert(&data)?;
        ctx.update_progress(100);
        Ok(())
    }

    fn take_output(&mut self) -> Option<TaskOutput> {
        Some(Box::new(ConvertedId {
            source_accession: self.accession.clone(),
            converted: self.converted.take(),
        }))
    }
}
