use std::sync::Arc;

use async_trait::async_trait;

use seqflow_core::config::FetchConfig;
use seqflow_core::error::TaskError;
use seqflow_core::task::{TaskContext, TaskFlags, TaskHandler, TaskOutput, TaskSpec};

use super::model::{AnnotationGroups, FetchedSequence};
use super::payload;
use super::source::{fetch_guarded, FetchKind, RemoteSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Sequence,
    Features,
}

/// Fetch one remote object (the reference sequence or one source's feature
/// set). Transport failures, timeouts and malformed payloads each fail this
/// task alone; coordinating parents decide what propagates.
pub struct FetchObjectTask {
    accession: String,
    source: Arc<dyn RemoteSource>,
    kind: ObjectKind,
    cfg: FetchConfig,
    sequence: Option<FetchedSequence>,
    features: Option<AnnotationGroups>,
}

impl FetchObjectTask {
    pub fn sequence(
        accession: impl Into<String>,
        source: Arc<dyn RemoteSource>,
        cfg: &FetchConfig,
    ) -> Self {
        Self::new(accession, source, ObjectKind::Sequence, cfg)
    }

    pub fn features(
        accession: impl Into<String>,
        source: Arc<dyn RemoteSource>,
        cfg: &FetchConfig,
    ) -> Self {
        Self::new(accession, source, ObjectKind::Features, cfg)
    }

    fn new(
        accession: impl Into<String>,
        source: Arc<dyn RemoteSource>,
        kind: ObjectKind,
        cfg: &FetchConfig,
    ) -> Self {
        Self {
            accession: accession.into(),
            source,
            kind,
            cfg: cfg.clone(),
            sequence: None,
            features: None,
        }
    }

    pub fn spec(self, key: impl Into<String>) -> TaskSpec {
        let name = format!(
            "load remote data for '{}' from {}",
            self.accession,
            self.source.name()
        );
        TaskSpec::new(name, self)
            .with_key(key)
            .with_flags(TaskFlags::default().with_minimize_subtask_error_text())
    }
}

#[async_trait]
impl TaskHandler for FetchObjectTask {
    async fn run(&mut self, ctx: TaskContext) -> Result<(), TaskError> {
        if ctx.is_canceled() {
            return Ok(());
        }
        ctx.update_progress(0);
        tracing::trace!(accession = %self.accession, source = %self.source.name(), "start loading remote data");

        let kind = match self.kind {
            ObjectKind::Sequence => FetchKind::Sequence,
            ObjectKind::Features => FetchKind::Features,
        };
        let data = match fetch_guarded(&self.source, &self.accession, kind, &self.cfg, &ctx).await? {
            Some(data) => data,
            // Canceled mid-transfer; not an error.
            None => return Ok(()),
        };

        tracing::trace!(bytes = data.len(), "download finished");

        match self.kind {
            ObjectKind::Sequence => {
                self.sequence = Some(payload::parse_sequence(&data, &self.accession)?);
            }
            ObjectKind::Features => {
                self.features = Some(payload::parse_features(&data)?);
            }
        }
        ctx.update_progress(100);
        Ok(())
    }

    fn take_output(&mut self) -> Option<TaskOutput> {
        if let Some(sequence) = self.sequence.take() {
            return Some(Box::new(sequence));
        }
        if let Some(features) = self.features.take() {
            return Some(Box::new(features));
        }
        None
    }
}
