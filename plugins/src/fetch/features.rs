use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use seqflow_core::config::FetchConfig;
use seqflow_core::error::TaskError;
use seqflow_core::task::state::StateInfo;
use seqflow_core::task::{
    FinishedSubtask, PrepareContext, TaskFlags, TaskHandler, TaskId, TaskOutput, TaskSpec,
};

use super::model::AnnotationGroups;
use super::object::FetchObjectTask;
use super::source::RemoteSource;

/// Load feature annotations for a set of accessions from every configured
/// source, merging the results with structural dedup. Per-source failures
/// are tolerated and only noted in the generated report.
pub struct FetchFeaturesTask {
    accessions: Vec<String>,
    sources: Vec<Arc<dyn RemoteSource>>,
    cfg: FetchConfig,
    subtasks: HashMap<TaskId, String>,
    annotations: AnnotationGroups,
    report_lines: Vec<String>,
}

impl FetchFeaturesTask {
    pub fn new(
        accessions: Vec<String>,
        sources: Vec<Arc<dyn RemoteSource>>,
        cfg: &FetchConfig,
    ) -> Self {
        Self {
            accessions,
            sources,
            cfg: cfg.clone(),
            subtasks: HashMap::new(),
            annotations: AnnotationGroups::default(),
            report_lines: Vec::new(),
        }
    }

    pub fn spec(self) -> TaskSpec {
        TaskSpec::new("load feature annotations", self).with_flags(
            TaskFlags::coordinator()
                .with_cancel_on_subtask_cancel()
                .with_reporting(),
        )
    }
}

#[async_trait]
impl TaskHandler for FetchFeaturesTask {
    async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        for accession in &self.accessions {
            for source in &self.sources {
                let task = FetchObjectTask::features(accession.clone(), source.clone(), &self.cfg);
                let key = format!("features:{accession}:{}", source.name());
                let id = ctx.add_subtask(task.spec(key));
                self.subtasks.insert(id, source.name().to_string());
            }
        }
        Ok(())
    }

    fn on_subtask_finished(
        &mut self,
        finished: &mut FinishedSubtask,
        state: &StateInfo,
    ) -> Result<Vec<TaskSpec>, TaskError> {
        if state.is_canceled() || state.has_error() {
            return Ok(Vec::new());
        }

        let source_name = match self.subtasks.remove(&finished.id) {
            Some(name) => name,
            None => return Ok(Vec::new()),
        };

        if finished.has_error() {
            self.report_lines.push(format!(
                "cannot receive response from the server \"{source_name}\""
            ));
        } else if let Some(groups) = finished.take_output::<AnnotationGroups>() {
            self.report_lines.push(format!(
                "received {} annotations from the server \"{source_name}\"",
                groups.annotation_count()
            ));
            self.annotations.merge(*groups);
        }
        Ok(Vec::new())
    }

    fn generate_report(&self) -> Option<String> {
        if self.report_lines.is_empty() {
            None
        } else {
            Some(self.report_lines.join("\n"))
        }
    }

    fn take_output(&mut self) -> Option<TaskOutput> {
        Some(Box::new(std::mem::take(&mut self.annotations)))
    }
}
