use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use seqflow_core::config::FetchConfig;
use seqflow_core::error::TaskError;
use seqflow_core::task::state::StateInfo;
use seqflow_core::task::{
    FinishedSubtask, PrepareContext, TaskContext, TaskFlags, TaskHandler, TaskId, TaskOutput,
    TaskSpec,
};

use super::convert::{ConvertIdTask, ConvertedId};
use super::model::{AnnotationGroups, FetchedDocument, FetchedSequence};
use super::object::FetchObjectTask;
use super::source::RemoteSource;

/// Coordinator for one remote document: the reference sequence plus feature
/// sets from any number of sources, fetched in parallel.
///
/// The reference sequence is mandatory; a failed feature source is logged,
/// noted in the report and excluded from the merge. The persist step is
/// scheduled only once every fetch subtask is terminal, re-evaluated after
/// each completion.
pub struct FetchDocumentTask {
    accession: String,
    reference_source: Arc<dyn RemoteSource>,
    feature_sources: Vec<Arc<dyn RemoteSource>>,
    out_path: PathBuf,
    cfg: FetchConfig,
    sequence_task: Option<TaskId>,
    feature_tasks: HashMap<TaskId, String>,
    sequence: Option<FetchedSequence>,
    annotations: AnnotationGroups,
    persist_scheduled: bool,
    report_lines: Vec<String>,
    document: Option<FetchedDocument>,
}

impl FetchDocumentTask {
    pub fn new(
        accession: impl Into<String>,
        reference_source: Arc<dyn RemoteSource>,
        feature_sources: Vec<Arc<dyn RemoteSource>>,
        out_path: impl Into<PathBuf>,
        cfg: &FetchConfig,
    ) -> Self {
        Self {
            accession: accession.into(),
            reference_source,
            feature_sources,
            out_path: out_path.into(),
            cfg: cfg.clone(),
            sequence_task: None,
            feature_tasks: HashMap::new(),
            sequence: None,
            annotations: AnnotationGroups::default(),
            persist_scheduled: false,
            report_lines: Vec::new(),
            document: None,
        }
    }

    pub fn spec(self) -> TaskSpec {
        let name = format!("load remote document for: {}", self.accession);
        TaskSpec::new(name, self).with_flags(
            TaskFlags::coordinator()
                .with_minimize_subtask_error_text()
                .with_reporting(),
        )
    }

    fn all_data_loaded(&self) -> bool {
        self.sequence_task.is_none() && self.feature_tasks.is_empty()
    }
}

#[async_trait]
impl TaskHandler for FetchDocumentTask {
    async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        let sequence = FetchObjectTask::sequence(
            self.accession.clone(),
            self.reference_source.clone(),
            &self.cfg,
        );
        self.sequence_task = Some(ctx.add_subtask(sequence.spec("sequence")));

        for source in &self.feature_sources {
            let task = FetchObjectTask::features(self.accession.clone(), source.clone(), &self.cfg);
            let id = ctx.add_subtask(task.spec(format!("features:{}", source.name())));
            self.feature_tasks.insert(id, source.name().to_string());
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

        if self.sequence_task == Some(finished.id) {
            self.sequence_task = None;
            if finished.has_error() {
                state.set_error(format!(
                    "cannot find reference sequence: {}",
                    self.accession
                ));
                return Ok(Vec::new());
            }
            if !finished.canceled {
                self.sequence = finished.take_output::<FetchedSequence>().map(|b| *b);
            }
        } else if let Some(source_name) = self.feature_tasks.remove(&finished.id) {
            if finished.has_error() {
                tracing::info!(
                    accession = %self.accession,
                    source = %source_name,
                    "cannot load features for '{}' from {}",
                    self.accession,
                    source_name
                );
                self.report_lines.push(format!(
                    "cannot receive response from the server \"{source_name}\""
                ));
            } else if !finished.canceled {
                if let Some(groups) = finished.take_output::<AnnotationGroups>() {
                    self.report_lines.push(format!(
                        "received {} annotations from the server \"{source_name}\"",
                        groups.annotation_count()
                    ));
                    self.annotations.merge(*groups);
                }
            }
        } else if finished.key_is("persist") {
            if finished.has_error() {
                state.set_error(format!("cannot save document: {}", self.accession));
            }
            return Ok(Vec::new());
        }

        if self.all_data_loaded() && !self.persist_scheduled {
            if let Some(sequence) = self.sequence.clone() {
                self.persist_scheduled = true;
                let document = FetchedDocument {
                    accession: self.accession.clone(),
                    sequence,
                    annotations: self.annotations.clone(),
                };
                self.document = Some(document.clone());
                let persist = PersistTask::new(document, self.out_path.clone());
                return Ok(vec![persist.spec("persist")]);
            }
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
        self.document.take().map(|d| Box::new(d) as TaskOutput)
    }
}

/// Write the merged document to disk as JSON.
pub struct PersistTask {
    document: FetchedDocument,
    path: PathBuf,
}

impl PersistTask {
    pub fn new(document: FetchedDocument, path: impl Into<PathBuf>) -> Self {
        Self {
            document,
            path: path.into(),
        }
    }

    pub fn spec(self, key: impl Into<String>) -> TaskSpec {
        let name = format!("save document: {}", self.path.display());
        TaskSpec::new(name, self).with_key(key)
    }
}

#[async_trait]
impl TaskHandler for PersistTask {
    async fn run(&mut self, ctx: TaskContext) -> Result<(), TaskError> {
        if ctx.is_canceled() {
            return Ok(());
        }
        let data = serde_json::to_vec_pretty(&self.document)
            .map_err(|e| TaskError::failed(format!("cannot serialize document: {e}")))?;
        tokio::fs::write(&self.path, data)
            .await
            .map_err(|e| TaskError::failed(format!("cannot write '{}': {e}", self.path.display())))?;
        tracing::debug!(path = %self.path.display(), "document saved");
        Ok(())
    }
}

/// Two-phase chain: resolve the accession first, then load the document
/// under the converted id. Conversion failure is non-fatal; the original
/// accession is used instead. A failed load is adopted as this task's error.
pub struct ConvertIdAndFetchDocumentTask {
    accession: String,
    reference_source: Arc<dyn RemoteSource>,
    feature_sources: Vec<Arc<dyn RemoteSource>>,
    out_path: PathBuf,
    cfg: FetchConfig,
    convert_id: bool,
    document: Option<FetchedDocument>,
    load_report: Option<String>,
}

impl ConvertIdAndFetchDocumentTask {
    pub fn new(
        accession: impl Into<String>,
        reference_source: Arc<dyn RemoteSource>,
        feature_sources: Vec<Arc<dyn RemoteSource>>,
        out_path: impl Into<PathBuf>,
        convert_id: bool,
        cfg: &FetchConfig,
    ) -> Self {
        Self {
            accession: accession.into(),
            reference_source,
            feature_sources,
            out_path: out_path.into(),
            cfg: cfg.clone(),
            convert_id,
            document: None,
            load_report: None,
        }
    }

    pub fn spec(self) -> TaskSpec {
        let name = format!("convert id and load document for: {}", self.accession);
        TaskSpec::new(name, self).with_flags(
            TaskFlags::coordinator()
                .with_cancel_on_subtask_cancel()
                .with_minimize_subtask_error_text()
                .with_reporting(),
        )
    }

    fn load_spec(&self) -> TaskSpec {
        FetchDocumentTask::new(
            self.accession.clone(),
            self.reference_source.clone(),
            self.feature_sources.clone(),
            &self.out_path,
            &self.cfg,
        )
        .spec()
        .with_key("load")
    }
}

#[async_trait]
impl TaskHandler for ConvertIdAndFetchDocumentTask {
    async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        if self.convert_id {
            let convert = ConvertIdTask::new(
                self.accession.clone(),
                self.reference_source.clone(),
                &self.cfg,
            );
            ctx.add_subtask(convert.spec("convert"));
        } else {
            let spec = self.load_spec();
            ctx.add_subtask(spec);
        }
        Ok(())
    }

    fn on_subtask_finished(
        &mut self,
        finished: &mut FinishedSubtask,
        state: &StateInfo,
    ) -> Result<Vec<TaskSpec>, TaskError> {
        if finished.canceled || state.is_canceled() || state.has_error() {
            return Ok(Vec::new());
        }

        if finished.key_is("convert") {
            if !finished.has_error() {
                if let Some(converted) = finished.take_output::<ConvertedId>() {
                    if let Some(accession) = converted.converted {
                        if !accession.is_empty() {
                            tracing::debug!(
                                "\"{}\" was converted into \"{}\"",
                                self.accession,
                                accession
                            );
                            self.accession = accession;
                        }
                    }
                }
            }
            return Ok(vec![self.load_spec()]);
        }

        if finished.key_is("load") {
            self.load_report = finished.report.take();
            if let Some(error) = finished.error.clone() {
                state.set_error(error);
            } else if !finished.canceled {
                self.document = finished.take_output::<FetchedDocument>().map(|b| *b);
            }
        }
        Ok(Vec::new())
    }

    fn generate_report(&self) -> Option<String> {
        self.load_report.clone()
    }

    fn take_output(&mut self) -> Option<TaskOutput> {
        self.document.take().map(|d| Box::new(d) as TaskOutput)
    }
}
