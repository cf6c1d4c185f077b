use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use seqflow_core::config::FetchConfig;
use seqflow_core::error::TaskError;
use seqflow_core::task::TaskState;
use seqflow_core::TaskScheduler;
use seqflow_plugins::fetch::{
    AnnotationGroups, ConvertIdAndFetchDocumentTask, FetchDocumentTask, FetchFeaturesTask,
    FetchKind, FetchObjectTask, FetchedDocument, ProgressFn, RemoteSource,
};
use serde_json::json;

/// Scripted remote source: one response per fetch kind, with a request log.
struct MockSource {
    name: String,
    responses: HashMap<FetchKind, MockResponse>,
    requested: Arc<Mutex<Vec<(String, FetchKind)>>>,
}

enum MockResponse {
    Json(serde_json::Value),
    Error(String),
    /// Never completes; the guard counts transport releases.
    Hang(Arc<AtomicUsize>),
}

struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl MockSource {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            responses: HashMap::new(),
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn respond(mut self, kind: FetchKind, body: serde_json::Value) -> Self {
        self.responses.insert(kind, MockResponse::Json(body));
        self
    }

    fn fail(mut self, kind: FetchKind, msg: &str) -> Self {
        self.responses
            .insert(kind, MockResponse::Error(msg.to_string()));
        self
    }

    fn hang(mut self, kind: FetchKind, releases: Arc<AtomicUsize>) -> Self {
        self.responses.insert(kind, MockResponse::Hang(releases));
        self
    }

    fn request_log(&self) -> Arc<Mutex<Vec<(String, FetchKind)>>> {
        self.requested.clone()
    }
}

#[async_trait]
impl RemoteSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        accession: &str,
        kind: FetchKind,
        _on_progress: ProgressFn,
    ) -> Result<Vec<u8>, TaskError> {
        self.requested
            .lock()
            .unwrap()
            .push((accession.to_string(), kind));

        match self.responses.get(&kind) {
            Some(MockResponse::Json(v)) => Ok(serde_json::to_vec(v).unwrap()),
            Some(MockResponse::Error(msg)) => Err(TaskError::Transport(msg.clone())),
            Some(MockResponse::Hang(releases)) => {
                let _guard = ReleaseGuard(releases.clone());
                std::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
            None => Err(TaskError::Transport("no scripted response".to_string())),
        }
    }
}

fn sequence_json(id: &str) -> serde_json::Value {
    json!({"id": id, "residues": "MKTAYIAKQRQISFVKSHFSRQLEERLGLIEVQ"})
}

fn features_json(group: &str, names: &[&str]) -> serde_json::Value {
    let annotations: Vec<_> = names
        .iter()
        .map(|n| json!({"name": n, "region": [0, 10]}))
        .collect();
    json!({ group: annotations })
}

#[tokio::test(start_paused = true)]
async fn failed_reference_sequence_fails_the_tree_and_skips_persist() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("P12345.json");

    let reference: Arc<dyn RemoteSource> = Arc::new(
        MockSource::new("reference").fail(FetchKind::Sequence, "connection refused"),
    );
    let features_a: Arc<dyn RemoteSource> = Arc::new(
        MockSource::new("source-a").respond(FetchKind::Features, features_json("domain", &["d1"])),
    );
    let features_b: Arc<dyn RemoteSource> = Arc::new(
        MockSource::new("source-b").respond(FetchKind::Features, features_json("site", &["s1"])),
    );

    let task = FetchDocumentTask::new(
        "P12345",
        reference,
        vec![features_a, features_b],
        &out,
        &FetchConfig::default(),
    );

    let mut scheduler = TaskScheduler::default();
    let root = scheduler.register(task.spec());
    scheduler.drive().await.unwrap();

    // Sequence + two feature fetches, but never a persist subtask.
    assert_eq!(scheduler.children_of(root).len(), 3);

    let finished = scheduler.take_finished(root).unwrap();
    assert_eq!(
        finished.error.as_deref(),
        Some("cannot find reference sequence: P12345")
    );
    assert!(!out.exists(), "persist step must never be scheduled");
}

#[tokio::test(start_paused = true)]
async fn partial_feature_failure_is_tolerated_and_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("P12345.json");

    let reference: Arc<dyn RemoteSource> =
        Arc::new(MockSource::new("reference").respond(FetchKind::Sequence, sequence_json("P12345")));
    let features_a: Arc<dyn RemoteSource> = Arc::new(
        MockSource::new("source-a")
            .respond(FetchKind::Features, features_json("domain", &["d1", "d2"])),
    );
    let features_b: Arc<dyn RemoteSource> =
        Arc::new(MockSource::new("source-b").fail(FetchKind::Features, "gateway timeout"));

    let task = FetchDocumentTask::new(
        "P12345",
        reference,
        vec![features_a, features_b],
        &out,
        &FetchConfig::default(),
    );

    let mut scheduler = TaskScheduler::default();
    let mut finished = scheduler.run_task(task.spec()).await.unwrap();

    assert_eq!(finished.state, TaskState::Finished);
    assert!(finished.error.is_none(), "partial failure is not fatal");

    let report = finished.report.clone().expect("report generated");
    assert!(
        report.contains("cannot receive response from the server \"source-b\""),
        "failed source named in report: {report}"
    );
    assert!(report.contains("received 2 annotations from the server \"source-a\""));

    let document = finished
        .take_output::<FetchedDocument>()
        .expect("document output");
    assert_eq!(document.annotations.0.keys().collect::<Vec<_>>(), ["domain"]);
    assert_eq!(document.annotations.annotation_count(), 2);

    let persisted: FetchedDocument =
        serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(persisted.sequence.id, "P12345");
    assert_eq!(persisted.annotations, document.annotations);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_source_times_out_and_releases_its_transport_once() {
    let releases = Arc::new(AtomicUsize::new(0));
    let source: Arc<dyn RemoteSource> =
        Arc::new(MockSource::new("slow").hang(FetchKind::Sequence, releases.clone()));

    let task = FetchObjectTask::sequence("P12345", source, &FetchConfig::default());

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler.run_task(task.spec("sequence")).await.unwrap();

    assert_eq!(
        finished.error.as_deref(),
        Some("remote server does not respond")
    );
    assert_eq!(
        releases.load(Ordering::SeqCst),
        1,
        "transport released exactly once"
    );
}

#[tokio::test(start_paused = true)]
async fn feature_composite_merges_across_accessions_with_dedup() {
    // Source "a" serves the same payload for every accession, so the merged
    // result keeps a single structural copy per annotation. Source "b" fails
    // for every accession and only shows up in the report.
    let source_a: Arc<dyn RemoteSource> = Arc::new(
        MockSource::new("source-a")
            .respond(FetchKind::Features, features_json("domain", &["d1", "d2"])),
    );
    let source_b: Arc<dyn RemoteSource> =
        Arc::new(MockSource::new("source-b").fail(FetchKind::Features, "gateway timeout"));

    let task = FetchFeaturesTask::new(
        vec!["P1".to_string(), "P2".to_string()],
        vec![source_a, source_b],
        &FetchConfig::default(),
    );

    let mut scheduler = TaskScheduler::default();
    let mut finished = scheduler.run_task(task.spec()).await.unwrap();

    assert_eq!(finished.state, TaskState::Finished);
    assert!(finished.error.is_none());

    let groups = finished
        .take_output::<AnnotationGroups>()
        .expect("merged annotations");
    assert_eq!(groups.annotation_count(), 2, "duplicates merged away");

    let report = finished.report.expect("report generated");
    assert_eq!(
        report
            .lines()
            .filter(|l| l.contains("cannot receive response from the server \"source-b\""))
            .count(),
        2,
        "one failure line per accession: {report}"
    );
}

#[tokio::test(start_paused = true)]
async fn converted_accession_is_used_for_the_fetch() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("doc.json");

    let reference = MockSource::new("reference")
        .respond(
            FetchKind::ConvertId,
            json!({"candidates": [{"accession": "P99999.2", "identical": true}]}),
        )
        .respond(FetchKind::Sequence, sequence_json("P99999"));
    let log = reference.request_log();
    let reference: Arc<dyn RemoteSource> = Arc::new(reference);

    let task = ConvertIdAndFetchDocumentTask::new(
        "XP_012345",
        reference,
        Vec::new(),
        &out,
        true,
        &FetchConfig::default(),
    );

    let mut scheduler = TaskScheduler::default();
    let mut finished = scheduler.run_task(task.spec()).await.unwrap();

    assert!(finished.ok(), "tree error: {:?}", finished.tree_error);
    let document = finished
        .take_output::<FetchedDocument>()
        .expect("document output");
    assert_eq!(document.accession, "P99999");

    let log = log.lock().unwrap();
    assert!(log.contains(&("XP_012345".to_string(), FetchKind::ConvertId)));
    assert!(log.contains(&("P99999".to_string(), FetchKind::Sequence)));
}

#[tokio::test(start_paused = true)]
async fn failed_conversion_falls_back_to_the_original_accession() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("doc.json");

    let reference = MockSource::new("reference")
        .fail(FetchKind::ConvertId, "service unavailable")
        .respond(FetchKind::Sequence, sequence_json("XP_012345"));
    let log = reference.request_log();
    let reference: Arc<dyn RemoteSource> = Arc::new(reference);

    let task = ConvertIdAndFetchDocumentTask::new(
        "XP_012345",
        reference,
        Vec::new(),
        &out,
        true,
        &FetchConfig::default(),
    );

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler.run_task(task.spec()).await.unwrap();

    assert!(finished.ok(), "conversion failure is non-fatal: {:?}", finished.tree_error);

    let log = log.lock().unwrap();
    assert!(
        log.contains(&("XP_012345".to_string(), FetchKind::Sequence)),
        "fetch falls back to the original accession: {log:?}"
    );
    assert!(out.exists());
}
