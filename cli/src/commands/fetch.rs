use std::sync::Arc;

use seqflow_core::config::AppConfig;
use seqflow_core::error::CliError;
use seqflow_core::TaskScheduler;
use seqflow_plugins::fetch::{ConvertIdAndFetchDocumentTask, HttpSource, RemoteSource};

use super::cli::FetchArgs;

pub async fn execute(args: FetchArgs, cfg: &AppConfig) -> Result<i32, CliError> {
    let reference: Arc<dyn RemoteSource> = Arc::new(HttpSource::new("reference", args.source.clone()));
    let feature_sources: Vec<Arc<dyn RemoteSource>> =
        args.features.iter().map(|spec| parse_source(spec)).collect();

    let task = ConvertIdAndFetchDocumentTask::new(
        args.accession.clone(),
        reference,
        feature_sources,
        &args.output,
        args.convert_id,
        &cfg.fetch,
    );

    let run_id = uuid::Uuid::new_v4();
    tracing::debug!(run_id = %run_id, accession = %args.accession, "fetch initialized");

    let mut scheduler = TaskScheduler::new(cfg.scheduler.clone());
    let root = scheduler.register(task.spec());
    let info = scheduler
        .info_handle(root)
        .ok_or_else(|| CliError::Command("task registration failed".to_string()))?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested");
            info.cancel();
        }
    });

    scheduler.drive().await?;
    let finished = scheduler.take_finished(root)?;

    if let Some(report) = finished.report.as_deref() {
        println!("{report}");
    }
    if let Some(error) = finished.tree_error.as_deref() {
        eprintln!("{error}");
        return Ok(1);
    }
    if finished.canceled {
        return Ok(130);
    }

    println!("saved {}", args.output.display());
    Ok(0)
}

fn parse_source(spec: &str) -> Arc<dyn RemoteSource> {
    match spec.split_once('=') {
        Some((name, url)) => Arc::new(HttpSource::new(name, url)),
        None => Arc::new(HttpSource::new(spec, spec)),
    }
}
