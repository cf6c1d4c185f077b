use clap::Parser;

mod commands;
mod progress;

use commands::cli;
use seqflow_core::config;
use seqflow_core::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[tokio::main]
async fn main() {
    let exit = match real_main().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e}");
            exit_code_for_error(&e)
        }
    };

    std::process::exit(exit);
}

async fn real_main() -> Result<i32, error::CliError> {
    let args = cli::Args::parse();

    match args.command {
        // Worker mode owns stdout for the wire protocol; tracing stays off
        // so no layer can corrupt the machine-parsed stream.
        cli::Command::Worker(worker_args) => commands::worker::execute(worker_args).await,
        cli::Command::Run(run_args) => {
            let cfg = setup()?;
            commands::run::execute(run_args, &cfg).await
        }
        cli::Command::Fetch(fetch_args) => {
            let cfg = setup()?;
            commands::fetch::execute(fetch_args, &cfg).await
        }
    }
}

fn setup() -> Result<config::AppConfig, error::CliError> {
    let cfg = config::load_default().map_err(|e| error::CliError::Config(e.to_string()))?;
    init_tracing(&cfg.logging).map_err(error::CliError::Command)?;
    Ok(cfg)
}

fn init_tracing(cfg: &config::LoggingConfig) -> Result<(), String> {
    if !cfg.enabled {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .map_err(|e| format!("invalid log filter: {e}"))?;

    let console_layer = cfg.console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let file_layer = if cfg.file {
        let dir = cfg
            .directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().to_string_lossy().to_string());
        let appender = tracing_appender::rolling::daily(dir, "seqflow.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("failed to init logging: {e}"))
}

fn exit_code_for_error(e: &error::CliError) -> i32 {
    match e {
        error::CliError::Config(_) => 2,
        _ => 1,
    }
}
