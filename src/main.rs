use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use slicegate::api::{AppState, routes};
use slicegate::artifact::ArtifactReader;
use slicegate::config::ServiceConfig;
use slicegate::engine::CommandSlicer;
use slicegate::pipeline::SlicePipeline;
use slicegate::validator::InputValidator;
use slicegate::workspace::WorkspaceAllocator;

/// File name prefix of the rolling log.
const LOG_FILE_PREFIX: &str = "slicegate.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind,
        "Starting slicegate"
    );

    // ── Scratch directory ───────────────────────────────────────────────
    let workspace = WorkspaceAllocator::init(&config.scratch_dir)
        .await
        .context("Scratch directory is unusable")?;
    let reader = ArtifactReader::new(workspace.root())
        .await
        .context("Scratch directory is unusable")?;

    // ── Pipeline ────────────────────────────────────────────────────────
    let validator = InputValidator::new(&config.allowed_extensions, config.max_upload_bytes);
    let slicer = CommandSlicer::new(config.engine.program.clone(), &config.engine.args)
        .with_timeout(config.engine.timeout)
        .with_output_cap(config.engine.output_cap);
    info!(
        engine = %config.engine.program.display(),
        timeout = ?config.engine.timeout,
        max_concurrent = config.engine.max_concurrent,
        "Slicing engine configured"
    );

    let pipeline = SlicePipeline::new(validator, workspace, Arc::new(slicer), config.pricing)
        .with_max_concurrent(config.engine.max_concurrent);

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = routes(AppState {
        pipeline: Arc::new(pipeline),
        reader: Arc::new(reader),
        currency: config.currency.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Shut down cleanly");
    Ok(())
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
