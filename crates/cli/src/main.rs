//! `solverbench` -- benchmark a batch of analytic performance models
//! against the batch and persistent solver backends.
//!
//! Scans `MODEL_DIR` for model files, evaluates every model on the
//! batch solver, then on the persistent solver server, and dumps the
//! per-model timing table once both passes drain.
//!
//! # Environment variables
//!
//! See [`config::BenchConfig::from_env`] for the full table; the
//! essentials are `SOLVER_HOST`/`SOLVER_PORT` for the persistent server,
//! `SOLVER_LAUNCH_CMD`/`SOLVER_LAUNCH_DIR` to allow launching one
//! locally, and `BATCH_SOLVER` for the batch program.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use solverbench_core::Backend;
use solverbench_dispatch::{DispatcherConfig, JobDispatcher};
use solverbench_solver::SolverConnection;

use config::BenchConfig;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "solverbench=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BenchConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = config.port,
        batch_solver = %config.batch_solver,
        model_dir = %config.model_dir.display(),
        "Starting solverbench",
    );

    let models = match scan_models(&config.model_dir) {
        Ok(models) if models.is_empty() => {
            tracing::error!(dir = %config.model_dir.display(), "No model files found");
            std::process::exit(1);
        }
        Ok(models) => models,
        Err(e) => {
            tracing::error!(dir = %config.model_dir.display(), error = %e, "Could not read model folder");
            std::process::exit(1);
        }
    };
    tracing::info!(count = models.len(), "Models discovered");

    let connection = SolverConnection::new(config.connect_config());
    if let Err(e) = connection.connect().await {
        tracing::error!(error = %e, "Could not establish a solver server connection");
        std::process::exit(1);
    }

    let dispatcher = JobDispatcher::new(
        DispatcherConfig {
            max_workers: config.max_workers,
            parallel: config.parallel,
        },
        config.batch_solver.clone(),
        Arc::new(connection),
    );

    tracing::info!("Starting batch evaluations");
    submit_all(&dispatcher, &models, Backend::Batch).await;
    wait_for_drain(&dispatcher, Backend::Batch).await;

    tracing::info!("Starting persistent evaluations");
    submit_all(&dispatcher, &models, Backend::Persistent).await;
    wait_for_drain(&dispatcher, Backend::Persistent).await;

    dispatcher.shutdown().await;

    let report = dispatcher.report();
    if report.is_empty() {
        tracing::warn!("No evaluations were recorded");
    } else {
        report.log_summary();
        if let Some(path) = &config.results_json {
            write_json_report(&report, path);
        }
    }

    tracing::info!("Terminated");
}

/// Model files in `dir`: `*.xml`, excluding `*_res.xml` result files.
fn scan_models(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut models = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.ends_with(".xml") && !name.ends_with("_res.xml") {
            models.push(path);
        }
    }
    models.sort();
    Ok(models)
}

async fn submit_all(dispatcher: &JobDispatcher, models: &[PathBuf], backend: Backend) {
    for model in models {
        if let Err(e) = dispatcher.submit(model, backend).await {
            tracing::error!(model = %model.display(), backend = %backend, error = %e, "Submission refused");
        }
    }
}

/// Poll until every evaluation submitted to `backend` has completed.
async fn wait_for_drain(dispatcher: &JobDispatcher, backend: Backend) {
    while !dispatcher.is_drained(backend) {
        tracing::info!(
            backend = %backend,
            pending = dispatcher.pending_count(backend),
            "Waiting for evaluations to finish",
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tracing::info!(backend = %backend, "All evaluations finished");
}

fn write_json_report(report: &solverbench_dispatch::BenchmarkReport, path: &Path) {
    match serde_json::to_string_pretty(&report.to_json()) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                tracing::error!(path = %path.display(), error = %e, "Could not write results file");
            } else {
                tracing::info!(path = %path.display(), "Results written");
            }
        }
        Err(e) => tracing::error!(error = %e, "Could not serialize results"),
    }
}
