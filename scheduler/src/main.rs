// Job server binary entry point
// Runs the scheduler, the execution engine and the back-channel until Ctrl+C

use anyhow::{Context, Result};
use common::bootstrap::JobServer;
use common::config::Settings;
use common::telemetry;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.json_logs,
    )?;

    info!("Starting job server");

    settings.validate().context("Invalid configuration")?;
    info!(
        job_runner_executable = %settings.executor.job_runner_executable,
        job_run_directory = %settings.executor.job_run_directory.display(),
        max_concurrent_processes = settings.executor.max_concurrent_processes,
        backchannel_address = ?settings.backchannel.address,
        "Configuration loaded"
    );

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port).context("Failed to initialize metrics exporter")?;
    }

    let server = JobServer::build(&settings).await?;

    let result = server.run(shutdown_signal()).await;
    if let Err(e) = &result {
        error!(error = %e, "Job server error");
    }

    info!("Job server stopped");
    result
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received SIGTERM signal, initiating graceful shutdown");
        },
    }
}
