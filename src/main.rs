use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use skytrail::cli::{Cli, Command};
use skytrail::commands;
use skytrail::config::Config;
use skytrail::logging;
use skytrail::metrics::{Metrics, sampler_task};

/// Grace period between the shutdown signal and forced exit.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    let config = Config::from_env()?;
    let log_path = logging::init(command.component(), &config.log_dir)?;
    info!("logging to {}", log_path.display());

    let metrics = Arc::new(Metrics::new());
    let cancel = CancellationToken::new();

    spawn_signal_handler(cancel.clone());

    tokio::spawn(sampler_task(
        Arc::clone(&metrics),
        config.metrics_dir.clone(),
        command.component().to_string(),
        config.metrics_csv,
        cancel.clone(),
    ));

    let result = match command {
        Command::Ingest => commands::ingest::execute(&config, Arc::clone(&metrics), cancel).await,
        Command::Record => commands::record::execute(&config, Arc::clone(&metrics), cancel).await,
        Command::Run => commands::run::execute(&config, Arc::clone(&metrics), cancel).await,
    };

    match metrics.export_artifacts(&config.metrics_dir, command.component()) {
        Ok(written) => {
            for path in written {
                info!("metrics artifact: {}", path.display());
            }
        }
        Err(e) => error!("failed to export metrics artifacts: {e:#}"),
    }

    result
}

/// Ctrl-C / SIGTERM trigger cooperative shutdown; a second deadline
/// escalates to forced exit if teardown hangs.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping tasks");
        cancel.cancel();

        tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        error!("graceful shutdown timed out after {SHUTDOWN_TIMEOUT:?}, forcing exit");
        std::process::exit(1);
    });
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
