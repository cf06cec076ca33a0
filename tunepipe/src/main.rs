use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tunepipe::api::{ApiServer, AppState};
use tunepipe::config::AppConfig;
use tunepipe::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default();
    let _log_guard = logging::init_logging(config.log_dir.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        extractor = %config.extractor_command.program,
        transcoder = %config.transcoder_command.program,
        "Starting tunepipe"
    );

    let cancel_token = CancellationToken::new();

    if let Some(log_dir) = &config.log_dir {
        logging::start_retention_cleanup(log_dir, cancel_token.child_token());
    }

    let server_config = config.server.clone();
    let sweep_interval = config.temp.sweep_interval;
    let state = AppState::new(config, cancel_token.child_token());

    if let Err(e) = state.temp.ensure_dir().await {
        error!(dir = %state.temp.dir().display(), error = %e, "Failed to create temp directory");
    }
    let sweeper = state
        .temp
        .start_sweeper(sweep_interval, cancel_token.child_token());

    let server = ApiServer::with_cancel_token(server_config, state, cancel_token.clone());

    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = server.run().await;
    cancel_token.cancel();
    let _ = sweeper.await;

    result?;
    info!("tunepipe stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
