//! Sleeper Controller
//!
//! Makes sure the Sleeper CRD is installed, then watches Sleeper objects
//! and wakes each one up after its requested sleep.

mod app;
mod config;
mod error;
mod handler;

use crate::app::App;
use crate::config::Config;
use crate::error::ControllerError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Sleeper Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Resync period: {:?}", config.resync_period);
    info!("  Watch backoff: {:?}..{:?}", config.min_backoff, config.max_backoff);

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(token.clone()));

    let app = App::new(config).await?;
    match app.run(token).await {
        Err(e) if e.is_shutdown() => {
            info!("Sleeper Controller stopped");
            Ok(())
        }
        other => other,
    }
}

async fn cancel_on_signal(token: CancellationToken) {
    if let Err(e) = wait_for_shutdown_signal().await {
        error!("Failed to listen for shutdown signals: {}", e);
        return;
    }
    info!("Shutdown signal received");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
