//! Foo Controller
//!
//! Sample controller keeping one nginx Deployment per Foo:
//! - Foo: declares the Deployment name and replica count
//! - Deployment: created and owned by its Foo, status reported back
//!
//! Configuration comes from the environment, see [`config`].

mod config;
mod controller;
mod error;
mod reconciler;
mod server;
mod watcher;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Already installed is fine
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Foo Controller");

    let config = Config::from_env()?;
    config.log();

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let controller = Controller::new(config, shutdown).await?;
    controller.run().await?;

    info!("Foo Controller stopped");
    Ok(())
}

/// Cancels `shutdown` on Ctrl-C or SIGTERM.
async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
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
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
