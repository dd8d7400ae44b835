//! Daemon mode: media ingest, provider sessions and the bus socket.

pub mod services;

pub use services::Services;

use crate::bus::{BusServer, LocalBus, default_socket_path};
use crate::config::Config;
use crate::error::{Result, ScribeError};
use crate::provider::build_enabled;
use std::path::PathBuf;

/// Run the daemon until SIGINT or SIGTERM, or a fatal media socket error.
///
/// `socket_path` overrides `bus.socket`; with neither set the bus listens
/// on [`default_socket_path`].
pub async fn run_daemon(config: Config, socket_path: Option<PathBuf>) -> Result<()> {
    config.validate()?;
    let providers = build_enabled(&config.providers)?;
    if providers.is_empty() {
        tracing::warn!("no providers enabled; calls will be accepted but not transcribed");
    }

    let bus = LocalBus::new();
    let socket_path = socket_path
        .or_else(|| config.bus.socket.clone())
        .unwrap_or_else(default_socket_path);
    let server = BusServer::bind(socket_path, bus.clone())?;

    let mut services = Services::start(&config, providers, bus).await?;
    tracing::info!(
        version = %crate::version_string(),
        media = %services.media_addr(),
        "daemon ready"
    );
    let server_handle = tokio::spawn(server.run(services.shutdown_signal()));

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            Ok(())
        }
        res = wait_for_sigterm() => {
            if let Err(e) = res {
                tracing::error!(error = %e, "signal handler failed");
            }
            tracing::info!("received SIGTERM, shutting down");
            Ok(())
        }
        res = services.media_stopped() => {
            tracing::error!("media socket stopped, shutting down");
            res.and(Err(ScribeError::MediaReceive {
                message: "media loop exited".to_string(),
            }))
        }
    };

    let stopped = services.shutdown().await;
    match server_handle.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "bus server stopped with error"),
        Err(e) => tracing::error!(error = %e, "bus server task failed"),
        Ok(Ok(())) => {}
    }
    tracing::info!("daemon stopped");
    outcome.and(stopped)
}

/// Wait for SIGTERM signal (used by systemd).
#[cfg(unix)]
async fn wait_for_sigterm() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ScribeError::Other(format!("Failed to register SIGTERM handler: {e}")))?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, ProviderKind};

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_binding() {
        let mut config = Config::default();
        config.bus.prefix = String::new();
        let result = run_daemon(config, None).await;
        assert!(matches!(result, Err(ScribeError::ConfigInvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_websocket_provider_without_url_is_rejected() {
        let mut config = Config::default();
        config.providers = vec![ProviderConfig {
            id: "ws".to_string(),
            kind: ProviderKind::Websocket,
            url: None,
            ..ProviderConfig::default()
        }];
        let result = run_daemon(config, None).await;
        assert!(matches!(result, Err(ScribeError::ConfigInvalidValue { .. })));
    }
}
