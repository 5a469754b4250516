//! Orchestrates the MailSnare application startup and component lifecycle.
//!
//! This library crate initializes configuration, builds the shared message
//! store, and concurrently runs the primary services (SMTP capture, HTTP
//! API). A process-wide shutdown channel lets Ctrl-C stop the listeners
//! and drain live sessions; if either essential service terminates with an
//! error the whole application shuts down.

pub mod api;
pub mod auth;
pub mod config;
pub mod message;
pub mod smtp;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::select;
use tokio::sync::broadcast;

use auth::CredentialVerifier;

/// Runs the main MailSnare application logic.
///
/// Builds the store, the credential verifier and both servers, then
/// monitors them with `tokio::select!`. Returns `Ok(())` after a
/// requested shutdown completes; returns an error if configuration fails
/// or either server stops unexpectedly.
pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{} SMTP capture server",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // Load configuration; exit early if configuration is invalid.
    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let store = storage::InMemory::new(config.message_ttl);

    let verifier: Arc<dyn CredentialVerifier> = match &config.auth_file {
        Some(path) => {
            info!("Verifying SMTP credentials against {}", path);
            Arc::new(auth::AuthFile::load(std::path::Path::new(path))?)
        }
        None => Arc::new(auth::AcceptAny),
    };

    // One broadcast channel signals shutdown to every listener and session.
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let smtp_server = smtp::Server::new(
        config.clone(),
        Arc::clone(&store),
        verifier,
        shutdown_tx.clone(),
    )?;

    let api_config = config.clone();
    let api_store = Arc::clone(&store);
    let api_shutdown = shutdown_tx.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::run_api_server(api_config, api_store, api_shutdown).await {
            error!("HTTP API encountered a fatal error: {}", e);
            Err(e)
        } else {
            Ok(())
        }
    });

    let smtp_handle = tokio::spawn(async move {
        if let Err(e) = smtp_server.run().await {
            error!("SMTP server encountered a fatal error: {}", e);
            Err(e)
        } else {
            Ok(())
        }
    });

    // Translate Ctrl-C into the shutdown broadcast.
    let signal_shutdown = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = signal_shutdown.send(());
        }
    });

    // Both servers run until shutdown; whichever finishes first decides
    // the outcome. A clean return means shutdown was requested.
    select! {
        res = api_handle => match res {
            Ok(Ok(())) => {
                info!("HTTP API stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("HTTP API returned error: {}", e);
                Err(e)
            }
            Err(join_error) => {
                error!("HTTP API task failed (panic or cancellation): {}", join_error);
                Err(anyhow::anyhow!("HTTP API task failed: {}", join_error))
            }
        },
        res = smtp_handle => match res {
            Ok(Ok(())) => {
                info!("SMTP server stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("SMTP server returned error: {}", e);
                Err(e)
            }
            Err(join_error) => {
                error!("SMTP server task failed (panic or cancellation): {}", join_error);
                Err(anyhow::anyhow!("SMTP server task failed: {}", join_error))
            }
        },
    }
}
