//! Presence hub - Entry Point
//!
//! Parses configuration, starts the heartbeat monitor, and accepts
//! WebSocket connections until Ctrl-C.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use presence_hub::{handle_connection, AppError, Authenticator, ChatService, Config, TrustedHeaderAuthenticator};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=presence_hub=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("presence_hub=info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("Presence hub listening on {}", config.addr);

    let service = ChatService::new(config);
    let heartbeat = service.start();
    let authenticator: Arc<dyn Authenticator> = Arc::new(TrustedHeaderAuthenticator);

    // Connection accept loop
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let service = service.clone();
                    let authenticator = Arc::clone(&authenticator);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service, authenticator).await {
                            error!("Connection handler error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    service.shutdown().await;
    if let Err(e) = heartbeat.await {
        error!("Heartbeat task failed: {}", e);
    }

    info!("Presence hub stopped");
    Ok(())
}
