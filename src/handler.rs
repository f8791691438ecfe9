//! WebSocket connection handler
//!
//! Performs the WebSocket handshake for one TCP connection, resolves the
//! caller's identity during the upgrade, and hands the socket to the chat
//! service. The connection's read loop then runs on its own task.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::error::{AppError, AuthError};
use crate::service::ChatService;

/// Handle a new TCP connection
///
/// Unauthenticated upgrades are answered with 401. A user who is already
/// online gets the handshake, then an immediate close.
pub async fn handle_connection(
    stream: TcpStream,
    service: ChatService,
    authenticator: Arc<dyn Authenticator>,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(service.config().max_message_size);

    // Identity resolved during the upgrade
    let mut identity = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match authenticator.authenticate(request) {
            Ok(user_id) => {
                identity = Some(user_id);
                Ok(response)
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "handshake rejected");
                Err(unauthorized(&e))
            }
        }
    };

    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let user_id = identity.ok_or(AuthError::MissingIdentity)?;

    service.register_connection(user_id, ws_stream).await?;
    info!(user_id, peer = %peer_addr, "client connected");

    Ok(())
}

fn unauthorized(err: &AuthError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}
