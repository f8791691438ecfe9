//! Handshake authentication
//!
//! Token verification lives in the upstream gateway. By the time a WebSocket
//! upgrade reaches this server the caller's identity is already established;
//! an `Authenticator` only extracts it from the upgrade request.

use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::error::AuthError;
use crate::types::UserId;

/// Header carrying the verified user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the authenticated user behind a WebSocket upgrade request
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &Request) -> Result<UserId, AuthError>;
}

/// Trusts the `x-user-id` header set by the gateway after token verification
///
/// Only deploy behind a gateway that strips this header from client requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedHeaderAuthenticator;

impl Authenticator for TrustedHeaderAuthenticator {
    fn authenticate(&self, request: &Request) -> Result<UserId, AuthError> {
        let value = request
            .headers()
            .get(USER_ID_HEADER)
            .ok_or(AuthError::MissingIdentity)?;
        let text = value
            .to_str()
            .map_err(|_| AuthError::InvalidIdentity("header is not ASCII".to_string()))?;
        let user_id: UserId = text
            .trim()
            .parse()
            .map_err(|_| AuthError::InvalidIdentity(format!("'{text}' is not a user id")))?;

        if user_id <= 0 {
            return Err(AuthError::InvalidIdentity(format!("'{user_id}' is not a user id")));
        }
        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(value: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("ws://localhost/ws");
        if let Some(value) = value {
            builder = builder.header(USER_ID_HEADER, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_header_identity_accepted() {
        let auth = TrustedHeaderAuthenticator;
        assert_eq!(auth.authenticate(&request_with(Some("42"))).unwrap(), 42);
    }

    #[test]
    fn test_missing_header_rejected() {
        let auth = TrustedHeaderAuthenticator;
        assert!(matches!(
            auth.authenticate(&request_with(None)),
            Err(AuthError::MissingIdentity)
        ));
    }

    #[test]
    fn test_non_positive_or_garbage_rejected() {
        let auth = TrustedHeaderAuthenticator;
        for value in ["0", "-3", "alice", ""] {
            assert!(matches!(
                auth.authenticate(&request_with(Some(value))),
                Err(AuthError::InvalidIdentity(_))
            ));
        }
    }
}
