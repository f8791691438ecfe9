//! Basic type definitions for the presence hub
//!
//! - `UserId` / `RoomId`: numeric identifiers owned by the account and room stores
//! - `ConnectionId`: UUID-based identifier for one live transport session

use uuid::Uuid;

/// Authenticated user identifier (supplied by the auth layer, never by clients)
pub type UserId = i64;

/// Chat room identifier
pub type RoomId = i64;

/// Unique connection identifier (newtype pattern)
///
/// A user may reconnect after a drop, so the user id alone cannot tell an
/// old session from its replacement. Teardown paths compare this id before
/// removing anything from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
