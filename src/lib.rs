//! Real-time presence and fan-out registry
//!
//! Tracks which users are connected over WebSocket, which chat rooms their
//! connections belong to, and pushes chat, private, friend-request and system
//! messages to the right live connections without letting slow or dead peers
//! hold anyone else up.
//!
//! # Features
//! - One live connection per user; duplicates are rejected
//! - Room membership kept consistent on both the registry and connection side
//! - Per-recipient fan-out with write deadlines and background teardown
//! - Heartbeat pings that reap dead connections
//! - Graceful shutdown with a bounded close handshake
//!
//! # Architecture
//! - `Registry` owns the `clients` and `rooms` maps behind one `RwLock`,
//!   never held across network I/O
//! - Each `Connection` has a write task and a read loop; every failure path
//!   converges on `Registry::unregister_connection`
//! - `HeartbeatMonitor` pings a snapshot of all connections on an interval
//! - `ChatService` is the façade business handlers call
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use presence_hub::{handle_connection, Authenticator, ChatService, Config, TrustedHeaderAuthenticator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let service = ChatService::new(Config::default());
//!     service.start();
//!     let auth: Arc<dyn Authenticator> = Arc::new(TrustedHeaderAuthenticator);
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, service.clone(), auth.clone()));
//!     }
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod message;
pub mod registry;
pub mod room;
pub mod service;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use auth::{Authenticator, TrustedHeaderAuthenticator, USER_ID_HEADER};
pub use config::{Config, ConnectionConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{AppError, AuthError, ConfigError, ProtocolError, RegistryError, TransportError};
pub use handler::handle_connection;
pub use heartbeat::HeartbeatMonitor;
pub use message::{Message, MessageKind, SYSTEM_SENDER};
pub use registry::Registry;
pub use room::Room;
pub use service::ChatService;
pub use types::{ConnectionId, RoomId, UserId};
