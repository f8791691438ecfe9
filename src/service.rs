//! Chat service façade
//!
//! The entry points business handlers call: attach an authenticated
//! transport, manage room membership, and push chat, private, friend-request
//! and system messages. Persistence happens in the callers; this layer only
//! delivers to whoever is connected right now.

use std::sync::Arc;

use futures_util::{Sink, Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::RegistryError;
use crate::heartbeat::HeartbeatMonitor;
use crate::message::Message;
use crate::registry::Registry;
use crate::types::{RoomId, UserId};

/// Handle shared by the connection handler and business handlers
#[derive(Debug, Clone)]
pub struct ChatService {
    registry: Registry,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl ChatService {
    /// Create a service with a fresh registry
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(config.self_echo);
        Self::with_registry(registry, config)
    }

    pub fn with_registry(registry: Registry, config: Config) -> Self {
        Self {
            registry,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the heartbeat monitor
    pub fn start(&self) -> JoinHandle<()> {
        HeartbeatMonitor::new(
            self.registry.clone(),
            self.config.ping_interval(),
            self.shutdown.child_token(),
        )
        .spawn()
    }

    /// Register an accepted WebSocket for an authenticated user
    ///
    /// On success the connection's read loop runs on its own task. A second
    /// connection for an online user is closed and `AlreadyOnline` returned.
    pub async fn register_connection<S>(
        &self,
        user_id: UserId,
        ws_stream: WebSocketStream<S>,
    ) -> Result<Arc<Connection>, RegistryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws_stream.split();
        self.register_transport(user_id, sink, stream).await
    }

    /// Register any frame sink/stream pair as a user's connection
    pub async fn register_transport<Si, St>(
        &self,
        user_id: UserId,
        sink: Si,
        stream: St,
    ) -> Result<Arc<Connection>, RegistryError>
    where
        Si: Sink<WsMessage, Error = WsError> + Send + 'static,
        St: Stream<Item = Result<WsMessage, WsError>> + Unpin + Send + 'static,
    {
        let conn = Arc::new(Connection::new(user_id, sink, self.config.connection()));

        if let Err(e) = self.registry.register(Arc::clone(&conn)) {
            conn.close().await;
            return Err(e);
        }

        let reader = Arc::clone(&conn).run_reader(
            stream,
            self.registry.clone(),
            self.config.read_timeout(),
            self.shutdown.child_token(),
        );
        tokio::spawn(reader);

        Ok(conn)
    }

    pub async fn unregister(&self, user_id: UserId) {
        self.registry.unregister(user_id).await;
    }

    /// Join a room and notify its members
    pub fn join_chat_room(&self, user_id: UserId, room_id: RoomId) -> Result<(), RegistryError> {
        self.registry.join_room(user_id, room_id)?;

        let notice = Message::room_notice(room_id, format!("user {user_id} joined the room"))
            .with_extra("event", "join")
            .with_extra("user_id", user_id);
        self.registry.send_to_room(room_id, notice);
        Ok(())
    }

    /// Leave a room and notify the remaining members
    pub fn leave_chat_room(&self, user_id: UserId, room_id: RoomId) -> Result<(), RegistryError> {
        self.registry.leave_room(user_id, room_id)?;

        let notice = Message::room_notice(room_id, format!("user {user_id} left the room"))
            .with_extra("event", "leave")
            .with_extra("user_id", user_id);
        self.registry.send_to_room(room_id, notice);
        Ok(())
    }

    /// Fan a chat message out to a room; returns the recipient count
    pub fn send_chat_message(
        &self,
        user_id: UserId,
        room_id: RoomId,
        content: impl Into<String>,
        extra: Map<String, Value>,
    ) -> usize {
        let message = Message::group(user_id, room_id, content).with_extras(extra);
        self.registry.send_to_room(room_id, message)
    }

    /// Push a private message; an offline recipient is not an error
    pub async fn send_private(
        &self,
        from: UserId,
        to: UserId,
        content: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.registry
            .send_to_user(to, Message::private(from, to, content))
            .await
    }

    /// Push a friend request notification; an offline recipient is not an error
    pub async fn send_friend_request(
        &self,
        from: UserId,
        to: UserId,
        content: impl Into<String>,
    ) -> Result<(), RegistryError> {
        self.registry
            .send_to_user(to, Message::friend_request(from, to, content))
            .await
    }

    pub fn send_to_room(&self, room_id: RoomId, message: Message) -> usize {
        self.registry.send_to_room(room_id, message)
    }

    /// System notice to every online user; returns the recipient count
    pub fn broadcast(&self, content: impl Into<String>) -> usize {
        self.registry.broadcast(Message::system(content))
    }

    pub fn list_online_users(&self) -> Vec<UserId> {
        self.registry.list_online_users()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    /// Stop the heartbeat and read loops, then close every connection
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            warn!("shutdown already requested");
            return;
        }
        info!("shutting down presence hub");
        self.shutdown.cancel();
        self.registry.shutdown().await;
    }
}
