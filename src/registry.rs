//! Registry: presence and room-membership authority
//!
//! Holds every live connection (`clients`, keyed by user) and every room's
//! member set (`rooms`) behind one reader/writer lock. The lock only ever
//! covers map work: all network writes happen after it is released, against
//! a snapshot of the target connections.
//!
//! Fan-out is independent per recipient. Each frame is queued on the
//! recipient's own write task; a recipient that fails or misses its write
//! deadline is unregistered in the background and never delays the others.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::future::join_all;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::RegistryError;
use crate::message::{Message, MessageKind, SYSTEM_SENDER};
use crate::room::Room;
use crate::types::{ConnectionId, RoomId, UserId};

#[derive(Debug, Default)]
struct RegistryState {
    /// All registered connections: UserId -> Connection
    clients: HashMap<UserId, Arc<Connection>>,
    /// All non-empty rooms: RoomId -> Room
    rooms: HashMap<RoomId, Room>,
}

impl RegistryState {
    /// Remove a user's connection from `clients` and from every room it joined
    ///
    /// With `expected` set, only that exact connection is removed, so a late
    /// teardown of a dropped session cannot evict its replacement.
    fn detach(&mut self, user_id: UserId, expected: Option<ConnectionId>) -> Option<Arc<Connection>> {
        let current = self.clients.get(&user_id)?;
        if expected.is_some_and(|id| id != current.id()) {
            return None;
        }

        let conn = self.clients.remove(&user_id)?;
        for room_id in conn.take_rooms() {
            let Some(room) = self.rooms.get_mut(&room_id) else {
                panic!("connection {} lists room {} that does not exist", conn.id(), room_id);
            };
            room.remove(conn.id());
            if room.is_empty() {
                self.rooms.remove(&room_id);
                debug!(room_id, "room deleted (empty)");
            }
        }
        Some(conn)
    }
}

#[derive(Debug)]
struct Inner {
    state: RwLock<RegistryState>,
    self_echo: bool,
}

/// Shared registry handle
///
/// Cloning is cheap; every clone refers to the same state.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create an empty registry
    ///
    /// With `self_echo` off, group and broadcast fan-out skips the sender's
    /// own connection.
    pub fn new(self_echo: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(RegistryState::default()),
                self_echo,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a connection visible to the rest of the system
    ///
    /// Fails with `AlreadyOnline` if the user already has a live connection;
    /// that connection is left untouched.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let user_id = conn.user_id();
        let mut state = self.write();

        if state.clients.contains_key(&user_id) {
            warn!(user_id, conn_id = %conn.id(), "duplicate registration rejected");
            return Err(RegistryError::AlreadyOnline(user_id));
        }

        conn.mark_registered();
        info!(user_id, conn_id = %conn.id(), "connection registered");
        state.clients.insert(user_id, conn);
        debug!(
            "Total clients: {}, Total rooms: {}",
            state.clients.len(),
            state.rooms.len()
        );
        Ok(())
    }

    /// Remove a user's connection from all maps and close its transport
    ///
    /// Idempotent; unknown users are ignored.
    pub async fn unregister(&self, user_id: UserId) {
        let removed = self.write().detach(user_id, None);
        if let Some(conn) = removed {
            info!(user_id, conn_id = %conn.id(), "connection unregistered");
            conn.close().await;
        }
    }

    /// Tear down one specific connection
    ///
    /// Shared by the read loop, the heartbeat, and failed writes. The
    /// connection is closed even if it was never registered or has already
    /// been replaced.
    pub async fn unregister_connection(&self, conn: &Connection) {
        let user_id = conn.user_id();
        let removed = self.write().detach(user_id, Some(conn.id()));
        if removed.is_some() {
            info!(user_id, conn_id = %conn.id(), "connection unregistered");
        }
        conn.close().await;
    }

    fn schedule_unregister(&self, conn: Arc<Connection>) {
        let registry = self.clone();
        tokio::spawn(async move {
            registry.unregister_connection(&conn).await;
        });
    }

    /// Add a user's connection to a room
    pub fn join_room(&self, user_id: UserId, room_id: RoomId) -> Result<(), RegistryError> {
        let mut state = self.write();
        let conn = state
            .clients
            .get(&user_id)
            .cloned()
            .ok_or(RegistryError::NotOnline(user_id))?;

        conn.join_room(room_id);
        state
            .rooms
            .entry(room_id)
            .or_insert_with(|| Room::new(room_id))
            .insert(&conn);

        info!(user_id, room_id, "joined room");
        Ok(())
    }

    /// Remove a user's connection from a room
    ///
    /// Leaving a room the user is not in is a no-op.
    pub fn leave_room(&self, user_id: UserId, room_id: RoomId) -> Result<(), RegistryError> {
        let mut state = self.write();
        let conn = state
            .clients
            .get(&user_id)
            .cloned()
            .ok_or(RegistryError::NotOnline(user_id))?;

        if !conn.leave_room(room_id) {
            return Ok(());
        }
        if let Some(room) = state.rooms.get_mut(&room_id) {
            room.remove(conn.id());
            if room.is_empty() {
                state.rooms.remove(&room_id);
                debug!(room_id, "room deleted (empty)");
            }
        }

        info!(user_id, room_id, "left room");
        Ok(())
    }

    /// Look up a user's live connection
    pub fn connection(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.read().clients.get(&user_id).cloned()
    }

    /// Snapshot of every registered connection
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.read().clients.values().cloned().collect()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.read().clients.contains_key(&user_id)
    }

    /// Online user ids in ascending order
    pub fn list_online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.read().clients.keys().copied().collect();
        users.sort_unstable();
        users
    }

    /// Member user ids of a room in ascending order
    pub fn room_members(&self, room_id: RoomId) -> Vec<UserId> {
        let state = self.read();
        let mut members: Vec<UserId> = state
            .rooms
            .get(&room_id)
            .map(|room| room.connections().iter().map(|c| c.user_id()).collect())
            .unwrap_or_default();
        members.sort_unstable();
        members
    }

    /// Push a message to one user
    ///
    /// An offline recipient is not an error. A failed write returns
    /// `Undelivered` and schedules the recipient for unregistration.
    pub async fn send_to_user(&self, user_id: UserId, mut message: Message) -> Result<(), RegistryError> {
        let Some(conn) = self.connection(user_id) else {
            debug!(user_id, "recipient offline, message dropped");
            return Ok(());
        };

        message.stamp_now();
        let frame = WsMessage::Text(message.encode()?.into());

        if let Err(e) = conn.send(frame).await {
            warn!(user_id, error = %e, "delivery failed, unregistering");
            self.schedule_unregister(conn);
            return Err(RegistryError::Undelivered { user_id, source: e });
        }
        Ok(())
    }

    /// Fan a message out to every member of a room
    ///
    /// Returns the number of recipients the message was queued for, without
    /// waiting for delivery.
    pub fn send_to_room(&self, room_id: RoomId, mut message: Message) -> usize {
        message.stamp_now();
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(room_id, error = %e, "failed to encode room message");
                return 0;
            }
        };

        let targets: Vec<Arc<Connection>> = {
            let state = self.read();
            let Some(room) = state.rooms.get(&room_id) else {
                debug!(room_id, "room has no members");
                return 0;
            };
            room.connections()
                .into_iter()
                .filter(|conn| self.delivers_to(conn, &message))
                .collect()
        };

        debug!(room_id, recipients = targets.len(), "room fan-out");
        self.fan_out(targets, frame)
    }

    /// Fan a message out to every registered connection
    pub fn broadcast(&self, mut message: Message) -> usize {
        message.stamp_now();
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast");
                return 0;
            }
        };

        let targets: Vec<Arc<Connection>> = self
            .read()
            .clients
            .values()
            .filter(|conn| self.delivers_to(conn, &message))
            .cloned()
            .collect();

        debug!(recipients = targets.len(), "broadcast fan-out");
        self.fan_out(targets, frame)
    }

    fn delivers_to(&self, conn: &Connection, message: &Message) -> bool {
        self.inner.self_echo || message.from() == SYSTEM_SENDER || conn.user_id() != message.from()
    }

    /// Queue `frame` on every target and watch the writes in the background
    fn fan_out(&self, targets: Vec<Arc<Connection>>, frame: String) -> usize {
        let recipients = targets.len();
        let mut pending = Vec::with_capacity(recipients);

        for conn in targets {
            match conn.enqueue(WsMessage::Text(frame.clone().into())) {
                Ok(done) => pending.push((conn, done)),
                Err(e) => {
                    warn!(user_id = conn.user_id(), error = %e, "fan-out enqueue failed, unregistering");
                    self.schedule_unregister(conn);
                }
            }
        }

        if !pending.is_empty() {
            let registry = self.clone();
            tokio::spawn(async move {
                let results = join_all(pending.into_iter().map(|(conn, done)| async move {
                    let result = conn.await_write(done).await;
                    (conn, result)
                }))
                .await;

                let failed = results.into_iter().filter_map(|(conn, result)| match result {
                    Ok(()) => None,
                    Err(e) => {
                        warn!(user_id = conn.user_id(), error = %e, "fan-out write failed, unregistering");
                        Some(conn)
                    }
                });
                let failed: Vec<Arc<Connection>> = failed.collect();
                join_all(failed.iter().map(|conn| registry.unregister_connection(conn))).await;
            });
        }

        recipients
    }

    /// Route a frame received from `sender` by its kind
    pub(crate) async fn route_inbound(&self, sender: &Connection, message: Message) {
        let user_id = sender.user_id();
        match message.kind() {
            MessageKind::Private | MessageKind::FriendRequest => {
                let Some(to) = message.to() else {
                    return;
                };
                if let Err(e) = self.send_to_user(to, message).await {
                    debug!(user_id, to, error = %e, "inbound message not delivered");
                }
            }
            MessageKind::Group => {
                let Some(room_id) = message.room_id() else {
                    return;
                };
                if !sender.is_in_room(room_id) {
                    warn!(user_id, room_id, "group message for a room the sender has not joined");
                    return;
                }
                self.send_to_room(room_id, message);
            }
            MessageKind::System => {
                warn!(user_id, "dropping client-originated system message");
            }
        }
    }

    /// Unregister and close every connection
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.write();
            state.rooms.clear();
            state.clients.drain().map(|(_, conn)| conn).collect()
        };

        info!(count = connections.len(), "closing all connections");
        join_all(connections.iter().map(|conn| {
            conn.take_rooms();
            conn.close()
        }))
        .await;
    }

    /// Check the room/connection mutual-consistency invariant
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let state = self.read();
        for (room_id, room) in &state.rooms {
            assert!(!room.is_empty(), "room {room_id} left empty");
            for conn in room.connections() {
                assert!(conn.is_in_room(*room_id), "room {room_id} lists a non-member");
                let owner = state.clients.get(&conn.user_id()).map(|c| c.id());
                assert_eq!(owner, Some(conn.id()), "room {room_id} lists an unregistered connection");
            }
        }
        for conn in state.clients.values() {
            for room_id in conn.joined_rooms() {
                let room = state.rooms.get(&room_id);
                assert!(
                    room.is_some_and(|r| r.contains(conn.id())),
                    "user {} joined room {room_id} but is not listed",
                    conn.user_id()
                );
            }
        }
    }
}
