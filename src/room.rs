//! Room membership set
//!
//! A room only tracks which connections belong to it. Connections are held
//! weakly: the registry's `clients` map owns them, and a room never extends a
//! connection's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::connection::Connection;
use crate::types::{ConnectionId, RoomId};

/// Chat room members
#[derive(Debug)]
pub struct Room {
    /// Room identifier
    pub id: RoomId,
    members: HashMap<ConnectionId, Weak<Connection>>,
}

impl Room {
    /// Create an empty room
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
        }
    }

    /// Add a connection
    ///
    /// Returns false if it was already a member.
    pub fn insert(&mut self, conn: &Arc<Connection>) -> bool {
        self.members
            .insert(conn.id(), Arc::downgrade(conn))
            .is_none()
    }

    /// Remove a connection
    ///
    /// Returns false if it was not a member.
    pub fn remove(&mut self, conn_id: ConnectionId) -> bool {
        self.members.remove(&conn_id).is_some()
    }

    /// Check if a connection is in this room
    pub fn contains(&self, conn_id: ConnectionId) -> bool {
        self.members.contains_key(&conn_id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Upgrade every member to a strong handle
    ///
    /// # Panics
    ///
    /// If a member has no live owner. Members are removed under the same
    /// lock that drops their owning entry, so this indicates a registry bug.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.members
            .iter()
            .map(|(conn_id, member)| match member.upgrade() {
                Some(conn) => conn,
                None => panic!("room {} holds connection {} with no owner", self.id, conn_id),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::drain_connection;

    #[tokio::test]
    async fn test_room_creation() {
        let room = Room::new(7);

        assert_eq!(room.id, 7);
        assert!(room.is_empty());
        assert_eq!(room.len(), 0);
        assert!(room.connections().is_empty());
    }

    #[tokio::test]
    async fn test_room_insert_and_remove() {
        let alice = drain_connection(1);
        let bob = drain_connection(2);
        let mut room = Room::new(7);

        assert!(room.insert(&alice));
        assert!(!room.insert(&alice));
        assert!(room.insert(&bob));
        assert_eq!(room.len(), 2);
        assert!(room.contains(alice.id()));

        assert!(room.remove(alice.id()));
        assert!(!room.remove(alice.id()));
        assert!(!room.contains(alice.id()));
        assert_eq!(room.len(), 1);
    }

    #[tokio::test]
    async fn test_room_does_not_own_members() {
        let alice = drain_connection(1);
        let mut room = Room::new(7);
        room.insert(&alice);

        assert_eq!(Arc::strong_count(&alice), 1);
        let members = room.connections();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "no owner")]
    async fn test_orphaned_member_fails_fast() {
        let mut room = Room::new(7);
        room.insert(&drain_connection(1));

        room.connections();
    }
}
