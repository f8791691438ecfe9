//! Message envelope definitions
//!
//! One flat JSON object per frame, discriminated by its `type` field.
//! Deserialization goes through an unchecked wire shape and is converted into
//! [`Message`] only if the fields required by the kind are present, so a
//! `Message` value is always routable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::types::{RoomId, UserId};

/// Sender id used for server-originated messages
pub const SYSTEM_SENDER: UserId = 0;

/// Message kind, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Server notice
    System,
    /// One-to-one message, requires `to`
    Private,
    /// Room message, requires `room_id`
    Group,
    /// Friend request push, requires `to`
    FriendRequest,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::System => "system",
            MessageKind::Private => "private",
            MessageKind::Group => "group",
            MessageKind::FriendRequest => "friend_request",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routed message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageKind,
    from: UserId,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    room_id: Option<RoomId>,
    content: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    extra: Map<String, Value>,
    timestamp: i64,
}

/// Inbound shape before kind-specific validation
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: MessageKind,
    #[serde(default)]
    from: UserId,
    #[serde(default)]
    to: Option<UserId>,
    #[serde(default)]
    room_id: Option<RoomId>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    extra: Option<Map<String, Value>>,
    #[serde(default)]
    timestamp: i64,
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        // Zero ids are treated as absent, matching `omitempty` producers
        let to = wire.to.filter(|id| *id > 0);
        let room_id = wire.room_id.filter(|id| *id > 0);

        match wire.kind {
            MessageKind::Private | MessageKind::FriendRequest if to.is_none() => {
                return Err(ProtocolError::MissingField {
                    kind: wire.kind.as_str(),
                    field: "to",
                });
            }
            MessageKind::Group if room_id.is_none() => {
                return Err(ProtocolError::MissingField {
                    kind: wire.kind.as_str(),
                    field: "room_id",
                });
            }
            _ => {}
        }

        Ok(Self {
            kind: wire.kind,
            from: wire.from,
            to,
            room_id,
            content: wire.content,
            extra: wire.extra.unwrap_or_default(),
            timestamp: wire.timestamp,
        })
    }
}

impl Message {
    fn new(kind: MessageKind, from: UserId, content: impl Into<String>) -> Self {
        Self {
            kind,
            from,
            to: None,
            room_id: None,
            content: content.into(),
            extra: Map::new(),
            timestamp: 0,
        }
    }

    /// Server notice addressed to everyone who receives it
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, SYSTEM_SENDER, content)
    }

    /// Server notice scoped to one room
    pub fn room_notice(room_id: RoomId, content: impl Into<String>) -> Self {
        let mut msg = Self::system(content);
        msg.room_id = Some(room_id);
        msg
    }

    pub fn private(from: UserId, to: UserId, content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Private, from, content);
        msg.to = Some(to);
        msg
    }

    pub fn group(from: UserId, room_id: RoomId, content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Group, from, content);
        msg.room_id = Some(room_id);
        msg
    }

    pub fn friend_request(from: UserId, to: UserId, content: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::FriendRequest, from, content);
        msg.to = Some(to);
        msg
    }

    /// Attach one `extra` entry
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Merge a map of `extra` entries
    pub fn with_extras(mut self, extra: Map<String, Value>) -> Self {
        self.extra.extend(extra);
        self
    }

    /// Decode one inbound frame payload
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode for the wire
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn from(&self) -> UserId {
        self.from
    }

    pub fn to(&self) -> Option<UserId> {
        self.to
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Replace the client-supplied sender with the authenticated one
    pub(crate) fn assign_sender(&mut self, from: UserId) {
        self.from = from;
    }

    /// Stamp the send time, discarding any client-supplied value
    pub(crate) fn stamp_now(&mut self) {
        self.timestamp = chrono::Utc::now().timestamp();
    }
}
