//! Binary protocol for entity mutation synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬───────────┬──────────┐
//! │ msg_type │ channel  │ user      │ payload  │
//! │ 1 byte   │ variable │ 16 bytes  │ variable │
//! └──────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! The envelope is [`SyncMessage`]; mutation bodies are [`MutationEvent`]
//! values encoded into the payload. Events are immutable after creation —
//! a correction is expressed as a new event.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable entity identifier, assigned by the creating client.
pub type EntityId = String;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a connection: join a channel
    Join = 1,
    /// Voluntary leave (disconnect also implies leave)
    Leave = 2,
    /// Entity mutation event
    Mutation = 3,
    /// Server accepted the mutation (applied or duplicate)
    Ack = 4,
    /// Server rejected the mutation (validation or store error)
    Reject = 5,
    /// Full entity snapshot, sent to a peer on join
    Snapshot = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Which collaborative collection an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// Hierarchical: parent references form a tree
    Section,
    /// Flat ordered list
    Goal,
}

/// Mutation event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Add,
    Update,
    Remove,
    Reorder,
}

/// Entity-type-specific fields.
///
/// `name` holds the section name or the goal text. `parent_id` is only
/// meaningful for sections; goals form a single root-level list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub name: String,
    pub parent_id: Option<EntityId>,
    /// Position among siblings — dense, zero-based
    pub order: u64,
}

/// A versioned collaborative entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: EntityKind,
    /// User who last mutated the entity (not necessarily its creator)
    pub owner: Uuid,
    pub data: EntityData,
    /// Client logical time of the creating event (ms since epoch)
    pub created_ms: u64,
    /// Client logical time of the event that produced this revision
    pub last_event_ms: u64,
    /// Assigned by the authoritative side at persistence; tie-break only
    pub server_ms: u64,
}

/// Partial event payload.
///
/// All fields optional: `Add` requires `name`, `Reorder` requires `order`,
/// `Update` merges whatever is present. `parent_id` uses a double option so
/// `Some(None)` reparents to the root while `None` leaves the parent alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub name: Option<String>,
    pub parent_id: Option<Option<EntityId>>,
    pub order: Option<u64>,
}

impl EventPayload {
    /// Payload carrying only a name (typical rename / goal edit).
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Payload for creating an entity under the given parent.
    pub fn child_of(name: impl Into<String>, parent_id: Option<EntityId>) -> Self {
        Self {
            name: Some(name.into()),
            parent_id: Some(parent_id),
            order: None,
        }
    }

    /// Payload moving an entity to `order` within its sibling group.
    pub fn at_order(order: u64) -> Self {
        Self {
            order: Some(order),
            ..Self::default()
        }
    }
}

/// The unit of synchronization: one mutation of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    pub kind: EventKind,
    pub entity: EntityKind,
    pub id: EntityId,
    /// Originating user
    pub user: Uuid,
    /// `None` for remove
    pub payload: Option<EventPayload>,
    /// Client logical timestamp (ms since epoch); dedup + tie-break only
    pub timestamp_ms: u64,
    /// Stamped on admission by the server; zero until then
    pub server_ms: u64,
}

impl MutationEvent {
    pub fn add(
        entity: EntityKind,
        id: impl Into<EntityId>,
        user: Uuid,
        payload: EventPayload,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::Add,
            entity,
            id: id.into(),
            user,
            payload: Some(payload),
            timestamp_ms,
            server_ms: 0,
        }
    }

    pub fn update(
        entity: EntityKind,
        id: impl Into<EntityId>,
        user: Uuid,
        payload: EventPayload,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::Update,
            entity,
            id: id.into(),
            user,
            payload: Some(payload),
            timestamp_ms,
            server_ms: 0,
        }
    }

    pub fn remove(
        entity: EntityKind,
        id: impl Into<EntityId>,
        user: Uuid,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::Remove,
            entity,
            id: id.into(),
            user,
            payload: None,
            timestamp_ms,
            server_ms: 0,
        }
    }

    pub fn reorder(
        entity: EntityKind,
        id: impl Into<EntityId>,
        user: Uuid,
        payload: EventPayload,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            kind: EventKind::Reorder,
            entity,
            id: id.into(),
            user,
            payload: Some(payload),
            timestamp_ms,
            server_ms: 0,
        }
    }

    /// Serialize to bytes for the message payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from message payload bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (event, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(event)
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Collaboration channel ("binder") name
    pub channel: String,
    /// Sending user (or `Uuid::nil()` for server-originated messages)
    pub user: Uuid,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join message.
    pub fn join(channel: impl Into<String>, user: Uuid) -> Self {
        Self {
            msg_type: MessageType::Join,
            channel: channel.into(),
            user,
            payload: Vec::new(),
        }
    }

    /// Create a leave message.
    pub fn leave(channel: impl Into<String>, user: Uuid) -> Self {
        Self {
            msg_type: MessageType::Leave,
            channel: channel.into(),
            user,
            payload: Vec::new(),
        }
    }

    /// Create a mutation message wrapping the given event.
    pub fn mutation(
        channel: impl Into<String>,
        event: &MutationEvent,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Mutation,
            channel: channel.into(),
            user: event.user,
            payload: event.encode()?,
        })
    }

    /// Create an ack for the event with the given fingerprint source.
    ///
    /// The payload carries the admitted event (server-stamped) so the
    /// originator can reconcile its optimistic state.
    pub fn ack(channel: impl Into<String>, event: &MutationEvent) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Ack,
            channel: channel.into(),
            user: Uuid::nil(),
            payload: event.encode()?,
        })
    }

    /// Create a rejection carrying a human-readable reason.
    pub fn reject(channel: impl Into<String>, reason: &str) -> Self {
        Self {
            msg_type: MessageType::Reject,
            channel: channel.into(),
            user: Uuid::nil(),
            payload: reason.as_bytes().to_vec(),
        }
    }

    /// Create a snapshot message carrying the full entity list.
    pub fn snapshot(
        channel: impl Into<String>,
        entities: &[Entity],
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(entities, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Snapshot,
            channel: channel.into(),
            user: Uuid::nil(),
            payload,
        })
    }

    /// Create a ping message.
    pub fn ping(user: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            channel: String::new(),
            user,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(user: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            channel: String::new(),
            user,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the payload as a mutation event (Mutation or Ack).
    pub fn mutation_event(&self) -> Result<MutationEvent, ProtocolError> {
        if self.msg_type != MessageType::Mutation && self.msg_type != MessageType::Ack {
            return Err(ProtocolError::InvalidMessageType);
        }
        MutationEvent::decode(&self.payload)
    }

    /// Parse the payload as a snapshot entity list.
    pub fn snapshot_entities(&self) -> Result<Vec<Entity>, ProtocolError> {
        if self.msg_type != MessageType::Snapshot {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (entities, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(entities)
    }

    /// Parse the payload as a rejection reason.
    pub fn reject_reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Reject {
            return Err(ProtocolError::InvalidMessageType);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
