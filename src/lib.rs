//! # binder-sync — Channel-scoped collaborative entity synchronization
//!
//! Multi-client synchronization of tree/list entities ("binder" sections and
//! goals) via append-only mutation events over WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer   │
//! │ (per user)  │    Binary Proto     │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                                     ┌──────┴────────┐
//!                                     │ ChannelRegistry│
//!                                     └──────┬────────┘
//!                                            │ per channel, serialized
//!                    validate → dedup → EntityStore → persist → broadcast
//!                                            │
//!                                     ┌──────┴───────┐
//!                                     │ RecordStore  │
//!                                     │ (RocksDB)    │
//!                                     └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded envelope + events)
//! - [`validate`] — Boundary validation of incoming mutation events
//! - [`store`] — Per-channel authoritative entity collection
//! - [`order`] — Dense sibling ordering and renumbering
//! - [`dedup`] — Time-bounded replay suppression window
//! - [`broadcast`] — Originator-excluding fan-out to connected peers
//! - [`channel`] — Serialized apply pipeline and channel registry
//! - [`storage`] — Durable entity records and event log (RocksDB)
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client

pub mod protocol;
pub mod validate;
pub mod order;
pub mod store;
pub mod dedup;
pub mod broadcast;
pub mod channel;
pub mod storage;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    Entity, EntityData, EntityKind, EventKind, EventPayload, MessageType,
    MutationEvent, ProtocolError, SyncMessage,
};
pub use validate::{validate, ValidationError};
pub use store::{EntityStore, StoreError};
pub use dedup::{Clock, DedupWindow, Fingerprint, SystemClock};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use channel::{ApplyError, ApplyOutcome, Channel, ChannelConfig, ChannelRegistry};
pub use storage::{RecordError, RecordStore, StoreConfig};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
