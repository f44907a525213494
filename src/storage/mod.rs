//! Durable storage for channel entity records.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   apply → persist   ┌──────────────┐
//! │ Channel      │ ──────────────────► │ RecordStore  │
//! │ (in-memory)  │                     │ (RocksDB)    │
//! └──────┬───────┘                     └──────┬───────┘
//!        │ on (re)join                        │ column families
//!        ▼                                    ▼
//! ┌──────────────┐    ┌─────────────────────────────────────┐
//! │ EntityStore  │    │ CF "entities" — records (LZ4)        │
//! │ (rehydrated) │    │ CF "events"   — admitted event log   │
//! └──────────────┘    │ CF "metadata" — per-channel counters │
//!                     └─────────────────────────────────────┘
//! ```
//!
//! The in-memory store is the source of truth for live clients; records here
//! are best-effort durability written only after a successful in-memory
//! apply, and the rehydration source on channel (re)load.

pub mod records;

pub use records::{ChannelMetadata, RecordError, RecordStore, StoreConfig};
