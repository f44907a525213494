//! RocksDB-backed record store for channel entities.
//!
//! Column families:
//! - `entities` — one record per entity, keyed `(channel, kind, id)`,
//!   LZ4-compressed bincode [`Entity`] values
//! - `events`   — append-only log of admitted events, keyed by a monotonic
//!   sequence recovered on reopen
//! - `metadata` — per-channel counters
//!
//! Records are written only after the in-memory apply succeeded, so persisted
//! state never leads validated state. A repeated create for the same key
//! surfaces a conflict; deleting an absent record is a no-op success.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use crate::protocol::{Entity, EntityKind, MutationEvent};

/// Column family names.
const CF_ENTITIES: &str = "entities";
const CF_EVENTS: &str = "events";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_ENTITIES, CF_EVENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false — RocksDB WAL covers atomicity)
    pub sync_writes: bool,
    /// Max open files (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("binder_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// Per-channel storage counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetadata {
    pub channel: String,
    /// Live entity records
    pub record_count: u64,
    /// Admitted events appended since creation
    pub event_count: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl ChannelMetadata {
    fn new(channel: &str) -> Self {
        let now = epoch_secs();
        Self {
            channel: channel.to_string(),
            record_count: 0,
            event_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, RecordError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RecordError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RecordError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// One entry in the admitted-event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventRecord {
    channel: String,
    event: MutationEvent,
}

/// Record store errors.
#[derive(Debug, Clone)]
pub enum RecordError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Create targeted an already-persisted (channel, id)
    Conflict { channel: String, id: String },
    /// Record not found
    NotFound { channel: String, id: String },
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatabaseError(e) => write!(f, "Database error: {e}"),
            Self::Conflict { channel, id } => {
                write!(f, "Record already exists: {channel}/{id}")
            }
            Self::NotFound { channel, id } => write!(f, "Record not found: {channel}/{id}"),
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<rocksdb::Error> for RecordError {
    fn from(e: rocksdb::Error) -> Self {
        RecordError::DatabaseError(e.to_string())
    }
}

/// RocksDB-backed store of entity records and the admitted-event log.
pub struct RecordStore {
    /// Single-threaded mode — concurrency via the channel's serialized path
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next event-log sequence number
    sequence: AtomicU64,
}

impl RecordStore {
    /// Open the record store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, RecordError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db);

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ENTITIES => {
                // Many small values, prefix-scanned per (channel, kind)
                opts.set_max_write_buffer_number(4);
            }
            CF_EVENTS => {
                // Sequential appends, sequential scans during recovery
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Recover the last event sequence number from the events CF.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let cf = match db.cf_handle(CF_EVENTS) {
            Some(cf) => cf,
            None => return 0,
        };

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        match iter.next() {
            Some(Ok((key, _))) if key.len() >= 8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[..8]);
                u64::from_be_bytes(buf) + 1
            }
            _ => 0,
        }
    }

    // ─── Entity records ───────────────────────────────────────────────

    /// Persist a newly created entity.
    ///
    /// Surfaces [`RecordError::Conflict`] if the `(channel, id)` key already
    /// holds a record — a repeated create is never silently overwritten.
    pub fn create_record(&self, channel: &str, entity: &Entity) -> Result<(), RecordError> {
        let cf = self.cf(CF_ENTITIES)?;
        let key = Self::entity_key(channel, entity.kind, &entity.id);

        if self.db.get_cf(&cf, &key)?.is_some() {
            return Err(RecordError::Conflict {
                channel: channel.to_string(),
                id: entity.id.clone(),
            });
        }

        self.put_record(channel, &key, entity, 1)
    }

    /// Persist the current revision of an existing entity.
    ///
    /// Upserts: a record missed by an earlier failed create is healed by the
    /// next update for the same key.
    pub fn update_record(&self, channel: &str, entity: &Entity) -> Result<(), RecordError> {
        let cf = self.cf(CF_ENTITIES)?;
        let key = Self::entity_key(channel, entity.kind, &entity.id);
        let existed = self.db.get_cf(&cf, &key)?.is_some();
        self.put_record(channel, &key, entity, if existed { 0 } else { 1 })
    }

    /// Delete an entity record. Absent records are a no-op success.
    pub fn delete_record(
        &self,
        channel: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<(), RecordError> {
        let cf_entities = self.cf(CF_ENTITIES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = Self::entity_key(channel, kind, id);

        if self.db.get_cf(&cf_entities, &key)?.is_none() {
            return Ok(());
        }

        let mut meta = self.channel_meta_or_new(channel)?;
        meta.record_count = meta.record_count.saturating_sub(1);
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_entities, &key);
        batch.put_cf(&cf_meta, channel.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    /// Load one entity record.
    pub fn load_record(
        &self,
        channel: &str,
        kind: EntityKind,
        id: &str,
    ) -> Result<Entity, RecordError> {
        let cf = self.cf(CF_ENTITIES)?;
        let key = Self::entity_key(channel, kind, id);
        match self.db.get_cf(&cf, &key)? {
            Some(compressed) => decode_entity(&compressed),
            None => Err(RecordError::NotFound {
                channel: channel.to_string(),
                id: id.to_string(),
            }),
        }
    }

    /// All records of one kind in one channel, ordered for rehydration.
    ///
    /// Roots first, then by `(order, server_ms, id)` within each sibling
    /// group — the same deterministic sequence the in-memory store lists.
    pub fn list_entities(&self, channel: &str, kind: EntityKind) -> Result<Vec<Entity>, RecordError> {
        let cf = self.cf(CF_ENTITIES)?;
        let prefix = Self::kind_prefix(channel, kind);

        let mut entities = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| RecordError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            entities.push(decode_entity(&value)?);
        }

        entities.sort_by(|a, b| {
            let ka = (a.data.parent_id.is_some(), a.data.parent_id.as_deref());
            let kb = (b.data.parent_id.is_some(), b.data.parent_id.as_deref());
            ka.cmp(&kb).then_with(|| crate::order::sibling_cmp(a, b))
        });
        Ok(entities)
    }

    /// Delete every entity record and the counters for a channel.
    ///
    /// Used when a binder is explicitly deleted. Logged events are
    /// sequence-keyed across channels and reclaimed by [`truncate_events`],
    /// not here.
    ///
    /// [`truncate_events`]: RecordStore::truncate_events
    pub fn delete_channel(&self, channel: &str) -> Result<u64, RecordError> {
        let cf_entities = self.cf(CF_ENTITIES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let prefix = Self::channel_prefix(channel);

        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        let iter = self.db.iterator_cf(
            &cf_entities,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.map_err(|e| RecordError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(&cf_entities, &key);
            count += 1;
        }

        batch.delete_cf(&cf_meta, channel.as_bytes());
        self.write(batch)?;
        Ok(count)
    }

    /// Channels with at least one persisted record or counter.
    pub fn list_channels(&self) -> Result<Vec<String>, RecordError> {
        let cf = self.cf(CF_METADATA)?;
        let mut channels = Vec::new();

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| RecordError::DatabaseError(e.to_string()))?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| RecordError::DeserializationError(e.to_string()))?;
            channels.push(name);
        }
        Ok(channels)
    }

    /// Per-channel counters.
    pub fn channel_meta(&self, channel: &str) -> Result<ChannelMetadata, RecordError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, channel.as_bytes())? {
            Some(bytes) => ChannelMetadata::decode(&bytes),
            None => Err(RecordError::NotFound {
                channel: channel.to_string(),
                id: String::new(),
            }),
        }
    }

    // ─── Event log ────────────────────────────────────────────────────

    /// Append an admitted event to the log. Returns the sequence assigned.
    pub fn append_event(&self, channel: &str, event: &MutationEvent) -> Result<u64, RecordError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);

        let record = EventRecord {
            channel: channel.to_string(),
            event: event.clone(),
        };
        let encoded = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| RecordError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self.channel_meta_or_new(channel)?;
        meta.event_count += 1;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_events, seq.to_be_bytes(), &compressed);
        batch.put_cf(&cf_meta, channel.as_bytes(), &meta.encode()?);
        self.write(batch)?;

        Ok(seq)
    }

    /// Read logged events at or after `since_seq`, in sequence order.
    pub fn events_since(
        &self,
        since_seq: u64,
    ) -> Result<Vec<(u64, String, MutationEvent)>, RecordError> {
        let cf = self.cf(CF_EVENTS)?;
        let start_key = since_seq.to_be_bytes();

        let mut events = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item.map_err(|e| RecordError::DatabaseError(e.to_string()))?;
            if key.len() < 8 {
                continue;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[..8]);
            let seq = u64::from_be_bytes(seq_buf);

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| RecordError::CompressionError(e.to_string()))?;
            let (record, _): (EventRecord, _) =
                bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
                    .map_err(|e| RecordError::DeserializationError(e.to_string()))?;

            events.push((seq, record.channel, record.event));
        }
        Ok(events)
    }

    /// Drop logged events up to and including `up_to_seq`.
    pub fn truncate_events(&self, up_to_seq: u64) -> Result<u64, RecordError> {
        let cf = self.cf(CF_EVENTS)?;
        let mut batch = WriteBatch::default();
        let mut count = 0u64;

        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| RecordError::DatabaseError(e.to_string()))?;
            if key.len() < 8 {
                continue;
            }
            let mut seq_buf = [0u8; 8];
            seq_buf.copy_from_slice(&key[..8]);
            if u64::from_be_bytes(seq_buf) > up_to_seq {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write(batch)?;
        }
        Ok(count)
    }

    /// Next event-log sequence number.
    pub fn event_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Force a flush of memtables.
    pub fn sync(&self) -> Result<(), RecordError> {
        self.db
            .flush()
            .map_err(|e| RecordError::DatabaseError(e.to_string()))
    }

    /// The database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn put_record(
        &self,
        channel: &str,
        key: &[u8],
        entity: &Entity,
        count_delta: u64,
    ) -> Result<(), RecordError> {
        let cf_entities = self.cf(CF_ENTITIES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = bincode::serde::encode_to_vec(entity, bincode::config::standard())
            .map_err(|e| RecordError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let mut meta = self.channel_meta_or_new(channel)?;
        meta.record_count += count_delta;
        meta.updated_at = epoch_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_entities, key, &compressed);
        batch.put_cf(&cf_meta, channel.as_bytes(), &meta.encode()?);
        self.write(batch)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), RecordError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn channel_meta_or_new(&self, channel: &str) -> Result<ChannelMetadata, RecordError> {
        match self.channel_meta(channel) {
            Ok(meta) => Ok(meta),
            Err(RecordError::NotFound { .. }) => Ok(ChannelMetadata::new(channel)),
            Err(e) => Err(e),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, RecordError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| RecordError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// Key: `<channel len:2 BE><channel><kind:1><id>`.
    ///
    /// The length prefix keeps one channel's keys from shadowing another's
    /// when channel names share a prefix.
    fn entity_key(channel: &str, kind: EntityKind, id: &str) -> Vec<u8> {
        let mut key = Self::kind_prefix(channel, kind);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn kind_prefix(channel: &str, kind: EntityKind) -> Vec<u8> {
        let mut key = Self::channel_prefix(channel);
        key.push(kind_byte(kind));
        key
    }

    fn channel_prefix(channel: &str) -> Vec<u8> {
        let bytes = channel.as_bytes();
        let mut key = Vec::with_capacity(2 + bytes.len() + 1);
        key.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        key.extend_from_slice(bytes);
        key
    }
}

fn kind_byte(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::Section => 1,
        EntityKind::Goal => 2,
    }
}

fn decode_entity(compressed: &[u8]) -> Result<Entity, RecordError> {
    let decompressed = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| RecordError::CompressionError(e.to_string()))?;
    let (entity, _) = bincode::serde::decode_from_slice(&decompressed, bincode::config::standard())
        .map_err(|e| RecordError::DeserializationError(e.to_string()))?;
    Ok(entity)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
