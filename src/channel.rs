//! Channel orchestration: the serialized apply pipeline.
//!
//! Pipeline per admitted event:
//! ```text
//! validate ─► dedup ─► store apply ─► stamp server_ms ─► persist ─► remember ─► broadcast
//!    │          │           │                               (best-effort)          │
//!    ▼          ▼           ▼                                                      ▼
//!  Reject      Ack        Reject                                        every peer but origin
//! ```
//!
//! One channel applies events strictly one at a time under a single async
//! mutex, so concurrent submissions from different peers serialize in arrival
//! order and every peer observes the same final state. Different channels
//! share nothing and proceed fully in parallel.
//!
//! Persistence failures are logged and never roll back the in-memory apply or
//! suppress the broadcast; live clients keep converging while durability
//! lags.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::dedup::{DedupWindow, Fingerprint, SystemClock, DEFAULT_TTL_MS};
use crate::protocol::{
    Entity, EntityData, EntityKind, EventKind, MutationEvent, ProtocolError, SyncMessage,
};
use crate::storage::{RecordError, RecordStore};
use crate::store::{EntityStore, StoreError};
use crate::validate::{self, ValidationError};

/// Per-channel tuning knobs.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Replay-suppression window (ms)
    pub dedup_ttl_ms: u64,
    /// Per-peer broadcast queue capacity
    pub peer_queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_ms: DEFAULT_TTL_MS,
            peer_queue_capacity: 256,
        }
    }
}

/// Result of submitting an event to a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// Admitted and broadcast; carries the server-stamped event
    Applied(MutationEvent),
    /// Suppressed as a replay — acknowledged, not re-applied, not broadcast
    Duplicate,
}

/// Errors surfaced to the originator as a rejection.
#[derive(Debug, Clone)]
pub enum ApplyError {
    Validation(ValidationError),
    Store(StoreError),
    Protocol(ProtocolError),
    /// Channel is administratively locked against mutations
    Locked,
}

impl std::fmt::Display for ApplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "validation failed: {e}"),
            Self::Store(e) => write!(f, "apply failed: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Locked => write!(f, "channel is locked"),
        }
    }
}

impl std::error::Error for ApplyError {}

impl From<ValidationError> for ApplyError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<StoreError> for ApplyError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ProtocolError> for ApplyError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// State mutated under the channel's apply lock.
struct ChannelState {
    sections: EntityStore,
    goals: EntityStore,
    dedup: DedupWindow,
    locked: bool,
}

impl ChannelState {
    fn store_mut(&mut self, kind: EntityKind) -> &mut EntityStore {
        match kind {
            EntityKind::Section => &mut self.sections,
            EntityKind::Goal => &mut self.goals,
        }
    }
}

/// One collaboration channel ("binder"): authoritative state, replay window,
/// fan-out group, and optional durability.
pub struct Channel {
    name: String,
    state: Mutex<ChannelState>,
    broadcast: BroadcastGroup,
    records: Option<Arc<RecordStore>>,
}

impl Channel {
    /// Create a channel, rehydrating from the record store when one is given.
    pub fn open(
        name: impl Into<String>,
        config: &ChannelConfig,
        records: Option<Arc<RecordStore>>,
    ) -> Result<Self, RecordError> {
        let name = name.into();
        let mut sections = EntityStore::new(EntityKind::Section);
        let mut goals = EntityStore::new(EntityKind::Goal);

        if let Some(store) = &records {
            Self::rehydrate(store, &name, &mut sections)?;
            Self::rehydrate(store, &name, &mut goals)?;
        }

        Ok(Self {
            name,
            state: Mutex::new(ChannelState {
                sections,
                goals,
                dedup: DedupWindow::new(config.dedup_ttl_ms, Arc::new(SystemClock::new())),
                locked: false,
            }),
            broadcast: BroadcastGroup::new(config.peer_queue_capacity),
            records,
        })
    }

    fn rehydrate(
        records: &RecordStore,
        name: &str,
        store: &mut EntityStore,
    ) -> Result<(), RecordError> {
        // Listed roots-first with stored orders intact
        for entity in records.list_entities(name, store.kind())? {
            if let Err(e) = store.insert_restored(entity) {
                log::warn!("Channel '{name}': skipping corrupt record on rehydrate: {e}");
            }
        }
        Ok(())
    }

    /// The channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fan-out group for this channel.
    pub fn broadcast_group(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Submit one mutation event through the full pipeline.
    ///
    /// Holding the state lock across broadcast keeps fan-out order equal to
    /// admission order.
    pub async fn apply(&self, mut event: MutationEvent) -> Result<ApplyOutcome, ApplyError> {
        validate::validate(&event)?;

        let mut state = self.state.lock().await;
        if state.locked {
            return Err(ApplyError::Locked);
        }

        let fingerprint = Fingerprint::of(&event);
        if state.dedup.seen(&fingerprint) {
            log::debug!(
                "Channel '{}': suppressed replay of {:?} '{}'",
                self.name,
                event.kind,
                event.id
            );
            return Ok(ApplyOutcome::Duplicate);
        }

        event.server_ms = epoch_ms();
        let removed = self.apply_to_store(&mut state, &event)?;

        // Best-effort durability: log and keep going. The in-memory apply
        // already succeeded and every live client must still hear about it.
        if let Err(e) = self.persist(&state, &event, &removed) {
            log::warn!(
                "Channel '{}': persistence failed for {:?} '{}': {e}",
                self.name,
                event.kind,
                event.id
            );
        }

        state.dedup.remember(fingerprint);

        let encoded = SyncMessage::mutation(&self.name, &event)?.encode()?;
        let delivered = self
            .broadcast
            .broadcast(Arc::new(encoded), Some(event.user))
            .await;
        log::trace!(
            "Channel '{}': {:?} '{}' delivered to {delivered} peers",
            self.name,
            event.kind,
            event.id
        );

        Ok(ApplyOutcome::Applied(event))
    }

    /// Mutate the in-memory store. Returns entities removed by a cascade.
    fn apply_to_store(
        &self,
        state: &mut ChannelState,
        event: &MutationEvent,
    ) -> Result<Vec<Entity>, ApplyError> {
        let store = state.store_mut(event.entity);
        let payload = event.payload.clone().unwrap_or_default();

        match event.kind {
            EventKind::Add => {
                let entity = Entity {
                    id: event.id.clone(),
                    kind: event.entity,
                    owner: event.user,
                    data: EntityData {
                        name: payload.name.clone().unwrap_or_default(),
                        parent_id: payload.parent_id.clone().flatten(),
                        order: 0, // assigned on insert
                    },
                    created_ms: event.timestamp_ms,
                    last_event_ms: event.timestamp_ms,
                    server_ms: event.server_ms,
                };
                store.add(entity)?;
                Ok(Vec::new())
            }
            EventKind::Update => {
                store.patch(
                    &event.id,
                    &payload,
                    event.user,
                    event.timestamp_ms,
                    event.server_ms,
                )?;
                Ok(Vec::new())
            }
            EventKind::Remove => Ok(store.remove(&event.id)?),
            EventKind::Reorder => {
                store.reorder(
                    &event.id,
                    &payload,
                    event.user,
                    event.timestamp_ms,
                    event.server_ms,
                )?;
                Ok(Vec::new())
            }
        }
    }

    /// Write the admitted event and the records it touched.
    ///
    /// Sibling orders shift on remove and reorder, so those paths rewrite the
    /// whole kind's records rather than chase the renumbered set. A name-only
    /// update touches exactly one record.
    fn persist(
        &self,
        state: &ChannelState,
        event: &MutationEvent,
        removed: &[Entity],
    ) -> Result<(), RecordError> {
        let records = match &self.records {
            Some(r) => r,
            None => return Ok(()),
        };

        records.append_event(&self.name, event)?;

        let store = match event.entity {
            EntityKind::Section => &state.sections,
            EntityKind::Goal => &state.goals,
        };

        match event.kind {
            EventKind::Add => {
                let entity = store
                    .get(&event.id)
                    .map_err(|e| RecordError::DatabaseError(e.to_string()))?;
                records.create_record(&self.name, entity)?;
            }
            EventKind::Update => {
                let structural = event
                    .payload
                    .as_ref()
                    .is_some_and(|p| p.parent_id.is_some() || p.order.is_some());
                if structural {
                    self.rewrite_kind(records, store)?;
                } else {
                    let entity = store
                        .get(&event.id)
                        .map_err(|e| RecordError::DatabaseError(e.to_string()))?;
                    records.update_record(&self.name, entity)?;
                }
            }
            EventKind::Remove => {
                for entity in removed {
                    records.delete_record(&self.name, entity.kind, &entity.id)?;
                }
                self.rewrite_kind(records, store)?;
            }
            EventKind::Reorder => {
                self.rewrite_kind(records, store)?;
            }
        }
        Ok(())
    }

    fn rewrite_kind(&self, records: &RecordStore, store: &EntityStore) -> Result<(), RecordError> {
        for entity in store.list_all() {
            records.update_record(&self.name, entity)?;
        }
        Ok(())
    }

    /// Full entity snapshot, sections then goals, each roots-first ordered.
    pub async fn snapshot(&self) -> Vec<Entity> {
        let state = self.state.lock().await;
        let mut entities: Vec<Entity> = state.sections.list_all().into_iter().cloned().collect();
        entities.extend(state.goals.list_all().into_iter().cloned());
        entities
    }

    /// Entity counts `(sections, goals)`.
    pub async fn entity_counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.sections.len(), state.goals.len())
    }

    /// Replays suppressed since the channel opened.
    pub async fn suppressed_replays(&self) -> u64 {
        self.state.lock().await.dedup.suppressed()
    }

    /// Refuse further mutations (reads and joins still work).
    pub async fn lock(&self) {
        self.state.lock().await.locked = true;
    }

    /// Accept mutations again.
    pub async fn unlock(&self) {
        self.state.lock().await.locked = false;
    }
}

/// Registry of live channels, created on first join.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    config: ChannelConfig,
    records: Option<Arc<RecordStore>>,
}

impl ChannelRegistry {
    pub fn new(config: ChannelConfig, records: Option<Arc<RecordStore>>) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            config,
            records,
        }
    }

    /// Get the channel, opening (and rehydrating) it if absent.
    pub async fn open(&self, name: &str) -> Result<Arc<Channel>, RecordError> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(name) {
                return Ok(channel.clone());
            }
        }

        let mut channels = self.channels.write().await;
        // Double-check: another task may have opened it between the locks
        if let Some(channel) = channels.get(name) {
            return Ok(channel.clone());
        }

        let channel = Arc::new(Channel::open(name, &self.config, self.records.clone())?);
        channels.insert(name.to_string(), channel.clone());
        log::info!("Opened channel '{name}'");
        Ok(channel)
    }

    /// Get a live channel without opening one.
    pub async fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Drop the channel if no peers remain. Records stay on disk; the next
    /// join rehydrates.
    pub async fn close_if_empty(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(name) {
            if channel.broadcast_group().peer_count().await == 0 {
                channels.remove(name);
                log::info!("Closed idle channel '{name}'");
                return true;
            }
        }
        false
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}

/// Milliseconds since the Unix epoch.
fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventPayload;

    fn add_event(id: &str, name: &str, user: Uuid, ts: u64) -> MutationEvent {
        MutationEvent::add(
            EntityKind::Section,
            id,
            user,
            EventPayload::child_of(name, None),
            ts,
        )
    }

    async fn open_channel() -> Channel {
        Channel::open("test-binder", &ChannelConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn test_apply_add_stamps_and_applies() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        let outcome = channel.apply(add_event("s1", "Intro", user, 100)).await.unwrap();
        let ApplyOutcome::Applied(stamped) = outcome else {
            panic!("expected Applied");
        };
        assert!(stamped.server_ms > 0);

        let snapshot = channel.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "s1");
        assert_eq!(snapshot[0].data.name, "Intro");
        assert_eq!(snapshot[0].owner, user);
    }

    #[tokio::test]
    async fn test_duplicate_suppressed_not_reapplied() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();
        let event = add_event("s1", "Intro", user, 100);

        let first = channel.apply(event.clone()).await.unwrap();
        assert!(matches!(first, ApplyOutcome::Applied(_)));

        // Same fingerprint: kind + id + client timestamp
        let second = channel.apply(event).await.unwrap();
        assert_eq!(second, ApplyOutcome::Duplicate);

        assert_eq!(channel.entity_counts().await, (1, 0));
        assert_eq!(channel.suppressed_replays().await, 1);
    }

    #[tokio::test]
    async fn test_same_id_different_timestamp_not_duplicate() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        channel.apply(add_event("s1", "Intro", user, 100)).await.unwrap();
        let err = channel.apply(add_event("s1", "Intro", user, 101)).await;
        // Not suppressed — reaches the store and fails as a duplicate id
        assert!(matches!(err, Err(ApplyError::Store(StoreError::DuplicateId(_)))));
    }

    #[tokio::test]
    async fn test_validation_rejects_before_store() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        let bad = MutationEvent::add(
            EntityKind::Section,
            "s1",
            user,
            EventPayload::named("   "),
            100,
        );
        let err = channel.apply(bad).await;
        assert!(matches!(err, Err(ApplyError::Validation(_))));
        assert_eq!(channel.entity_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_rejected_event_not_remembered() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        // Fails in the store: dangling parent
        let dangling = MutationEvent::add(
            EntityKind::Section,
            "child",
            user,
            EventPayload::child_of("Child", Some("ghost".into())),
            100,
        );
        assert!(channel.apply(dangling).await.is_err());

        // The parent arrives, then the same event retries and succeeds —
        // a rejected event must not occupy the replay window
        channel.apply(add_event("ghost", "Parent", user, 50)).await.unwrap();
        let retry = MutationEvent::add(
            EntityKind::Section,
            "child",
            user,
            EventPayload::child_of("Child", Some("ghost".into())),
            100,
        );
        assert!(matches!(
            channel.apply(retry).await.unwrap(),
            ApplyOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let channel = open_channel().await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_tx_a, mut rx_alice) = channel.broadcast_group().add_peer(alice).await;
        let (_tx_b, mut rx_bob) = channel.broadcast_group().add_peer(bob).await;

        channel.apply(add_event("s1", "Intro", alice, 100)).await.unwrap();

        let bytes = rx_bob.try_recv().unwrap();
        let msg = SyncMessage::decode(&bytes).unwrap();
        let event = msg.mutation_event().unwrap();
        assert_eq!(event.id, "s1");
        assert!(event.server_ms > 0);

        assert!(rx_alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_not_broadcast() {
        let channel = open_channel().await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (_tx_b, mut rx_bob) = channel.broadcast_group().add_peer(bob).await;

        let event = add_event("s1", "Intro", alice, 100);
        channel.apply(event.clone()).await.unwrap();
        channel.apply(event).await.unwrap();

        assert!(rx_bob.try_recv().is_ok());
        assert!(rx_bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sections_and_goals_isolated() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        channel.apply(add_event("x", "Section X", user, 1)).await.unwrap();
        let goal = MutationEvent::add(
            EntityKind::Goal,
            "x", // same id, different kind
            user,
            EventPayload::named("Goal X"),
            2,
        );
        channel.apply(goal).await.unwrap();

        assert_eq!(channel.entity_counts().await, (1, 1));
    }

    #[tokio::test]
    async fn test_locked_channel_rejects_mutations() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        channel.lock().await;
        let err = channel.apply(add_event("s1", "Intro", user, 1)).await;
        assert!(matches!(err, Err(ApplyError::Locked)));

        channel.unlock().await;
        assert!(channel.apply(add_event("s1", "Intro", user, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_remove_cascade_through_pipeline() {
        let channel = open_channel().await;
        let user = Uuid::new_v4();

        channel.apply(add_event("a", "Root", user, 1)).await.unwrap();
        let child = MutationEvent::add(
            EntityKind::Section,
            "b",
            user,
            EventPayload::child_of("Child", Some("a".into())),
            2,
        );
        channel.apply(child).await.unwrap();

        let remove = MutationEvent::remove(EntityKind::Section, "a", user, 3);
        channel.apply(remove).await.unwrap();
        assert_eq!(channel.entity_counts().await, (0, 0));
    }

    #[tokio::test]
    async fn test_registry_opens_once() {
        let registry = ChannelRegistry::new(ChannelConfig::default(), None);

        let a = registry.open("binder-1").await.unwrap();
        let b = registry.open("binder-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.channel_count().await, 1);

        registry.open("binder-2").await.unwrap();
        assert_eq!(registry.channel_count().await, 2);
    }

    #[tokio::test]
    async fn test_registry_close_if_empty() {
        let registry = ChannelRegistry::new(ChannelConfig::default(), None);
        let channel = registry.open("binder-1").await.unwrap();

        let user = Uuid::new_v4();
        let (_tx, _rx) = channel.broadcast_group().add_peer(user).await;
        assert!(!registry.close_if_empty("binder-1").await);

        channel.broadcast_group().remove_peer(&user).await;
        assert!(registry.close_if_empty("binder-1").await);
        assert!(registry.get("binder-1").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_applies_serialize() {
        let channel = Arc::new(open_channel().await);
        let mut handles = Vec::new();

        for i in 0..16 {
            let ch = channel.clone();
            handles.push(tokio::spawn(async move {
                ch.apply(add_event(&format!("s{i}"), "Section", Uuid::new_v4(), i))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Every add admitted exactly once, orders dense
        let snapshot = channel.snapshot().await;
        assert_eq!(snapshot.len(), 16);
        let mut orders: Vec<u64> = snapshot.iter().map(|e| e.data.order).collect();
        orders.sort_unstable();
        assert_eq!(orders, (0..16).collect::<Vec<u64>>());
    }
}
