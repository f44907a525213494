//! Fan-out to connected peers, excluding the originator.
//!
//! Each peer holds an independent bounded mpsc queue; delivery is best-effort
//! per connection. A full or closed peer queue counts as a drop and never
//! blocks delivery to the others — reconnect-driven resync is the recovery
//! path for a lagging peer. Within one channel, messages are fanned out in
//! the order events were admitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats — lock-free on the hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A fan-out group for a single channel.
///
/// Peers are keyed by user uuid; sending a message delivers it to every
/// other peer's queue.
pub struct BroadcastGroup {
    /// Per-peer outgoing queues
    peers: Arc<RwLock<HashMap<Uuid, mpsc::Sender<Arc<Vec<u8>>>>>>,
    /// Queue capacity per peer (messages buffered before drops)
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a group with the given per-peer queue capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a peer; returns the sender and receiver ends of its queue.
    ///
    /// Re-joining with the same uuid replaces the previous queue (the old
    /// receiver sees its sender closed). The returned sender identifies this
    /// registration for [`remove_peer_if`].
    ///
    /// [`remove_peer_if`]: BroadcastGroup::remove_peer_if
    pub async fn add_peer(
        &self,
        user: Uuid,
    ) -> (mpsc::Sender<Arc<Vec<u8>>>, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.write().await.insert(user, tx.clone());
        (tx, rx)
    }

    /// Remove a peer from the group.
    pub async fn remove_peer(&self, user: &Uuid) -> bool {
        self.peers.write().await.remove(user).is_some()
    }

    /// Remove a peer only if `tx` is its currently registered queue.
    ///
    /// A connection that lost its registration to a same-uuid rejoin holds a
    /// stale sender; its teardown must not evict the replacement.
    pub async fn remove_peer_if(&self, user: &Uuid, tx: &mpsc::Sender<Arc<Vec<u8>>>) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(user) {
            Some(current) if current.same_channel(tx) => {
                peers.remove(user);
                true
            }
            _ => false,
        }
    }

    /// Deliver pre-encoded bytes to every peer except `exclude`.
    ///
    /// Returns the number of peers that received the message. Full or closed
    /// queues are counted as drops, not errors.
    pub async fn broadcast(&self, encoded: Arc<Vec<u8>>, exclude: Option<Uuid>) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;

        for (user, tx) in peers.iter() {
            if Some(*user) == exclude {
                continue;
            }
            match tx.try_send(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Current peer count.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether a peer is connected.
    pub async fn has_peer(&self, user: &Uuid) -> bool {
        self.peers.read().await.contains_key(user)
    }

    /// Connected peer uuids.
    pub async fn peer_ids(&self) -> Vec<Uuid> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Broadcast statistics snapshot.
    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    /// Per-peer queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
