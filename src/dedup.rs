//! Time-bounded replay suppression.
//!
//! Rebroadcast and reconnect can deliver the same logical event more than
//! once. The window remembers a fingerprint per admitted event for a short
//! TTL; an already-seen event is acknowledged but never re-applied.
//!
//! Expiry is lazy — entries are purged on access against a pluggable
//! [`Clock`], so tests advance logical time deterministically instead of
//! sleeping, and no background timer exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::protocol::{EventKind, MutationEvent};

/// Default window: matches the empirical rebroadcast horizon.
pub const DEFAULT_TTL_MS: u64 = 1000;

/// Composite key identifying one logical event.
///
/// Two events with the same fingerprint are the same event, e.g. a
/// rebroadcast after reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub kind: EventKind,
    pub id: String,
    pub timestamp_ms: u64,
}

impl Fingerprint {
    pub fn of(event: &MutationEvent) -> Self {
        Self {
            kind: event.kind,
            id: event.id.clone(),
            timestamp_ms: event.timestamp_ms,
        }
    }
}

/// Monotonic millisecond clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock milliseconds since process start.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Expiring set of seen event fingerprints.
pub struct DedupWindow {
    /// fingerprint → expiry deadline (clock ms)
    seen: HashMap<Fingerprint, u64>,
    ttl_ms: u64,
    clock: Arc<dyn Clock>,
    /// Replays suppressed since creation
    suppressed: u64,
}

impl DedupWindow {
    /// Create a window with the given TTL and clock.
    pub fn new(ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            seen: HashMap::new(),
            ttl_ms,
            clock,
            suppressed: 0,
        }
    }

    /// Create with the default TTL on the system clock.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_TTL_MS, Arc::new(SystemClock::new()))
    }

    /// Whether this fingerprint was admitted within the TTL window.
    ///
    /// Counts a hit as a suppressed replay.
    pub fn seen(&mut self, fingerprint: &Fingerprint) -> bool {
        let now = self.clock.now_ms();
        self.purge(now);
        let hit = self
            .seen
            .get(fingerprint)
            .is_some_and(|deadline| *deadline > now);
        if hit {
            self.suppressed += 1;
        }
        hit
    }

    /// Record a fingerprint; it expires `ttl_ms` from now.
    pub fn remember(&mut self, fingerprint: Fingerprint) {
        let now = self.clock.now_ms();
        self.purge(now);
        self.seen.insert(fingerprint, now + self.ttl_ms);
    }

    /// Live (non-expired) entry count.
    pub fn len(&mut self) -> usize {
        let now = self.clock.now_ms();
        self.purge(now);
        self.seen.len()
    }

    /// Whether no live entries remain.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Replays suppressed since creation.
    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// The configured TTL.
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Drop expired entries so the set never grows unbounded.
    fn purge(&mut self, now: u64) {
        self.seen.retain(|_, deadline| *deadline > now);
    }
}
