//! Event deduplication.
//!
//! The backend may redeliver frames on its own retries, and a reconnect can
//! replay the tail of the stream. Each event gets a stable key; a bounded
//! insertion-ordered window per session suppresses re-application of keys it
//! has already seen. The window only filters, it never reorders.

use crate::protocol::{DomainEvent, EventKind};
use std::collections::{HashSet, VecDeque};

/// Derive the stable dedup key for an event.
///
/// Events carrying an explicit monotonic index (candles) key on
/// `(type, index)`. Everything else falls back to `(type, timestamp)`.
/// Two distinct events of the same type within the same millisecond would
/// collide under the fallback; the wire protocol carries no sequence number,
/// so the risk stands and is accepted.
pub fn dedup_key(event: &DomainEvent) -> String {
    match &event.kind {
        EventKind::Candle { index, .. } => format!("candle:{index}"),
        kind => format!("{}:{}", kind.tag(), event.timestamp.timestamp_millis()),
    }
}

/// Bounded insertion-ordered set of seen dedup keys.
///
/// When the window is full, the oldest half is evicted in a single pass, so
/// inserts stay amortized O(1) instead of paying an O(n) shift each time.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record a key. Returns `true` on first sighting, `false` for a
    /// duplicate within the window.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }

        if self.order.len() >= self.capacity {
            let evict = (self.capacity / 2).max(1);
            for old in self.order.drain(..evict) {
                self.seen.remove(&old);
            }
        }

        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
