// Copyright (c) 2023 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::PacketId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Capacity and time bounded set of recently seen packet identifiers.
///
/// Used on the inbound path to collapse re-deliveries of QoS 1/2
/// publishes. Expired entries are dropped lazily on access and in bulk by
/// the owner's periodic tick. When the set is full the earliest-added
/// entry is evicted regardless of its remaining lifetime.
#[derive(Debug)]
pub struct LruDedupCache {
    capacity: usize,
    retention: Duration,

    /// Identifier to its expiry instant.
    entries: HashMap<PacketId, Instant>,

    /// Insertion order; stale ids whose entry was replaced or removed are
    /// skipped during eviction.
    order: VecDeque<PacketId>,
}

impl LruDedupCache {
    #[must_use]
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity,
            retention,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Check whether `id` is still held. An expired entry is removed and
    /// reported as absent.
    pub fn contains(&mut self, id: PacketId) -> bool {
        match self.entries.get(&id) {
            Some(expire_at) if *expire_at > Instant::now() => true,
            Some(_) => {
                self.entries.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Record `id` for the configured retention time.
    pub fn add(&mut self, id: PacketId) {
        while self.entries.len() >= self.capacity {
            // Full: the oldest entry goes first, expired or not.
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        if self.entries.insert(id, Instant::now() + self.retention).is_none() {
            self.order.push_back(id);
        }
    }

    /// Forget `id`, e.g. once its QoS 2 handshake completed.
    pub fn remove(&mut self, id: PacketId) {
        self.entries.remove(&id);
    }

    /// Drop every expired entry, returns how many were removed.
    pub fn evict_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_id, expire_at| *expire_at > now);
        self.order.retain(|id| self.entries.contains_key(id));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_within_retention() {
        let mut cache = LruDedupCache::new(16, Duration::from_secs(60));
        cache.add(PacketId::new(7));
        assert!(cache.contains(PacketId::new(7)));
        assert!(!cache.contains(PacketId::new(8)));
    }

    #[test]
    fn test_expired_entries_are_counted() {
        let mut cache = LruDedupCache::new(16, Duration::from_millis(0));
        cache.add(PacketId::new(1));
        cache.add(PacketId::new(2));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.evict_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lazy_eviction_on_access() {
        let mut cache = LruDedupCache::new(16, Duration::from_millis(0));
        cache.add(PacketId::new(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!cache.contains(PacketId::new(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_drops_earliest() {
        let mut cache = LruDedupCache::new(2, Duration::from_secs(60));
        cache.add(PacketId::new(1));
        cache.add(PacketId::new(2));
        cache.add(PacketId::new(3));
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(PacketId::new(1)));
        assert!(cache.contains(PacketId::new(2)));
        assert!(cache.contains(PacketId::new(3)));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = LruDedupCache::new(4, Duration::from_secs(60));
        cache.add(PacketId::new(1));
        cache.remove(PacketId::new(1));
        assert!(!cache.contains(PacketId::new(1)));

        cache.add(PacketId::new(2));
        cache.clear();
        assert!(cache.is_empty());
    }
}
