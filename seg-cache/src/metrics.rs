//! Engine metrics
//!
//! Plain atomic counters, bumped inline on the hot paths and read out as a
//! consistent-enough snapshot. Gauges (live items, free segments, ...) are
//! computed from the owning structures instead of being tracked here.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn incr_n(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for everything the engine does.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests for a new segment.
    pub seg_request: Counter,
    /// Segments carved from the unallocated region.
    pub seg_alloc: Counter,
    /// Segments reclaimed by the eviction ranker.
    pub seg_evict: Counter,
    /// Eviction attempts that lost a race or found nothing.
    pub seg_evict_fail: Counter,
    /// Item removal passes re-run because a slow writer slipped in.
    pub seg_evict_retry: Counter,
    /// Segments reclaimed by expiration or flush.
    pub seg_expire: Counter,
    /// Segments consumed by merge compaction.
    pub seg_merge: Counter,
    /// Segments handed back unused after losing a link race.
    pub seg_return: Counter,

    pub item_reserve: Counter,
    pub item_insert: Counter,
    pub item_delete: Counter,
    /// Reservations refused because the item cannot fit a segment.
    pub item_oversized: Counter,
    /// Reservations refused because no segment could be freed.
    pub item_no_memory: Counter,

    pub hash_lookup: Counter,
    pub hash_hit: Counter,
    pub hash_insert: Counter,
    pub hash_remove: Counter,
    pub hash_evict: Counter,
    pub hash_relink: Counter,
    /// Slots whose tag matched but whose key did not.
    pub hash_tag_collision: Counter,
    /// Overflow buckets allocated.
    pub hash_overflow_alloc: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            seg_request: self.seg_request.value(),
            seg_alloc: self.seg_alloc.value(),
            seg_evict: self.seg_evict.value(),
            seg_evict_fail: self.seg_evict_fail.value(),
            seg_evict_retry: self.seg_evict_retry.value(),
            seg_expire: self.seg_expire.value(),
            seg_merge: self.seg_merge.value(),
            seg_return: self.seg_return.value(),
            item_reserve: self.item_reserve.value(),
            item_insert: self.item_insert.value(),
            item_delete: self.item_delete.value(),
            item_oversized: self.item_oversized.value(),
            item_no_memory: self.item_no_memory.value(),
            hash_lookup: self.hash_lookup.value(),
            hash_hit: self.hash_hit.value(),
            hash_insert: self.hash_insert.value(),
            hash_remove: self.hash_remove.value(),
            hash_evict: self.hash_evict.value(),
            hash_relink: self.hash_relink.value(),
            hash_tag_collision: self.hash_tag_collision.value(),
            hash_overflow_alloc: self.hash_overflow_alloc.value(),
        }
    }
}

/// Plain-value copy of [`Metrics`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub seg_request: u64,
    pub seg_alloc: u64,
    pub seg_evict: u64,
    pub seg_evict_fail: u64,
    pub seg_evict_retry: u64,
    pub seg_expire: u64,
    pub seg_merge: u64,
    pub seg_return: u64,
    pub item_reserve: u64,
    pub item_insert: u64,
    pub item_delete: u64,
    pub item_oversized: u64,
    pub item_no_memory: u64,
    pub hash_lookup: u64,
    pub hash_hit: u64,
    pub hash_insert: u64,
    pub hash_remove: u64,
    pub hash_evict: u64,
    pub hash_relink: u64,
    pub hash_tag_collision: u64,
    pub hash_overflow_alloc: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.seg_alloc.incr();
        metrics.seg_alloc.incr_n(3);
        assert_eq!(metrics.seg_alloc.value(), 4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.seg_alloc, 4);
        assert_eq!(snapshot.seg_evict, 0);
    }
}
