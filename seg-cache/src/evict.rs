//! Eviction ranking
//!
//! A ranked array of all segment ids, re-sorted at most once per interval by
//! the active policy's comparator. Victim selection walks the array with an
//! atomic cursor so concurrent allocators never fight over the same segment;
//! segments that are being written or parked in the free pool rank last and
//! are skipped.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::EvictionPolicy;
use crate::seg::{SegHeap, SegmentHeader};
use crate::time::TimeSource;

pub struct EvictState {
    policy: EvictionPolicy,
    /// Minimum seconds between two rankings.
    interval: u32,
    last_rank_at: AtomicI64,
    ranked: Mutex<Vec<i32>>,
    cursor: AtomicUsize,
}

impl EvictState {
    pub fn new(policy: EvictionPolicy, nseg: i32, interval: u32) -> Self {
        Self {
            policy,
            interval,
            last_rank_at: AtomicI64::new(-1),
            ranked: Mutex::new((0..nseg).collect()),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Pick the next reclamation victim, or `None` when every candidate is
    /// busy within one pass over the heap.
    pub fn next_victim(&self, heap: &SegHeap, time: &TimeSource) -> Option<i32> {
        if self.policy == EvictionPolicy::Random {
            return self.random_victim(heap);
        }

        self.maybe_rerank(heap, time);

        let nseg = heap.max_nseg() as usize;
        loop {
            let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
            if idx >= nseg {
                warn!("no reclaimable segment within one ranking pass");
                self.cursor.store(0, Ordering::Relaxed);
                return None;
            }
            let seg_id = self.ranked.lock()[idx];
            if Self::usable(heap.header(seg_id)) {
                return Some(seg_id);
            }
        }
    }

    fn random_victim(&self, heap: &SegHeap) -> Option<i32> {
        let nseg = heap.max_nseg();
        let mut seg_id = (rand::random::<u64>() % nseg as u64) as i32;
        for _ in 0..nseg {
            if Self::usable(heap.header(seg_id)) {
                return Some(seg_id);
            }
            seg_id = (seg_id + 1) % nseg;
        }
        warn!("no reclaimable segment among {} candidates", nseg);
        None
    }

    fn usable(header: &SegmentHeader) -> bool {
        header.is_initialized()
            && header.is_evictable()
            && !header.in_free_pool()
            && header.writers() == 0
    }

    fn maybe_rerank(&self, heap: &SegHeap, time: &TimeSource) {
        let now = i64::from(time.proc_sec());
        let prev = self.last_rank_at.load(Ordering::Relaxed);
        if prev != -1 && now - prev <= i64::from(self.interval) {
            return;
        }
        if self
            .last_rank_at
            .compare_exchange(prev, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another thread is already re-ranking.
            return;
        }

        let mut ranked = self.ranked.lock();
        if self.policy == EvictionPolicy::Learned {
            // Roll the hit window: this ranking judges the previous window.
            for header in heap.headers() {
                let hits = header.n_hit.swap(0, Ordering::Relaxed);
                header.n_hit_last.store(hits, Ordering::Relaxed);
            }
        }
        let policy = self.policy;
        ranked.sort_by_key(|&seg_id| Self::rank_key(policy, heap.header(seg_id)));
        self.cursor.store(0, Ordering::Relaxed);
        debug!("re-ranked {} segments, head {:?}", ranked.len(), &ranked[..ranked.len().min(8)]);
    }

    /// Smaller sorts earlier; busy segments sort last regardless of policy.
    fn rank_key(policy: EvictionPolicy, header: &SegmentHeader) -> u64 {
        if !Self::usable(header) {
            return u64::MAX;
        }
        match policy {
            EvictionPolicy::Fifo | EvictionPolicy::MergeFifo => u64::from(header.create_at()),
            EvictionPolicy::ClosestToExpiration => {
                u64::from(header.create_at()) + u64::from(header.ttl())
            }
            EvictionPolicy::Utilization => header.live_bytes().max(0) as u64,
            EvictionPolicy::Learned => u64::from(header.n_hit_last.load(Ordering::Relaxed)),
            EvictionPolicy::Random => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapool::Datapool;

    fn seeded_heap(nseg: i32) -> (Datapool, SegHeap) {
        let seg_size = 4096;
        let pool = Datapool::open(None, "evict_test", seg_size * nseg as usize, false).unwrap();
        let heap = SegHeap::new(pool.payload_ptr(), seg_size, nseg, 0);
        for i in 0..nseg {
            let id = heap.allocate().unwrap();
            heap.init_segment(id, (i * 10) as u32);
            heap.header(id).set_evictable(true);
            heap.header(id).seal();
        }
        (pool, heap)
    }

    #[test]
    fn test_fifo_prefers_oldest() {
        let (_pool, heap) = seeded_heap(4);
        let time = TimeSource::new();
        let state = EvictState::new(EvictionPolicy::Fifo, 4, 5);

        assert_eq!(state.next_victim(&heap, &time), Some(0));
        assert_eq!(state.next_victim(&heap, &time), Some(1));
    }

    #[test]
    fn test_cte_orders_by_expiration() {
        let (_pool, heap) = seeded_heap(3);
        let time = TimeSource::new();
        // Segment 0 is oldest but has the longest TTL.
        heap.header(0).set_ttl(10_000);
        heap.header(1).set_ttl(100);
        heap.header(2).set_ttl(5);

        let state = EvictState::new(EvictionPolicy::ClosestToExpiration, 3, 5);
        assert_eq!(state.next_victim(&heap, &time), Some(2));
    }

    #[test]
    fn test_utilization_prefers_emptiest() {
        let (_pool, heap) = seeded_heap(3);
        let time = TimeSource::new();
        heap.header(0).live_bytes.store(3000, Ordering::Relaxed);
        heap.header(1).live_bytes.store(10, Ordering::Relaxed);
        heap.header(2).live_bytes.store(500, Ordering::Relaxed);

        let state = EvictState::new(EvictionPolicy::Utilization, 3, 5);
        assert_eq!(state.next_victim(&heap, &time), Some(1));
    }

    #[test]
    fn test_busy_segments_are_skipped() {
        let (_pool, heap) = seeded_heap(3);
        let time = TimeSource::new();
        assert!(heap.header(0).pin_writer());

        let state = EvictState::new(EvictionPolicy::Fifo, 3, 5);
        assert_eq!(state.next_victim(&heap, &time), Some(1));
        heap.header(0).unpin_writer();
    }

    #[test]
    fn test_exhausted_pass_returns_none() {
        let (_pool, heap) = seeded_heap(2);
        let time = TimeSource::new();
        for id in 0..2 {
            assert!(heap.header(id).pin_writer());
        }

        let state = EvictState::new(EvictionPolicy::Fifo, 2, 5);
        assert_eq!(state.next_victim(&heap, &time), None);
        // The cursor reset allows a later retry to succeed.
        heap.header(1).unpin_writer();
        assert_eq!(state.next_victim(&heap, &time), Some(1));
        heap.header(0).unpin_writer();
    }

    #[test]
    fn test_random_finds_free_candidate() {
        let (_pool, heap) = seeded_heap(4);
        let time = TimeSource::new();
        let state = EvictState::new(EvictionPolicy::Random, 4, 5);
        assert!(state.next_victim(&heap, &time).is_some());
    }

    #[test]
    fn test_learned_uses_previous_window() {
        let (_pool, heap) = seeded_heap(3);
        let time = TimeSource::new();
        heap.header(0).n_hit.store(50, Ordering::Relaxed);
        heap.header(1).n_hit.store(2, Ordering::Relaxed);
        heap.header(2).n_hit.store(9, Ordering::Relaxed);

        let state = EvictState::new(EvictionPolicy::Learned, 3, 5);
        assert_eq!(state.next_victim(&heap, &time), Some(1));
        // The window rolled.
        assert_eq!(heap.header(0).n_hit.load(Ordering::Relaxed), 0);
        assert_eq!(heap.header(0).n_hit_last.load(Ordering::Relaxed), 50);
    }
}
