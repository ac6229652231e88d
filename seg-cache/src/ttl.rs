//! TTL-indexed segment lists
//!
//! Segments with similar TTLs share a doubly linked list whose head and tail
//! live in a fixed table of 1024 buckets: four ranges of 256 buckets with the
//! granularity doubling by 16x between ranges. Writes always go to the tail
//! segment of a bucket; expiration only ever has to look at list heads.
//!
//! ```text
//!       1s -    2047s: 256 buckets of 8s
//!    2048s -   32767s: 256 buckets of 128s
//!   32768s -  524287s: 256 buckets of 2048s
//!  524288s - 8388607s: 256 buckets of 32768s
//! ```
//!
//! A TTL of zero means "never expires" and maps to the final bucket. The
//! first 16 buckets of each upper range are unreachable (the previous range
//! covers those TTLs); the table trades those 48 slots for an exact
//! shift-and-add mapping.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::seg::{HeapLists, SegHeap};
use crate::types::NO_SEG;

pub const N_TTL_BUCKET: usize = 1024;
const N_BUCKET_PER_RANGE: u32 = 256;

const GRANULARITY_BITS: [u32; 4] = [3, 7, 11, 15];
const BOUNDARIES: [u32; 4] = [2048, 32768, 524_288, 8_388_608];

/// Largest representable TTL; anything above clamps to the final bucket.
pub const TTL_MAX: u32 = BOUNDARIES[3] - 1;

/// Map a TTL in seconds to its bucket index.
pub fn ttl_bucket_index(ttl: u32) -> usize {
    if ttl == 0 {
        return N_TTL_BUCKET - 1;
    }
    for (range, (&boundary, &bits)) in BOUNDARIES.iter().zip(GRANULARITY_BITS.iter()).enumerate() {
        if ttl < boundary {
            return ((ttl >> bits) + range as u32 * N_BUCKET_PER_RANGE) as usize;
        }
    }
    N_TTL_BUCKET - 1
}

#[derive(Debug)]
pub struct TtlBucket {
    /// Smallest nonzero TTL this bucket represents; segments linked here
    /// expire on this value.
    ttl: u32,
    pub(crate) first: AtomicI32,
    pub(crate) last: AtomicI32,
    pub(crate) n_seg: AtomicU32,
    /// Where the merge compactor resumes in this bucket's list.
    pub(crate) next_seg_to_merge: AtomicI32,
    /// Taken by the merge scheduler while it inspects the list; list surgery
    /// itself is serialized by the heap mutex.
    pub(crate) mutex: Mutex<()>,
}

impl TtlBucket {
    fn new(ttl: u32) -> Self {
        Self {
            ttl,
            first: AtomicI32::new(NO_SEG),
            last: AtomicI32::new(NO_SEG),
            n_seg: AtomicU32::new(0),
            next_seg_to_merge: AtomicI32::new(NO_SEG),
            mutex: Mutex::new(()),
        }
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    pub fn first(&self) -> i32 {
        self.first.load(Ordering::Acquire)
    }

    pub fn last(&self) -> i32 {
        self.last.load(Ordering::Acquire)
    }

    pub fn n_seg(&self) -> u32 {
        self.n_seg.load(Ordering::Relaxed)
    }
}

pub struct TtlBuckets {
    buckets: Box<[TtlBucket]>,
}

impl TtlBuckets {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(N_TTL_BUCKET);
        for range in 0..4u32 {
            let granularity = 1u32 << GRANULARITY_BITS[range as usize];
            for j in 0..N_BUCKET_PER_RANGE {
                buckets.push(TtlBucket::new(granularity * j + 1));
            }
        }
        Self {
            buckets: buckets.into_boxed_slice(),
        }
    }

    pub fn bucket(&self, idx: usize) -> &TtlBucket {
        &self.buckets[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &TtlBucket> {
        self.buckets.iter()
    }

    /// Link a freshly initialized segment as the new tail of a bucket.
    /// Caller holds the heap mutex.
    pub fn link_tail_locked(
        &self,
        heap: &SegHeap,
        _lists: &mut HeapLists,
        bucket_idx: usize,
        seg_id: i32,
    ) {
        let bucket = &self.buckets[bucket_idx];
        let header = heap.header(seg_id);
        let last = bucket.last.load(Ordering::Relaxed);

        if bucket.first.load(Ordering::Relaxed) == NO_SEG {
            debug_assert_eq!(last, NO_SEG);
            bucket.first.store(seg_id, Ordering::Release);
        } else {
            heap.header(last).next.store(seg_id, Ordering::Relaxed);
        }
        header.prev.store(last, Ordering::Relaxed);
        debug_assert_eq!(header.next.load(Ordering::Relaxed), NO_SEG);
        bucket.last.store(seg_id, Ordering::Release);
        bucket.n_seg.fetch_add(1, Ordering::Relaxed);

        let was_evictable = header.set_evictable(true);
        debug_assert!(!was_evictable);
    }

    /// Unlink a segment from its bucket's list. Caller holds the heap mutex.
    pub fn unlink_locked(
        &self,
        heap: &SegHeap,
        _lists: &mut HeapLists,
        bucket_idx: usize,
        seg_id: i32,
    ) {
        let bucket = &self.buckets[bucket_idx];
        let header = heap.header(seg_id);
        let prev = header.prev.load(Ordering::Relaxed);
        let next = header.next.load(Ordering::Relaxed);

        if prev == NO_SEG {
            debug_assert_eq!(bucket.first.load(Ordering::Relaxed), seg_id);
            bucket.first.store(next, Ordering::Release);
        } else {
            heap.header(prev).next.store(next, Ordering::Relaxed);
        }
        if next == NO_SEG {
            debug_assert_eq!(bucket.last.load(Ordering::Relaxed), seg_id);
            bucket.last.store(prev, Ordering::Release);
        } else {
            heap.header(next).prev.store(prev, Ordering::Relaxed);
        }
        header.prev.store(NO_SEG, Ordering::Relaxed);
        header.next.store(NO_SEG, Ordering::Relaxed);
        bucket.n_seg.fetch_sub(1, Ordering::Relaxed);

        // The compactor's cursor may point at the departing segment.
        let _ = bucket.next_seg_to_merge.compare_exchange(
            seg_id,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Put `new_id` in `old_id`'s position in the list. Caller holds the
    /// heap mutex; used by the merge compactor so the destination inherits
    /// the run's place in expiration order.
    pub fn replace_locked(
        &self,
        heap: &SegHeap,
        _lists: &mut HeapLists,
        bucket_idx: usize,
        new_id: i32,
        old_id: i32,
    ) {
        let bucket = &self.buckets[bucket_idx];
        let old = heap.header(old_id);
        let new = heap.header(new_id);
        let prev = old.prev.load(Ordering::Relaxed);
        let next = old.next.load(Ordering::Relaxed);

        if prev == NO_SEG {
            debug_assert_eq!(bucket.first.load(Ordering::Relaxed), old_id);
            bucket.first.store(new_id, Ordering::Release);
        } else {
            heap.header(prev).next.store(new_id, Ordering::Relaxed);
        }
        if next == NO_SEG {
            bucket.last.store(new_id, Ordering::Release);
        } else {
            heap.header(next).prev.store(new_id, Ordering::Relaxed);
        }
        new.prev.store(prev, Ordering::Relaxed);
        new.next.store(next, Ordering::Relaxed);
        old.prev.store(NO_SEG, Ordering::Relaxed);
        old.next.store(NO_SEG, Ordering::Relaxed);
    }
}

impl Default for TtlBuckets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapool::Datapool;

    #[test]
    fn test_mapping_first_range() {
        assert_eq!(ttl_bucket_index(1), 0);
        assert_eq!(ttl_bucket_index(7), 0);
        assert_eq!(ttl_bucket_index(8), 1);
        assert_eq!(ttl_bucket_index(45), 5);
        assert_eq!(ttl_bucket_index(2047), 255);
    }

    #[test]
    fn test_mapping_upper_ranges() {
        assert_eq!(ttl_bucket_index(2048), 256 + 16);
        assert_eq!(ttl_bucket_index(30000), 256 + 234);
        assert_eq!(ttl_bucket_index(32767), 511);
        assert_eq!(ttl_bucket_index(32768), 512 + 16);
        assert_eq!(ttl_bucket_index(524_287), 767);
        assert_eq!(ttl_bucket_index(524_288), 768 + 16);
        assert_eq!(ttl_bucket_index(8_388_607), 1023);
    }

    #[test]
    fn test_zero_and_overflow_map_to_last_bucket() {
        assert_eq!(ttl_bucket_index(0), 1023);
        assert_eq!(ttl_bucket_index(u32::MAX), 1023);
    }

    #[test]
    fn test_bucket_ttl_maps_back_to_its_bucket() {
        let buckets = TtlBuckets::new();
        for idx in [0usize, 1, 5, 255, 300, 511, 600, 1023] {
            let ttl = buckets.bucket(idx).ttl();
            // Buckets below the range floor are unreachable by mapping; every
            // reachable bucket's stored TTL must map back to itself.
            let mapped = ttl_bucket_index(ttl);
            if idx % 256 >= 16 || idx < 256 {
                assert_eq!(mapped, idx, "bucket {idx} ttl {ttl}");
            }
        }
    }

    #[test]
    fn test_link_unlink_roundtrip() {
        let seg_size = 4096usize;
        let pool = Datapool::open(None, "ttl_test", seg_size * 4, false).unwrap();
        let heap = SegHeap::new(pool.payload_ptr(), seg_size, 4, 0);
        let buckets = TtlBuckets::new();

        for i in 0..3 {
            let id = heap.allocate().unwrap();
            heap.init_segment(id, 0);
            let mut lists = heap.lists.lock();
            buckets.link_tail_locked(&heap, &mut lists, 7, i);
        }
        let bucket = buckets.bucket(7);
        assert_eq!(bucket.first(), 0);
        assert_eq!(bucket.last(), 2);
        assert_eq!(bucket.n_seg(), 3);

        {
            let mut lists = heap.lists.lock();
            buckets.unlink_locked(&heap, &mut lists, 7, 1);
        }
        assert_eq!(heap.header(0).next.load(Ordering::Relaxed), 2);
        assert_eq!(heap.header(2).prev.load(Ordering::Relaxed), 0);
        assert_eq!(bucket.n_seg(), 2);

        {
            let mut lists = heap.lists.lock();
            buckets.unlink_locked(&heap, &mut lists, 7, 0);
            buckets.unlink_locked(&heap, &mut lists, 7, 2);
        }
        assert_eq!(bucket.first(), NO_SEG);
        assert_eq!(bucket.last(), NO_SEG);
        assert_eq!(bucket.n_seg(), 0);
    }

    #[test]
    fn test_replace_keeps_position() {
        let seg_size = 4096usize;
        let pool = Datapool::open(None, "ttl_test", seg_size * 4, false).unwrap();
        let heap = SegHeap::new(pool.payload_ptr(), seg_size, 4, 0);
        let buckets = TtlBuckets::new();

        for i in 0..3 {
            let id = heap.allocate().unwrap();
            heap.init_segment(id, 0);
            let mut lists = heap.lists.lock();
            buckets.link_tail_locked(&heap, &mut lists, 0, i);
        }
        let id = heap.allocate().unwrap();
        heap.init_segment(id, 0);

        {
            let mut lists = heap.lists.lock();
            buckets.replace_locked(&heap, &mut lists, 0, 3, 1);
        }
        assert_eq!(heap.header(0).next.load(Ordering::Relaxed), 3);
        assert_eq!(heap.header(3).prev.load(Ordering::Relaxed), 0);
        assert_eq!(heap.header(3).next.load(Ordering::Relaxed), 2);
        assert_eq!(heap.header(2).prev.load(Ordering::Relaxed), 3);
    }
}
