//! Bulk-chained concurrent hash index
//!
//! The table is an array of cache-line-sized buckets, each holding eight
//! 64-bit slots. Slot 0 of a head bucket is bucket metadata:
//!
//! ```text
//! bits 56..64  spin lock byte
//! bits 48..56  chain length - 1
//! bits 32..48  last frequency-aging timestamp (seconds, truncated)
//! bits  0..32  CAS generation counter
//! ```
//!
//! The remaining slots are packed item locators:
//!
//! ```text
//! bits 52..64  tag (top 12 bits of the hash, bit 52 forced on)
//! bits 44..52  frequency byte (bit 51 = bumped-this-second)
//! bits 20..44  segment id
//! bits  0..20  offset in 8-byte units
//! ```
//!
//! A zero slot is empty. When a chain fills up, the last slot of the last
//! link is repurposed as a pointer to an overflow bucket; the chain length in
//! the head bucket says how to interpret it. Overflow buckets are owned by an
//! append-only registry and freed at teardown.
//!
//! All mutations take the per-bucket spin lock and bump the CAS counter on
//! the way out. Slot stores that publish items are releases, paired with the
//! acquire loads in lookups.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::item::FLAG_TOMBSTONE;
use crate::metrics::Metrics;
use crate::seg::SegHeap;
use crate::time::TimeSource;

const N_SLOT_PER_BUCKET: usize = 8;

const TAG_MASK: u64 = 0xfff0_0000_0000_0000;
const FREQ_MASK: u64 = 0x000f_f000_0000_0000;
const SEG_ID_MASK: u64 = 0x0000_0fff_ff00_0000;
const OFFSET_MASK: u64 = 0x0000_0000_000f_ffff;

const FREQ_BIT_SHIFT: u64 = 44;
const SEG_ID_BIT_SHIFT: u64 = 20;
/// Offsets are stored in 8-byte units.
const OFFSET_UNIT_BITS: u64 = 3;

/// Tags start from bit 52 so a live locator can never be all zero.
const TAG_FLOOR: u64 = 0x0010_0000_0000_0000;

/// Set while the frequency byte has been considered this second.
const FREQ_BUMPED_MASK: u64 = 0x0008_0000_0000_0000;
const CLEAR_BUMPED_MASK: u64 = !FREQ_BUMPED_MASK;

const LOCK_MASK: u64 = 0xff00_0000_0000_0000;
const LOCKED: u64 = 0x0100_0000_0000_0000;
const CHAIN_LEN_MASK: u64 = 0x00ff_0000_0000_0000;
const CHAIN_LEN_SHIFT: u64 = 48;
const CHAIN_LEN_ONE: u64 = 1 << CHAIN_LEN_SHIFT;
const TS_MASK: u64 = 0x0000_ffff_0000_0000;
const TS_SHIFT: u64 = 32;
const CAS_MASK: u64 = 0x0000_0000_ffff_ffff;

#[repr(align(64))]
struct HashBucket([AtomicU64; N_SLOT_PER_BUCKET]);

impl HashBucket {
    fn new() -> Self {
        Self(std::array::from_fn(|_| AtomicU64::new(0)))
    }
}

/// A successful lookup: where the item lives plus the bucket's CAS
/// generation at lookup time. The caller holds a reader pin on the segment.
#[derive(Debug, Clone, Copy)]
pub struct LookupHit {
    pub seg_id: i32,
    pub offset: u32,
    pub cas: u32,
}

/// Result of the lock-free frequency probe used by the merge compactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFreq {
    /// No entry for this key at all.
    Missing,
    /// The key exists but points at a newer version.
    Stale,
    /// The probed locator is current; payload is the saturating counter.
    Live(u8),
}

pub struct HashTable {
    bucket_mask: u64,
    table: Box<[HashBucket]>,
    /// Owns every overflow bucket ever allocated; slots carry raw pointers
    /// into these boxes for lock-free traversal.
    overflow: Mutex<Vec<Box<HashBucket>>>,
}

#[inline]
fn build_info(tag: u64, seg_id: i32, offset: u32) -> u64 {
    debug_assert_eq!(offset % 8, 0);
    tag | ((seg_id as u64) << SEG_ID_BIT_SHIFT) | (u64::from(offset) >> OFFSET_UNIT_BITS)
}

#[inline]
fn info_tag(info: u64) -> u64 {
    info & TAG_MASK
}

#[inline]
fn info_seg_id(info: u64) -> i32 {
    ((info & SEG_ID_MASK) >> SEG_ID_BIT_SHIFT) as i32
}

#[inline]
fn info_offset(info: u64) -> u32 {
    ((info & OFFSET_MASK) << OFFSET_UNIT_BITS) as u32
}

#[inline]
fn clear_freq(info: u64) -> u64 {
    info & !FREQ_MASK
}

#[inline]
fn tag_from_hash(hv: u64) -> u64 {
    (hv & TAG_MASK) | TAG_FLOOR
}

#[inline]
fn chain_len(head_info: u64) -> u64 {
    ((head_info & CHAIN_LEN_MASK) >> CHAIN_LEN_SHIFT) + 1
}

impl HashTable {
    /// `hash_power` is the log2 of the bucket count.
    pub fn new(hash_power: u32) -> Self {
        let n_bucket = 1usize << hash_power;
        let table = (0..n_bucket).map(|_| HashBucket::new()).collect::<Vec<_>>();
        debug!(
            "hash table: {} buckets, {} item slots",
            n_bucket,
            n_bucket * (N_SLOT_PER_BUCKET - 1)
        );
        Self {
            bucket_mask: (n_bucket - 1) as u64,
            table: table.into_boxed_slice(),
            overflow: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    fn locate(&self, hv: u64) -> &HashBucket {
        &self.table[(hv & self.bucket_mask) as usize]
    }

    #[inline]
    fn info_slot<'a>(head: &'a HashBucket) -> &'a AtomicU64 {
        &head.0[0]
    }

    fn lock(info: &AtomicU64) {
        while info.fetch_or(LOCKED, Ordering::Acquire) & LOCK_MASK != 0 {
            std::hint::spin_loop();
        }
    }

    fn unlock(info: &AtomicU64) {
        info.fetch_and(!LOCK_MASK, Ordering::Release);
    }

    /// Unlock and advance the CAS generation. Only the lock holder mutates
    /// the non-lock bits, so a plain store is safe against the spinners'
    /// read-modify-writes.
    fn unlock_bump_cas(info: &AtomicU64) {
        let cur = info.load(Ordering::Relaxed);
        let cas = ((cur & CAS_MASK) as u32).wrapping_add(1);
        let new = (cur & !(CAS_MASK | LOCK_MASK)) | u64::from(cas);
        info.store(new, Ordering::Release);
    }

    #[inline]
    unsafe fn follow(ptr_val: u64) -> &'static HashBucket {
        unsafe { &*(ptr_val as usize as *const HashBucket) }
    }

    /// Bytewise key comparison against the item a locator points to.
    fn same_key(&self, heap: &SegHeap, key: &[u8], info: u64) -> bool {
        let seg_id = info_seg_id(info);
        let offset = info_offset(info);
        let header = heap.item_header(seg_id, offset);
        usize::from(header.klen) == key.len() && heap.item_key(seg_id, offset, &header) == key
    }

    /// Drop a locator's claim on its item: decrement the owning segment's
    /// live counters and optionally mark the payload tombstone.
    fn unlink_entry(&self, heap: &SegHeap, info: u64, tombstone: bool) {
        let seg_id = info_seg_id(info);
        let offset = info_offset(info);
        let header = heap.item_header(seg_id, offset);
        let size = header.total_size() as i32;
        heap.header(seg_id).live_bytes.fetch_sub(size, Ordering::Relaxed);
        heap.header(seg_id).live_items.fetch_sub(1, Ordering::Relaxed);
        if tombstone {
            heap.item_flags(seg_id, offset)
                .fetch_or(FLAG_TOMBSTONE, Ordering::Release);
        }
    }

    /// Insert a published item, replacing any previous version of the key.
    ///
    /// The walk stops as soon as the new locator is placed and the previous
    /// version (if any) was handled; stale duplicates deeper in the chain
    /// are cleaned up by eviction.
    pub fn insert(&self, heap: &SegHeap, metrics: &Metrics, key: &[u8], seg_id: i32, offset: u32) {
        let hv = xxh3_64(key);
        let tag = tag_from_hash(hv);
        let head = self.locate(hv);
        let info_slot = Self::info_slot(head);
        let mut pending = build_info(tag, seg_id, offset);

        metrics.hash_insert.incr();
        Self::lock(info_slot);

        let mut remaining = chain_len(info_slot.load(Ordering::Relaxed));
        let mut link = head;
        let mut is_head = true;
        'walk: loop {
            let end = if remaining > 1 {
                N_SLOT_PER_BUCKET - 1
            } else {
                N_SLOT_PER_BUCKET
            };
            for i in usize::from(is_head)..end {
                let slot = &link.0[i];
                let info = slot.load(Ordering::Relaxed);
                if info_tag(info) != tag {
                    if pending != 0 && info == 0 {
                        slot.store(pending, Ordering::Release);
                        pending = 0;
                    }
                    continue;
                }
                if !self.same_key(heap, key, info) {
                    metrics.hash_tag_collision.incr();
                    continue;
                }
                // Found the previous version: either replace it in place or,
                // if the new locator was already placed, clear it.
                slot.store(pending, Ordering::Release);
                pending = 0;
                self.unlink_entry(heap, info, true);
                break 'walk;
            }
            if pending == 0 {
                break;
            }
            remaining -= 1;
            if remaining == 0 {
                // Chain exhausted: hang a new overflow bucket off the last
                // slot, moving the displaced locator into it.
                let new_link = Box::new(HashBucket::new());
                new_link.0[0].store(link.0[N_SLOT_PER_BUCKET - 1].load(Ordering::Relaxed), Ordering::Relaxed);
                new_link.0[1].store(pending, Ordering::Relaxed);
                pending = 0;
                let ptr = std::ptr::from_ref::<HashBucket>(new_link.as_ref()) as u64;
                self.overflow.lock().push(new_link);
                link.0[N_SLOT_PER_BUCKET - 1].store(ptr, Ordering::Release);
                info_slot.fetch_add(CHAIN_LEN_ONE, Ordering::Relaxed);
                metrics.hash_overflow_alloc.incr();
                debug!("hash chain grew to {} links", chain_len(info_slot.load(Ordering::Relaxed)));
                break;
            }
            link = unsafe { Self::follow(link.0[N_SLOT_PER_BUCKET - 1].load(Ordering::Acquire)) };
            is_head = false;
        }

        debug_assert_eq!(pending, 0);
        Self::unlock_bump_cas(info_slot);
    }

    /// Remove every entry for a key, tombstoning the pointed-to items.
    pub fn delete(&self, heap: &SegHeap, metrics: &Metrics, key: &[u8]) -> bool {
        let hv = xxh3_64(key);
        let tag = tag_from_hash(hv);
        let head = self.locate(hv);
        let info_slot = Self::info_slot(head);
        let mut deleted = false;

        metrics.hash_remove.incr();
        Self::lock(info_slot);

        self.walk_locked(head, |slot| {
            let info = slot.load(Ordering::Relaxed);
            if info_tag(info) != tag {
                return false;
            }
            if !self.same_key(heap, key, info) {
                metrics.hash_tag_collision.incr();
                return false;
            }
            self.unlink_entry(heap, info, true);
            slot.store(0, Ordering::Release);
            deleted = true;
            false
        });

        Self::unlock_bump_cas(info_slot);
        deleted
    }

    /// Remove all entries for the key of the item at `(seg_id, offset)`.
    ///
    /// The first (most recent) entry decides whether the evictee is current:
    /// only then is its payload tombstoned, preserving the rule that a
    /// tombstone always marks the latest version. A newer version than the
    /// evictee is left alone. Returns whether the exact locator was found.
    pub fn evict(&self, heap: &SegHeap, metrics: &Metrics, key: &[u8], seg_id: i32, offset: u32) -> bool {
        let hv = xxh3_64(key);
        let tag = tag_from_hash(hv);
        let head = self.locate(hv);
        let info_slot = Self::info_slot(head);
        let target = build_info(tag, seg_id, offset);
        let mut first_match = true;
        let mut found = false;

        metrics.hash_evict.incr();
        Self::lock(info_slot);

        self.walk_locked(head, |slot| {
            let info = slot.load(Ordering::Relaxed);
            if info_tag(info) != tag {
                return false;
            }
            if !self.same_key(heap, key, info) {
                metrics.hash_tag_collision.incr();
                return false;
            }
            if first_match {
                first_match = false;
                if clear_freq(info) == target {
                    self.unlink_entry(heap, info, true);
                    slot.store(0, Ordering::Release);
                    found = true;
                }
                // Otherwise a newer version exists; keep it.
            } else {
                if clear_freq(info) == target {
                    found = true;
                }
                self.unlink_entry(heap, info, false);
                slot.store(0, Ordering::Release);
            }
            false
        });

        Self::unlock_bump_cas(info_slot);
        found
    }

    /// Swap the locator of a merged item from its source to its destination
    /// position. Declines when the entry changed since the compactor read
    /// it (a racing update or delete); stale older entries are cleared
    /// without tombstoning since they were never the latest version.
    pub fn relink(
        &self,
        heap: &SegHeap,
        metrics: &Metrics,
        key: &[u8],
        old_seg: i32,
        old_offset: u32,
        new_seg: i32,
        new_offset: u32,
    ) -> bool {
        let hv = xxh3_64(key);
        let tag = tag_from_hash(hv);
        let head = self.locate(hv);
        let info_slot = Self::info_slot(head);
        let old_info = build_info(tag, old_seg, old_offset);
        let new_info = build_info(tag, new_seg, new_offset);
        let mut first_match = true;
        let mut relinked = false;

        metrics.hash_relink.incr();
        Self::lock(info_slot);

        self.walk_locked(head, |slot| {
            let info = slot.load(Ordering::Relaxed);
            if info_tag(info) != tag {
                return false;
            }
            if !self.same_key(heap, key, info) {
                metrics.hash_tag_collision.incr();
                return false;
            }
            if first_match {
                first_match = false;
                if clear_freq(info) == old_info {
                    slot.store(new_info, Ordering::Release);
                    self.unlink_entry(heap, old_info, false);
                    relinked = true;
                }
            } else {
                self.unlink_entry(heap, info, false);
                slot.store(0, Ordering::Release);
            }
            false
        });

        Self::unlock_bump_cas(info_slot);
        relinked
    }

    /// Look a key up and pin the owning segment for reading.
    ///
    /// With `incr_freq`, the slot's frequency byte is bumped at most once per
    /// second: always while the counter is small, with probability 1/count
    /// beyond 16, saturating at 127.
    pub fn get(
        &self,
        heap: &SegHeap,
        time: &TimeSource,
        metrics: &Metrics,
        key: &[u8],
        incr_freq: bool,
    ) -> Option<LookupHit> {
        let hv = xxh3_64(key);
        let tag = tag_from_hash(hv);
        let head = self.locate(hv);
        let info_slot = Self::info_slot(head);

        metrics.hash_lookup.incr();

        if incr_freq {
            self.age_bucket(head, time);
        }

        Self::lock(info_slot);

        let mut hit = None;
        self.walk_locked(head, |slot| {
            let info = slot.load(Ordering::Acquire);
            if info_tag(info) != tag {
                return false;
            }
            if !self.same_key(heap, key, info) {
                metrics.hash_tag_collision.incr();
                return false;
            }

            let cas = (info_slot.load(Ordering::Relaxed) & CAS_MASK) as u32;
            let seg_id = info_seg_id(info);
            let header = heap.header(seg_id);
            if !header.pin_reader() {
                // The segment is being reclaimed; report a clean miss.
                return true;
            }
            if slot.load(Ordering::Acquire) != info {
                header.unpin_reader();
                return true;
            }

            if incr_freq {
                let freq = (info & FREQ_MASK) >> FREQ_BIT_SHIFT;
                if freq < 127 {
                    let bumped = if freq <= 16 || rand::random::<u64>() % freq == 0 {
                        freq + 1
                    } else {
                        freq
                    };
                    let new_freq = (bumped << FREQ_BIT_SHIFT) | FREQ_BUMPED_MASK;
                    let new_info = (info & !FREQ_MASK) | new_freq;
                    let _ = slot.compare_exchange(
                        info,
                        new_info,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
            }

            hit = Some(LookupHit {
                seg_id,
                offset: info_offset(info),
                cas,
            });
            true
        });

        Self::unlock(info_slot);
        if hit.is_some() {
            metrics.hash_hit.incr();
        }
        hit
    }

    /// Once per second, clear every slot's bumped bit so frequencies can
    /// move again. Counter values are preserved.
    fn age_bucket(&self, head: &HashBucket, time: &TimeSource) {
        let info_slot = Self::info_slot(head);
        let now = u64::from(time.proc_sec()) & 0xffff;
        if (info_slot.load(Ordering::Relaxed) & TS_MASK) >> TS_SHIFT == now {
            return;
        }
        Self::lock(info_slot);
        let cur = info_slot.load(Ordering::Relaxed);
        if (cur & TS_MASK) >> TS_SHIFT != now {
            info_slot.store((cur & !TS_MASK) | (now << TS_SHIFT), Ordering::Relaxed);
            self.walk_locked(head, |slot| {
                slot.fetch_and(CLEAR_BUMPED_MASK, Ordering::Relaxed);
                false
            });
        }
        Self::unlock(info_slot);
    }

    /// The merge compactor's lock-free probe: current frequency of an exact
    /// locator, or whether it has been superseded.
    pub fn item_freq(&self, heap: &SegHeap, key: &[u8], seg_id: i32, offset: u32) -> ItemFreq {
        let hv = xxh3_64(key);
        let tag = tag_from_hash(hv);
        let head = self.locate(hv);
        let target = build_info(tag, seg_id, offset);
        let mut result = ItemFreq::Missing;

        self.walk_locked(head, |slot| {
            let info = slot.load(Ordering::Acquire);
            if info_tag(info) != tag {
                return false;
            }
            if clear_freq(info) == target {
                let freq = ((info & FREQ_MASK) >> FREQ_BIT_SHIFT) as u8 & 0x7f;
                result = ItemFreq::Live(freq);
                return true;
            }
            if self.same_key(heap, key, info) {
                result = ItemFreq::Stale;
                return true;
            }
            false
        });

        result
    }

    /// Occupied item slots and total bucket links, overflow included.
    pub fn stats(&self) -> (usize, usize) {
        let mut items = 0;
        let mut links = 0;
        for head in &self.table {
            links += chain_len(Self::info_slot(head).load(Ordering::Relaxed)) as usize;
            self.walk_locked(head, |slot| {
                if slot.load(Ordering::Relaxed) != 0 {
                    items += 1;
                }
                false
            });
        }
        (items, links)
    }

    /// Visit every item slot of a chain in walk order. The callback returns
    /// `true` to stop early. Named for its primary use under the bucket
    /// lock; lock-free callers tolerate racing slot updates.
    fn walk_locked(&self, head: &HashBucket, mut visit: impl FnMut(&AtomicU64) -> bool) {
        let mut remaining = chain_len(Self::info_slot(head).load(Ordering::Relaxed));
        let mut link = head;
        let mut is_head = true;
        loop {
            let end = if remaining > 1 {
                N_SLOT_PER_BUCKET - 1
            } else {
                N_SLOT_PER_BUCKET
            };
            for i in usize::from(is_head)..end {
                if visit(&link.0[i]) {
                    return;
                }
            }
            remaining -= 1;
            if remaining == 0 {
                return;
            }
            link = unsafe { Self::follow(link.0[N_SLOT_PER_BUCKET - 1].load(Ordering::Acquire)) };
            is_head = false;
        }
    }
}
