//! Segment metadata
//!
//! Headers live in a DRAM-side array parallel to the payload region, so the
//! hot bookkeeping (write offset, ref-counts, flags) never touches the
//! backing medium. All fields that concurrent requests touch are atomics;
//! list membership (prev/next) is additionally serialized by the heap mutex.

use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};

use crate::types::NO_SEG;

const FLAG_SEALED: u8 = 0x01;
const FLAG_ACCESSIBLE: u8 = 0x02;
const FLAG_EVICTABLE: u8 = 0x04;
const FLAG_IN_FREE_POOL: u8 = 0x08;
const FLAG_INITIALIZED: u8 = 0x10;

#[derive(Debug)]
pub struct SegmentHeader {
    id: i32,

    /// Neighbors in the owning TTL list or the free pool. Guarded by the
    /// heap mutex.
    pub(crate) prev: AtomicI32,
    pub(crate) next: AtomicI32,

    create_at: AtomicU32,
    merge_at: AtomicU32,
    ttl: AtomicU32,

    /// Next free byte. Monotonic while the segment is writable; may overshoot
    /// the segment size transiently, readers clamp.
    pub(crate) write_offset: AtomicU32,
    /// Live payload bytes, headers included. Decreases with deletions.
    pub(crate) live_bytes: AtomicI32,
    pub(crate) live_items: AtomicI32,

    /// Hits observed in the current and previous ranking windows.
    pub(crate) n_hit: AtomicU32,
    pub(crate) n_hit_last: AtomicU32,

    readers: AtomicU32,
    writers: AtomicU32,
    locked: AtomicU8,
    flags: AtomicU8,
}

impl SegmentHeader {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            prev: AtomicI32::new(NO_SEG),
            next: AtomicI32::new(NO_SEG),
            create_at: AtomicU32::new(0),
            merge_at: AtomicU32::new(0),
            ttl: AtomicU32::new(0),
            write_offset: AtomicU32::new(0),
            live_bytes: AtomicI32::new(0),
            live_items: AtomicI32::new(0),
            n_hit: AtomicU32::new(0),
            n_hit_last: AtomicU32::new(0),
            readers: AtomicU32::new(0),
            writers: AtomicU32::new(0),
            locked: AtomicU8::new(0),
            flags: AtomicU8::new(0),
        }
    }

    /// Reset to a writable, empty state. The caller has wiped the payload.
    pub fn reset(&self, now: u32) {
        self.prev.store(NO_SEG, Ordering::Relaxed);
        self.next.store(NO_SEG, Ordering::Relaxed);
        self.create_at.store(now, Ordering::Relaxed);
        self.merge_at.store(0, Ordering::Relaxed);
        self.ttl.store(0, Ordering::Relaxed);
        self.write_offset.store(0, Ordering::Relaxed);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.live_items.store(0, Ordering::Relaxed);
        self.n_hit.store(0, Ordering::Relaxed);
        self.n_hit_last.store(0, Ordering::Relaxed);
        self.readers.store(0, Ordering::Relaxed);
        self.writers.store(0, Ordering::Relaxed);
        self.locked.store(0, Ordering::Relaxed);
        self.flags
            .store(FLAG_ACCESSIBLE | FLAG_INITIALIZED, Ordering::Release);
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn create_at(&self) -> u32 {
        self.create_at.load(Ordering::Relaxed)
    }

    pub fn set_create_at(&self, at: u32) {
        self.create_at.store(at, Ordering::Relaxed);
    }

    pub fn merge_at(&self) -> u32 {
        self.merge_at.load(Ordering::Relaxed)
    }

    pub fn set_merge_at(&self, at: u32) {
        self.merge_at.store(at, Ordering::Relaxed);
    }

    pub fn ttl(&self) -> u32 {
        self.ttl.load(Ordering::Relaxed)
    }

    pub fn set_ttl(&self, ttl: u32) {
        self.ttl.store(ttl, Ordering::Relaxed);
    }

    /// Write frontier clamped to the segment size; the raw offset can
    /// overshoot when a reservation loses the fit race.
    pub fn frontier(&self, seg_size: usize) -> usize {
        (self.write_offset.load(Ordering::Acquire) as usize).min(seg_size)
    }

    pub fn live_bytes(&self) -> i32 {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn live_items(&self) -> i32 {
        self.live_items.load(Ordering::Relaxed)
    }

    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Relaxed)
    }

    pub fn writers(&self) -> u32 {
        self.writers.load(Ordering::Relaxed)
    }

    fn flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn is_accessible(&self) -> bool {
        self.flag(FLAG_ACCESSIBLE)
    }

    /// Returns the previous accessibility.
    pub fn set_accessible(&self, on: bool) -> bool {
        let prev = if on {
            self.flags.fetch_or(FLAG_ACCESSIBLE, Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!FLAG_ACCESSIBLE, Ordering::AcqRel)
        };
        prev & FLAG_ACCESSIBLE != 0
    }

    pub fn is_sealed(&self) -> bool {
        self.flag(FLAG_SEALED)
    }

    pub fn seal(&self) {
        self.flags.fetch_or(FLAG_SEALED, Ordering::AcqRel);
    }

    pub fn is_evictable(&self) -> bool {
        self.flag(FLAG_EVICTABLE)
    }

    /// Returns the previous evictability; reclaimers use the exchange to
    /// claim a segment exactly once.
    pub fn set_evictable(&self, on: bool) -> bool {
        let prev = if on {
            self.flags.fetch_or(FLAG_EVICTABLE, Ordering::AcqRel)
        } else {
            self.flags.fetch_and(!FLAG_EVICTABLE, Ordering::AcqRel)
        };
        prev & FLAG_EVICTABLE != 0
    }

    pub fn in_free_pool(&self) -> bool {
        self.flag(FLAG_IN_FREE_POOL)
    }

    pub fn set_in_free_pool(&self, on: bool) {
        if on {
            self.flags.fetch_or(FLAG_IN_FREE_POOL, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!FLAG_IN_FREE_POOL, Ordering::AcqRel);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.flag(FLAG_INITIALIZED)
    }

    /// Whether the segment's end of life has passed.
    pub fn is_expired(&self, now: u32, flush_at: i64) -> bool {
        let create_at = self.create_at();
        u64::from(create_at) + u64::from(self.ttl()) < u64::from(now)
            || i64::from(create_at) < flush_at
    }

    /// Claim exclusive reclamation rights. Only the first caller wins.
    pub fn lock(&self) -> bool {
        self.locked.swap(1, Ordering::AcqRel) == 0
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire) != 0
    }

    /// Spin until every outstanding pin is gone. Only legal after a
    /// successful `lock` with accessibility cleared, so both counts can only
    /// fall.
    pub fn wait_refcnt(&self) {
        debug_assert!(self.is_locked());
        while self.writers.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
        while self.readers.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }

    /// Take a read pin. Fails when the segment is being reclaimed; the
    /// increment is undone so the reclaimer's drain cannot miss us.
    pub fn pin_reader(&self) -> bool {
        self.readers.fetch_add(1, Ordering::AcqRel);
        if self.is_accessible() {
            true
        } else {
            self.readers.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    pub fn unpin_reader(&self) {
        let prev = self.readers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Take a write pin, same shape as `pin_reader`.
    pub fn pin_writer(&self) -> bool {
        self.writers.fetch_add(1, Ordering::AcqRel);
        if self.is_accessible() {
            true
        } else {
            self.writers.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    pub fn unpin_writer(&self) {
        let prev = self.writers.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    /// Whether the merge compactor may consume this segment right now.
    pub fn merge_eligible(&self, now: u32, mature_seconds: u32) -> bool {
        self.is_evictable()
            && self.is_accessible()
            && self.is_sealed()
            && !self.in_free_pool()
            && self.writers() == 0
            && now.saturating_sub(self.create_at()) >= mature_seconds
    }

    /// One-line summary for lifecycle logging.
    pub fn describe(&self) -> String {
        format!(
            "seg {} create_at {} ttl {} offset {} live {}B/{} items \
             readers {} writers {} flags [{}{}{}{}{}]",
            self.id,
            self.create_at(),
            self.ttl(),
            self.write_offset.load(Ordering::Relaxed),
            self.live_bytes(),
            self.live_items(),
            self.readers(),
            self.writers(),
            if self.is_sealed() { 's' } else { '-' },
            if self.is_accessible() { 'a' } else { '-' },
            if self.is_evictable() { 'e' } else { '-' },
            if self.in_free_pool() { 'f' } else { '-' },
            if self.is_initialized() { 'i' } else { '-' },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_makes_accessible() {
        let header = SegmentHeader::new(3);
        assert!(!header.is_accessible());
        header.reset(17);
        assert!(header.is_accessible());
        assert!(header.is_initialized());
        assert_eq!(header.create_at(), 17);
        assert_eq!(header.prev.load(Ordering::Relaxed), NO_SEG);
    }

    #[test]
    fn test_lock_single_winner() {
        let header = SegmentHeader::new(0);
        header.reset(0);
        assert!(header.lock());
        assert!(!header.lock());
    }

    #[test]
    fn test_pin_fails_when_inaccessible() {
        let header = SegmentHeader::new(0);
        header.reset(0);
        assert!(header.pin_reader());
        header.unpin_reader();

        header.set_accessible(false);
        assert!(!header.pin_reader());
        assert!(!header.pin_writer());
        assert_eq!(header.readers(), 0);
        assert_eq!(header.writers(), 0);
    }

    #[test]
    fn test_expiry_includes_flush_instant() {
        let header = SegmentHeader::new(0);
        header.reset(10);
        header.set_ttl(5);
        assert!(!header.is_expired(15, -1));
        assert!(header.is_expired(16, -1));
        assert!(header.is_expired(10, 11));
    }

    #[test]
    fn test_merge_eligibility_requires_age() {
        let header = SegmentHeader::new(0);
        header.reset(100);
        header.seal();
        header.set_evictable(true);
        assert!(!header.merge_eligible(110, 20));
        assert!(header.merge_eligible(120, 20));
    }
}
