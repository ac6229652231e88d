//! The cache engine
//!
//! `SegCache` wires the datapool, segment heap, TTL bucket table, hash index,
//! eviction ranker and background worker together and exposes the item API:
//! reserve/backfill/insert, get, delete, incr/decr, flush.
//!
//! Writes reserve space in the TTL bucket's active segment, copy their
//! payload, then publish through the hash index. Reads resolve the key to a
//! (segment, offset) locator, pin the segment, and hand out a guard whose
//! drop releases the pin. Reclamation (expiration, eviction, merge) always
//! follows the same shape: lock the segment, unlink it, remove its hash
//! entries, drain pins, recycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::background;
use crate::config::{EvictionPolicy, SegConfig};
use crate::datapool::Datapool;
use crate::error::{Result, SegError};
use crate::evict::EvictState;
use crate::hashtable::HashTable;
use crate::item::{self, FLAG_NUMERIC, FLAG_TOMBSTONE, ItemHeader, ItemScan};
use crate::merge::MergeState;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::seg::SegHeap;
use crate::time::TimeSource;
use crate::ttl::{N_TTL_BUCKET, TtlBuckets, ttl_bucket_index};
use crate::types::{ItemLocation, NO_SEG, SegStats};

/// Retries for a reservation that keeps losing the segment race.
const RESERVE_RETRIES: usize = 16;
/// Victims tried before an eviction-backed reservation gives up.
const EVICT_RETRIES: usize = 8;

pub(crate) struct Shared {
    pub(crate) config: SegConfig,
    pub(crate) time: TimeSource,
    /// Keeps the mapping alive; the heap's base pointer aliases it.
    _pool: Datapool,
    pub(crate) heap: SegHeap,
    pub(crate) index: HashTable,
    pub(crate) ttl: TtlBuckets,
    pub(crate) evict: EvictState,
    pub(crate) merge: MergeState,
    pub(crate) metrics: Metrics,
    /// Process time of the last `flush`; segments created before it are dead.
    pub(crate) flush_at: AtomicI64,
    /// Serializes reclamation passes (expiration and merge) against each
    /// other, so neither sees the other's half-assembled segment state.
    pub(crate) maintenance: Mutex<()>,
    pub(crate) stop: AtomicBool,
}

/// TTL-aware, segment-structured in-memory key/value cache.
pub struct SegCache {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SegCache {
    /// Bring the engine up: open the datapool, carve the heap, start the
    /// background worker.
    pub fn setup(config: SegConfig) -> Result<Self> {
        config.validate()?;

        let time = TimeSource::new();
        time.refresh();

        let max_nseg = config.max_segments() as i32;
        let reserve = if config.eviction_policy == EvictionPolicy::MergeFifo {
            1
        } else {
            0
        };
        let pool = Datapool::open(
            config.datapool_path.as_deref(),
            &config.datapool_name,
            max_nseg as usize * config.segment_size,
            config.prefault,
        )?;
        let heap = SegHeap::new(pool.payload_ptr(), config.segment_size, max_nseg, reserve);

        // Park the merge destination reserve in the free pool up front so a
        // full heap can still assemble merge output.
        for _ in 0..reserve {
            if let Some(seg_id) = heap.allocate() {
                heap.init_segment(seg_id, time.proc_sec());
                heap.push_free(seg_id);
            }
        }

        let index = HashTable::new(config.hash_power);
        let ttl = TtlBuckets::new();
        let evict = EvictState::new(
            config.eviction_policy,
            max_nseg,
            config.rerank_interval_seconds,
        );

        info!(
            "segment cache: {} segments of {} bytes, hash power {}, policy {:?}",
            max_nseg, config.segment_size, config.hash_power, config.eviction_policy
        );

        let shared = Arc::new(Shared {
            config,
            time,
            _pool: pool,
            heap,
            index,
            ttl,
            evict,
            merge: MergeState::new(),
            metrics: Metrics::new(),
            flush_at: AtomicI64::new(-1),
            maintenance: Mutex::new(()),
            stop: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("seg-cache-bg".to_string())
            .spawn(move || background::worker_loop(&worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Reserve space for an item and write its key plus the first chunk of
    /// the value. The value may be completed with [`Reservation::backfill`];
    /// nothing is visible to readers until [`SegCache::insert`].
    ///
    /// `expire_at` is in process seconds (see [`SegCache::now`]); zero means
    /// the item never expires.
    pub fn reserve<'a>(
        &'a self,
        key: &[u8],
        value: &[u8],
        value_len_total: usize,
        optional_len: u8,
        expire_at: u32,
    ) -> Result<Reservation<'a>> {
        let shared = &*self.shared;
        debug_assert!(!key.is_empty());

        if key.len() > item::KEY_LEN_MAX
            || value_len_total > item::VALUE_LEN_MAX
            || usize::from(optional_len) > item::OPTIONAL_LEN_MAX
        {
            shared.metrics.item_oversized.incr();
            return Err(SegError::Oversized {
                size: key.len().max(value_len_total),
                max: item::VALUE_LEN_MAX,
            });
        }
        debug_assert!(value.len() <= value_len_total);

        let size = item::item_size(key.len(), value_len_total, usize::from(optional_len));
        if size > shared.config.segment_size {
            shared.metrics.item_oversized.incr();
            return Err(SegError::Oversized {
                size,
                max: shared.config.segment_size,
            });
        }

        let now = shared.time.proc_sec();
        let ttl = if expire_at == 0 {
            0
        } else {
            expire_at.saturating_sub(now).max(1)
        };
        let bucket_idx = ttl_bucket_index(ttl);

        let (seg_id, offset) = shared.reserve_in_bucket(bucket_idx, size)?;

        let header = ItemHeader::new(key.len() as u8, value_len_total as u32, optional_len);
        shared
            .heap
            .write_bytes(seg_id, offset as usize, &header.encode());
        shared
            .heap
            .write_bytes(seg_id, offset as usize + header.key_offset(), key);
        shared
            .heap
            .write_bytes(seg_id, offset as usize + header.value_offset(), value);

        let seg = shared.heap.header(seg_id);
        seg.live_bytes.fetch_add(size as i32, Ordering::Relaxed);
        seg.live_items.fetch_add(1, Ordering::Relaxed);
        shared.metrics.item_reserve.incr();

        Ok(Reservation {
            shared,
            seg_id,
            offset,
            item: header,
            value_written: value.len(),
            published: false,
        })
    }

    /// Publish a reserved item in the hash index, replacing any previous
    /// version of the key, and release the writer pin.
    pub fn insert(&self, mut reservation: Reservation<'_>) {
        let shared = &*self.shared;
        debug_assert!(std::ptr::eq(shared, reservation.shared));
        debug_assert_eq!(
            reservation.value_written, reservation.item.vlen as usize,
            "inserting a partially backfilled item"
        );

        let key_offset = reservation.offset as usize + reservation.item.key_offset();
        let key = shared.heap.read_bytes(
            reservation.seg_id,
            key_offset,
            usize::from(reservation.item.klen),
        );
        shared.index.insert(
            &shared.heap,
            &shared.metrics,
            key,
            reservation.seg_id,
            reservation.offset,
        );
        shared.metrics.item_insert.incr();
        shared.heap.header(reservation.seg_id).unpin_writer();
        reservation.published = true;
    }

    /// Reserve and publish in one call.
    pub fn set(&self, key: &[u8], value: &[u8], expire_at: u32) -> Result<()> {
        let reservation = self.reserve(key, value, value.len(), 0, expire_at)?;
        self.insert(reservation);
        Ok(())
    }

    /// Look up a key, bumping its frequency, and pin the item for reading.
    pub fn get<'a>(&'a self, key: &[u8]) -> Option<ItemGuard<'a>> {
        self.lookup(key, true)
    }

    /// Look up a key without disturbing its frequency.
    pub fn get_no_freq_incr<'a>(&'a self, key: &[u8]) -> Option<ItemGuard<'a>> {
        self.lookup(key, false)
    }

    fn lookup<'a>(&'a self, key: &[u8], incr_freq: bool) -> Option<ItemGuard<'a>> {
        let shared = &*self.shared;
        let hit = shared
            .index
            .get(&shared.heap, &shared.time, &shared.metrics, key, incr_freq)?;

        let seg = shared.heap.header(hit.seg_id);
        if seg.is_expired(
            shared.time.proc_sec(),
            shared.flush_at.load(Ordering::Relaxed),
        ) {
            // The reaper has not caught up with this segment yet.
            seg.unpin_reader();
            return None;
        }
        seg.n_hit.fetch_add(1, Ordering::Relaxed);

        let item = shared.heap.item_header(hit.seg_id, hit.offset);
        let cas = if shared.config.use_cas { hit.cas } else { 0 };
        Some(ItemGuard {
            shared,
            seg_id: hit.seg_id,
            offset: hit.offset,
            item,
            cas,
        })
    }

    /// In-place numeric increment. The value must already be numeric or
    /// parse as an unsigned decimal integer.
    pub fn incr(&self, guard: &ItemGuard<'_>, delta: u64) -> Result<u64> {
        self.numeric_update(guard, delta, false)
    }

    /// In-place numeric decrement, saturating at zero.
    pub fn decr(&self, guard: &ItemGuard<'_>, delta: u64) -> Result<u64> {
        self.numeric_update(guard, delta, true)
    }

    fn numeric_update(&self, guard: &ItemGuard<'_>, delta: u64, negative: bool) -> Result<u64> {
        let shared = &*self.shared;
        let value_offset = guard.offset as usize + guard.item.value_offset();
        let flags = shared
            .heap
            .item_flags(guard.seg_id, guard.offset)
            .load(Ordering::Acquire);

        let current = if flags & FLAG_NUMERIC != 0 {
            shared.heap.read_value_u64(guard.seg_id, value_offset)
        } else {
            let raw = shared.heap.read_bytes(
                guard.seg_id,
                value_offset,
                guard.item.vlen as usize,
            );
            let parsed = std::str::from_utf8(raw)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or(SegError::NotANumber)?;
            shared
                .heap
                .item_flags(guard.seg_id, guard.offset)
                .fetch_or(FLAG_NUMERIC, Ordering::Release);
            parsed
        };

        let updated = if negative {
            current.saturating_sub(delta)
        } else {
            current.wrapping_add(delta)
        };
        shared
            .heap
            .write_value_u64(guard.seg_id, value_offset, updated);
        Ok(updated)
    }

    /// Remove every index entry for a key. Returns whether any existed.
    pub fn delete(&self, key: &[u8]) -> bool {
        let shared = &*self.shared;
        let existed = shared.index.delete(&shared.heap, &shared.metrics, key);
        if existed {
            shared.metrics.item_delete.incr();
        }
        existed
    }

    /// Invalidate everything stored so far; segments are reclaimed lazily by
    /// the background worker.
    pub fn flush(&self) {
        let shared = &*self.shared;
        shared.time.refresh();
        let now = i64::from(shared.time.proc_sec());
        shared.flush_at.store(now, Ordering::Relaxed);
        info!("all keys flushed at process time {now}");
    }

    /// Run one expiration pass on the calling thread.
    pub fn purge_expired(&self) {
        let shared = &*self.shared;
        shared.time.refresh();
        let _guard = shared.maintenance.lock();
        shared.reap_expired();
    }

    /// Run one merge compaction pass on the calling thread. Only meaningful
    /// under [`EvictionPolicy::MergeFifo`]; returns whether a run was
    /// compacted.
    pub fn compact_once(&self) -> bool {
        let shared = &*self.shared;
        if shared.config.eviction_policy != EvictionPolicy::MergeFifo {
            return false;
        }
        shared.time.refresh();
        let _guard = shared.maintenance.lock();
        shared.merge_once()
    }

    /// Current process time in seconds; `expire_at` arguments are relative
    /// to the same clock.
    pub fn now(&self) -> u32 {
        self.shared.time.proc_sec()
    }

    /// Shift the engine clock forward, for simulation and tests.
    pub fn advance_clock(&self, by: Duration) {
        self.shared.time.advance(by);
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    pub fn stats(&self) -> SegStats {
        let shared = &*self.shared;
        let (hash_items, hash_links) = shared.index.stats();
        let mut items_live = 0u64;
        let mut bytes_live = 0u64;
        for header in shared.heap.headers() {
            items_live += header.live_items().max(0) as u64;
            bytes_live += header.live_bytes().max(0) as u64;
        }
        SegStats {
            segments_allocated: shared.heap.allocated() as u32,
            segments_max: shared.heap.max_nseg() as u32,
            segments_free: shared.heap.free_count() as u32,
            items_live,
            bytes_live,
            hash_items,
            hash_links,
        }
    }

    /// Segment count of the TTL bucket a given TTL maps to.
    pub fn ttl_bucket_segments(&self, ttl: u32) -> u32 {
        self.shared.ttl.bucket(ttl_bucket_index(ttl)).n_seg()
    }

    /// Stop the background worker and flush the datapool.
    pub fn teardown(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.stop.store(true, Ordering::Release);
            if worker.join().is_err() {
                warn!("background worker exited abnormally");
            }
        }
    }
}

impl Drop for SegCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    /// Reserve `size` bytes in the active segment of a TTL bucket, taking a
    /// writer pin. On overflow the old tail's unused bytes are zeroed (the
    /// write offset is never rolled back; concurrent writers may have
    /// advanced it further) and a fresh segment is linked as the new tail.
    pub(crate) fn reserve_in_bucket(&self, bucket_idx: usize, size: usize) -> Result<(i32, u32)> {
        let bucket = self.ttl.bucket(bucket_idx);
        let seg_size = self.heap.seg_size();
        let mut curr = bucket.last();

        for _ in 0..RESERVE_RETRIES {
            if curr != NO_SEG {
                let header = self.heap.header(curr);
                if header.pin_writer() {
                    let offset =
                        header.write_offset.fetch_add(size as u32, Ordering::AcqRel) as usize;
                    if offset + size <= seg_size {
                        return Ok((curr, offset as u32));
                    }
                    if offset < seg_size {
                        // Zero the tail so forward scans see end-of-items.
                        self.heap.zero_range(curr, offset, seg_size - offset);
                    }
                    header.unpin_writer();
                }
            }

            let new_id = self.acquire_segment()?;
            self.heap.header(new_id).set_ttl(bucket.ttl());

            let mut lists = self.heap.lists.lock();
            let last = bucket.last();
            if last != curr && last != NO_SEG {
                // Another writer linked a tail while we were allocating;
                // hand the spare segment back and write there instead.
                self.metrics.seg_return.incr();
                self.heap.push_free_locked(&mut lists, new_id);
                curr = last;
            } else {
                self.ttl
                    .link_tail_locked(&self.heap, &mut lists, bucket_idx, new_id);
                if curr != NO_SEG {
                    self.heap.header(curr).seal();
                }
                debug!(
                    "linked segment {} to ttl bucket {} ({} segments)",
                    new_id,
                    bucket_idx,
                    bucket.n_seg()
                );
                curr = new_id;
            }
        }

        warn!("reservation starved after {RESERVE_RETRIES} attempts");
        Err(SegError::OutOfMemory)
    }

    /// Produce an initialized, unlinked segment: allocation cursor first,
    /// then the free pool, then eviction (or merge under merge-fifo).
    pub(crate) fn acquire_segment(&self) -> Result<i32> {
        self.metrics.seg_request.incr();
        let now = self.time.proc_sec();

        if let Some(seg_id) = self.heap.allocate() {
            self.metrics.seg_alloc.incr();
            self.heap.init_segment(seg_id, now);
            return Ok(seg_id);
        }
        if let Some(seg_id) = self.heap.pop_free(false) {
            self.heap.init_segment(seg_id, now);
            return Ok(seg_id);
        }

        if self.config.eviction_policy == EvictionPolicy::MergeFifo {
            for _ in 0..EVICT_RETRIES {
                {
                    let _guard = self.maintenance.lock();
                    if self.heap.free_count() <= self.heap.reserve_count() && !self.merge_once() {
                        break;
                    }
                }
                if let Some(seg_id) = self.heap.pop_free(false) {
                    self.heap.init_segment(seg_id, now);
                    return Ok(seg_id);
                }
            }
            self.metrics.item_no_memory.incr();
            return Err(SegError::OutOfMemory);
        }

        for _ in 0..EVICT_RETRIES {
            let Some(victim) = self.evict.next_victim(&self.heap, &self.time) else {
                break;
            };
            if self.remove_segment_content(victim) {
                self.metrics.seg_evict.incr();
                self.heap.init_segment(victim, now);
                return Ok(victim);
            }
            self.metrics.seg_evict_fail.incr();
        }

        self.metrics.item_no_memory.incr();
        Err(SegError::OutOfMemory)
    }

    /// Take a segment out of service: lock it, unlink it from its TTL list,
    /// remove every hash entry pointing into it, and drain outstanding pins.
    /// Does not recycle the segment; the caller either reuses it directly or
    /// returns it to the free pool. Fails when another thread got there
    /// first.
    pub(crate) fn remove_segment_content(&self, seg_id: i32) -> bool {
        let header = self.heap.header(seg_id);
        if !header.lock() {
            debug!("segment {} already being reclaimed", seg_id);
            return false;
        }
        header.set_accessible(false);
        header.set_evictable(false);
        debug!("reclaiming {}", header.describe());

        let bucket_idx = ttl_bucket_index(header.ttl());
        {
            let mut lists = self.heap.lists.lock();
            self.ttl
                .unlink_locked(&self.heap, &mut lists, bucket_idx, seg_id);
        }

        self.evict_all_entries(seg_id);
        header.wait_refcnt();

        // A writer that reserved before accessibility flipped may have
        // published after the scan; sweep again.
        if header.live_items() > 0 {
            self.metrics.seg_evict_retry.incr();
            self.evict_all_entries(seg_id);
        }
        true
    }

    fn evict_all_entries(&self, seg_id: i32) {
        let scan_end = self.heap.scan_end(seg_id);
        let records: Vec<(u32, ItemHeader)> =
            ItemScan::new(self.heap.read_bytes(seg_id, 0, scan_end)).collect();
        for (offset, item) in records {
            let key = self
                .heap
                .item_key(seg_id, offset, &item)
                .to_vec();
            self.index
                .evict(&self.heap, &self.metrics, &key, seg_id, offset);
        }
    }

    /// Remove expired list heads across all TTL buckets. Caller holds the
    /// maintenance lock.
    pub(crate) fn reap_expired(&self) {
        let now = self.time.proc_sec();
        let flush_at = self.flush_at.load(Ordering::Relaxed);
        for idx in 0..N_TTL_BUCKET {
            let bucket = self.ttl.bucket(idx);
            loop {
                let head = bucket.first();
                if head == NO_SEG {
                    break;
                }
                let header = self.heap.header(head);
                if !header.is_expired(now, flush_at) {
                    break;
                }
                debug!(
                    "expire segment {} (create {} + ttl {} < {})",
                    head,
                    header.create_at(),
                    header.ttl(),
                    now
                );
                if !self.remove_segment_content(head) {
                    break;
                }
                self.heap.push_free(head);
                self.metrics.seg_expire.incr();
            }
        }
    }
}

/// Space reserved for one item, writer pin held. Publish with
/// [`SegCache::insert`]; a dropped reservation is abandoned and its bytes
/// are reclaimed with the segment.
pub struct Reservation<'a> {
    shared: &'a Shared,
    seg_id: i32,
    offset: u32,
    item: ItemHeader,
    value_written: usize,
    published: bool,
}

impl Reservation<'_> {
    pub fn location(&self) -> ItemLocation {
        ItemLocation::new(self.seg_id, self.offset)
    }

    /// Append more value bytes to a reservation made with a larger total
    /// value length.
    pub fn backfill(&mut self, chunk: &[u8]) {
        debug_assert!(self.value_written + chunk.len() <= self.item.vlen as usize);
        self.shared.heap.write_bytes(
            self.seg_id,
            self.offset as usize + self.item.value_offset() + self.value_written,
            chunk,
        );
        self.value_written += chunk.len();
    }

    /// Fill the optional metadata bytes reserved at creation.
    pub fn write_optional(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= usize::from(self.item.olen));
        self.shared.heap.write_bytes(
            self.seg_id,
            self.offset as usize + self.item.optional_offset(),
            data,
        );
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        // Abandoned: the bytes stay dead in the segment until it is
        // reclaimed. Tombstone them so scans skip the record.
        let seg = self.shared.heap.header(self.seg_id);
        seg.live_bytes
            .fetch_sub(self.item.total_size() as i32, Ordering::Relaxed);
        seg.live_items.fetch_sub(1, Ordering::Relaxed);
        self.shared
            .heap
            .item_flags(self.seg_id, self.offset)
            .fetch_or(FLAG_TOMBSTONE, Ordering::Release);
        seg.unpin_writer();
    }
}

/// A pinned view of a stored item. The owning segment cannot be reclaimed
/// while the guard lives; drop it promptly.
pub struct ItemGuard<'a> {
    shared: &'a Shared,
    seg_id: i32,
    offset: u32,
    item: ItemHeader,
    cas: u32,
}

impl ItemGuard<'_> {
    pub fn key(&self) -> &[u8] {
        self.shared
            .heap
            .item_key(self.seg_id, self.offset, &self.item)
    }

    /// Raw value bytes. After a numeric update these hold a little-endian
    /// integer; check [`ItemGuard::is_numeric`].
    pub fn value(&self) -> &[u8] {
        self.shared.heap.read_bytes(
            self.seg_id,
            self.offset as usize + self.item.value_offset(),
            self.item.vlen as usize,
        )
    }

    pub fn optional(&self) -> &[u8] {
        self.shared.heap.read_bytes(
            self.seg_id,
            self.offset as usize + self.item.optional_offset(),
            usize::from(self.item.olen),
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.shared
            .heap
            .item_flags(self.seg_id, self.offset)
            .load(Ordering::Acquire)
            & FLAG_NUMERIC
            != 0
    }

    /// The value as a native integer, when it has been switched to in-place
    /// numeric representation.
    pub fn value_u64(&self) -> Option<u64> {
        if self.is_numeric() {
            Some(self.shared.heap.read_value_u64(
                self.seg_id,
                self.offset as usize + self.item.value_offset(),
            ))
        } else {
            None
        }
    }

    /// CAS generation of the hash bucket at lookup time; zero when CAS
    /// publication is disabled.
    pub fn cas(&self) -> u32 {
        self.cas
    }

    pub fn location(&self) -> ItemLocation {
        ItemLocation::new(self.seg_id, self.offset)
    }
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        self.shared.heap.header(self.seg_id).unpin_reader();
    }
}
