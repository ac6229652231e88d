//! Segment merge compaction
//!
//! Under the merge-fifo policy, space is reclaimed by folding a run of
//! consecutive segments in a TTL list into one destination segment, keeping
//! only the items whose access frequency clears an adaptive cutoff. The
//! destination takes over the first source's position (and creation time) so
//! expiration order is preserved; consumed sources go back to the free pool.
//!
//! A pass walks the TTL buckets round-robin from a cursor. Inside a bucket
//! the per-bucket merge cursor remembers where the last run ended, so
//! repeated passes sweep the whole list instead of hammering its head.
//! All passes run under the engine's maintenance lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::hashtable::ItemFreq;
use crate::item::{ItemHeader, ItemScan};
use crate::storage::Shared;
use crate::ttl::{N_TTL_BUCKET, ttl_bucket_index};
use crate::types::NO_SEG;

/// A destination that ends a run with no more live payload than this is
/// thrown back rather than linked.
const EMPTY_DEST_BYTES: i32 = 8;

#[derive(Debug, Default)]
pub(crate) struct MergeState {
    /// Round-robin position of the bucket walk.
    pub(crate) last_bucket: AtomicUsize,
    /// Segments consumed by merges, and the sum of their ages at merge time;
    /// together they give the mean merge age for the old-head escape hatch.
    pub(crate) n_merged: AtomicU64,
    pub(crate) age_sum: AtomicU64,
    /// Merge outcomes; a streak of empty merges drops the next run's
    /// starting cutoff to zero so something gets kept.
    pub(crate) empty_merges: AtomicU64,
    pub(crate) good_merges: AtomicU64,
}

impl MergeState {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl Shared {
    /// Run one compaction pass: find a mergeable run in some TTL bucket and
    /// fold it. Returns whether any segment was freed. Caller holds the
    /// maintenance lock.
    pub(crate) fn merge_once(&self) -> bool {
        let start = self.merge.last_bucket.load(Ordering::Relaxed);

        for i in 0..=N_TTL_BUCKET {
            let idx = (start + i) % N_TTL_BUCKET;
            let bucket = self.ttl.bucket(idx);
            if bucket.first() == NO_SEG {
                continue;
            }
            // Contended buckets are skipped rather than waited on.
            let Some(_guard) = bucket.mutex.try_lock() else {
                continue;
            };

            let begin = self.valid_merge_cursor(idx);
            let Some(run_start) = self.find_merge_run(begin) else {
                bucket.next_seg_to_merge.store(NO_SEG, Ordering::Release);
                if self.evict_stale_head(idx) {
                    self.merge.last_bucket.store(idx + 1, Ordering::Relaxed);
                    return true;
                }
                continue;
            };

            let claimed = self.claim_run(run_start);
            if claimed.len() < 2 {
                for &seg_id in &claimed {
                    self.heap.header(seg_id).set_evictable(true);
                }
                continue;
            }

            let next = self.merge_run(idx, &claimed);
            bucket.next_seg_to_merge.store(next, Ordering::Release);
            self.merge.last_bucket.store(idx, Ordering::Relaxed);
            return true;
        }

        debug!("no mergeable run in any ttl bucket");
        false
    }

    /// The bucket's merge cursor, discarded when it no longer points into
    /// this bucket's list (the segment was reclaimed and reused meanwhile).
    fn valid_merge_cursor(&self, bucket_idx: usize) -> i32 {
        let bucket = self.ttl.bucket(bucket_idx);
        let cursor = bucket.next_seg_to_merge.load(Ordering::Acquire);
        if cursor == NO_SEG {
            return bucket.first();
        }
        let header = self.heap.header(cursor);
        if !header.is_initialized()
            || header.in_free_pool()
            || ttl_bucket_index(header.ttl()) != bucket_idx
        {
            return bucket.first();
        }
        cursor
    }

    /// First position from `begin` where `merge_min` consecutive eligible
    /// segments are followed by at least one more segment (the list tail is
    /// never part of a run).
    fn find_merge_run(&self, begin: i32) -> Option<i32> {
        let now = self.time.proc_sec();
        let mature = self.config.segment_mature_seconds;
        let need = self.config.merge_min;

        let mut candidate = begin;
        while candidate != NO_SEG {
            let mut id = candidate;
            let mut count = 0;
            while id != NO_SEG && count < need && self.heap.header(id).merge_eligible(now, mature) {
                count += 1;
                id = self.heap.header(id).next.load(Ordering::Relaxed);
            }
            if count == need {
                if id != NO_SEG {
                    return Some(candidate);
                }
                return None;
            }
            if id == NO_SEG {
                return None;
            }
            // `id` itself is ineligible; no run through it can work.
            candidate = self.heap.header(id).next.load(Ordering::Relaxed);
        }
        None
    }

    /// Claim up to `merge_max` eligible segments starting at `start` by
    /// swapping out their evictable bits, so neither the ranker nor a
    /// concurrent pass can take them.
    fn claim_run(&self, start: i32) -> Vec<i32> {
        let now = self.time.proc_sec();
        let mature = self.config.segment_mature_seconds;
        let mut claimed = Vec::with_capacity(self.config.merge_max);

        let _lists = self.heap.lists.lock();
        let mut seg_id = start;
        while seg_id != NO_SEG && claimed.len() < self.config.merge_max {
            let header = self.heap.header(seg_id);
            if header.merge_eligible(now, mature) && header.set_evictable(false) {
                claimed.push(seg_id);
                self.merge.n_merged.fetch_add(1, Ordering::Relaxed);
                self.merge.age_sum.fetch_add(
                    u64::from(now.saturating_sub(header.create_at())),
                    Ordering::Relaxed,
                );
            }
            seg_id = header.next.load(Ordering::Relaxed);
        }
        claimed
    }

    /// Fold a claimed run into one destination. Returns the list position
    /// where the next pass should resume.
    fn merge_run(&self, bucket_idx: usize, claimed: &[i32]) -> i32 {
        let now = self.time.proc_sec();
        let seg_size = self.heap.seg_size();
        let stop_bytes = (seg_size as f64 * self.config.merge_stop_ratio) as usize;
        let fallback_cursor = self
            .heap
            .header(claimed[claimed.len() - 1])
            .next
            .load(Ordering::Relaxed);

        let Some(dst) = self.heap.pop_free(true) else {
            warn!("no reserved segment for merge destination");
            for &seg_id in claimed {
                self.heap.header(seg_id).set_evictable(true);
            }
            return fallback_cursor;
        };
        self.heap.init_segment(dst, now);
        let dst_header = self.heap.header(dst);
        dst_header.set_create_at(self.heap.header(claimed[0]).create_at());
        dst_header.set_merge_at(now);
        dst_header.set_ttl(self.ttl.bucket(bucket_idx).ttl());

        // A streak of empty merges means the cutoff is starving the
        // destination; let everything through once.
        let empty = self.merge.empty_merges.load(Ordering::Relaxed);
        let mut cutoff =
            if empty > self.merge.good_merges.load(Ordering::Relaxed) && empty > 2 {
                0.0
            } else {
                1.0
            };

        let mut consumed = 0;
        for (i, &src) in claimed.iter().enumerate() {
            if dst_header.write_offset.load(Ordering::Relaxed) as usize >= stop_bytes {
                break;
            }
            self.copy_live_items(dst, src, &mut cutoff);

            let src_header = self.heap.header(src);
            let locked = src_header.lock();
            debug_assert!(locked, "claimed segment {src} reclaimed elsewhere");
            let was_accessible = src_header.set_accessible(false);
            debug_assert!(was_accessible);
            src_header.wait_refcnt();
            {
                let mut lists = self.heap.lists.lock();
                if i == 0 {
                    self.ttl
                        .replace_locked(&self.heap, &mut lists, bucket_idx, dst, src);
                } else {
                    self.ttl
                        .unlink_locked(&self.heap, &mut lists, bucket_idx, src);
                }
                self.heap.push_free_locked(&mut lists, src);
            }
            consumed += 1;
            self.metrics.seg_merge.incr();
        }

        for &seg_id in &claimed[consumed..] {
            let was_evictable = self.heap.header(seg_id).set_evictable(true);
            debug_assert!(!was_evictable);
        }

        if dst_header.live_bytes() <= EMPTY_DEST_BYTES {
            // Nothing survived the cutoff; throw the destination back too.
            dst_header.set_accessible(false);
            {
                let mut lists = self.heap.lists.lock();
                self.ttl
                    .unlink_locked(&self.heap, &mut lists, bucket_idx, dst);
                self.heap.push_free_locked(&mut lists, dst);
            }
            self.merge.empty_merges.fetch_add(1, Ordering::Relaxed);
            warn!(
                "merged {} segments with no live items, destination {} returned",
                consumed, dst
            );
            return fallback_cursor;
        }

        let write_offset = dst_header.write_offset.load(Ordering::Relaxed) as usize;
        self.heap.zero_range(dst, write_offset, seg_size - write_offset);
        dst_header.seal();
        dst_header.set_evictable(true);
        self.merge.good_merges.fetch_add(1, Ordering::Relaxed);
        info!(
            "ttl bucket {}: merged {}/{} segments into {} ({} items, {} bytes)",
            bucket_idx,
            consumed,
            claimed.len(),
            dst,
            dst_header.live_items(),
            dst_header.live_bytes(),
        );

        dst_header.next.load(Ordering::Relaxed)
    }

    /// Copy the still-valuable items of `src` into `dst`, evicting the rest
    /// from the index. The cutoff is re-derived from the previous source's
    /// result and adjusted every tenth of a segment scanned.
    fn copy_live_items(&self, dst: i32, src: i32, cutoff_carry: &mut f64) {
        let seg_size = self.heap.seg_size();
        let dst_header = self.heap.header(dst);
        let src_header = self.heap.header(src);
        let target = self.config.merge_target_ratio;
        let stop_bytes = (seg_size as f64 * self.config.merge_stop_ratio) as usize;

        let mean_size =
            src_header.live_bytes().max(1) as f64 / src_header.live_items().max(1) as f64;
        let mut copy_all = *cutoff_carry < 0.0001;
        let mut cutoff = (1.0 + *cutoff_carry) / 2.0;

        let checkpoint_interval = seg_size / 10;
        let mut next_checkpoint = checkpoint_interval;
        let mut scanned = 0usize;
        let mut kept = 0usize;

        let scan_end = self.heap.scan_end(src);
        let records: Vec<(u32, ItemHeader)> =
            ItemScan::new(self.heap.read_bytes(src, 0, scan_end)).collect();

        for (offset, item) in records {
            let size = item.total_size();
            scanned += size;

            if scanned >= next_checkpoint {
                next_checkpoint += checkpoint_interval;
                let deviation = (kept as f64 / scanned as f64 - target) / target;
                if deviation.abs() > 0.5 {
                    cutoff *= 1.0 + deviation;
                }
            }

            if !copy_all
                && dst_header.write_offset.load(Ordering::Relaxed) as usize >= stop_bytes
                && offset as usize > stop_bytes
            {
                // The destination is full enough; take the rest of this
                // source as-is instead of re-scanning it later.
                copy_all = true;
            }

            if item.deleted
                || self
                    .heap
                    .item_flags(src, offset)
                    .load(Ordering::Acquire)
                    & crate::item::FLAG_TOMBSTONE
                    != 0
            {
                continue;
            }

            let key = self.heap.item_key(src, offset, &item);
            let freq = match self.index.item_freq(&self.heap, key, src, offset) {
                ItemFreq::Missing => continue,
                ItemFreq::Stale => 0.0,
                ItemFreq::Live(f) => f64::from(f),
            };

            let normalized = freq / (size as f64 / mean_size);
            if normalized <= cutoff && !copy_all {
                self.index
                    .evict(&self.heap, &self.metrics, key, src, offset);
                continue;
            }

            let dst_offset = dst_header.write_offset.load(Ordering::Relaxed) as usize;
            if dst_offset + size > seg_size {
                self.index
                    .evict(&self.heap, &self.metrics, key, src, offset);
                continue;
            }

            self.heap
                .copy_between(src, offset as usize, dst, dst_offset, size);
            if self.index.relink(
                &self.heap,
                &self.metrics,
                key,
                src,
                offset,
                dst,
                dst_offset as u32,
            ) {
                dst_header
                    .write_offset
                    .store((dst_offset + size) as u32, Ordering::Release);
                dst_header.live_bytes.fetch_add(size as i32, Ordering::Relaxed);
                dst_header.live_items.fetch_add(1, Ordering::Relaxed);
                kept += size;
            }
            // A failed relink means the item was updated or deleted while
            // we copied; the destination bytes stay dead.
        }

        *cutoff_carry = cutoff;
        debug!(
            "merge copy {} -> {}: kept {}/{} bytes, cutoff {:.2}",
            src, dst, kept, scanned, cutoff
        );
    }

    /// Escape hatch for buckets that never produce a mergeable run: once
    /// enough merges have established a mean age, evict a head that is more
    /// than twice as old.
    fn evict_stale_head(&self, bucket_idx: usize) -> bool {
        let n = self.merge.n_merged.load(Ordering::Relaxed);
        if n <= 100 {
            return false;
        }
        let head = self.ttl.bucket(bucket_idx).first();
        if head == NO_SEG {
            return false;
        }
        let age = self
            .time
            .proc_sec()
            .saturating_sub(self.heap.header(head).create_at());
        let mean_age = self.merge.age_sum.load(Ordering::Relaxed) / n;
        if u64::from(age) <= mean_age * 2 {
            return false;
        }
        debug!(
            "evicting stale head {} of bucket {} (age {} vs mean {})",
            head, bucket_idx, age, mean_age
        );
        if self.remove_segment_content(head) {
            self.heap.push_free(head);
            self.metrics.seg_evict.incr();
            true
        } else {
            false
        }
    }
}
