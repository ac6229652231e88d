//! Background maintenance worker
//!
//! One thread owns the cooperative chores: refreshing the coarse clock,
//! expiring TTL bucket heads, and (under merge-fifo) topping the free pool
//! up by compaction. Each tick's work runs under the maintenance lock so
//! foreground-triggered passes never interleave with it.

use std::sync::atomic::Ordering;

use tracing::info;

use crate::config::EvictionPolicy;
use crate::storage::Shared;

/// Merge passes attempted per tick while the free pool is depleted.
const MERGE_PASSES_PER_TICK: usize = 8;

pub(crate) fn worker_loop(shared: &Shared) {
    info!("background worker started");

    while !shared.stop.load(Ordering::Acquire) {
        shared.time.refresh();

        {
            let _guard = shared.maintenance.lock();
            shared.reap_expired();
        }

        if shared.evict.policy() == EvictionPolicy::MergeFifo {
            let mut passes = 0;
            while passes < MERGE_PASSES_PER_TICK
                && !shared.stop.load(Ordering::Acquire)
                && shared.heap.allocated() == shared.heap.max_nseg()
                && shared.heap.free_count() <= shared.heap.reserve_count()
            {
                let _guard = shared.maintenance.lock();
                if !shared.merge_once() {
                    break;
                }
                passes += 1;
            }
        }

        std::thread::sleep(shared.config.reap_interval);
    }

    info!("background worker stopped");
}
