//! Watch the TTL machinery reclaim whole segments.
//!
//! Items with similar TTLs land in the same segment list, so expiration is a
//! matter of unlinking list heads. The clock is advanced artificially here;
//! in a real deployment the background worker does the same work on real
//! time.

use std::time::Duration;

use seg_cache::{SegCache, SegConfig};

fn main() -> seg_cache::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cache = SegCache::setup(SegConfig::default())?;

    let now = cache.now();
    for i in 0..100 {
        let key = format!("short-{i:03}");
        cache.set(key.as_bytes(), b"gone in ten seconds", now + 10)?;
    }
    for i in 0..100 {
        let key = format!("long-{i:03}");
        cache.set(key.as_bytes(), b"stays for an hour", now + 3600)?;
    }
    println!(
        "before: {} items, short-ttl bucket holds {} segment(s)",
        cache.stats().items_live,
        cache.ttl_bucket_segments(10)
    );

    cache.advance_clock(Duration::from_secs(60));
    cache.purge_expired();

    println!(
        "after one minute: {} items, short-000 present: {}, long-000 present: {}",
        cache.stats().items_live,
        cache.get(b"short-000").is_some(),
        cache.get(b"long-000").is_some()
    );

    let metrics = cache.metrics();
    println!(
        "segments expired: {}, segments free: {}",
        metrics.seg_expire,
        cache.stats().segments_free
    );

    cache.teardown();
    Ok(())
}
