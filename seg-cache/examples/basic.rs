//! Minimal tour of the cache API: set, get, incr, delete.

use seg_cache::{SegCache, SegConfig};

fn main() -> seg_cache::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cache = SegCache::setup(SegConfig::default())?;

    cache.set(b"greeting", b"hello from a segment", 0)?;
    if let Some(item) = cache.get(b"greeting") {
        println!(
            "greeting = {:?} (cas {})",
            String::from_utf8_lossy(item.value()),
            item.cas()
        );
    }

    cache.set(b"hits", b"41", 0)?;
    if let Some(item) = cache.get(b"hits") {
        let n = cache.incr(&item, 1)?;
        println!("hits incremented to {n}");
    }

    cache.delete(b"greeting");
    println!("greeting present after delete: {}", cache.get(b"greeting").is_some());

    let stats = cache.stats();
    println!(
        "{} live items in {}/{} segments, {} hash slots used",
        stats.items_live, stats.segments_allocated, stats.segments_max, stats.hash_items
    );

    cache.teardown();
    Ok(())
}
