//! Stress scenarios: eviction churn and expiration under concurrent load

use std::sync::Arc;
use std::time::Duration;

use seg_cache::{EvictionPolicy, SegCache, SegConfig, SegError};

/// Deterministic payload so readers can verify integrity end to end.
fn payload(key: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(200);
    while value.len() < 200 {
        value.extend_from_slice(key);
    }
    value.truncate(200);
    value
}

#[test]
fn test_churn_with_eviction_keeps_integrity() {
    let config = SegConfig {
        segment_size: 65536,
        heap_size: 8 * 65536,
        hash_power: 12,
        eviction_policy: EvictionPolicy::Fifo,
        ..Default::default()
    };
    let cache = Arc::new(SegCache::setup(config).unwrap());

    // Far more data than the heap can hold, written from four threads while
    // each thread reads back its own recent keys.
    let mut threads = Vec::new();
    for tid in 0..4u32 {
        let cache = Arc::clone(&cache);
        threads.push(std::thread::spawn(move || {
            let mut failures = 0u32;
            for i in 0..2000u32 {
                let key = format!("t{tid}-{i:06}").into_bytes();
                match cache.set(&key, &payload(&key), 0) {
                    Ok(()) => {}
                    Err(SegError::OutOfMemory) => failures += 1,
                    Err(e) => panic!("unexpected error: {e}"),
                }

                if i % 7 == 0 {
                    let probe = format!("t{tid}-{:06}", i.saturating_sub(50)).into_bytes();
                    if let Some(item) = cache.get(&probe) {
                        assert_eq!(item.value(), payload(&probe), "corrupt value");
                    }
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for thread in threads {
        failures += thread.join().unwrap();
    }

    // Eviction must have kicked in, and the cache must still be coherent:
    // every surviving key maps to its own payload and the index agrees with
    // the segment accounting.
    assert!(cache.metrics().seg_evict > 0);
    assert!(failures < 100, "{failures} reservations starved");

    let mut survivors = 0u64;
    for tid in 0..4u32 {
        for i in 0..2000u32 {
            let key = format!("t{tid}-{i:06}").into_bytes();
            if let Some(item) = cache.get(&key) {
                assert_eq!(item.value(), payload(&key));
                survivors += 1;
            }
        }
    }
    let stats = cache.stats();
    assert!(survivors > 0);
    assert_eq!(stats.items_live, survivors);
    assert_eq!(stats.hash_items as u64, survivors);
}

#[test]
fn test_expiration_under_write_load() {
    let config = SegConfig {
        segment_size: 65536,
        heap_size: 32 * 65536,
        ..Default::default()
    };
    let cache = Arc::new(SegCache::setup(config).unwrap());

    let mut threads = Vec::new();
    for tid in 0..3u32 {
        let cache = Arc::clone(&cache);
        threads.push(std::thread::spawn(move || {
            for i in 0..1500u32 {
                let key = format!("w{tid}-{i:06}").into_bytes();
                // Mixed short TTLs, all within the finest bucket range.
                let expire_at = cache.now() + 2 + (i % 8);
                cache.set(&key, &payload(&key), expire_at).unwrap();
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    // Everything was given at most ten seconds to live; TTL bucketing may
    // stretch that by one granularity step.
    cache.advance_clock(Duration::from_secs(30));
    cache.purge_expired();

    let stats = cache.stats();
    assert_eq!(stats.items_live, 0);
    assert_eq!(stats.hash_items, 0);
    assert_eq!(stats.segments_free, stats.segments_allocated);
    assert!(cache.get(b"w0-000000").is_none());
    assert!(cache.metrics().seg_expire > 0);
}

#[test]
fn test_flush_under_read_load() {
    let cache = Arc::new(SegCache::setup(SegConfig::default()).unwrap());

    for i in 0..500u32 {
        let key = format!("k{i:06}").into_bytes();
        cache.set(&key, &payload(&key), 0).unwrap();
    }

    let reader = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || {
            // Readers racing a flush see either the full value or a miss.
            for round in 0..200u32 {
                let key = format!("k{:06}", round % 500).into_bytes();
                if let Some(item) = cache.get(&key) {
                    assert_eq!(item.value(), payload(&key));
                }
            }
        })
    };

    cache.advance_clock(Duration::from_secs(1));
    cache.flush();
    reader.join().unwrap();

    cache.purge_expired();
    assert_eq!(cache.stats().items_live, 0);
}
