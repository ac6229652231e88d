use criterion::{Criterion, criterion_group, criterion_main};
use seg_cache::{SegCache, SegConfig};

fn bench_set_get(c: &mut Criterion) {
    let cache = SegCache::setup(SegConfig {
        heap_size: 256 * 1024 * 1024,
        hash_power: 20,
        ..Default::default()
    })
    .unwrap();

    let value = vec![0xabu8; 100];
    for i in 0..100_000u64 {
        cache.set(&i.to_be_bytes(), &value, 0).unwrap();
    }

    let mut n = 0u64;
    c.bench_function("set_100b", |b| {
        b.iter(|| {
            n = n.wrapping_add(1) % 100_000;
            cache.set(&n.to_be_bytes(), &value, 0).unwrap();
        });
    });

    let mut k = 0u64;
    c.bench_function("get_100b", |b| {
        b.iter(|| {
            k = k.wrapping_add(7919) % 100_000;
            std::hint::black_box(cache.get(&k.to_be_bytes()));
        });
    });
}

criterion_group!(benches, bench_set_get);
criterion_main!(benches);
