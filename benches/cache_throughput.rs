//! Cache throughput benchmarks.
//!
//! Measures lookups and inserts per policy, with and without eviction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use core_resources::cache::{Cache, CacheConfig, EvictionPolicy};

fn config(capacity: usize, policy: EvictionPolicy) -> CacheConfig {
    CacheConfig {
        capacity,
        policy,
        ..CacheConfig::default()
    }
}

fn bench_cache_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get_hit");

    for policy in [EvictionPolicy::Lru, EvictionPolicy::Lfu, EvictionPolicy::Ttl] {
        let cache = Cache::new(config(4096, policy)).unwrap();
        for key in 0..4096u64 {
            cache.insert(key, key);
        }

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("get", format!("{policy:?}")), |b| {
            let mut key = 0u64;
            b.iter(|| {
                key = (key + 7) % 4096;
                black_box(cache.get(&key))
            })
        });
    }

    group.finish();
}

fn bench_cache_insert_evicting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_insert_evicting");

    // Small capacities keep every insert on the eviction path.
    for capacity in [64usize, 1024] {
        let cache = Cache::new(config(capacity, EvictionPolicy::Lru)).unwrap();
        let mut key = 0u64;

        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("insert", capacity), |b| {
            b.iter(|| {
                key += 1;
                cache.insert(black_box(key), key);
            })
        });
    }

    group.finish();
}

fn bench_cache_concurrent_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_concurrent_mixed");

    for threads in [2usize, 8] {
        let cache = Cache::new(config(1024, EvictionPolicy::Lru)).unwrap();
        group.throughput(Throughput::Elements((threads * 1000) as u64));
        group.bench_function(BenchmarkId::new("threads", threads), |b| {
            b.iter(|| {
                std::thread::scope(|scope| {
                    for t in 0..threads as u64 {
                        let cache = cache.clone();
                        scope.spawn(move || {
                            for i in 0..1000u64 {
                                let key = (t * 1000 + i) % 2048;
                                if cache.get(&key).is_none() {
                                    cache.insert(key, i);
                                }
                            }
                        });
                    }
                });
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_cache_get_hit,
    bench_cache_insert_evicting,
    bench_cache_concurrent_mixed
);
criterion_main!(benches);
