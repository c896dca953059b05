#![forbid(unsafe_code)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grist_cache::{AssociativeCache, CacheConfig, EvictionKind, MemoryManager};
use grist_types::{NodeId, PageOffset};
use std::sync::Arc;

const PAGE: usize = 4096;

fn build_cache(npages: usize, eviction: EvictionKind) -> Arc<AssociativeCache> {
    let cfg = CacheConfig {
        cache_size: npages * PAGE,
        init_cache_size: npages * PAGE,
        max_cache_size: npages * PAGE,
        eviction,
        ..CacheConfig::default()
    };
    let manager = MemoryManager::new(cfg.max_cache_size, PAGE, NodeId(0));
    AssociativeCache::new(cfg, manager).expect("bench cache")
}

fn off(page_index: i64) -> PageOffset {
    PageOffset(page_index * PAGE as i64)
}

fn bench_search_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_hit");
    for eviction in [EvictionKind::Lru, EvictionKind::Gclock] {
        let cache = build_cache(1024, eviction);
        // Warm the working set so every lookup is a hit.
        for i in 0..512_i64 {
            let handle = cache.search(off(i));
            handle.set_data_ready(true);
        }
        group.bench_function(format!("{eviction:?}").to_lowercase(), |b| {
            let mut i = 0_i64;
            b.iter(|| {
                let handle = cache.search(black_box(off(i % 512)));
                i += 1;
                black_box(handle.offset())
            });
        });
    }
    group.finish();
}

fn bench_search_evicting(c: &mut Criterion) {
    // Working set twice the cache size: every lookup churns a cell.
    let cache = build_cache(256, EvictionKind::Gclock);
    c.bench_function("search_evicting_gclock", |b| {
        let mut i = 0_i64;
        b.iter(|| {
            let handle = cache.search(black_box(off(i % 512)));
            handle.set_data_ready(true);
            i += 1;
            black_box(handle.hits())
        });
    });
}

criterion_group!(benches, bench_search_hit, bench_search_evicting);
criterion_main!(benches);
