//! Table growth and shrinkage under load, including races with searches.

use grist_cache::{AssociativeCache, CacheConfig, EvictionKind, MemoryManager, TableShape};
use grist_types::{NodeId, PageOffset};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const PAGE: usize = 4096;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn off(page_index: i64) -> PageOffset {
    PageOffset(page_index * PAGE as i64)
}

fn build_cache(
    cache_pages: usize,
    init_pages: usize,
    max_pages: usize,
) -> Arc<AssociativeCache> {
    let cfg = CacheConfig {
        cache_size: cache_pages * PAGE,
        init_cache_size: init_pages * PAGE,
        max_cache_size: max_pages * PAGE,
        init_ncells: 4,
        eviction: EvictionKind::Lru,
        ..CacheConfig::default()
    };
    let manager = MemoryManager::new(cfg.max_cache_size, PAGE, NodeId(0));
    AssociativeCache::new(cfg, manager).expect("cache")
}

/// Fill a page with a pattern derived from its offset so later hits can
/// verify they read the page they asked for.
fn stamp(handle: &grist_cache::PageHandle) {
    let mut payload = vec![0x3C_u8; PAGE];
    payload[..8].copy_from_slice(&handle.offset().0.to_le_bytes());
    handle.fill(&payload).expect("fill");
    handle.set_data_ready(true);
}

fn verify(handle: &grist_cache::PageHandle) {
    handle.with_data(|data| {
        let mut stamped = [0_u8; 8];
        stamped.copy_from_slice(&data[..8]);
        assert_eq!(
            i64::from_le_bytes(stamped),
            handle.offset().0,
            "page content belongs to a different offset"
        );
    });
}

#[test]
fn expand_splits_the_table_to_the_next_level() {
    init_logging();
    let cache = build_cache(12, 12, 96);
    assert_eq!(
        cache.shape(),
        TableShape {
            level: 0,
            split: 0,
            ncells: 4,
            npages: 12
        }
    );
    for i in 0..12_i64 {
        stamp(&cache.search(off(i)));
    }

    let added = cache.expand(12).expect("expand");
    assert_eq!(added, 12);
    let shape = cache.shape();
    assert_eq!(shape.level, 1);
    assert_eq!(shape.split, 0);
    assert_eq!(shape.ncells, 8);
    assert_eq!(shape.npages, 24);
    cache.sanity_check().expect("sane");

    // Every page still routes to the cell that now holds it.
    for i in 0..12_i64 {
        let handle = cache.probe(off(i)).expect("page survived the split");
        verify(&handle);
    }
}

#[test]
fn grow_then_shrink_under_memory_pressure() {
    init_logging();
    let cache = build_cache(48, 12, 96);
    assert_eq!(cache.cache_npages(), 48);
    for i in 0..48_i64 {
        stamp(&cache.search(off(i)));
    }

    let stolen = cache.shrink(24);
    assert_eq!(stolen.len(), 24, "pressure shrink returns the stolen buffers");
    assert!(stolen.iter().all(|buf| buf.len() == PAGE));
    assert_eq!(cache.cache_npages(), 24);
    assert_eq!(cache.get_num_used_pages(), 24);
    cache.sanity_check().expect("sane");

    // The cache keeps serving lookups at its reduced size.
    let handle = cache.search(off(100));
    assert_eq!(handle.offset(), off(100));
}

#[test]
fn expand_then_shrink_round_trips_the_page_count() {
    init_logging();
    let cache = build_cache(12, 12, 96);
    let before = cache.cache_npages();
    let added = cache.expand(12).expect("expand");
    assert_eq!(added, 12);
    let stolen = cache.shrink(12);
    assert_eq!(stolen.len(), 12);
    assert_eq!(cache.cache_npages(), before);
    cache.sanity_check().expect("sane");
}

#[test]
fn concurrent_hits_during_split_never_misroute() {
    init_logging();
    let cache = build_cache(12, 12, 256);
    let stop = Arc::new(AtomicBool::new(false));
    let trials = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for t in 0..4_u64 {
        let cache = Arc::clone(&cache);
        let stop = Arc::clone(&stop);
        let trials = Arc::clone(&trials);
        workers.push(std::thread::spawn(move || {
            let mut i = 0_u64;
            while !stop.load(Ordering::Relaxed) {
                let target = off(((i.wrapping_mul(31).wrapping_add(t * 7)) % 96) as i64);
                let handle = cache.search(target);
                assert_eq!(handle.offset(), target);
                if handle.is_data_ready() {
                    verify(&handle);
                } else {
                    stamp(&handle);
                }
                trials.fetch_add(1, Ordering::Relaxed);
                i += 1;
            }
        }));
    }

    // Keep splitting while the searchers hammer the table.
    for _ in 0..6 {
        let _ = cache.expand(24).expect("expand");
    }
    // Let the workers accumulate trials against the final shape too.
    while trials.load(Ordering::Relaxed) < 10_000 {
        std::thread::yield_now();
    }
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        worker.join().expect("search worker");
    }

    assert!(trials.load(Ordering::Relaxed) >= 10_000);
    assert_eq!(cache.get_num_used_pages(), cache.cache_npages());
    cache.sanity_check().expect("sane");
}
