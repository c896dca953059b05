//! End-to-end writeback scenarios against an in-memory disk.

use grist_cache::{
    AssociativeCache, CacheConfig, CompletionTarget, EvictionKind, FlushConfig, FlushCoordinator,
    IoCompletion, IoRequest, MemoryManager, PageHandle, PageIo,
};
use grist_types::{NodeId, PageOffset};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

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

fn page_payload(page_index: i64, salt: u8) -> Vec<u8> {
    let mut out = vec![salt; PAGE];
    out[..8].copy_from_slice(&page_index.to_le_bytes());
    out
}

fn blake3_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Backing store shared between the read path and the writeback path.
#[derive(Clone, Default)]
struct SharedDisk {
    pages: Arc<Mutex<HashMap<i64, Vec<u8>>>>,
}

impl SharedDisk {
    fn read_page(&self, off: PageOffset) -> Vec<u8> {
        self.pages
            .lock()
            .get(&off.0)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; PAGE])
    }

    fn write_page(&self, off: PageOffset, data: &[u8]) {
        self.pages.lock().insert(off.0, data.to_vec());
    }

    fn stored(&self, off: PageOffset) -> Option<Vec<u8>> {
        self.pages.lock().get(&off.0).cloned()
    }
}

/// Writeback I/O that persists pages to the shared disk and reports each
/// request on a completion thread, like a real submission queue would.
struct DiskIo {
    disk: SharedDisk,
    target: Mutex<Option<Weak<FlushCoordinator>>>,
    inline: bool,
}

impl DiskIo {
    fn new(disk: SharedDisk, inline: bool) -> Arc<Self> {
        Arc::new(Self {
            disk,
            target: Mutex::new(None),
            inline,
        })
    }

    fn set_target(&self, target: &Arc<FlushCoordinator>) {
        *self.target.lock() = Some(Arc::downgrade(target));
    }

    fn complete(disk: &SharedDisk, target: Option<Arc<FlushCoordinator>>, requests: Vec<IoRequest>) {
        let mut completions = Vec::with_capacity(requests.len());
        for request in requests {
            for page in request.pages() {
                page.with_data(|data| disk.write_page(page.offset(), data));
            }
            completions.push(IoCompletion::ok(request));
        }
        if let Some(target) = target {
            target.notify_completion(completions);
        }
    }
}

impl PageIo for DiskIo {
    fn access(&self, requests: Vec<IoRequest>) {
        let target = self
            .target
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade());
        if self.inline {
            Self::complete(&self.disk, target, requests);
        } else {
            let disk = self.disk.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(1));
                Self::complete(&disk, target, requests);
            });
        }
    }
}

fn build_cache(cells: usize, pages_per_cell: usize) -> Arc<AssociativeCache> {
    let npages = cells * pages_per_cell;
    let cfg = CacheConfig {
        cache_size: npages * PAGE,
        init_cache_size: npages * PAGE,
        max_cache_size: npages * PAGE,
        init_ncells: cells,
        eviction: EvictionKind::Lru,
        ..CacheConfig::default()
    };
    let manager = MemoryManager::new(cfg.max_cache_size, PAGE, NodeId(0));
    AssociativeCache::new(cfg, manager).expect("cache")
}

/// Client read path: search, honor old-dirty victims, fill on miss.
fn read_through(cache: &AssociativeCache, disk: &SharedDisk, target: PageOffset) -> PageHandle {
    let (handle, prev) = cache.search_with_victim(target);
    assert_eq!(handle.offset(), target);
    if handle.is_old_dirty() {
        // The victim's prior bytes are still owed to its old offset.
        let prev = prev.expect("old-dirty eviction reports the prior offset");
        assert!(prev.is_valid());
        handle.with_data(|data| disk.write_page(prev, data));
        handle.clear_old_dirty();
    }
    if !handle.is_data_ready() {
        let data = disk.read_page(target);
        handle.fill(&data).expect("fill");
        handle.set_data_ready(true);
    }
    handle
}

fn wait_for_drain(cache: &AssociativeCache, coordinator: &FlushCoordinator, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cache.get_num_dirty_pages() == 0 && coordinator.pending_flushes() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(cache.get_num_dirty_pages(), 0, "dirty pages did not drain");
    assert_eq!(coordinator.pending_flushes(), 0, "pending flushes did not drain");
}

#[test]
fn cold_miss_then_hit_serves_cached_data() {
    init_logging();
    let disk = SharedDisk::default();
    disk.write_page(off(0), &page_payload(0, 0x11));
    let cache = build_cache(4, 6);

    let first = read_through(&cache, &disk, off(0));
    assert_eq!(first.hits(), 1);
    let second = read_through(&cache, &disk, off(0));
    assert!(second.same_page(&first));
    assert!(second.is_data_ready());
    assert_eq!(second.hits(), 2);
    second.with_data(|data| {
        assert_eq!(blake3_hex(data), blake3_hex(&page_payload(0, 0x11)));
    });
}

#[test]
fn contiguous_dirty_pages_flush_and_persist() {
    init_logging();
    let disk = SharedDisk::default();
    let cache = build_cache(1, 8);
    let io = DiskIo::new(disk.clone(), true);
    let coordinator = FlushCoordinator::start(
        &cache,
        Arc::clone(&io) as Arc<dyn PageIo>,
        FlushConfig {
            max_pending_flush: 10,
            writeback_batch_pages: 8,
            dirty_pages_threshold: 5,
            ..FlushConfig::default()
        },
    )
    .expect("coordinator");
    io.set_target(&coordinator);

    let mut handles = Vec::new();
    for i in 0..7_i64 {
        let handle = read_through(&cache, &disk, off(i));
        handle.fill(&page_payload(i, 0xD0)).expect("fill");
        handle.set_dirty(true);
        handles.push(handle);
    }
    cache.mark_dirty_pages(&handles);

    wait_for_drain(&cache, &coordinator, Duration::from_secs(2));
    for (i, handle) in handles.iter().enumerate() {
        assert!(!handle.is_dirty());
        assert!(!handle.is_io_pending());
        assert_eq!(handle.ref_count(), 1);
        let stored = disk.stored(off(i as i64)).expect("page persisted");
        assert_eq!(blake3_hex(&stored), blake3_hex(&page_payload(i as i64, 0xD0)));
    }
    coordinator.shutdown();
}

#[test]
fn dirty_eviction_surfaces_old_dirty_and_prior_offset() {
    init_logging();
    let disk = SharedDisk::default();
    // One cell of three pages; no flush coordinator attached.
    let cache = build_cache(1, 3);

    let victim_payload = page_payload(0, 0xAA);
    {
        let handle = read_through(&cache, &disk, off(0));
        handle.fill(&victim_payload).expect("fill");
        handle.set_dirty(true);
    }
    // Two more offsets fill the cell; the fourth evicts the dirty page.
    for i in 1..3_i64 {
        let _ = read_through(&cache, &disk, off(i));
    }
    let fresh = read_through(&cache, &disk, off(3));
    assert_eq!(fresh.offset(), off(3));
    assert!(!fresh.is_old_dirty(), "read path settles the old-dirty state");

    // The evicted page's bytes were written back to its prior offset.
    let stored = disk.stored(off(0)).expect("old-dirty bytes persisted");
    assert_eq!(blake3_hex(&stored), blake3_hex(&victim_payload));
}

#[test]
fn sustained_writeback_drains_with_async_completions() {
    init_logging();
    let disk = SharedDisk::default();
    let cache = build_cache(4, 8);
    let io = DiskIo::new(disk.clone(), false);
    let coordinator = FlushCoordinator::start(
        &cache,
        Arc::clone(&io) as Arc<dyn PageIo>,
        FlushConfig {
            max_pending_flush: 4,
            writeback_batch_pages: 4,
            dirty_pages_threshold: 2,
            ..FlushConfig::default()
        },
    )
    .expect("coordinator");
    io.set_target(&coordinator);

    let mut expected = HashMap::new();
    for i in 0..24_i64 {
        let handle = read_through(&cache, &disk, off(i));
        let payload = page_payload(i, 0xB0 ^ (i as u8));
        handle.fill(&payload).expect("fill");
        handle.set_dirty(true);
        expected.insert(i, blake3_hex(&payload));
        cache.mark_dirty_pages(std::slice::from_ref(&handle));
    }

    wait_for_drain(&cache, &coordinator, Duration::from_secs(5));
    for (i, checksum) in expected {
        let stored = disk.stored(off(i)).expect("page persisted");
        assert_eq!(blake3_hex(&stored), checksum, "page {i} content drifted");
    }
    coordinator.shutdown();
}

#[test]
fn concurrent_readers_park_requests_on_a_not_ready_page() {
    init_logging();
    let disk = SharedDisk::default();
    disk.write_page(off(5), &page_payload(5, 0x77));
    let cache = build_cache(2, 4);

    // First reader misses and holds the page before data arrives.
    let pending = cache.search(off(5));
    assert!(!pending.is_data_ready());
    pending.set_io_pending(true);

    // A second reader finds the same page not ready and parks its request.
    let other = cache.search(off(5));
    assert!(other.same_page(&pending));
    assert!(!other.is_data_ready());
    other.enqueue_waiter(IoRequest::new(
        off(5),
        grist_cache::IoDirection::Read,
        vec![other.clone()],
        false,
    ));

    // The read completes: fill, settle flags, hand parked requests back.
    pending.fill(&disk.read_page(off(5))).expect("fill");
    pending.set_io_pending(false);
    pending.set_data_ready(true);
    let waiters = pending.take_waiters();
    assert_eq!(waiters.len(), 1);
    for request in waiters {
        for page in request.pages() {
            assert!(page.is_data_ready());
        }
    }
    other.with_data(|data| {
        assert_eq!(blake3_hex(data), blake3_hex(&page_payload(5, 0x77)));
    });
}
