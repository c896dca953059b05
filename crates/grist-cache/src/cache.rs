//! The set-associative page cache with linear-hashing growth.
//!
//! The table is an outer vector of fixed-size inner arrays of
//! [`HashCell`]s. A read/write lock guards only the *shape* of the table
//! (publishing arrays, moving the `(level, split)` boundary); individual
//! cells carry their own locks. Cell resolution clones the inner array's
//! `Arc` under the read lock and drops the lock before touching the cell,
//! so no cell operation ever runs under the shape lock and a page handle
//! stays valid across any concurrent expand or shrink.
//!
//! Expansion and shrinkage are cooperative: a single-bit `TABLE_EXPANDING`
//! flag serializes them to one thread, and splits move one cell at a time
//! in Litwin's linear-hashing fashion, tracked by `(level, split)`.

use crate::buffer::AlignedBuf;
use crate::cell::HashCell;
use crate::config::CacheConfig;
use crate::flush::FlushCoordinator;
use crate::memory::{CacheReclaim, MemoryManager};
use crate::page::{flags, PageHandle};
use crate::stats::{CacheStats, StatsSnapshot};
use grist_error::{CacheError, Result};
use grist_types::{NodeId, PageOffset};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

type CellArray = Arc<Vec<HashCell>>;

/// Stable reference to one cell: the owning inner array plus a slot index.
/// Cells never move once allocated, and the `Arc` keeps the array alive
/// even after a shrink retires it from the table.
#[derive(Debug, Clone)]
pub(crate) struct CellRef {
    array: CellArray,
    slot: usize,
}

impl CellRef {
    pub(crate) fn cell(&self) -> &HashCell {
        &self.array[self.slot]
    }
}

/// Point-in-time table geometry, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableShape {
    pub level: u32,
    pub split: usize,
    pub ncells: usize,
    pub npages: usize,
}

/// Concurrent set-associative page cache.
pub struct AssociativeCache {
    config: CacheConfig,
    init_ncells: usize,
    table: RwLock<Vec<Option<CellArray>>>,
    /// Linear-hashing state; written only under the shape write lock.
    level: AtomicU32,
    split: AtomicUsize,
    /// Single-writer discipline for expand/shrink.
    expanding: AtomicBool,
    /// Persistent deposit/steal cursor shared by expand and shrink.
    expand_cursor: AtomicUsize,
    /// Per-cell fill target the deposit walk tops cells up to.
    height: AtomicUsize,
    npages: AtomicUsize,
    manager: Arc<MemoryManager>,
    registration: AtomicU64,
    flush: Mutex<Option<Arc<FlushCoordinator>>>,
    stats: Arc<CacheStats>,
}

impl AssociativeCache {
    /// Build a cache from a validated config, drawing buffers from
    /// `manager`. An expandable cache starts at the initial size and grows
    /// toward `cache_size` before returning.
    pub fn new(config: CacheConfig, manager: Arc<MemoryManager>) -> Result<Arc<Self>> {
        Self::with_stats(config, manager, Arc::new(CacheStats::default()))
    }

    /// As [`Self::new`], with an injected diagnostics sink.
    pub fn with_stats(
        config: CacheConfig,
        manager: Arc<MemoryManager>,
        stats: Arc<CacheStats>,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let init_npages = config.init_npages();
        let init_ncells = config.resolved_init_ncells();

        let per_cell = init_npages / init_ncells;
        let remainder = init_npages % init_ncells;
        if per_cell < config.min_cell_size {
            return Err(CacheError::Config(format!(
                "initial pages per cell ({per_cell}) below min_cell_size ({})",
                config.min_cell_size
            )));
        }
        if per_cell + usize::from(remainder > 0) > config.cell_max {
            return Err(CacheError::Config(format!(
                "initial pages per cell ({}) above cell_max ({})",
                per_cell + 1,
                config.cell_max
            )));
        }

        let mut bufs = manager.get_free_pages(init_npages).ok_or_else(|| {
            CacheError::OutOfMemory {
                requested: init_npages,
                available: manager.available_pages(),
            }
        })?;

        let cells: Vec<HashCell> = (0..init_ncells)
            .map(|i| HashCell::new(config.cell_max, config.eviction, i as u64))
            .collect();
        for (i, cell) in cells.iter().enumerate() {
            let take = per_cell + usize::from(i < remainder);
            let chunk: Vec<AlignedBuf> = bufs.drain(..take).collect();
            cell.populate(chunk, config.node);
        }
        debug_assert!(bufs.is_empty());

        let max_ncells = (manager.get_max_size() / config.page_size.get() / config.min_cell_size)
            .max(init_ncells);
        let max_arrays = (max_ncells / init_ncells).next_power_of_two().max(1);
        let mut table: Vec<Option<CellArray>> = Vec::with_capacity(max_arrays);
        table.push(Some(Arc::new(cells)));
        table.resize_with(max_arrays, || None);

        let target_npages = config.page_size.bytes_to_pages(config.cache_size);
        let node = config.node;
        let min_cell_size = config.min_cell_size;
        let expandable = config.expandable;

        let cache = Arc::new(Self {
            config,
            init_ncells,
            table: RwLock::new(table),
            level: AtomicU32::new(0),
            split: AtomicUsize::new(0),
            expanding: AtomicBool::new(false),
            expand_cursor: AtomicUsize::new(0),
            height: AtomicUsize::new(min_cell_size),
            npages: AtomicUsize::new(init_npages),
            manager: Arc::clone(&manager),
            registration: AtomicU64::new(0),
            flush: Mutex::new(None),
            stats,
        });
        let cache_dyn: Arc<dyn CacheReclaim> = Arc::clone(&cache) as Arc<dyn CacheReclaim>;
        let weak: Weak<dyn CacheReclaim> = Arc::downgrade(&cache_dyn);
        let token = manager.register_cache(weak);
        cache.registration.store(token, Ordering::SeqCst);

        info!(
            event = "cache_created",
            node = node.0,
            init_npages,
            init_ncells,
            target_npages,
            expandable
        );

        if expandable && target_npages > init_npages {
            let _ = cache.expand(target_npages - init_npages)?;
        }
        Ok(cache)
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.config.page_size.get()
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.config.node
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<MemoryManager> {
        &self.manager
    }

    pub(crate) fn stats_handle(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Pages currently owned by the cache.
    #[must_use]
    pub fn cache_npages(&self) -> usize {
        self.npages.load(Ordering::SeqCst)
    }

    /// Logical number of cells: `2^level * init_ncells + split`.
    #[must_use]
    pub fn ncells(&self) -> usize {
        let level = self.level.load(Ordering::SeqCst);
        let split = self.split.load(Ordering::SeqCst);
        ((self.init_ncells) << level) + split
    }

    #[must_use]
    pub fn shape(&self) -> TableShape {
        TableShape {
            level: self.level.load(Ordering::SeqCst),
            split: self.split.load(Ordering::SeqCst),
            ncells: self.ncells(),
            npages: self.cache_npages(),
        }
    }

    fn hash_key(&self, off: PageOffset) -> u64 {
        let index = off
            .page_index(self.config.page_size.get())
            .expect("hash of a valid offset");
        index.wrapping_mul(self.config.offset_factor)
    }

    /// Route an offset to its logical cell index under the current
    /// `(level, split)` boundary.
    fn route(&self, off: PageOffset) -> usize {
        let key = self.hash_key(off);
        let level = self.level.load(Ordering::SeqCst);
        let split = self.split.load(Ordering::SeqCst);
        let ncells_base = (self.init_ncells as u64) << level;
        let mut idx = key % ncells_base;
        if (idx as usize) < split {
            // The cell was already split; use the next-level hash.
            idx = key % (ncells_base << 1);
        }
        idx as usize
    }

    /// Resolve a logical cell index to a stable cell reference.
    pub(crate) fn cell_at(&self, idx: usize) -> Option<CellRef> {
        let table = self.table.read();
        let array = table.get(idx / self.init_ncells)?.as_ref()?;
        Some(CellRef {
            array: Arc::clone(array),
            slot: idx % self.init_ncells,
        })
    }

    /// Route and resolve in one step, retrying across shape changes.
    pub(crate) fn cell_for_offset(&self, off: PageOffset) -> CellRef {
        loop {
            let idx = self.route(off);
            if let Some(cellref) = self.cell_at(idx) {
                return cellref;
            }
            // Raced a concurrent unsplit; the fresh route resolves.
            std::thread::yield_now();
        }
    }

    /// Look up `off`, evicting a victim on miss.
    ///
    /// The returned handle holds a reference; on a miss its `DATA_READY`
    /// is clear and the caller is responsible for issuing the read.
    pub fn search(&self, off: PageOffset) -> PageHandle {
        self.search_with_victim(off).0
    }

    /// As [`Self::search`], also reporting the offset the victim page held
    /// before it was recycled (`None` on a hit, [`PageOffset::INVALID`] for
    /// a never-used slot). A caller seeing `OLD_DIRTY` on the handle must
    /// flush the buffer to that prior offset before overwriting it.
    pub fn search_with_victim(&self, off: PageOffset) -> (PageHandle, Option<PageOffset>) {
        debug_assert!(off.is_valid());
        self.stats.record_access();
        let cellref = self.cell_for_offset(off);
        let (handle, prev) = cellref.cell().search_or_insert(off, &self.stats);
        match prev {
            None => self.stats.record_hit(),
            Some(_) => self.stats.record_eviction(),
        }
        (handle, prev)
    }

    /// Read-only lookup: a hit increments refcount and hit counter; a miss
    /// changes nothing and returns `None`.
    pub fn probe(&self, off: PageOffset) -> Option<PageHandle> {
        debug_assert!(off.is_valid());
        self.stats.record_access();
        let cellref = self.cell_for_offset(off);
        let found = cellref.cell().search(off);
        if found.is_some() {
            self.stats.record_hit();
        }
        found
    }

    /// Forward freshly dirtied pages to the flush coordinator, if one is
    /// attached. Infallible from the caller's perspective.
    pub fn mark_dirty_pages(&self, pages: &[PageHandle]) {
        let flush = self.flush.lock().clone();
        if let Some(flush) = flush {
            flush.flush_dirty_pages(pages);
        }
    }

    pub(crate) fn attach_flush(&self, coordinator: &Arc<FlushCoordinator>) {
        *self.flush.lock() = Some(Arc::clone(coordinator));
    }

    /// The attached flush coordinator, if any.
    #[must_use]
    pub fn flush_coordinator(&self) -> Option<Arc<FlushCoordinator>> {
        self.flush.lock().clone()
    }

    /// Grow the cache by `npages`.
    ///
    /// Returns the number of pages actually added. Returns `Ok(0)` when
    /// another thread already owns the table shape; surfaces
    /// [`CacheError::OutOfMemory`] when the memory manager denies the
    /// buffers, leaving the cache usable at its current size.
    pub fn expand(&self, npages: usize) -> Result<usize> {
        if npages == 0 {
            return Ok(0);
        }
        if self.expanding.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let result = self.expand_locked(npages);
        self.expanding.store(false, Ordering::SeqCst);
        result
    }

    fn expand_locked(&self, npages: usize) -> Result<usize> {
        let min = self.config.min_cell_size;
        let cell_max = self.config.cell_max;
        let node = self.config.node;
        let mut bufs =
            self.manager
                .get_free_pages(npages)
                .ok_or_else(|| CacheError::OutOfMemory {
                    requested: npages,
                    available: self.manager.available_pages(),
                })?;

        let mut deposited = 0_usize;
        let mut expand_over = false;
        while !bufs.is_empty() && !expand_over {
            if self.split.load(Ordering::SeqCst) == 0 {
                deposited += self.deposit_pass(&mut bufs, node)?;
                if bufs.is_empty() {
                    break;
                }
                // Every cell holds at least `height` pages. Split the table
                // if it can still double and the remaining buffers cover the
                // worst-case top-up (one minimum per pair); otherwise raise
                // the fill target and sweep again.
                let num_half = self.init_ncells << self.level.load(Ordering::SeqCst);
                let can_split = bufs.len() >= num_half * min && self.publish_doubled_table();
                if !can_split {
                    let height = self.height.load(Ordering::SeqCst);
                    if height >= cell_max {
                        break;
                    }
                    self.height.store(height + 1, Ordering::SeqCst);
                    continue;
                }
            }
            expand_over = self.split_pass(&mut bufs, &mut deposited, min, node)?;
        }

        if !bufs.is_empty() {
            self.manager.free_pages(bufs);
        }
        self.npages.fetch_add(deposited, Ordering::SeqCst);
        self.stats.record_expansion();
        let shape = self.shape();
        info!(
            event = "cache_expand",
            requested = npages,
            deposited,
            level = shape.level,
            split = shape.split,
            ncells = shape.ncells,
            npages = shape.npages,
            aborted = expand_over
        );
        Ok(deposited)
    }

    /// One cursor sweep depositing buffers into cells below the current
    /// fill target.
    fn deposit_pass(&self, bufs: &mut Vec<AlignedBuf>, node: NodeId) -> Result<usize> {
        let ncells = self.ncells();
        let height = self
            .height
            .load(Ordering::SeqCst)
            .clamp(self.config.min_cell_size, self.config.cell_max);
        let mut deposited = 0_usize;
        for _ in 0..ncells {
            if bufs.is_empty() {
                break;
            }
            let cursor = self.expand_cursor.load(Ordering::SeqCst) % ncells;
            self.expand_cursor
                .store((cursor + 1) % ncells, Ordering::SeqCst);
            let Some(cellref) = self.cell_at(cursor) else {
                continue;
            };
            let have = cellref.cell().num_pages();
            if have < height {
                let take = (height - have).min(bufs.len());
                let chunk: Vec<AlignedBuf> = bufs.drain(..take).collect();
                cellref.cell().add_pages(chunk, node)?;
                deposited += take;
            }
        }
        Ok(deposited)
    }

    /// Publish a new generation of inner arrays, doubling the table.
    /// Returns false when the table is already at its maximum size.
    fn publish_doubled_table(&self) -> bool {
        let level = self.level.load(Ordering::SeqCst);
        let narrays = 1_usize << level;
        let mut table = self.table.write();
        if narrays * 2 > table.len() {
            return false;
        }
        for array_idx in narrays..narrays * 2 {
            let base = array_idx * self.init_ncells;
            let cells: Vec<HashCell> = (0..self.init_ncells)
                .map(|j| {
                    HashCell::new(self.config.cell_max, self.config.eviction, (base + j) as u64)
                })
                .collect();
            table[array_idx] = Some(Arc::new(cells));
        }
        debug!(event = "cache_table_doubled", level, narrays = narrays * 2);
        true
    }

    /// Walk the split boundary across the lower half, rehashing each cell
    /// into its expanded twin and topping both halves up to the minimum.
    ///
    /// Returns true when the split was abandoned (a half could not reach
    /// the minimum and the pair was merged back).
    fn split_pass(
        &self,
        bufs: &mut Vec<AlignedBuf>,
        deposited: &mut usize,
        min: usize,
        node: NodeId,
    ) -> Result<bool> {
        let level = self.level.load(Ordering::SeqCst);
        let num_half = self.init_ncells << level;
        let next_ncells = (num_half as u64) * 2;
        let page_size = self.config.page_size.get();
        let factor = self.config.offset_factor;

        loop {
            let split = self.split.load(Ordering::SeqCst);
            if split >= num_half {
                break;
            }
            let low = self
                .cell_at(split)
                .expect("split cell resolves during expand");
            let high = self
                .cell_at(split + num_half)
                .expect("expanded twin resolves during expand");
            low.cell().rehash(
                high.cell(),
                |off| {
                    off.page_index(page_size)
                        .map(|index| index.wrapping_mul(factor) % next_ncells)
                },
                min,
            );

            let shortfall = min.saturating_sub(low.cell().num_pages())
                + min.saturating_sub(high.cell().num_pages());
            if shortfall <= bufs.len() {
                *deposited += low.cell().add_pages_to_min(bufs, min, node)?;
                *deposited += high.cell().add_pages_to_min(bufs, min, node)?;
            }

            if low.cell().num_pages() < min || high.cell().num_pages() < min {
                // Adversarial offsets: a viable split is impossible. Merge
                // the halves back, reset the fill target, and stop.
                low.cell().merge(high.cell());
                self.height.store(min, Ordering::SeqCst);
                self.stats.record_merged_back();
                warn!(event = "cache_split_merge_back", cell = split);
                return Ok(true);
            }

            {
                let _shape = self.table.write();
                self.split.store(split + 1, Ordering::SeqCst);
            }
        }

        {
            let _shape = self.table.write();
            if self.split.load(Ordering::SeqCst) >= num_half {
                self.split.store(0, Ordering::SeqCst);
                self.level.store(level + 1, Ordering::SeqCst);
            }
        }
        self.height.store(min + 1, Ordering::SeqCst);
        self.expand_cursor.store(0, Ordering::SeqCst);
        Ok(false)
    }

    /// Hand back up to `npages` clean page buffers, shrinking the table
    /// when stealing from over-filled cells is not enough.
    ///
    /// Returns the surrendered buffers; empty when another thread owns the
    /// table shape. Surviving cells keep at least `min_cell_size` pages.
    #[must_use]
    pub fn shrink(&self, npages: usize) -> Vec<AlignedBuf> {
        if npages == 0 {
            return Vec::new();
        }
        if self.expanding.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let out = self.shrink_locked(npages);
        self.expanding.store(false, Ordering::SeqCst);
        out
    }

    fn shrink_locked(&self, npages: usize) -> Vec<AlignedBuf> {
        let min = self.config.min_cell_size;
        let mut out: Vec<AlignedBuf> = Vec::new();

        'outer: while out.len() < npages {
            if self.split.load(Ordering::SeqCst) == 0 {
                // Steal pass: walk the reverse cursor, lowering the fill
                // target down to the floor.
                loop {
                    let height = self.height.load(Ordering::SeqCst).max(min);
                    let ncells = self.ncells();
                    let mut progressed = false;
                    for _ in 0..ncells {
                        if out.len() >= npages {
                            break 'outer;
                        }
                        let cursor = self.expand_cursor.load(Ordering::SeqCst) % ncells;
                        let prev = if cursor == 0 { ncells - 1 } else { cursor - 1 };
                        self.expand_cursor.store(prev, Ordering::SeqCst);
                        let Some(cellref) = self.cell_at(cursor) else {
                            continue;
                        };
                        let have = cellref.cell().num_pages();
                        if have > height {
                            let take = (have - height).min(npages - out.len());
                            let stolen = cellref.cell().steal_buffers(take);
                            if !stolen.is_empty() {
                                progressed = true;
                            }
                            out.extend(stolen);
                        }
                    }
                    if height > min {
                        self.height.store(height - 1, Ordering::SeqCst);
                    } else if !progressed {
                        break;
                    }
                }
            }

            // Nothing left above the floor: fold one level of the table.
            if self.level.load(Ordering::SeqCst) == 0 && self.split.load(Ordering::SeqCst) == 0 {
                break;
            }
            self.unsplit_level();
        }

        self.npages.fetch_sub(out.len(), Ordering::SeqCst);
        self.stats.record_shrink();
        let shape = self.shape();
        info!(
            event = "cache_shrink",
            requested = npages,
            stolen = out.len(),
            level = shape.level,
            split = shape.split,
            npages = shape.npages
        );
        out
    }

    /// Merge every upper cell back into its lower twin and retire the
    /// upper arrays.
    fn unsplit_level(&self) {
        let level = self.level.load(Ordering::SeqCst);
        debug_assert!(level > 0 || self.split.load(Ordering::SeqCst) > 0);
        if self.split.load(Ordering::SeqCst) == 0 {
            let num_half = self.init_ncells << (level - 1);
            {
                let _shape = self.table.write();
                self.level.store(level - 1, Ordering::SeqCst);
                self.split.store(num_half - 1, Ordering::SeqCst);
            }
        }
        let level = self.level.load(Ordering::SeqCst);
        let num_half = self.init_ncells << level;

        loop {
            let split = self.split.load(Ordering::SeqCst);
            let low = self.cell_at(split).expect("merge target resolves");
            let high = self
                .cell_at(split + num_half)
                .expect("merge source resolves");
            low.cell().merge(high.cell());
            if split == 0 {
                break;
            }
            let _shape = self.table.write();
            self.split.store(split - 1, Ordering::SeqCst);
        }

        {
            let mut table = self.table.write();
            let keep = 1_usize << level;
            for slot in table.iter_mut().skip(keep) {
                *slot = None;
            }
        }
        self.expand_cursor.store(0, Ordering::SeqCst);
        debug!(event = "cache_table_folded", level, ncells = num_half);
    }

    /// Sum of pages across all cells. Consistent with the shape at the
    /// moment of the call; concurrent searches do not move pages.
    #[must_use]
    pub fn get_num_used_pages(&self) -> usize {
        let table = self.table.read();
        let ncells = self.ncells();
        let mut total = 0_usize;
        for idx in 0..ncells {
            if let Some(array) = table.get(idx / self.init_ncells).and_then(Option::as_ref) {
                total += array[idx % self.init_ncells].num_pages();
            }
        }
        total
    }

    /// Dirty-page count across all cells. A racy snapshot hint: cells are
    /// visited one at a time and a concurrent flush may clean pages
    /// mid-walk.
    #[must_use]
    pub fn get_num_dirty_pages(&self) -> usize {
        let table = self.table.read();
        let ncells = self.ncells();
        let mut total = 0_usize;
        for idx in 0..ncells {
            if let Some(array) = table.get(idx / self.init_ncells).and_then(Option::as_ref) {
                total += array[idx % self.init_ncells].num_pages_flagged(flags::DIRTY, 0);
            }
        }
        total
    }

    /// Verify per-cell invariants and the global page accounting.
    ///
    /// Cells that were created for a split but never populated are skipped;
    /// everything else must satisfy the dense-map and floor invariants.
    pub fn sanity_check(&self) -> Result<()> {
        let min = self.config.min_cell_size;
        let mut total = 0_usize;
        {
            let table = self.table.read();
            let ncells = self.ncells();
            for idx in 0..ncells {
                let Some(array) = table.get(idx / self.init_ncells).and_then(Option::as_ref)
                else {
                    continue;
                };
                let cell = &array[idx % self.init_ncells];
                let num = cell.num_pages();
                if num == 0 {
                    continue;
                }
                total += num;
                cell.sanity_check(min)?;
                if num > self.config.cell_max {
                    return Err(CacheError::InvalidOperation(format!(
                        "cell {idx} above cell_max: {num}"
                    )));
                }
            }
        }
        let accounted = self.cache_npages();
        if total != accounted {
            return Err(CacheError::InvalidOperation(format!(
                "page accounting drift: cells hold {total}, counter says {accounted}"
            )));
        }
        Ok(())
    }

    /// Aggregate per-cell access/eviction counters.
    #[must_use]
    pub fn cell_counters(&self) -> (u64, u64) {
        let table = self.table.read();
        let ncells = self.ncells();
        let mut accesses = 0_u64;
        let mut evictions = 0_u64;
        for idx in 0..ncells {
            if let Some(array) = table.get(idx / self.init_ncells).and_then(Option::as_ref) {
                let (a, e) = array[idx % self.init_ncells].counters();
                accesses += a;
                evictions += e;
            }
        }
        (accesses, evictions)
    }

    #[cfg(test)]
    pub(crate) fn assert_no_page_in_two_cells(&self) {
        use std::collections::HashSet;
        let table = self.table.read();
        let mut seen: HashSet<usize> = HashSet::new();
        for array in table.iter().flatten() {
            for cell in array.iter() {
                cell.for_each_page(|page| {
                    let key = Arc::as_ptr(page) as usize;
                    assert!(seen.insert(key), "page present in two cells");
                });
            }
        }
    }
}

impl CacheReclaim for AssociativeCache {
    fn reclaim(&self, npages: usize) -> Vec<AlignedBuf> {
        self.shrink(npages)
    }
}

impl Drop for AssociativeCache {
    fn drop(&mut self) {
        self.manager
            .unregister_cache(self.registration.load(Ordering::SeqCst));
    }
}

impl std::fmt::Debug for AssociativeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = self.shape();
        f.debug_struct("AssociativeCache")
            .field("node", &self.config.node)
            .field("level", &shape.level)
            .field("split", &shape.split)
            .field("ncells", &shape.ncells)
            .field("npages", &shape.npages)
            .finish_non_exhaustive()
    }
}
