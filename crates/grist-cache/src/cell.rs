//! Cache cells: fixed-capacity page arrays and their guarded wrappers.
//!
//! [`PageCell`] is the raw slot array with a compact index map so clients
//! can iterate a dense prefix even after sparse removal. [`HashCell`] wraps
//! one `PageCell` and its eviction policy behind an adaptive spinlock and
//! implements the search / insert / merge / rehash operations the table
//! builds on. All page mutations inside a cell happen under that lock.

use crate::buffer::AlignedBuf;
use crate::page::{Page, PageHandle};
use crate::policy::EvictionPolicy;
use crate::stats::CacheStats;
use grist_error::{CacheError, Result};
use grist_types::{NodeId, PageOffset};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Fixed-capacity array of pages with a compaction map.
///
/// `maps` is strictly increasing and covers exactly the occupied slots, so
/// dense index `i` (for `i < num_pages`) always resolves to a live page.
pub(crate) struct PageCell {
    slots: Box<[Option<Arc<Page>>]>,
    maps: Vec<u8>,
    num_pages: usize,
    /// Scratch cursor for round-robin walks (FIFO eviction).
    idx: usize,
}

impl PageCell {
    pub(crate) fn new(cell_max: usize) -> Self {
        Self {
            slots: vec![None; cell_max].into_boxed_slice(),
            maps: Vec::with_capacity(cell_max),
            num_pages: 0,
            idx: 0,
        }
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub(crate) fn num_pages(&self) -> usize {
        self.num_pages
    }

    #[must_use]
    pub(crate) fn cursor(&self) -> usize {
        self.idx
    }

    /// Page at dense position `pos` (`pos < num_pages`).
    #[must_use]
    pub(crate) fn get_page(&self, pos: usize) -> &Arc<Page> {
        let slot = self.maps[pos] as usize;
        self.slots[slot].as_ref().expect("mapped slot is occupied")
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Page>> + '_ {
        self.maps
            .iter()
            .map(move |&slot| self.slots[slot as usize].as_ref().expect("mapped slot is occupied"))
    }

    /// Initial population from raw buffers.
    pub(crate) fn set_pages(&mut self, bufs: Vec<AlignedBuf>, node: NodeId) {
        debug_assert_eq!(self.num_pages, 0);
        debug_assert!(bufs.len() <= self.capacity());
        for (slot, buf) in bufs.into_iter().enumerate() {
            self.slots[slot] = Some(Page::new(buf, node));
        }
        self.idx = 0;
        self.rebuild_map();
    }

    /// Grow the cell with fresh buffers.
    pub(crate) fn add_pages(&mut self, bufs: Vec<AlignedBuf>, node: NodeId) -> Result<()> {
        if self.num_pages + bufs.len() > self.capacity() {
            return Err(CacheError::InvalidOperation(format!(
                "add_pages past cell capacity: have={} adding={} cap={}",
                self.num_pages,
                bufs.len(),
                self.capacity()
            )));
        }
        let mut bufs = bufs.into_iter();
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                match bufs.next() {
                    Some(buf) => *slot = Some(Page::new(buf, node)),
                    None => break,
                }
            }
        }
        debug_assert!(bufs.next().is_none());
        self.rebuild_map();
        Ok(())
    }

    /// Bulk move of whole page records into this cell.
    pub(crate) fn inject_pages(&mut self, pages: Vec<Arc<Page>>) {
        debug_assert!(self.num_pages + pages.len() <= self.capacity());
        let mut pages = pages.into_iter();
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                match pages.next() {
                    Some(page) => *slot = Some(page),
                    None => break,
                }
            }
        }
        debug_assert!(pages.next().is_none(), "inject_pages past cell capacity");
        self.rebuild_map();
    }

    /// Remove specific page records (matched by identity) from the cell.
    pub(crate) fn remove_pages(&mut self, pages: &[Arc<Page>]) {
        for target in pages {
            for slot in self.slots.iter_mut() {
                let matches = slot
                    .as_ref()
                    .is_some_and(|page| Arc::ptr_eq(page, target));
                if matches {
                    *slot = None;
                    break;
                }
            }
        }
        self.rebuild_map();
    }

    /// Take out every page record that is currently unreferenced.
    pub(crate) fn take_unreferenced(&mut self) -> Vec<Arc<Page>> {
        let mut taken = Vec::new();
        for slot in self.slots.iter_mut() {
            let free = slot.as_ref().is_some_and(|page| page.ref_count() == 0);
            if free {
                if let Some(page) = slot.take() {
                    taken.push(page);
                }
            }
        }
        self.rebuild_map();
        taken
    }

    /// Recompute the dense map after sparse removal.
    pub(crate) fn rebuild_map(&mut self) {
        self.maps.clear();
        for (slot, page) in self.slots.iter().enumerate() {
            if page.is_some() {
                self.maps.push(slot as u8);
            }
        }
        self.num_pages = self.maps.len();
    }

    /// Dense position of `page`, if present.
    #[must_use]
    pub(crate) fn position_of(&self, page: &Arc<Page>) -> Option<usize> {
        self.iter().position(|candidate| Arc::ptr_eq(candidate, page))
    }

    /// Dense position of the page holding `off`, if any.
    #[must_use]
    pub(crate) fn find(&self, off: PageOffset) -> Option<usize> {
        self.iter().position(|page| page.offset() == off)
    }

    /// Next page in round-robin order, advancing the scratch cursor.
    pub(crate) fn next_round_robin(&mut self) -> Arc<Page> {
        debug_assert!(self.num_pages > 0);
        let pos = self.idx % self.num_pages;
        self.idx = self.idx.wrapping_add(1);
        Arc::clone(self.get_page(pos))
    }

    /// Halve every page's hit counter; called when one saturates.
    pub(crate) fn scale_down_hits(&self) {
        for page in self.iter() {
            page.scale_down_hits();
        }
    }

    /// Verify the dense-map invariant and the cell floor.
    pub(crate) fn sanity_check(&self, min_cell_size: usize) -> Result<()> {
        if self.num_pages < min_cell_size {
            return Err(CacheError::InvalidOperation(format!(
                "cell below minimum: {} < {min_cell_size}",
                self.num_pages
            )));
        }
        let occupied = self.slots.iter().filter(|slot| slot.is_some()).count();
        if occupied != self.num_pages || self.maps.len() != self.num_pages {
            return Err(CacheError::InvalidOperation(format!(
                "dense map out of sync: occupied={occupied} num_pages={} maps={}",
                self.num_pages,
                self.maps.len()
            )));
        }
        let mut prev: Option<u8> = None;
        for &slot in &self.maps {
            if self.slots[slot as usize].is_none() {
                return Err(CacheError::InvalidOperation(format!(
                    "map points at empty slot {slot}"
                )));
            }
            if let Some(prev_slot) = prev {
                if slot <= prev_slot {
                    return Err(CacheError::InvalidOperation(
                        "map is not strictly increasing".to_owned(),
                    ));
                }
            }
            prev = Some(slot);
        }
        Ok(())
    }
}

impl std::fmt::Debug for PageCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCell")
            .field("num_pages", &self.num_pages)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub(crate) struct CellInner {
    pub(crate) buf: PageCell,
    policy: EvictionPolicy,
    num_accesses: u64,
    num_evictions: u64,
}

/// One bucket of the set-associative table: a guarded page cell plus its
/// eviction policy and flush-queue bookkeeping.
#[derive(Debug)]
pub(crate) struct HashCell {
    inner: Mutex<CellInner>,
    /// Logical index in the linear-hashing table.
    index: AtomicU64,
    /// True while the cell sits in the flush coordinator's dirty queue.
    in_queue: AtomicBool,
}

impl HashCell {
    pub(crate) fn new(cell_max: usize, kind: crate::config::EvictionKind, index: u64) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                buf: PageCell::new(cell_max),
                policy: EvictionPolicy::new(kind),
                num_accesses: 0,
                num_evictions: 0,
            }),
            index: AtomicU64::new(index),
            in_queue: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub(crate) fn index(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    /// Mark the cell as queued for flushing. Returns the previous value,
    /// so a false return means this caller owns the enqueue.
    pub(crate) fn set_in_queue(&self, queued: bool) -> bool {
        self.in_queue.swap(queued, Ordering::SeqCst)
    }

    #[must_use]
    pub(crate) fn is_in_queue(&self) -> bool {
        self.in_queue.load(Ordering::SeqCst)
    }

    pub(crate) fn populate(&self, bufs: Vec<AlignedBuf>, node: NodeId) {
        self.inner.lock().buf.set_pages(bufs, node);
    }

    pub(crate) fn add_pages(&self, bufs: Vec<AlignedBuf>, node: NodeId) -> Result<()> {
        self.inner.lock().buf.add_pages(bufs, node)
    }

    /// Top the cell up to `min` pages, drawing from the front of `bufs`.
    /// Returns the number of buffers consumed.
    pub(crate) fn add_pages_to_min(
        &self,
        bufs: &mut Vec<AlignedBuf>,
        min: usize,
        node: NodeId,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let have = inner.buf.num_pages();
        if have >= min {
            return Ok(0);
        }
        let take = (min - have).min(bufs.len());
        if take == 0 {
            return Ok(0);
        }
        let taken: Vec<AlignedBuf> = bufs.drain(..take).collect();
        inner.buf.add_pages(taken, node)?;
        Ok(take)
    }

    #[must_use]
    pub(crate) fn num_pages(&self) -> usize {
        self.inner.lock().buf.num_pages()
    }

    #[must_use]
    pub(crate) fn counters(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.num_accesses, inner.num_evictions)
    }

    /// Read-only lookup: scan for `off`, increment refcount and hit counter
    /// on success, never evict.
    pub(crate) fn search(&self, off: PageOffset) -> Option<PageHandle> {
        let mut inner = self.inner.lock();
        inner.num_accesses += 1;
        let pos = inner.buf.find(off)?;
        if inner.buf.get_page(pos).hits() == u8::MAX {
            inner.buf.scale_down_hits();
        }
        let page = Arc::clone(inner.buf.get_page(pos));
        let handle = PageHandle::acquire(&page);
        page.hit();
        Some(handle)
    }

    /// The core routine: return the page holding `off`, evicting a victim
    /// on miss.
    ///
    /// On a miss the returned second value is the victim's prior offset
    /// ([`PageOffset::INVALID`] for a never-used slot); `None` means a hit.
    /// When every page is referenced the cell releases its lock, waits for
    /// any refcount to drop, and retries.
    pub(crate) fn search_or_insert(
        &self,
        off: PageOffset,
        stats: &CacheStats,
    ) -> (PageHandle, Option<PageOffset>) {
        let mut inner = self.inner.lock();
        inner.num_accesses += 1;
        loop {
            if let Some(pos) = inner.buf.find(off) {
                if inner.buf.get_page(pos).hits() == u8::MAX {
                    inner.buf.scale_down_hits();
                }
                let page = Arc::clone(inner.buf.get_page(pos));
                let CellInner { buf, policy, .. } = &mut *inner;
                policy.access_page(&page, buf);
                let handle = PageHandle::acquire(&page);
                page.hit();
                return (handle, None);
            }

            let CellInner {
                buf,
                policy,
                num_evictions,
                ..
            } = &mut *inner;
            if let Some(victim) = policy.evict_page(buf) {
                *num_evictions += 1;
                debug_assert_eq!(victim.ref_count(), 0);
                debug_assert!(!victim.is_io_pending());
                victim.set_data_ready(false);
                // PREPARE_WRITEBACK is deliberately left alone: the page may
                // still sit in a flush queue and must not be submitted twice.
                // The flag clears when the queue entry settles.
                let _ = victim.promote_dirty_to_old();
                let prev = victim.offset();
                victim.set_offset(off);
                let handle = PageHandle::acquire(&victim);
                if victim.hits() == u8::MAX {
                    inner.buf.scale_down_hits();
                }
                victim.hit();
                return (handle, Some(prev));
            }

            // Every page referenced: release the lock so other threads can
            // finish with their handles, wait, then rescan from the top
            // (another thread may have inserted `off` meanwhile).
            drop(inner);
            stats.record_wait_unused();
            self.wait_any_unreferenced();
            inner = self.inner.lock();
        }
    }

    /// Spin until at least one page in the cell shows refcount zero.
    fn wait_any_unreferenced(&self) {
        let pages: Vec<Arc<Page>> = {
            let inner = self.inner.lock();
            inner.buf.iter().cloned().collect()
        };
        if pages.is_empty() {
            return;
        }
        let mut spins = 0_u32;
        loop {
            if pages.iter().any(|page| page.ref_count() == 0) {
                return;
            }
            spins = spins.saturating_add(1);
            if spins < 128 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Move every page from `other` into this cell.
    ///
    /// Locks are taken in increasing logical-index order; the combined page
    /// count must fit the cell. Pages still referenced in `other` are
    /// waited for with both locks released.
    pub(crate) fn merge(&self, other: &HashCell) {
        debug_assert!(
            self.index() < other.index(),
            "merge must lock cells in increasing index order"
        );
        loop {
            let mut low = self.inner.lock();
            let mut high = other.inner.lock();
            debug_assert!(
                low.buf.num_pages() + high.buf.num_pages() <= low.buf.capacity(),
                "merge would overflow the cell"
            );
            let moved = high.buf.take_unreferenced();
            low.buf.inject_pages(moved);
            if high.buf.num_pages() == 0 {
                return;
            }
            let busy: Vec<Arc<Page>> = high.buf.iter().cloned().collect();
            drop(high);
            drop(low);
            for page in busy {
                page.wait_unused();
            }
        }
    }

    /// Move pages that hash to `expanded` under the next-level hash.
    ///
    /// `next_index_of` maps a page offset to its next-level cell index
    /// (`None` for uninitialized slots). Pages that belong to neither half
    /// arrived mid-split; their hit counter is set to 1 so they evict
    /// early, but they stay accessible until then. Referenced pages are
    /// skipped. Afterwards, never-initialized pages cover the expanded
    /// twin's shortfall toward `min_cell_size`.
    pub(crate) fn rehash<F>(&self, expanded: &HashCell, next_index_of: F, min_cell_size: usize)
    where
        F: Fn(PageOffset) -> Option<u64>,
    {
        debug_assert!(self.index() < expanded.index());
        let mut low = self.inner.lock();
        let mut high = expanded.inner.lock();
        let self_index = self.index();
        let expanded_index = expanded.index();

        let mut moved: Vec<Arc<Page>> = Vec::new();
        for page in low.buf.iter() {
            let Some(target) = next_index_of(page.offset()) else {
                continue;
            };
            if target == expanded_index {
                if page.ref_count() == 0 {
                    moved.push(Arc::clone(page));
                }
                // A referenced page stays put; it becomes unreachable via
                // routing and falls out through eviction.
            } else if target != self_index {
                page.set_hits(1);
            }
        }
        if !moved.is_empty() {
            trace!(
                target: "grist::cache::cell",
                event = "rehash_move",
                from = self_index,
                to = expanded_index,
                pages = moved.len()
            );
            low.buf.remove_pages(&moved);
            high.buf.inject_pages(moved);
        }

        let shortfall = min_cell_size.saturating_sub(high.buf.num_pages());
        if shortfall > 0 {
            let mut empties: Vec<Arc<Page>> = Vec::new();
            for page in low.buf.iter() {
                if !page.is_initialized() && page.ref_count() == 0 {
                    empties.push(Arc::clone(page));
                    if empties.len() == shortfall {
                        break;
                    }
                }
            }
            if !empties.is_empty() {
                low.buf.remove_pages(&empties);
                high.buf.inject_pages(empties);
            }
        }
    }

    /// Surrender up to `max` clean, unreferenced page buffers.
    ///
    /// Never-initialized pages go first. Dirty, old-dirty, and in-flight
    /// pages are never surrendered.
    pub(crate) fn steal_buffers(&self, max: usize) -> Vec<AlignedBuf> {
        let mut inner = self.inner.lock();
        let mut victims: Vec<Arc<Page>> = Vec::new();
        for initialized_pass in [false, true] {
            for page in inner.buf.iter() {
                if victims.len() == max {
                    break;
                }
                if page.is_initialized() != initialized_pass {
                    continue;
                }
                let stealable = page.ref_count() == 0
                    && page.test_flags(
                        0,
                        crate::page::flags::DIRTY
                            | crate::page::flags::OLD_DIRTY
                            | crate::page::flags::IO_PENDING
                            | crate::page::flags::PREPARE_WRITEBACK,
                    )
                    && !victims.iter().any(|seen| Arc::ptr_eq(seen, page));
                if stealable {
                    victims.push(Arc::clone(page));
                }
            }
        }
        inner.buf.remove_pages(&victims);
        victims
            .into_iter()
            .filter_map(|page| page.take_buffer())
            .collect()
    }

    /// Count pages matching the flag constraints.
    #[must_use]
    pub(crate) fn num_pages_flagged(&self, set_mask: u8, clear_mask: u8) -> usize {
        let inner = self.inner.lock();
        inner
            .buf
            .iter()
            .filter(|page| page.test_flags(set_mask, clear_mask))
            .count()
    }

    /// Collect up to `want` pages matching the flag constraints, in scan
    /// order, taking a reference on each.
    #[must_use]
    pub(crate) fn get_pages(&self, want: usize, set_mask: u8, clear_mask: u8) -> Vec<PageHandle> {
        let inner = self.inner.lock();
        inner
            .buf
            .iter()
            .filter(|page| page.test_flags(set_mask, clear_mask))
            .take(want)
            .map(PageHandle::acquire)
            .collect()
    }

    /// Collect up to `want` pages next in eviction order matching the flag
    /// constraints, taking a reference on each. Side-effect-free on the
    /// policy state.
    #[must_use]
    pub(crate) fn predict_evicted_pages(
        &self,
        want: usize,
        set_mask: u8,
        clear_mask: u8,
    ) -> Vec<PageHandle> {
        let inner = self.inner.lock();
        inner
            .policy
            .predict_evicted_pages(&inner.buf, want, set_mask, clear_mask)
            .iter()
            .map(PageHandle::acquire)
            .collect()
    }

    pub(crate) fn sanity_check(&self, min_cell_size: usize) -> Result<()> {
        self.inner.lock().buf.sanity_check(min_cell_size)
    }

    /// Run `f` over every page under the cell lock.
    #[cfg(test)]
    pub(crate) fn for_each_page(&self, mut f: impl FnMut(&Arc<Page>)) {
        let inner = self.inner.lock();
        for page in inner.buf.iter() {
            f(page);
        }
    }
}
