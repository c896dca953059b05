//! Background dirty-page flushing.
//!
//! The coordinator keeps a FIFO of dirty cells (each cell enqueues itself
//! at most once, guarded by a CAS flag), batches dirty pages into
//! writeback requests with contiguous offsets fused together, and
//! rate-limits submissions against a pending-flush budget. Completions
//! arrive on I/O-thread context, settle page flags, release the flush
//! references, and wake the worker when the budget opens up again.

use crate::cache::{AssociativeCache, CellRef};
use crate::cell::HashCell;
use crate::config::{FlushConfig, FlushSelection};
use crate::io::{CompletionTarget, IoCompletion, IoDirection, IoRequest, PageIo};
use crate::page::{flags, PageHandle};
use crate::stats::CacheStats;
use grist_error::{CacheError, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

const IDLE_WAIT: Duration = Duration::from_millis(50);
const BUDGET_WAIT: Duration = Duration::from_millis(10);

/// Background agent that batches dirty pages into writeback requests.
pub struct FlushCoordinator {
    cache: Weak<AssociativeCache>,
    io: Arc<dyn PageIo>,
    config: FlushConfig,
    page_size: usize,
    queue: Mutex<VecDeque<CellRef>>,
    work_cv: Condvar,
    /// Pages currently under writeback.
    pending: AtomicUsize,
    stop: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<CacheStats>,
}

impl FlushCoordinator {
    /// Spawn the coordinator for `cache`, submitting writebacks through
    /// `io`, and attach it to the cache's write path.
    pub fn start(
        cache: &Arc<AssociativeCache>,
        io: Arc<dyn PageIo>,
        config: FlushConfig,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let coordinator = Arc::new(Self {
            cache: Arc::downgrade(cache),
            io,
            config,
            page_size: cache.page_size(),
            queue: Mutex::new(VecDeque::new()),
            work_cv: Condvar::new(),
            pending: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            worker: Mutex::new(None),
            stats: cache.stats_handle(),
        });
        let runner = Arc::clone(&coordinator);
        let handle = std::thread::Builder::new()
            .name("grist-flush".to_owned())
            .spawn(move || runner.worker_loop())
            .map_err(CacheError::from)?;
        *coordinator.worker.lock() = Some(handle);
        cache.attach_flush(&coordinator);
        Ok(coordinator)
    }

    /// Request shutdown and block until the worker exits after one final
    /// drain pass.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.work_cv.notify_all();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Pages currently under writeback.
    #[must_use]
    pub fn pending_flushes(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Dirty cells waiting to be drained.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Write-path hook: examine the cells behind freshly dirtied pages and
    /// either flush them immediately (budget permitting) or enqueue them.
    pub fn flush_dirty_pages(&self, pages: &[PageHandle]) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let skip_mask = flags::IO_PENDING | flags::PREPARE_WRITEBACK;
        let mut queued = false;
        for handle in pages {
            let off = handle.offset();
            if !off.is_valid() {
                continue;
            }
            let cellref = cache.cell_for_offset(off);
            // Only dirty pages not already on their way to disk count
            // toward the threshold.
            let flushable = cellref.cell().num_pages_flagged(flags::DIRTY, skip_mask);
            if flushable <= self.config.dirty_pages_threshold {
                continue;
            }
            if self.pending.load(Ordering::SeqCst) > self.config.max_pending_flush {
                queued |= self.enqueue(cellref);
            } else {
                let submitted = self.flush_cell(cellref.cell());
                if submitted == self.config.writeback_batch_pages
                    && flushable.saturating_sub(submitted) > self.config.dirty_pages_threshold
                {
                    // The cell filled a whole batch and still has work.
                    queued |= self.enqueue(cellref);
                }
            }
        }
        if queued {
            self.work_cv.notify_one();
        }
    }

    /// Enqueue a cell unless it is already queued. Returns true if this
    /// call performed the enqueue.
    fn enqueue(&self, cellref: CellRef) -> bool {
        if cellref.cell().set_in_queue(true) {
            return false;
        }
        self.queue.lock().push_back(cellref);
        true
    }

    /// Drain the dirty-cell queue in batches until it is empty or the
    /// pending budget is exhausted. Returns pages submitted.
    pub fn run_once(&self) -> usize {
        let mut total = 0_usize;
        loop {
            if self.pending.load(Ordering::SeqCst) > self.config.max_pending_flush {
                break;
            }
            let batch: Vec<CellRef> = {
                let mut queue = self.queue.lock();
                let take = queue.len().min(self.config.fetch_batch_cells);
                queue.drain(..take).collect()
            };
            if batch.is_empty() {
                break;
            }
            let mut requeue: Vec<CellRef> = Vec::new();
            for cellref in batch {
                let submitted = self.flush_cell(cellref.cell());
                total += submitted;
                if submitted == self.config.writeback_batch_pages {
                    // A full batch suggests more dirty pages behind it;
                    // keep the cell queued.
                    requeue.push(cellref);
                } else {
                    let _ = cellref.cell().set_in_queue(false);
                }
            }
            if !requeue.is_empty() {
                self.queue.lock().extend(requeue);
            }
        }
        total
    }

    /// Select dirty pages from one cell, claim them for writeback, fuse
    /// contiguous runs, and submit. Returns the number of pages submitted.
    fn flush_cell(&self, cell: &HashCell) -> usize {
        let want = self.config.writeback_batch_pages;
        let set_mask = flags::DIRTY;
        let clear_mask = flags::IO_PENDING | flags::PREPARE_WRITEBACK;
        let selected = match self.config.selection {
            FlushSelection::ByEvictionOrder => {
                cell.predict_evicted_pages(want, set_mask, clear_mask)
            }
            FlushSelection::Arbitrary => cell.get_pages(want, set_mask, clear_mask),
        };
        // Claim atomically; pages that raced a cleaner or another flusher
        // drop out here, releasing the selection reference.
        let mut claimed: Vec<PageHandle> = selected
            .into_iter()
            .filter(|handle| {
                debug_assert!(!handle.is_old_dirty());
                handle.page().try_begin_writeback()
            })
            .collect();
        if claimed.is_empty() {
            return 0;
        }
        claimed.sort_by_key(PageHandle::offset);

        let mut requests: Vec<IoRequest> = Vec::new();
        let mut run: Vec<PageHandle> = Vec::new();
        for handle in claimed {
            let contiguous = run
                .last()
                .map_or(false, |prev| prev.offset().next_page(self.page_size) == Some(handle.offset()));
            if run.is_empty() || contiguous {
                run.push(handle);
            } else {
                requests.push(Self::writeback_request(&mut run));
                run.push(handle);
            }
        }
        if !run.is_empty() {
            requests.push(Self::writeback_request(&mut run));
        }
        self.submit(requests)
    }

    fn writeback_request(run: &mut Vec<PageHandle>) -> IoRequest {
        let start = run[0].offset();
        IoRequest::new(start, IoDirection::Write, std::mem::take(run), false)
    }

    /// Mark pages in flight, account the budget, and hand the requests to
    /// the I/O layer.
    fn submit(&self, requests: Vec<IoRequest>) -> usize {
        if requests.is_empty() {
            return 0;
        }
        let total: usize = requests.iter().map(IoRequest::num_pages).sum();
        for request in &requests {
            for page in request.pages() {
                page.set_io_pending(true);
            }
        }
        self.pending.fetch_add(total, Ordering::SeqCst);
        trace!(
            target: "grist::cache::flush",
            event = "writeback_submit",
            requests = requests.len(),
            pages = total,
            pending = self.pending.load(Ordering::SeqCst)
        );
        self.io.access(requests);
        total
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            {
                let mut queue = self.queue.lock();
                while queue.is_empty() && !self.stop.load(Ordering::Acquire) {
                    let _ = self.work_cv.wait_for(&mut queue, IDLE_WAIT);
                }
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let submitted = self.run_once();
            if submitted > 0 {
                debug!(
                    target: "grist::cache::flush",
                    event = "flush_round",
                    pages = submitted,
                    pending = self.pending.load(Ordering::SeqCst)
                );
            }
            if self.pending.load(Ordering::SeqCst) > self.config.max_pending_flush {
                // Over budget: wait for completions to open it up.
                let mut queue = self.queue.lock();
                let _ = self.work_cv.wait_for(&mut queue, BUDGET_WAIT);
            }
        }
        // Final drain so shutdown leaves no queued cell behind.
        let drained = self.run_once();
        if drained > 0 {
            debug!(
                target: "grist::cache::flush",
                event = "flush_shutdown_drain",
                pages = drained
            );
        }
    }
}

impl CompletionTarget for FlushCoordinator {
    /// Settle each completed request: on success pages become clean; on
    /// failure they stay dirty for a later retry. Either way the flush
    /// reference is released and the budget is credited.
    fn notify_completion(&self, completions: Vec<IoCompletion>) {
        let mut finished_pages = 0_usize;
        for completion in completions {
            let ok = completion.result.is_ok();
            if let Err(err) = &completion.result {
                self.stats.record_flush_failure();
                warn!(
                    target: "grist::cache::flush",
                    event = "writeback_failed",
                    offset = completion.request.offset().0,
                    pages = completion.request.num_pages(),
                    error = %err
                );
            }
            let pages = completion.request.into_pages();
            finished_pages += pages.len();
            if ok {
                self.stats.record_flushed_pages(pages.len());
            }
            for handle in pages {
                debug_assert_eq!(
                    handle.page().waiter_count(),
                    0,
                    "writeback pages never hold read waiters"
                );
                handle.page().complete_writeback(ok);
                drop(handle);
            }
        }
        if finished_pages == 0 {
            return;
        }
        let before = self.pending.fetch_sub(finished_pages, Ordering::SeqCst);
        debug_assert!(before >= finished_pages, "pending flush underflow");
        if before - finished_pages <= self.config.max_pending_flush {
            self.work_cv.notify_one();
        }
    }
}

impl Drop for FlushCoordinator {
    fn drop(&mut self) {
        // The worker owns an Arc of self, so by the time Drop runs the
        // thread has already exited (or shutdown() joined it).
        self.stop.store(true, Ordering::Release);
        self.work_cv.notify_all();
    }
}

impl std::fmt::Debug for FlushCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushCoordinator")
            .field("pending", &self.pending_flushes())
            .field("queued_cells", &self.queue_len())
            .field("max_pending_flush", &self.config.max_pending_flush)
            .finish()
    }
}
