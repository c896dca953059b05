//! Reference-counted page records and client-facing page handles.
//!
//! A [`Page`] is one fixed-size buffer plus the metadata tracking a single
//! file offset's residence in the cache: an atomic reference count, a
//! saturating hit counter, and a flag byte covering the dirty/ready/IO
//! state machine. The same physical buffer is reused indefinitely; only
//! the offset and flags change, always under the owning cell's lock.

use crate::buffer::AlignedBuf;
use crate::io::IoRequest;
use grist_error::{CacheError, Result};
use grist_types::{NodeId, PageOffset};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Page flag bits.
///
/// `DIRTY` and `OLD_DIRTY` are mutually exclusive: a dirty victim that is
/// repurposed for a new offset has its dirty bit promoted to old-dirty in
/// one atomic step, recording that the buffer still holds bytes owed to
/// the *previous* offset.
pub mod flags {
    /// Buffer contents reflect the page at its current offset.
    pub const DATA_READY: u8 = 1 << 0;
    /// Exactly one read or write is outstanding on this page.
    pub const IO_PENDING: u8 = 1 << 1;
    /// Buffer differs from disk at the current offset.
    pub const DIRTY: u8 = 1 << 2;
    /// A prior offset's dirty bytes still live in the buffer.
    pub const OLD_DIRTY: u8 = 1 << 3;
    /// Page sits in a flush queue; writeback I/O not yet issued.
    pub const PREPARE_WRITEBACK: u8 = 1 << 4;
    /// Page has held at least one real offset.
    pub const INITIALIZED: u8 = 1 << 5;
}

const UNUSED_SPIN_LIMIT: u32 = 128;
const UNUSED_PARK_INTERVAL: Duration = Duration::from_millis(1);

/// One cached page: buffer plus residence metadata.
///
/// Shared via `Arc`; cells hold the slots, clients hold [`PageHandle`]s.
pub struct Page {
    data: Mutex<Option<AlignedBuf>>,
    offset: AtomicI64,
    refcount: AtomicU32,
    hits: AtomicU8,
    flags: AtomicU8,
    node: NodeId,
    /// Requests parked on this page while its data is not yet ready.
    waiters: Mutex<Vec<IoRequest>>,
    unused_lock: Mutex<()>,
    unused_cv: Condvar,
}

impl Page {
    pub(crate) fn new(buf: AlignedBuf, node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Some(buf)),
            offset: AtomicI64::new(PageOffset::INVALID.0),
            refcount: AtomicU32::new(0),
            hits: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            node,
            waiters: Mutex::new(Vec::new()),
            unused_lock: Mutex::new(()),
            unused_cv: Condvar::new(),
        })
    }

    #[must_use]
    pub fn offset(&self) -> PageOffset {
        PageOffset(self.offset.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference. Dropping to zero wakes any `wait_unused` parker.
    pub(crate) fn dec_ref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "page refcount underflow");
        if prev == 1 {
            let _guard = self.unused_lock.lock();
            self.unused_cv.notify_all();
        }
    }

    /// Block until the reference count drops to zero.
    ///
    /// Short bounded spin first; parks on the page condvar afterwards.
    pub(crate) fn wait_unused(&self) {
        for _ in 0..UNUSED_SPIN_LIMIT {
            if self.ref_count() == 0 {
                return;
            }
            std::hint::spin_loop();
        }
        let mut guard = self.unused_lock.lock();
        while self.ref_count() > 0 {
            let _ = self
                .unused_cv
                .wait_for(&mut guard, UNUSED_PARK_INTERVAL);
        }
    }

    /// Reassign the page to a new offset.
    ///
    /// Contract: refcount must be zero and the owning cell lock held.
    /// Clears `DATA_READY` and marks the page initialized.
    pub(crate) fn set_offset(&self, off: PageOffset) {
        debug_assert_eq!(self.ref_count(), 0, "set_offset on a referenced page");
        self.offset.store(off.0, Ordering::SeqCst);
        let _ = self.flags.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
            Some((f & !flags::DATA_READY) | flags::INITIALIZED)
        });
    }

    #[must_use]
    pub fn test_flags(&self, set_mask: u8, clear_mask: u8) -> bool {
        let f = self.flags.load(Ordering::SeqCst);
        (f & set_mask) == set_mask && (f & clear_mask) == 0
    }

    fn set_flag(&self, bit: u8, value: bool) {
        if value {
            self.flags.fetch_or(bit, Ordering::SeqCst);
        } else {
            self.flags.fetch_and(!bit, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn is_data_ready(&self) -> bool {
        self.test_flags(flags::DATA_READY, 0)
    }

    pub fn set_data_ready(&self, ready: bool) {
        self.set_flag(flags::DATA_READY, ready);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.test_flags(flags::DIRTY, 0)
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.set_flag(flags::DIRTY, dirty);
    }

    #[must_use]
    pub fn is_old_dirty(&self) -> bool {
        self.test_flags(flags::OLD_DIRTY, 0)
    }

    pub fn set_old_dirty(&self, old_dirty: bool) {
        self.set_flag(flags::OLD_DIRTY, old_dirty);
    }

    #[must_use]
    pub fn is_io_pending(&self) -> bool {
        self.test_flags(flags::IO_PENDING, 0)
    }

    pub fn set_io_pending(&self, pending: bool) {
        self.set_flag(flags::IO_PENDING, pending);
    }

    #[must_use]
    pub fn is_prepare_writeback(&self) -> bool {
        self.test_flags(flags::PREPARE_WRITEBACK, 0)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.test_flags(flags::INITIALIZED, 0)
    }

    /// Promote `DIRTY` to `OLD_DIRTY` in one atomic step.
    ///
    /// Used when a dirty victim is repurposed before its own bytes have
    /// been written back. Returns true if the promotion happened.
    pub(crate) fn promote_dirty_to_old(&self) -> bool {
        self.flags
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if (f & flags::DIRTY) != 0 && (f & flags::OLD_DIRTY) == 0 {
                    Some((f & !flags::DIRTY) | flags::OLD_DIRTY)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Claim the page for writeback: requires `DIRTY` set and neither
    /// `IO_PENDING` nor `PREPARE_WRITEBACK`. Sets `PREPARE_WRITEBACK`.
    pub(crate) fn try_begin_writeback(&self) -> bool {
        self.flags
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                let busy = flags::IO_PENDING | flags::PREPARE_WRITEBACK;
                if (f & flags::DIRTY) != 0 && (f & busy) == 0 {
                    Some(f | flags::PREPARE_WRITEBACK)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Settle writeback state after the I/O layer reports completion.
    ///
    /// On success the page becomes clean; on failure `DIRTY` stays set so a
    /// later flush pass retries.
    pub(crate) fn complete_writeback(&self, success: bool) {
        let _ = self.flags.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
            let mut next = f & !(flags::IO_PENDING | flags::PREPARE_WRITEBACK);
            if success {
                next &= !flags::DIRTY;
            }
            Some(next)
        });
    }

    #[must_use]
    pub fn hits(&self) -> u8 {
        self.hits.load(Ordering::SeqCst)
    }

    /// Record a hit, saturating at 255.
    pub(crate) fn hit(&self) {
        let _ = self.hits.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| {
            Some(h.saturating_add(1))
        });
    }

    pub(crate) fn set_hits(&self, hits: u8) {
        self.hits.store(hits, Ordering::SeqCst);
    }

    pub(crate) fn reset_hits(&self) {
        self.hits.store(0, Ordering::SeqCst);
    }

    /// Halve the hit counter; used when any page in the cell saturates.
    pub(crate) fn scale_down_hits(&self) {
        let _ = self
            .hits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |h| Some(h / 2));
    }

    /// Remove the buffer from the page, leaving the record empty.
    ///
    /// Contract: refcount zero, clean, owning cell lock held.
    pub(crate) fn take_buffer(&self) -> Option<AlignedBuf> {
        debug_assert_eq!(self.ref_count(), 0, "take_buffer on a referenced page");
        debug_assert!(!self.is_dirty() && !self.is_old_dirty());
        self.data.lock().take()
    }

    pub(crate) fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.lock();
        let buf = guard
            .as_ref()
            .expect("page buffer present while record is live");
        f(buf.as_slice())
    }

    pub(crate) fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.data.lock();
        let buf = guard
            .as_mut()
            .expect("page buffer present while record is live");
        f(buf.as_mut_slice())
    }

    pub(crate) fn enqueue_waiter(&self, req: IoRequest) {
        self.waiters.lock().push(req);
    }

    pub(crate) fn take_waiters(&self) -> Vec<IoRequest> {
        std::mem::take(&mut *self.waiters.lock())
    }

    #[must_use]
    pub(crate) fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("offset", &self.offset())
            .field("refcount", &self.ref_count())
            .field("hits", &self.hits())
            .field("flags", &format_args!("{:#08b}", self.flags.load(Ordering::SeqCst)))
            .finish()
    }
}

/// Borrowed, reference-counted view of a cached page.
///
/// Acquiring a handle increments the page refcount; dropping it decrements
/// and, on drop-to-zero, wakes eviction waiters. A page cannot be evicted
/// or reassigned while any handle to it exists.
pub struct PageHandle {
    page: Arc<Page>,
}

impl PageHandle {
    /// Take a new reference on `page`.
    pub(crate) fn acquire(page: &Arc<Page>) -> Self {
        page.inc_ref();
        Self {
            page: Arc::clone(page),
        }
    }

    pub(crate) fn page(&self) -> &Arc<Page> {
        &self.page
    }

    #[must_use]
    pub fn offset(&self) -> PageOffset {
        self.page.offset()
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.page.node()
    }

    #[must_use]
    pub fn is_data_ready(&self) -> bool {
        self.page.is_data_ready()
    }

    pub fn set_data_ready(&self, ready: bool) {
        self.page.set_data_ready(ready);
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.page.is_dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.page.set_dirty(dirty);
    }

    #[must_use]
    pub fn is_old_dirty(&self) -> bool {
        self.page.is_old_dirty()
    }

    /// Clear `OLD_DIRTY` after the prior offset's bytes have been flushed.
    pub fn clear_old_dirty(&self) {
        self.page.set_old_dirty(false);
    }

    #[must_use]
    pub fn is_io_pending(&self) -> bool {
        self.page.is_io_pending()
    }

    pub fn set_io_pending(&self, pending: bool) {
        self.page.set_io_pending(pending);
    }

    #[must_use]
    pub fn is_prepare_writeback(&self) -> bool {
        self.page.is_prepare_writeback()
    }

    #[must_use]
    pub fn hits(&self) -> u8 {
        self.page.hits()
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.page.ref_count()
    }

    /// True if both handles view the same underlying page record.
    #[must_use]
    pub fn same_page(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.page, &other.page)
    }

    /// Copy `src` into the page buffer. `src.len()` must equal the page size.
    pub fn fill(&self, src: &[u8]) -> Result<()> {
        self.page.with_data_mut(|dst| {
            if dst.len() != src.len() {
                return Err(CacheError::InvalidOperation(format!(
                    "fill size mismatch: got={} expected={}",
                    src.len(),
                    dst.len()
                )));
            }
            dst.copy_from_slice(src);
            Ok(())
        })
    }

    /// Read the page buffer through a closure.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.page.with_data(f)
    }

    /// Mutate the page buffer through a closure.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.page.with_data_mut(f)
    }

    /// Park a request on this page until its data becomes ready.
    pub fn enqueue_waiter(&self, req: IoRequest) {
        self.page.enqueue_waiter(req);
    }

    /// Drain requests parked on this page.
    #[must_use]
    pub fn take_waiters(&self) -> Vec<IoRequest> {
        self.page.take_waiters()
    }
}

impl Clone for PageHandle {
    fn clone(&self) -> Self {
        Self::acquire(&self.page)
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        self.page.dec_ref();
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PageHandle").field(&*self.page).finish()
    }
}
