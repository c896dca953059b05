//! Byte-budgeted page buffer manager.
//!
//! Hands out NUMA-tagged aligned buffers against a fixed byte budget and
//! keeps freed buffers pooled for reuse. Registered caches can be asked to
//! shrink when another consumer runs dry.

use crate::buffer::AlignedBuf;
use grist_types::NodeId;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// A cache that can surrender clean buffers back to the manager on demand.
pub trait CacheReclaim: Send + Sync {
    /// Give back up to `npages` buffers. May return fewer.
    fn reclaim(&self, npages: usize) -> Vec<AlignedBuf>;
}

struct ManagerState {
    /// Pages ever materialized and still alive (in caches or in `pool`).
    allocated_pages: usize,
    pool: Vec<AlignedBuf>,
    caches: Vec<(u64, Weak<dyn CacheReclaim>)>,
    next_token: u64,
}

/// Allocator for page buffers with a hard byte budget.
pub struct MemoryManager {
    page_size: usize,
    max_size: usize,
    node: NodeId,
    state: Mutex<ManagerState>,
}

impl MemoryManager {
    #[must_use]
    pub fn new(max_size: usize, page_size: usize, node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            max_size,
            node,
            state: Mutex::new(ManagerState {
                allocated_pages: 0,
                pool: Vec::new(),
                caches: Vec::new(),
                next_token: 0,
            }),
        })
    }

    #[must_use]
    pub fn get_max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn max_pages(&self) -> usize {
        self.max_size / self.page_size
    }

    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Pages that could still be handed out right now.
    #[must_use]
    pub fn available_pages(&self) -> usize {
        let state = self.state.lock();
        self.max_pages() - state.allocated_pages + state.pool.len()
    }

    /// Acquire exactly `n` page buffers, or nothing.
    ///
    /// Pooled buffers are reused before fresh ones are allocated. Returns
    /// `None` when the budget cannot cover the full request; partial
    /// allocations are rolled back into the pool.
    #[must_use]
    pub fn get_free_pages(&self, n: usize) -> Option<Vec<AlignedBuf>> {
        let mut state = self.state.lock();
        let max_pages = self.max_pages();
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if let Some(mut buf) = state.pool.pop() {
                buf.clear();
                out.push(buf);
            } else if state.allocated_pages < max_pages {
                state.allocated_pages += 1;
                out.push(AlignedBuf::page(self.page_size));
            } else {
                break;
            }
        }
        if out.len() == n {
            Some(out)
        } else {
            warn!(
                event = "memory_budget_denied",
                requested = n,
                short_by = n - out.len(),
                max_pages = max_pages
            );
            state.pool.extend(out);
            None
        }
    }

    /// Return buffers to the pool.
    pub fn free_pages(&self, bufs: Vec<AlignedBuf>) {
        if bufs.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        debug_assert!(bufs.iter().all(|buf| buf.len() == self.page_size));
        state.pool.extend(bufs);
    }

    /// Register a cache as a reclaim target. Returns an unregister token.
    pub fn register_cache(&self, cache: Weak<dyn CacheReclaim>) -> u64 {
        let mut state = self.state.lock();
        let token = state.next_token;
        state.next_token += 1;
        state.caches.push((token, cache));
        token
    }

    pub fn unregister_cache(&self, token: u64) {
        let mut state = self.state.lock();
        state.caches.retain(|(t, _)| *t != token);
    }

    /// Ask registered caches to surrender up to `npages` buffers.
    ///
    /// Returns the number of pages actually reclaimed into the pool.
    pub fn request_reclaim(&self, npages: usize) -> usize {
        let targets: Vec<Weak<dyn CacheReclaim>> = {
            let mut state = self.state.lock();
            state.caches.retain(|(_, weak)| weak.strong_count() > 0);
            state.caches.iter().map(|(_, weak)| weak.clone()).collect()
        };
        let mut reclaimed = 0_usize;
        for weak in targets {
            if reclaimed >= npages {
                break;
            }
            let Some(cache) = weak.upgrade() else {
                continue;
            };
            let bufs = cache.reclaim(npages - reclaimed);
            reclaimed += bufs.len();
            self.free_pages(bufs);
        }
        debug!(event = "memory_reclaim", requested = npages, reclaimed);
        reclaimed
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryManager")
            .field("max_pages", &self.max_pages())
            .field("allocated_pages", &state.allocated_pages)
            .field("pooled", &state.pool.len())
            .field("caches", &state.caches.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_all_or_nothing() {
        let manager = MemoryManager::new(4 * 4096, 4096, NodeId(0));
        assert_eq!(manager.max_pages(), 4);
        let first = manager.get_free_pages(3).expect("within budget");
        assert_eq!(first.len(), 3);
        assert!(manager.get_free_pages(2).is_none());
        // The failed request must not leak the one page it briefly held.
        assert_eq!(manager.available_pages(), 1);
        manager.free_pages(first);
        assert_eq!(manager.available_pages(), 4);
    }

    #[test]
    fn freed_buffers_are_reused_zeroed() {
        let manager = MemoryManager::new(2 * 512, 512, NodeId(0));
        let mut bufs = manager.get_free_pages(2).expect("allocate");
        bufs[0].as_mut_slice().fill(0xEE);
        manager.free_pages(bufs);
        let again = manager.get_free_pages(2).expect("reuse");
        assert!(again
            .iter()
            .all(|buf| buf.as_slice().iter().all(|b| *b == 0)));
    }

    #[test]
    fn reclaim_walks_registered_caches() {
        struct FixedDonor {
            pages: Mutex<Vec<AlignedBuf>>,
        }
        impl CacheReclaim for FixedDonor {
            fn reclaim(&self, npages: usize) -> Vec<AlignedBuf> {
                let mut pages = self.pages.lock();
                let take = npages.min(pages.len());
                pages.drain(..take).collect()
            }
        }

        let manager = MemoryManager::new(8 * 512, 512, NodeId(0));
        let donor = Arc::new(FixedDonor {
            pages: Mutex::new(
                manager
                    .get_free_pages(4)
                    .expect("donor allocation")
                    .into_iter()
                    .collect(),
            ),
        });
        let donor_dyn: Arc<dyn CacheReclaim> = Arc::clone(&donor) as Arc<dyn CacheReclaim>;
        let weak: Weak<dyn CacheReclaim> = Arc::downgrade(&donor_dyn);
        let token = manager.register_cache(weak);

        assert_eq!(manager.request_reclaim(3), 3);
        assert_eq!(donor.pages.lock().len(), 1);
        assert_eq!(manager.available_pages(), 7);

        manager.unregister_cache(token);
        assert_eq!(manager.request_reclaim(1), 0);
    }
}
