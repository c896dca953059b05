//! Pluggable eviction policies, one embedded in each hash cell.
//!
//! A policy is a small tagged variant consulted only under the cell lock,
//! so every operation inlines without heap indirection. All variants
//! choose victims among unreferenced pages and return `None` when every
//! page in the cell is referenced; the caller is responsible for backing
//! off and retrying.

use crate::cell::PageCell;
use crate::config::EvictionKind;
use crate::page::Page;
use std::sync::Arc;

#[derive(Debug)]
pub(crate) enum EvictionPolicy {
    /// Recency order over dense positions; front is evicted next.
    Lru { order: Vec<usize> },
    /// Minimum hit counter wins; ties broken by scan order.
    Lfu,
    /// Rotating cursor over the cell, shared with the page cell's walk state.
    Fifo,
    /// Second-chance sweep; hit counters cleared on the way past.
    Clock { hand: usize },
    /// Counter variant of CLOCK; hit counters decremented on the way past.
    Gclock { hand: usize },
}

impl EvictionPolicy {
    pub(crate) fn new(kind: EvictionKind) -> Self {
        match kind {
            EvictionKind::Lru => Self::Lru { order: Vec::new() },
            EvictionKind::Lfu => Self::Lfu,
            EvictionKind::Fifo => Self::Fifo,
            EvictionKind::Clock => Self::Clock { hand: 0 },
            EvictionKind::Gclock => Self::Gclock { hand: 0 },
        }
    }

    /// Choose a victim that is not currently referenced.
    ///
    /// Returns `None` when every page is referenced; never blocks.
    pub(crate) fn evict_page(&mut self, buf: &mut PageCell) -> Option<Arc<Page>> {
        let n = buf.num_pages();
        if n == 0 {
            return None;
        }
        match self {
            Self::Lru { order } => {
                order.retain(|pos| *pos < n);
                let mut tracked = vec![false; n];
                for &pos in order.iter() {
                    tracked[pos] = true;
                }
                // Untracked positions are pages that never saw an access;
                // use them before displacing anything.
                for (pos, &seen) in tracked.iter().enumerate() {
                    if !seen && buf.get_page(pos).ref_count() == 0 {
                        order.push(pos);
                        return Some(Arc::clone(buf.get_page(pos)));
                    }
                }
                let slot = order
                    .iter()
                    .position(|&pos| buf.get_page(pos).ref_count() == 0)?;
                let pos = order.remove(slot);
                order.push(pos);
                Some(Arc::clone(buf.get_page(pos)))
            }
            Self::Lfu => {
                let mut best: Option<(u8, usize)> = None;
                for pos in 0..n {
                    let page = buf.get_page(pos);
                    if page.ref_count() != 0 {
                        continue;
                    }
                    let hits = page.hits();
                    if best.map_or(true, |(best_hits, _)| hits < best_hits) {
                        best = Some((hits, pos));
                        if hits == 0 {
                            break;
                        }
                    }
                }
                let (_, pos) = best?;
                let page = Arc::clone(buf.get_page(pos));
                page.reset_hits();
                Some(page)
            }
            Self::Fifo => {
                for _ in 0..n {
                    let page = buf.next_round_robin();
                    if page.ref_count() == 0 {
                        return Some(page);
                    }
                }
                None
            }
            Self::Clock { hand } => Self::sweep(buf, hand, false),
            Self::Gclock { hand } => Self::sweep(buf, hand, true),
        }
    }

    /// CLOCK/GCLOCK shared sweep. Referenced and dirty pages are skipped
    /// for one full rotation; after that dirty pages are admitted. Returns
    /// `None` only when every page is referenced.
    fn sweep(buf: &PageCell, hand: &mut usize, graduated: bool) -> Option<Arc<Page>> {
        let n = buf.num_pages();
        let mut num_referenced = 0_usize;
        let mut num_dirty = 0_usize;
        let mut avoid_dirty = true;
        loop {
            if num_dirty + num_referenced >= n {
                num_dirty = 0;
                num_referenced = 0;
                avoid_dirty = false;
            }
            let page = buf.get_page(*hand % n);
            if page.ref_count() != 0 {
                num_referenced += 1;
                if num_referenced >= n {
                    return None;
                }
                *hand = hand.wrapping_add(1);
                continue;
            }
            if avoid_dirty && page.is_dirty() {
                num_dirty += 1;
                *hand = hand.wrapping_add(1);
                continue;
            }
            if page.hits() == 0 {
                let victim = Arc::clone(page);
                *hand = hand.wrapping_add(1);
                victim.reset_hits();
                return Some(victim);
            }
            if graduated {
                page.set_hits(page.hits() - 1);
            } else {
                page.reset_hits();
            }
            *hand = hand.wrapping_add(1);
        }
    }

    /// Record a hit on `page`. The hit counter itself is maintained by the
    /// cell; only recency-ordered policies carry extra state.
    pub(crate) fn access_page(&mut self, page: &Arc<Page>, buf: &PageCell) {
        match self {
            Self::Lru { order } => {
                let Some(pos) = buf.position_of(page) else {
                    return;
                };
                if let Some(slot) = order.iter().position(|&p| p == pos) {
                    let _ = order.remove(slot);
                }
                order.push(pos);
            }
            Self::Lfu | Self::Fifo | Self::Clock { .. } | Self::Gclock { .. } => {}
        }
    }

    /// Non-destructively list up to `want` pages next in line for eviction
    /// that match the flag constraints.
    ///
    /// Works on a shadow copy of the hit counters, so repeated calls see
    /// identical cell state.
    pub(crate) fn predict_evicted_pages(
        &self,
        buf: &PageCell,
        want: usize,
        set_mask: u8,
        clear_mask: u8,
    ) -> Vec<Arc<Page>> {
        let n = buf.num_pages();
        let mut out = Vec::new();
        if n == 0 || want == 0 {
            return out;
        }
        let push = |page: &Arc<Page>, out: &mut Vec<Arc<Page>>| {
            if page.test_flags(set_mask, clear_mask) {
                out.push(Arc::clone(page));
            }
        };
        match self {
            Self::Lru { order } => {
                let mut tracked = vec![false; n];
                for &pos in order.iter().filter(|&&pos| pos < n) {
                    tracked[pos] = true;
                }
                for (pos, &seen) in tracked.iter().enumerate() {
                    if !seen {
                        push(buf.get_page(pos), &mut out);
                        if out.len() == want {
                            return out;
                        }
                    }
                }
                for &pos in order.iter().filter(|&&pos| pos < n) {
                    push(buf.get_page(pos), &mut out);
                    if out.len() == want {
                        return out;
                    }
                }
                out
            }
            Self::Lfu => {
                let mut positions: Vec<usize> = (0..n).collect();
                positions.sort_by_key(|&pos| buf.get_page(pos).hits());
                for pos in positions {
                    push(buf.get_page(pos), &mut out);
                    if out.len() == want {
                        break;
                    }
                }
                out
            }
            Self::Fifo => {
                let start = buf.cursor();
                for i in 0..n {
                    push(buf.get_page((start + i) % n), &mut out);
                    if out.len() == want {
                        break;
                    }
                }
                out
            }
            Self::Clock { hand } => Self::sweep_predict(buf, *hand, false, want, set_mask, clear_mask),
            Self::Gclock { hand } => Self::sweep_predict(buf, *hand, true, want, set_mask, clear_mask),
        }
    }

    fn sweep_predict(
        buf: &PageCell,
        hand: usize,
        graduated: bool,
        want: usize,
        set_mask: u8,
        clear_mask: u8,
    ) -> Vec<Arc<Page>> {
        let n = buf.num_pages();
        let mut shadow: Vec<i16> = (0..n)
            .map(|pos| i16::from(buf.get_page(pos).hits()))
            .collect();
        let mut out = Vec::new();
        loop {
            let mut remaining = false;
            for i in 0..n {
                let pos = (hand + i) % n;
                match shadow[pos] {
                    h if h < 0 => {}
                    0 => {
                        shadow[pos] = -1;
                        let page = buf.get_page(pos);
                        if page.test_flags(set_mask, clear_mask) {
                            out.push(Arc::clone(page));
                            if out.len() == want {
                                return out;
                            }
                        }
                    }
                    h => {
                        shadow[pos] = if graduated { h - 1 } else { 0 };
                        remaining = true;
                    }
                }
            }
            if !remaining {
                return out;
            }
        }
    }
}
