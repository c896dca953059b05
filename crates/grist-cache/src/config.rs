//! Runtime configuration for the cache and its flush coordinator.

use grist_error::{CacheError, Result};
use grist_types::{NodeId, PageSize, DEFAULT_INIT_CACHE_SIZE};
use serde::{Deserialize, Serialize};

/// Eviction policy selection, one per cell.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionKind {
    Lru,
    Lfu,
    Fifo,
    Clock,
    #[default]
    Gclock,
}

/// How the flush coordinator picks dirty pages out of a cell.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushSelection {
    /// Prefer pages the eviction policy would discard next.
    #[default]
    ByEvictionOrder,
    /// Any dirty page in scan order.
    Arbitrary,
}

/// Flush coordinator tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Upper bound on pages concurrently under writeback.
    pub max_pending_flush: usize,
    /// Max dirty pages selected per cell per flush batch.
    pub writeback_batch_pages: usize,
    /// Cell-level count of flushable dirty pages that triggers an enqueue.
    pub dirty_pages_threshold: usize,
    /// Dirty cells fetched from the queue per drain round.
    pub fetch_batch_cells: usize,
    /// Selection policy for dirty pages within a cell.
    pub selection: FlushSelection,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_pending_flush: 1024,
            writeback_batch_pages: 8,
            dirty_pages_threshold: 4,
            fetch_batch_cells: 32,
            selection: FlushSelection::default(),
        }
    }
}

impl FlushConfig {
    pub fn validate(self) -> Result<Self> {
        if self.max_pending_flush == 0 {
            return Err(CacheError::Config(
                "max_pending_flush must be > 0".to_owned(),
            ));
        }
        if self.writeback_batch_pages == 0 {
            return Err(CacheError::Config(
                "writeback_batch_pages must be > 0".to_owned(),
            ));
        }
        if self.fetch_batch_cells == 0 {
            return Err(CacheError::Config("fetch_batch_cells must be > 0".to_owned()));
        }
        Ok(self)
    }
}

/// Cache construction parameters.
///
/// Sizes are in bytes. An expandable cache starts at
/// `min(init_cache_size, cache_size)` pages and grows toward `cache_size`
/// on demand; a non-expandable cache allocates everything up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Page size; validated power of two by construction.
    pub page_size: PageSize,
    /// Hard cap on pages per cell.
    pub cell_max: usize,
    /// Minimum pages per cell; floor for split viability.
    pub min_cell_size: usize,
    /// Target cache size in bytes.
    pub cache_size: usize,
    /// Initial allocation before on-demand expansion.
    pub init_cache_size: usize,
    /// Byte budget enforced by the memory manager.
    pub max_cache_size: usize,
    /// Cells per inner table array. Zero derives `init pages / min_cell_size`.
    pub init_ncells: usize,
    /// Stride multiplier applied to page indices before hashing; lets
    /// several per-node caches partition one offset space.
    pub offset_factor: u64,
    /// NUMA node this cache allocates on.
    pub node: NodeId,
    /// Whether the table may grow past the initial allocation.
    pub expandable: bool,
    pub eviction: EvictionKind,
    pub flush: FlushConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: PageSize::default(),
            cell_max: 8,
            min_cell_size: 3,
            cache_size: DEFAULT_INIT_CACHE_SIZE,
            init_cache_size: DEFAULT_INIT_CACHE_SIZE,
            max_cache_size: DEFAULT_INIT_CACHE_SIZE,
            init_ncells: 0,
            offset_factor: 1,
            node: NodeId(0),
            expandable: true,
            eviction: EvictionKind::default(),
            flush: FlushConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(self) -> Result<Self> {
        if self.min_cell_size == 0 {
            return Err(CacheError::Config("min_cell_size must be > 0".to_owned()));
        }
        if self.cell_max > u8::MAX as usize {
            return Err(CacheError::Config(format!(
                "cell_max must fit in u8, got {}",
                self.cell_max
            )));
        }
        // Unsplitting merges two minimum-sized cells into one.
        if self.cell_max < self.min_cell_size * 2 {
            return Err(CacheError::Config(format!(
                "cell_max ({}) must be at least twice min_cell_size ({})",
                self.cell_max, self.min_cell_size
            )));
        }
        if self.offset_factor == 0 {
            return Err(CacheError::Config("offset_factor must be > 0".to_owned()));
        }
        let min_bytes = self.min_cell_size * self.page_size.get();
        if self.cache_size < min_bytes {
            return Err(CacheError::Config(format!(
                "cache_size ({}) below one minimum cell ({min_bytes})",
                self.cache_size
            )));
        }
        if self.max_cache_size < self.cache_size {
            return Err(CacheError::Config(format!(
                "max_cache_size ({}) below cache_size ({})",
                self.max_cache_size, self.cache_size
            )));
        }
        if self.flush.writeback_batch_pages > self.cell_max {
            return Err(CacheError::Config(format!(
                "writeback_batch_pages ({}) exceeds cell_max ({})",
                self.flush.writeback_batch_pages, self.cell_max
            )));
        }
        let _ = self.flush.validate()?;
        Ok(self)
    }

    /// Initial page count: an expandable cache starts small and grows.
    #[must_use]
    pub fn init_npages(&self) -> usize {
        let init_bytes = if self.expandable {
            self.init_cache_size.min(self.cache_size)
        } else {
            self.cache_size
        };
        self.page_size
            .bytes_to_pages(init_bytes)
            .max(self.min_cell_size)
    }

    /// Cells per inner array, derived when not set explicitly.
    #[must_use]
    pub fn resolved_init_ncells(&self) -> usize {
        if self.init_ncells > 0 {
            self.init_ncells
        } else {
            (self.init_npages() / self.min_cell_size).max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = CacheConfig::default().validate().expect("default config");
        assert_eq!(cfg.page_size.get(), 4096);
        assert_eq!(cfg.cell_max, 8);
        assert_eq!(cfg.min_cell_size, 3);
    }

    #[test]
    fn cell_max_must_allow_merge() {
        let cfg = CacheConfig {
            cell_max: 5,
            min_cell_size: 3,
            ..CacheConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn batch_cannot_exceed_cell_capacity() {
        let mut cfg = CacheConfig::default();
        cfg.flush.writeback_batch_pages = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn init_ncells_derives_from_min_cell_size() {
        let cfg = CacheConfig {
            cache_size: 48 * 1024,
            init_cache_size: 48 * 1024,
            max_cache_size: 96 * 1024,
            ..CacheConfig::default()
        };
        // 12 pages at 3 per cell.
        assert_eq!(cfg.init_npages(), 12);
        assert_eq!(cfg.resolved_init_ncells(), 4);
    }

    #[test]
    fn config_round_trips_through_serde() {
        let cfg = CacheConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: CacheConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }

    #[test]
    fn eviction_kind_uses_snake_case_names() {
        let json = serde_json::to_string(&EvictionKind::Gclock).expect("serialize");
        assert_eq!(json, "\"gclock\"");
    }
}
