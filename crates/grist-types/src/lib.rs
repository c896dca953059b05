#![forbid(unsafe_code)]
//! Shared newtypes and constants for the grist graph engine.
//!
//! Unit-carrying wrappers prevent mixing byte offsets, page indices, and
//! NUMA node ids across the cache and I/O layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Default initial cache allocation before on-demand expansion.
pub const DEFAULT_INIT_CACHE_SIZE: usize = 128 * 1024 * 1024;

/// Byte offset of a page within the backing file.
///
/// Offsets are signed; [`PageOffset::INVALID`] marks a page slot that has
/// never been assigned an offset, and is also the sentinel reported to
/// callers when an eviction victim was uninitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageOffset(pub i64);

impl PageOffset {
    pub const INVALID: Self = Self(-1);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Page index for a given page size (truncating).
    ///
    /// Returns `None` for the invalid sentinel.
    #[must_use]
    pub fn page_index(self, page_size: usize) -> Option<u64> {
        if !self.is_valid() {
            return None;
        }
        let size = u64::try_from(page_size).ok()?;
        u64::try_from(self.0).ok().map(|off| off / size)
    }

    /// Offset of the page immediately after this one.
    #[must_use]
    pub fn next_page(self, page_size: usize) -> Option<Self> {
        if !self.is_valid() {
            return None;
        }
        let size = i64::try_from(page_size).ok()?;
        self.0.checked_add(size).map(Self)
    }
}

/// NUMA node identifier. Buffers and caches are tagged with the node they
/// were allocated on.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

/// Validated page size (power of two in 512..=65536).
///
/// Deserialization goes through the same validation as [`PageSize::new`],
/// so a config file cannot smuggle in an unusable page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct PageSize(usize);

impl PageSize {
    /// Create a `PageSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: usize) -> Result<Self, TypeError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(TypeError::InvalidField {
                field: "page_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }

    /// Number of bits to shift to convert between bytes and pages.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte count to a page count (truncating).
    #[must_use]
    pub fn bytes_to_pages(self, bytes: usize) -> usize {
        bytes >> self.shift()
    }

    /// Byte offset of page `index`, or `None` on overflow.
    #[must_use]
    pub fn page_to_offset(self, index: u64) -> Option<PageOffset> {
        let size = u64::try_from(self.0).ok()?;
        let byte = index.checked_mul(size)?;
        i64::try_from(byte).ok().map(PageOffset)
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(DEFAULT_PAGE_SIZE)
    }
}

impl TryFrom<usize> for PageSize {
    type Error = TypeError;

    fn try_from(value: usize) -> Result<Self, TypeError> {
        Self::new(value)
    }
}

impl From<PageSize> for usize {
    fn from(value: PageSize) -> Self {
        value.0
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for PageOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_rejects_non_power_of_two() {
        assert!(PageSize::new(4096).is_ok());
        assert!(PageSize::new(3000).is_err());
        assert!(PageSize::new(256).is_err());
        assert!(PageSize::new(128 * 1024).is_err());
    }

    #[test]
    fn page_offset_sentinel_is_invalid() {
        assert!(!PageOffset::INVALID.is_valid());
        assert_eq!(PageOffset::INVALID.page_index(4096), None);
        assert!(PageOffset(0).is_valid());
        assert_eq!(PageOffset(8192).page_index(4096), Some(2));
    }

    #[test]
    fn next_page_advances_by_page_size() {
        let off = PageOffset(4096);
        assert_eq!(off.next_page(4096), Some(PageOffset(8192)));
        assert_eq!(PageOffset::INVALID.next_page(4096), None);
    }

    #[test]
    fn page_size_conversions_round_trip() {
        let ps = PageSize::new(4096).expect("valid page size");
        assert_eq!(ps.shift(), 12);
        assert_eq!(ps.bytes_to_pages(128 * 1024), 32);
        assert_eq!(ps.page_to_offset(3), Some(PageOffset(12288)));
    }

    #[test]
    fn offsets_serialize_as_plain_integers() {
        let json = serde_json::to_string(&PageOffset(4096)).expect("serialize");
        assert_eq!(json, "4096");
    }

    #[test]
    fn page_size_validates_on_deserialization() {
        let ok: PageSize = serde_json::from_str("8192").expect("valid size");
        assert_eq!(ok.get(), 8192);
        assert!(serde_json::from_str::<PageSize>("3000").is_err());
        assert_eq!(
            serde_json::to_string(&PageSize::default()).expect("serialize"),
            "4096"
        );
    }
}
