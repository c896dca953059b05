#![forbid(unsafe_code)]
//! Grist public API facade.
//!
//! Re-exports the page cache surface through a stable external interface.
//! This is the crate downstream consumers (graph engine, scanners,
//! harnesses) depend on.

pub use grist_cache::*;
pub use grist_error::{CacheError, Result};
pub use grist_types::{NodeId, PageOffset, PageSize};
