//! Expiring key/value cache on top of the local store.
//!
//! This module provides:
//! - Entries with a creation time and an optional expiry
//! - A default lifetime of one hour, or no expiry at all
//! - Lazy eviction on read, plus an optional periodic sweep

mod entry;
mod layer;

pub use entry::{CacheEntry, Ttl};
pub use layer::{TtlCache, CACHE_PARTITION};
