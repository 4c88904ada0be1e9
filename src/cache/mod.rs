//! Address-keyed decode cache.
//!
//! Global heap collections, resolved object headers and other structures
//! reachable from several paths (hard links, shared messages) are decoded
//! once per (source, address, kind) and shared afterwards.

mod lru;

pub use lru::{CacheKey, CacheStats, DecodeCache};
