//! Write-back block cache
//!
//! Maps `(owner, block number)` to in-memory data blocks with LRU
//! eviction, back-pressure, background flushing and prefetch-driven
//! readahead. Blocks carry version-based optimistic concurrency against
//! their cluster.

mod block;
mod cache;
mod oracle;

pub use block::{BlockMode, DataBlock};
pub use cache::{CacheStats, DataCache, OwnerId, RequestMode};
pub use oracle::{PredictionType, PrefetchOracle};
