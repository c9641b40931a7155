//! Buffer pool management for Vellum.
//!
//! This crate provides in-memory page caching with:
//! - Fixed-size buffer pool with configurable page count
//! - LRU eviction that skips pinned pages and prefers clean victims
//! - Dirty page tracking with write-back through an injected store
//! - Page pinning for multi-node restructuring operations

mod pool;
mod store;

pub use pool::{BufferPool, Stats, DEFAULT_CAPACITY, MAX_CAPACITY};
pub use store::{MemoryNodeStore, NodeStore};
