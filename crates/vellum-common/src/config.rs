//! Configuration structures for Vellum.

use serde::{Deserialize, Serialize};

/// Default buffer pool capacity in pages.
pub const DEFAULT_POOL_PAGES: usize = 100;

/// Maximum buffer pool capacity in pages.
pub const MAX_POOL_PAGES: usize = 1000;

/// Storage configuration for a Vellum index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffer pool size in number of pages.
    pub buffer_pool_pages: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_pool_pages: DEFAULT_POOL_PAGES,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Returns the buffer pool capacity clamped to the supported range.
    ///
    /// Zero falls back to the default; anything above [`MAX_POOL_PAGES`]
    /// is capped there.
    pub fn clamped_pool_pages(&self) -> usize {
        if self.buffer_pool_pages == 0 {
            DEFAULT_POOL_PAGES
        } else {
            self.buffer_pool_pages.min(MAX_POOL_PAGES)
        }
    }
}
