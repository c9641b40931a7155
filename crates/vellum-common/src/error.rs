//! Error types for Vellum.

use thiserror::Error;

/// Result type alias using VellumError.
pub type Result<T> = std::result::Result<T, VellumError>;

/// Errors that can occur in Vellum operations.
#[derive(Debug, Error)]
pub enum VellumError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Metadata errors
    #[error("Corrupt metadata: {reason}")]
    CorruptMetadata { reason: String },

    // Allocation errors
    #[error("Page capacity exhausted: next page id {next_page_id} exceeds ceiling {ceiling}")]
    CapacityExhausted { next_page_id: i32, ceiling: i32 },

    // Page layout errors
    #[error("Page overflow: page {page_id} needs {required} bytes, page size is {page_size}")]
    PageOverflow {
        page_id: i32,
        required: usize,
        page_size: usize,
    },

    // Structural errors
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}
