//! Error taxonomy for the heap core.
//!
//! Resource exhaustion and configuration problems are recoverable and flow
//! back to the caller; integrity faults short-circuit pool open. States that
//! cannot be reached through the public API are treated as assertions, not
//! errors.

use thiserror::Error;

/// Errors surfaced by the heap core.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// Every zone is exhausted and no free block or run cell can satisfy
    /// the request.
    #[error("out of memory: no free blocks available")]
    OutOfMemory,

    /// The region is too small to hold a heap.
    #[error("invalid heap size {size}: minimum is {min}")]
    InvalidSize { size: usize, min: usize },

    /// The mapped region is smaller than the persisted heap size.
    #[error("mapped region ({mapped} bytes) smaller than the heap size ({declared} bytes)")]
    RegionTooSmall { mapped: usize, declared: u64 },

    /// An allocation class id that was never registered.
    #[error("unknown allocation class {0}")]
    UnknownClass(u8),

    /// No free slot or invalid configuration for a new allocation class.
    #[error("cannot register allocation class: {0}")]
    ClassConfig(&'static str),

    /// On-storage metadata failed verification; the pool cannot be opened.
    #[error("heap corruption: {0}")]
    Corrupt(String),

    /// A remote read callback failed during verification.
    #[error("remote read failed: {0}")]
    RemoteRead(String),
}
