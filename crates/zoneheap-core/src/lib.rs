//! # zoneheap-core
//!
//! Persistent heap allocator core for a storage engine.
//!
//! The heap manages a contiguous memory-mapped byte region divided into
//! fixed-size zones, each zone into chunks, and chunks into runs of
//! uniform-size cells for small allocations. On-storage invariants are kept
//! strong enough that an interrupted allocation or a crash leaves a
//! recoverable layout; the write-ahead log and transaction engine are
//! collaborators reached through the [`persist::PersistOps`] boundary.
//!
//! No `unsafe` code is permitted in this crate: the mapped region is viewed
//! as an array of atomic words, which covers both header publication and
//! the run-bitmap claim path.

#![deny(unsafe_code)]

pub mod alloc_class;
pub mod bucket;
pub mod container;
pub mod error;
pub mod heap;
pub mod layout;
pub mod memblock;
pub mod persist;
pub mod recycler;
pub mod region;
pub mod stats;

pub use alloc_class::{
    AllocClass, AllocClassCollection, ClassKind, ClassShape, DEFAULT_ALLOC_CLASS_ID, HeaderType,
    MAX_ALLOCATION_CLASSES, RUN_UNIT_MAX, RunDescriptor,
};
pub use bucket::{Bucket, BucketGuard, BucketLocked};
pub use error::HeapError;
pub use heap::{Heap, ZoneSet};
pub use layout::{CHUNK_SIZE, HEAP_MIN_SIZE, MAX_CHUNK, ZONE_MAX_SIZE, ZONE_MIN_SIZE};
pub use memblock::{BlockKind, BlockState, MemoryBlock};
pub use persist::{NoopPersist, PersistOps, PoolView, RemoteReader};
pub use recycler::{Recycler, RecyclerElement};
pub use region::PoolRegion;
pub use stats::HeapStats;
