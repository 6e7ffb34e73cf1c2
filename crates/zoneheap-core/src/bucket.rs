//! Buckets: thread-exclusive frontends over free-block containers.
//!
//! A bucket binds a container to one allocation class. `BucketLocked` wraps
//! it in a mutex; whoever acquires it has an exclusive view until the guard
//! drops. Run buckets additionally hold the active run they carve cells
//! from, with the container indexing that run's free spans.

use parking_lot::{Mutex, MutexGuard};

use crate::alloc_class::{AllocClass, ClassKind, RUN_UNIT_MAX};
use crate::container::{BlockContainer, SeglistsContainer, TreeContainer};
use crate::memblock::{BlockKind, MemoryBlock};
use crate::persist::PoolView;

/// Exclusive handle to a bucket, released on drop.
pub type BucketGuard<'a> = MutexGuard<'a, Bucket>;

/// A free-block cache for one allocation class.
pub struct Bucket {
    class: AllocClass,
    container: Box<dyn BlockContainer>,
    active_run: Option<MemoryBlock>,
}

impl Bucket {
    /// Bucket over a size-ordered tree, for the huge class.
    pub fn new_huge(class: AllocClass) -> Self {
        debug_assert_eq!(class.kind(), ClassKind::Huge);
        Self {
            class,
            container: Box::new(TreeContainer::new()),
            active_run: None,
        }
    }

    /// Bucket over segregated free-lists, for a run class.
    pub fn new_run(class: AllocClass) -> Self {
        debug_assert_eq!(class.kind(), ClassKind::Run);
        Self {
            class,
            container: Box::new(SeglistsContainer::new()),
            active_run: None,
        }
    }

    pub fn class(&self) -> &AllocClass {
        &self.class
    }

    pub fn active_run(&self) -> Option<&MemoryBlock> {
        self.active_run.as_ref()
    }

    /// Adds a free block to the container.
    pub fn insert_block(&mut self, m: MemoryBlock) {
        self.container.insert(m);
    }

    /// Removes exactly `m` from the container if it is tracked.
    pub fn remove_block(&mut self, m: &MemoryBlock) -> bool {
        self.container.remove_specific(m)
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// Installs `run` as the active run and indexes its free spans.
    pub fn attach_run(&mut self, view: &PoolView<'_>, run: &MemoryBlock) {
        debug_assert!(self.active_run.is_none(), "bucket already has an active run");
        debug_assert_eq!(run.kind, BlockKind::Run);
        let mut run = *run;
        run.block_off = 0;
        run.header_type = self.class.header_type;
        let bitmap = run.run_bitmap(view);
        let container = &mut self.container;
        bitmap.for_each_free_span(view, |bit, len| {
            container.insert(MemoryBlock {
                block_off: bit,
                size_idx: len,
                ..run
            });
        });
        self.active_run = Some(run);
    }

    /// Removes the active run, dropping its span index. The flag reports
    /// whether the run has no outstanding allocations.
    pub fn detach_run(&mut self, view: &PoolView<'_>) -> Option<(MemoryBlock, bool)> {
        let run = self.active_run.take()?;
        self.container.clear();
        let bitmap = run.run_bitmap(view);
        let empty = bitmap.free_count(view) == bitmap.nbits;
        Some((run, empty))
    }

    /// Tries to allocate `m.size_idx` worth of space from this bucket.
    ///
    /// Huge buckets pull the best-fit extent from the tree. Run buckets take
    /// the first-fit free span of the active run and claim the first
    /// `m.size_idx` cells of it in the bitmap; `m` comes back describing the
    /// whole span so the caller can split off the excess.
    pub fn alloc_block(&mut self, view: &PoolView<'_>, m: &mut MemoryBlock) -> bool {
        match self.class.kind() {
            ClassKind::Huge => {
                if let Some(found) = self.container.get_rm_bestfit(m.size_idx) {
                    *m = found;
                    true
                } else {
                    false
                }
            }
            ClassKind::Run => {
                let units = m.size_idx;
                debug_assert!(units >= 1 && units <= RUN_UNIT_MAX);
                if self.active_run.is_none() {
                    return false;
                }
                while let Some(span) = self.container.get_rm_firstfit(units) {
                    let cell = MemoryBlock {
                        size_idx: units,
                        ..span
                    };
                    if cell.claim_cells(view) {
                        *m = span;
                        m.header_type = self.class.header_type;
                        return true;
                    }
                    // A tracked span can only be stale if the volatile index
                    // diverged from the bitmap.
                    debug_assert!(false, "free span already claimed in bitmap");
                    log::error!(
                        "dropping stale free span: zone {} chunk {} off {}",
                        span.zone_id,
                        span.chunk_id,
                        span.block_off
                    );
                }
                false
            }
        }
    }
}

/// A bucket behind a sleep mutex.
pub struct BucketLocked {
    locked: Mutex<Bucket>,
}

impl BucketLocked {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            locked: Mutex::new(bucket),
        }
    }

    /// Obtains the bucket exclusively until the guard drops.
    pub fn acquire(&self) -> BucketGuard<'_> {
        self.locked.lock()
    }
}
