//! Persistence boundary.
//!
//! Every on-storage mutation the heap makes goes through [`PersistOps`] so
//! the surrounding write-ahead log can order and flush it. The heap never
//! talks to the WAL directly.

use crate::region::PoolRegion;

/// WAL-aware write-back operations provided by the pool owner.
pub trait PersistOps: Send + Sync {
    /// Records and flushes `len` bytes at `off` that were already written
    /// in place.
    fn persist(&self, region: &PoolRegion, off: usize, len: usize);

    /// Bulk-fills `len` bytes at `off` with `val` through the WAL.
    ///
    /// Implementations must write the bytes into `region` in addition to
    /// whatever logging they do.
    fn memset(&self, region: &PoolRegion, off: usize, val: u8, len: usize);
}

/// Direct write-through with no logging, for tests and volatile pools.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersist;

impl PersistOps for NoopPersist {
    fn persist(&self, _region: &PoolRegion, _off: usize, _len: usize) {}

    fn memset(&self, region: &PoolRegion, off: usize, val: u8, len: usize) {
        region.fill_bytes(off, val, len);
    }
}

/// Borrowed pair of the pool region and its persistence operations, passed
/// down to everything that touches persistent state.
#[derive(Clone, Copy)]
pub struct PoolView<'a> {
    pub region: &'a PoolRegion,
    pub p_ops: &'a dyn PersistOps,
}

impl PoolView<'_> {
    /// Flushes `len` bytes at `off` through the WAL.
    pub fn persist(&self, off: usize, len: usize) {
        self.p_ops.persist(self.region, off, len);
    }

    /// WAL-aware bulk set.
    pub fn memset(&self, off: usize, val: u8, len: usize) {
        self.p_ops.memset(self.region, off, val, len);
    }
}

/// Read callback used to verify the heap of a remote pool.
pub trait RemoteReader {
    /// Reads `buf.len()` bytes starting at byte offset `off` of the remote
    /// heap region.
    fn read(&self, off: usize, buf: &mut [u8]) -> Result<(), String>;
}
