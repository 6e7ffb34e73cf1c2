//! Transient allocation counters.
//!
//! These counters live outside the pool and are rebuilt on boot; the heap
//! only ever adds and subtracts, the consumer decides how to export them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Volatile counters describing run usage.
#[derive(Debug, Default)]
pub struct HeapStats {
    /// Bytes of chunk space currently carved into runs.
    run_active: AtomicU64,
    /// Bytes currently allocated out of run cells.
    run_allocated: AtomicU64,
}

impl HeapStats {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_run_active(&self, delta: u64) {
        self.run_active.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub_run_active(&self, delta: u64) {
        let _ = self
            .run_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    pub fn inc_run_allocated(&self, delta: u64) {
        self.run_allocated.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn sub_run_allocated(&self, delta: u64) {
        let _ = self
            .run_allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(delta))
            });
    }

    /// Bytes of chunk space currently carved into runs.
    pub fn run_active(&self) -> u64 {
        self.run_active.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated out of run cells.
    pub fn run_allocated(&self) -> u64 {
        self.run_allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let s = HeapStats::new();
        s.inc_run_active(1024);
        s.inc_run_allocated(64);
        assert_eq!(s.run_active(), 1024);
        assert_eq!(s.run_allocated(), 64);
        s.sub_run_active(1024);
        assert_eq!(s.run_active(), 0);
    }

    #[test]
    fn test_sub_saturates() {
        let s = HeapStats::new();
        s.sub_run_allocated(10);
        assert_eq!(s.run_allocated(), 0);
    }
}
