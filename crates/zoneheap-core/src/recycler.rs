//! Deferred accounting of freed run cells.
//!
//! Frees of run cells are cheap: they bump a counter and touch a pending
//! shard. Only when enough space has accumulated (or a caller forces it)
//! does the recycler renormalize the touched runs from their bitmaps,
//! emitting fully-empty runs for demotion and keeping partially-empty ones
//! drawable, most-free first.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::alloc_class::HeaderType;
use crate::memblock::{BlockKind, MemoryBlock};
use crate::persist::PoolView;

/// Snapshot of one run's free space, keyed by its location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecyclerElement {
    pub zone_id: u32,
    pub chunk_id: u32,
    /// Chunks in the run.
    pub size_idx: u32,
    /// Free cells at the time the element was built.
    pub free_space: u32,
    /// Longest allocatable free span at the time the element was built.
    pub max_free_span: u32,
}

/// Builds an element by reading the run's bitmap. `m` identifies a whole
/// run.
pub fn element_new(view: &PoolView<'_>, m: &MemoryBlock) -> RecyclerElement {
    debug_assert_eq!(m.kind, BlockKind::Run);
    let bitmap = m.run_bitmap(view);
    RecyclerElement {
        zone_id: m.zone_id,
        chunk_id: m.chunk_id,
        size_idx: m.size_idx,
        free_space: bitmap.free_count(view),
        max_free_span: bitmap.max_free_span(view),
    }
}

/// Drawable runs are ordered most-free first, then most-contiguous, then by
/// address for determinism.
type Score = (Reverse<u32>, Reverse<u32>, u32, u32);

fn score(e: &RecyclerElement) -> Score {
    (
        Reverse(e.free_space),
        Reverse(e.max_free_span),
        e.zone_id,
        e.chunk_id,
    )
}

#[derive(Clone, Copy)]
struct PendingRun {
    size_idx: u32,
    frees: u64,
}

#[derive(Default)]
struct Ledger {
    /// Drawable runs, best first.
    runs: std::collections::BTreeMap<Score, RecyclerElement>,
    /// Location of each drawable run's score.
    index: HashMap<(u32, u32), Score>,
    /// Runs touched by frees since their last normalization.
    pending: HashMap<(u32, u32), PendingRun>,
}

/// Per-class deferred-free ledger.
pub struct Recycler {
    /// Cells per run of the attached class; doubles as the recalc
    /// threshold.
    nallocs: u32,
    /// Frees recorded but not yet folded into any element.
    unaccounted: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl Recycler {
    pub fn new(nallocs: u32) -> Self {
        Self {
            nallocs,
            unaccounted: AtomicU64::new(0),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Makes a run drawable with freshly computed counts. Any pending frees
    /// recorded for it are folded away.
    pub fn put(&self, e: RecyclerElement) {
        let key = (e.zone_id, e.chunk_id);
        let mut ledger = self.ledger.lock();
        if let Some(old) = ledger.index.remove(&key) {
            ledger.runs.remove(&old);
        }
        if let Some(p) = ledger.pending.remove(&key) {
            self.unaccounted.fetch_sub(p.frees, Ordering::Relaxed);
        }
        let s = score(&e);
        ledger.runs.insert(s, e);
        ledger.index.insert(key, s);
    }

    /// Draws the most-free run able to service `m.size_idx` cells. On
    /// success `m` describes the whole run and the run leaves the ledger.
    pub fn get(&self, m: &mut MemoryBlock) -> bool {
        let units = m.size_idx;
        let mut ledger = self.ledger.lock();
        let Some(s) = ledger
            .runs
            .iter()
            .find(|(_, e)| e.max_free_span >= units)
            .map(|(s, _)| *s)
        else {
            return false;
        };
        let e = match ledger.runs.remove(&s) {
            Some(e) => e,
            None => return false,
        };
        ledger.index.remove(&(e.zone_id, e.chunk_id));
        *m = MemoryBlock {
            zone_id: e.zone_id,
            chunk_id: e.chunk_id,
            size_idx: e.size_idx,
            block_off: 0,
            kind: BlockKind::Run,
            header_type: HeaderType::Compact,
        };
        true
    }

    /// Records one free of a cell in run (`zone_id`, `chunk_id`) spanning
    /// `size_idx` chunks.
    pub fn inc_unaccounted(&self, zone_id: u32, chunk_id: u32, size_idx: u32) {
        self.unaccounted.fetch_add(1, Ordering::Relaxed);
        let mut ledger = self.ledger.lock();
        ledger
            .pending
            .entry((zone_id, chunk_id))
            .or_insert(PendingRun {
                size_idx,
                frees: 0,
            })
            .frees += 1;
    }

    /// Renormalizes drawable runs touched by frees and returns the ones
    /// that became fully empty, removed from the ledger so the caller can
    /// demote them.
    ///
    /// Below the threshold this is a no-op unless `force` is set. Pending
    /// frees against runs that are not drawable (attached to a bucket, or
    /// never reclaimed) stay pending; their counts fold in when the run is
    /// next put.
    pub fn recalc(&self, view: &PoolView<'_>, force: bool) -> Vec<MemoryBlock> {
        if !force && self.unaccounted.load(Ordering::Relaxed) < self.nallocs as u64 {
            return Vec::new();
        }
        let mut ledger = self.ledger.lock();
        let touched: Vec<(u32, u32)> = {
            let Ledger { pending, index, .. } = &*ledger;
            pending
                .keys()
                .filter(|k| index.contains_key(*k))
                .copied()
                .collect()
        };
        let mut empties = Vec::new();
        for key in touched {
            let Some(p) = ledger.pending.remove(&key) else {
                continue;
            };
            self.unaccounted.fetch_sub(p.frees, Ordering::Relaxed);
            let Some(old) = ledger.index.remove(&key) else {
                continue;
            };
            ledger.runs.remove(&old);

            let m = MemoryBlock {
                zone_id: key.0,
                chunk_id: key.1,
                size_idx: p.size_idx,
                block_off: 0,
                kind: BlockKind::Run,
                header_type: HeaderType::Compact,
            };
            let e = element_new(view, &m);
            if e.free_space == self.nallocs {
                empties.push(m);
            } else {
                let s = score(&e);
                ledger.runs.insert(s, e);
                ledger.index.insert(key, s);
            }
        }
        empties
    }

    /// Total frees recorded but not yet folded into an element.
    pub fn unaccounted_total(&self) -> u64 {
        self.unaccounted.load(Ordering::Relaxed)
    }

    /// Pending frees recorded against one run.
    pub fn pending_for(&self, zone_id: u32, chunk_id: u32) -> u64 {
        self.ledger
            .lock()
            .pending
            .get(&(zone_id, chunk_id))
            .map_or(0, |p| p.frees)
    }

    /// Recorded free space of a drawable run, if it is drawable.
    pub fn drawable_free_space(&self, zone_id: u32, chunk_id: u32) -> Option<u32> {
        let ledger = self.ledger.lock();
        let s = ledger.index.get(&(zone_id, chunk_id))?;
        ledger.runs.get(s).map(|e| e.free_space)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_class::{AllocClassCollection, ClassShape};
    use crate::layout::{CHUNK_SIZE, HEAP_HEADER_SIZE, ZONE_MIN_SIZE};
    use crate::memblock::run_init;
    use crate::persist::{NoopPersist, PoolView};
    use crate::region::PoolRegion;

    fn element(chunk_id: u32, free_space: u32, max_free_span: u32) -> RecyclerElement {
        RecyclerElement {
            zone_id: 0,
            chunk_id,
            size_idx: 1,
            free_space,
            max_free_span,
        }
    }

    #[test]
    fn test_get_prefers_most_free() {
        let r = Recycler::new(100);
        r.put(element(1, 10, 10));
        r.put(element(2, 80, 40));
        r.put(element(3, 50, 30));
        let mut m = MemoryBlock::NONE;
        m.size_idx = 5;
        assert!(r.get(&mut m));
        assert_eq!(m.chunk_id, 2);
        assert!(r.get(&mut m));
        assert_eq!(m.chunk_id, 3);
    }

    #[test]
    fn test_get_skips_runs_without_a_big_enough_span() {
        let r = Recycler::new(100);
        r.put(element(1, 90, 2));
        r.put(element(2, 30, 20));
        let mut m = MemoryBlock::NONE;
        m.size_idx = 10;
        assert!(r.get(&mut m));
        assert_eq!(m.chunk_id, 2, "most-free run cannot hold 10 cells");
    }

    #[test]
    fn test_get_removes_drawn_run() {
        let r = Recycler::new(100);
        r.put(element(1, 10, 10));
        let mut m = MemoryBlock::NONE;
        m.size_idx = 1;
        assert!(r.get(&mut m));
        assert!(!r.get(&mut m));
    }

    #[test]
    fn test_recalc_respects_threshold() {
        let region = PoolRegion::new(HEAP_HEADER_SIZE + ZONE_MIN_SIZE);
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let r = Recycler::new(1000);
        r.inc_unaccounted(0, 0, 1);
        assert!(r.recalc(&view, false).is_empty());
        assert_eq!(r.unaccounted_total(), 1);
    }

    #[test]
    fn test_recalc_emits_empty_runs_and_keeps_partial_ones() {
        let classes = AllocClassCollection::new();
        let class = *classes.by_alloc_size(64);
        let ClassShape::Run(rdsc) = class.shape else {
            panic!("expected run class");
        };
        let region = PoolRegion::new(HEAP_HEADER_SIZE + ZONE_MIN_SIZE + 4 * CHUNK_SIZE);
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };

        // Run at chunk 0 fully free, run at chunk 1 with one claimed cell.
        let run0 = run_init(&view, 0, 0, &rdsc, class.header_type);
        let run1 = run_init(&view, 0, 1, &rdsc, class.header_type);
        let cell = MemoryBlock {
            size_idx: 1,
            block_off: 0,
            ..run1
        };
        assert!(cell.claim_cells(&view));

        let r = Recycler::new(rdsc.nallocs);
        // Stale snapshots: both look partially free.
        r.put(RecyclerElement {
            free_space: rdsc.nallocs - 1,
            ..element_new(&view, &run0)
        });
        r.put(element_new(&view, &run1));
        r.inc_unaccounted(0, 0, 1);
        r.inc_unaccounted(0, 1, 1);

        let empties = r.recalc(&view, true);
        assert_eq!(empties.len(), 1);
        assert_eq!(empties[0].chunk_id, 0);
        assert_eq!(r.unaccounted_total(), 0);

        let mut m = MemoryBlock::NONE;
        m.size_idx = 1;
        assert!(r.get(&mut m), "partial run stays drawable");
        assert_eq!(m.chunk_id, 1);
        assert!(!r.get(&mut m), "empty run must have left the ledger");
    }

    #[test]
    fn test_pending_frees_against_non_drawable_runs_stay_pending() {
        let region = PoolRegion::new(HEAP_HEADER_SIZE + ZONE_MIN_SIZE);
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let r = Recycler::new(4);
        r.inc_unaccounted(0, 7, 1);
        r.inc_unaccounted(0, 7, 1);
        let empties = r.recalc(&view, true);
        assert!(empties.is_empty());
        assert_eq!(r.pending_for(0, 7), 2);
        assert_eq!(r.unaccounted_total(), 2);
    }

    #[test]
    fn test_put_folds_pending_counts() {
        let r = Recycler::new(100);
        r.inc_unaccounted(0, 3, 1);
        r.put(element(3, 42, 10));
        assert_eq!(r.pending_for(0, 3), 0);
        assert_eq!(r.unaccounted_total(), 0);
        assert_eq!(r.drawable_free_space(0, 3), Some(42));
    }
}
