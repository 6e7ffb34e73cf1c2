//! Free-block containers.
//!
//! A container indexes the free blocks of one bucket. Huge blocks live in a
//! size-ordered tree so best-fit can pick the smallest extent that satisfies
//! a request; run spans live in segregated per-size LIFO stacks with a
//! nonempty mask for O(1) best-fit.

use crate::alloc_class::RUN_UNIT_MAX;
use crate::memblock::MemoryBlock;
use std::collections::BTreeMap;

/// Capability set shared by both container variants.
pub trait BlockContainer: Send {
    /// Adds a free block.
    fn insert(&mut self, m: MemoryBlock);

    /// Removes exactly `m` if present.
    fn remove_specific(&mut self, m: &MemoryBlock) -> bool;

    /// Removes and returns the best block with `size_idx >=` the request.
    fn get_rm_bestfit(&mut self, size_idx: u32) -> Option<MemoryBlock>;

    /// Removes and returns the lowest-address block with `size_idx >=` the
    /// request. Containers without an address order fall back to best-fit.
    fn get_rm_firstfit(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        self.get_rm_bestfit(size_idx)
    }

    fn is_empty(&self) -> bool;

    /// Drops all tracked blocks.
    fn clear(&mut self);
}

/// Size-ordered tree of huge blocks. Ties break toward the smaller address
/// so allocations stay compact at the front of the pool.
#[derive(Default)]
pub struct TreeContainer {
    map: BTreeMap<(u32, u32, u32), MemoryBlock>,
}

impl TreeContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(m: &MemoryBlock) -> (u32, u32, u32) {
        (m.size_idx, m.zone_id, m.chunk_id)
    }
}

impl BlockContainer for TreeContainer {
    fn insert(&mut self, m: MemoryBlock) {
        let prev = self.map.insert(Self::key(&m), m);
        debug_assert!(prev.is_none(), "duplicate free block");
    }

    fn remove_specific(&mut self, m: &MemoryBlock) -> bool {
        self.map.remove(&Self::key(m)).is_some()
    }

    fn get_rm_bestfit(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        let key = *self.map.range((size_idx, 0, 0)..).next()?.0;
        self.map.remove(&key)
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn clear(&mut self) {
        self.map.clear();
    }
}

/// Segregated free-lists for run spans: one LIFO stack per exact span size,
/// from 1 to `RUN_UNIT_MAX` units.
pub struct SeglistsContainer {
    lists: Vec<Vec<MemoryBlock>>,
    /// Bit `i` set iff `lists[i]` is nonempty.
    nonempty: u64,
}

impl SeglistsContainer {
    pub fn new() -> Self {
        Self {
            lists: (0..RUN_UNIT_MAX as usize).map(|_| Vec::new()).collect(),
            nonempty: 0,
        }
    }
}

impl Default for SeglistsContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockContainer for SeglistsContainer {
    fn insert(&mut self, m: MemoryBlock) {
        debug_assert!(m.size_idx >= 1 && m.size_idx <= RUN_UNIT_MAX);
        let idx = m.size_idx as usize - 1;
        self.lists[idx].push(m);
        self.nonempty |= 1 << idx;
    }

    fn remove_specific(&mut self, m: &MemoryBlock) -> bool {
        if m.size_idx < 1 || m.size_idx > RUN_UNIT_MAX {
            return false;
        }
        let idx = m.size_idx as usize - 1;
        let Some(pos) = self.lists[idx].iter().position(|b| {
            b.zone_id == m.zone_id && b.chunk_id == m.chunk_id && b.block_off == m.block_off
        }) else {
            return false;
        };
        self.lists[idx].swap_remove(pos);
        if self.lists[idx].is_empty() {
            self.nonempty &= !(1 << idx);
        }
        true
    }

    fn get_rm_bestfit(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        debug_assert!(size_idx >= 1 && size_idx <= RUN_UNIT_MAX);
        let candidates = self.nonempty >> (size_idx - 1);
        if candidates == 0 {
            return None;
        }
        let idx = (size_idx - 1 + candidates.trailing_zeros()) as usize;
        let m = self.lists[idx].pop();
        if self.lists[idx].is_empty() {
            self.nonempty &= !(1 << idx);
        }
        m
    }

    fn get_rm_firstfit(&mut self, size_idx: u32) -> Option<MemoryBlock> {
        debug_assert!(size_idx >= 1 && size_idx <= RUN_UNIT_MAX);
        if self.nonempty >> (size_idx - 1) == 0 {
            return None;
        }
        let mut found: Option<(usize, usize)> = None;
        let mut lowest = u32::MAX;
        for idx in (size_idx as usize - 1)..RUN_UNIT_MAX as usize {
            if self.nonempty & (1 << idx) == 0 {
                continue;
            }
            for (pos, b) in self.lists[idx].iter().enumerate() {
                if b.block_off < lowest {
                    lowest = b.block_off;
                    found = Some((idx, pos));
                }
            }
        }
        let (idx, pos) = found?;
        let m = self.lists[idx].swap_remove(pos);
        if self.lists[idx].is_empty() {
            self.nonempty &= !(1 << idx);
        }
        Some(m)
    }

    fn is_empty(&self) -> bool {
        self.nonempty == 0
    }

    fn clear(&mut self) {
        for list in &mut self.lists {
            list.clear();
        }
        self.nonempty = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memblock::MemoryBlock;

    fn huge(zone_id: u32, chunk_id: u32, size_idx: u32) -> MemoryBlock {
        MemoryBlock::new_huge(zone_id, chunk_id, size_idx)
    }

    fn span(chunk_id: u32, block_off: u32, size_idx: u32) -> MemoryBlock {
        MemoryBlock {
            chunk_id,
            block_off,
            size_idx,
            kind: crate::memblock::BlockKind::Run,
            ..MemoryBlock::NONE
        }
    }

    #[test]
    fn test_tree_bestfit_picks_smallest_sufficient() {
        let mut t = TreeContainer::new();
        t.insert(huge(0, 0, 2));
        t.insert(huge(0, 10, 8));
        t.insert(huge(0, 30, 4));
        let m = t.get_rm_bestfit(3).expect("fit exists");
        assert_eq!(m.size_idx, 4);
        assert!(t.get_rm_bestfit(100).is_none());
    }

    #[test]
    fn test_tree_ties_break_toward_lower_address() {
        let mut t = TreeContainer::new();
        t.insert(huge(0, 50, 4));
        t.insert(huge(0, 7, 4));
        let m = t.get_rm_bestfit(4).expect("fit exists");
        assert_eq!(m.chunk_id, 7);
    }

    #[test]
    fn test_tree_remove_specific() {
        let mut t = TreeContainer::new();
        let m = huge(1, 3, 5);
        t.insert(m);
        assert!(t.remove_specific(&m));
        assert!(!t.remove_specific(&m));
        assert!(t.is_empty());
    }

    #[test]
    fn test_seglists_exact_and_bestfit() {
        let mut s = SeglistsContainer::new();
        s.insert(span(0, 0, 4));
        s.insert(span(0, 64, 16));
        assert_eq!(s.get_rm_bestfit(4).map(|m| m.block_off), Some(0));
        assert_eq!(s.get_rm_bestfit(5).map(|m| m.block_off), Some(64));
        assert!(s.get_rm_bestfit(1).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn test_seglists_lifo_within_size() {
        let mut s = SeglistsContainer::new();
        s.insert(span(0, 0, 8));
        s.insert(span(0, 100, 8));
        assert_eq!(s.get_rm_bestfit(8).map(|m| m.block_off), Some(100));
        assert_eq!(s.get_rm_bestfit(8).map(|m| m.block_off), Some(0));
    }

    #[test]
    fn test_seglists_remove_specific_updates_mask() {
        let mut s = SeglistsContainer::new();
        let a = span(2, 10, 3);
        s.insert(a);
        assert!(!s.is_empty());
        assert!(s.remove_specific(&a));
        assert!(s.is_empty());
        assert!(s.get_rm_bestfit(1).is_none());
    }

    #[test]
    fn test_seglists_firstfit_prefers_low_offsets() {
        let mut s = SeglistsContainer::new();
        s.insert(span(0, 128, 64));
        s.insert(span(0, 0, 64));
        s.insert(span(0, 200, 3));
        // Best-fit by size would pick the 3-unit span; first-fit takes the
        // lowest offset that is large enough.
        assert_eq!(s.get_rm_firstfit(2).map(|m| m.block_off), Some(0));
        assert_eq!(s.get_rm_firstfit(64).map(|m| m.block_off), Some(128));
        assert_eq!(s.get_rm_firstfit(1).map(|m| m.block_off), Some(200));
        assert!(s.is_empty());
    }

    #[test]
    fn test_seglists_max_span() {
        let mut s = SeglistsContainer::new();
        s.insert(span(0, 0, RUN_UNIT_MAX));
        assert_eq!(
            s.get_rm_bestfit(RUN_UNIT_MAX).map(|m| m.size_idx),
            Some(RUN_UNIT_MAX)
        );
    }

    #[test]
    fn test_clear() {
        let mut s = SeglistsContainer::new();
        s.insert(span(0, 0, 1));
        s.clear();
        assert!(s.is_empty());
        let mut t = TreeContainer::new();
        t.insert(huge(0, 0, 1));
        t.clear();
        assert!(t.is_empty());
    }
}
