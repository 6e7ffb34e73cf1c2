//! Memory blocks.
//!
//! A memory block is the allocator's unit of discourse: a value-type handle
//! for either a huge chunk extent or a cell inside a run. Its flavor and
//! header type are rebuilt from the persistent chunk headers; nothing
//! volatile is ever written into the pool.

use std::ops::ControlFlow;

use crate::alloc_class::{HeaderType, RunDescriptor, run_geometry};
use crate::layout::{
    CHUNK_SIZE, ChunkHeader, ChunkKind, RUN_BASE_METADATA_SIZE, chunk_data_offset,
    chunk_header_offset, read_chunk_header, write_chunk_header,
};
use crate::persist::PoolView;

/// Flavor of a memory block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    /// Spans one or more whole chunks.
    Huge,
    /// A run, or a cell within one.
    Run,
}

/// Persistent state a block can be driven to through [`MemoryBlock::prep_hdr`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Allocated,
    Free,
}

/// Value-type handle identifying a block of pool memory.
///
/// `size_idx` counts chunks for huge blocks and whole runs, and units for
/// run cells. `block_off` is the unit offset of a cell inside its run; it is
/// 0 for huge blocks and whole runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    pub zone_id: u32,
    pub chunk_id: u32,
    pub size_idx: u32,
    pub block_off: u32,
    pub kind: BlockKind,
    pub header_type: HeaderType,
}

impl MemoryBlock {
    /// Sentinel for "no block yet".
    pub const NONE: MemoryBlock = MemoryBlock {
        zone_id: 0,
        chunk_id: 0,
        size_idx: 0,
        block_off: 0,
        kind: BlockKind::Huge,
        header_type: HeaderType::Compact,
    };

    pub fn new_huge(zone_id: u32, chunk_id: u32, size_idx: u32) -> Self {
        MemoryBlock {
            zone_id,
            chunk_id,
            size_idx,
            ..MemoryBlock::NONE
        }
    }

    /// Reclassifies the block from its persistent chunk header.
    pub fn rebuild(&mut self, view: &PoolView<'_>) {
        let hdr = self.chunk_header(view);
        self.kind = if hdr.kind == ChunkKind::Run {
            BlockKind::Run
        } else {
            BlockKind::Huge
        };
        self.header_type = HeaderType::from_chunk_flags(hdr.flags);
    }

    /// The header of the chunk this block starts in.
    pub fn chunk_header(&self, view: &PoolView<'_>) -> ChunkHeader {
        read_chunk_header(view.region, self.zone_id, self.chunk_id)
    }

    /// Drives the block's persistent state: chunk header for huge blocks,
    /// bitmap bits for run cells. Writes go through the WAL.
    pub fn prep_hdr(&self, view: &PoolView<'_>, state: BlockState) {
        match self.kind {
            BlockKind::Huge => {
                let (kind, flags) = match state {
                    BlockState::Allocated => (ChunkKind::Used, self.header_type.chunk_flags()),
                    BlockState::Free => (ChunkKind::Free, 0),
                };
                write_extent_headers(view, self.zone_id, self.chunk_id, kind, flags, self.size_idx);
            }
            BlockKind::Run => match state {
                BlockState::Allocated => {
                    debug_assert!(self.cells_claimed(view), "allocated cell bits must be set");
                }
                BlockState::Free => self.free_cells(view),
            },
        }
    }

    /// The run header (cell size, alignment) of the run this block lives in.
    pub fn run_header(&self, view: &PoolView<'_>) -> (u64, u64) {
        let data = chunk_data_offset(self.zone_id, self.chunk_id);
        (view.region.load(data), view.region.load(data + 8))
    }

    /// The allocation bitmap of the run this block lives in.
    pub fn run_bitmap(&self, view: &PoolView<'_>) -> RunBitmap {
        let hdr = self.chunk_header(view);
        debug_assert_eq!(hdr.kind, ChunkKind::Run);
        let (block_size, _) = self.run_header(view);
        let (nbits, nvals) = run_geometry(block_size as usize, hdr.size_idx);
        RunBitmap {
            nbits,
            nvals,
            off: chunk_data_offset(self.zone_id, self.chunk_id) + RUN_BASE_METADATA_SIZE,
        }
    }

    /// Byte offset of cell `bit` in this block's run.
    pub fn cell_offset(&self, view: &PoolView<'_>, bit: u32) -> usize {
        let (block_size, alignment) = self.run_header(view);
        let bitmap = self.run_bitmap(view);
        let mut start = chunk_data_offset(self.zone_id, self.chunk_id)
            + RUN_BASE_METADATA_SIZE
            + bitmap.nvals as usize * 8;
        if alignment > 0 {
            let rem = start % alignment as usize;
            if rem != 0 {
                start += alignment as usize - rem;
            }
        }
        start + bit as usize * block_size as usize
    }

    /// First byte of this block's payload.
    pub fn data_offset(&self, view: &PoolView<'_>) -> usize {
        match self.kind {
            BlockKind::Huge => chunk_data_offset(self.zone_id, self.chunk_id),
            BlockKind::Run => self.cell_offset(view, self.block_off),
        }
    }

    /// Payload range usable by the caller, past the embedded block header.
    pub fn usable_data(&self, view: &PoolView<'_>) -> (usize, usize) {
        let total = match self.kind {
            BlockKind::Huge => self.size_idx as usize * CHUNK_SIZE,
            BlockKind::Run => {
                let (block_size, _) = self.run_header(view);
                self.size_idx as usize * block_size as usize
            }
        };
        let hdr = self.header_type.size();
        (self.data_offset(view) + hdr, total - hdr)
    }

    /// Atomically claims this cell's bits in the run bitmap. Returns false
    /// if any bit was already taken.
    pub fn claim_cells(&self, view: &PoolView<'_>) -> bool {
        debug_assert_eq!(self.kind, BlockKind::Run);
        let bitmap = self.run_bitmap(view);
        let (off, mask) = bitmap.word_mask(self.block_off, self.size_idx);
        let mut cur = view.region.load(off);
        loop {
            if cur & mask != 0 {
                return false;
            }
            match view.region.compare_exchange(off, cur, cur | mask) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
        view.persist(off, 8);
        true
    }

    /// Clears this cell's bits in the run bitmap.
    pub fn free_cells(&self, view: &PoolView<'_>) {
        debug_assert_eq!(self.kind, BlockKind::Run);
        let bitmap = self.run_bitmap(view);
        let (off, mask) = bitmap.word_mask(self.block_off, self.size_idx);
        let mut cur = view.region.load(off);
        loop {
            debug_assert_eq!(cur & mask, mask, "freed cell bits must be set");
            match view.region.compare_exchange(off, cur, cur & !mask) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }
        view.persist(off, 8);
    }

    fn cells_claimed(&self, view: &PoolView<'_>) -> bool {
        let bitmap = self.run_bitmap(view);
        let (off, mask) = bitmap.word_mask(self.block_off, self.size_idx);
        view.region.load(off) & mask == mask
    }

    /// Idempotent per-chunk fixup applied while rebuilding volatile state.
    /// For runs this re-pins the unused tail bits of the bitmap.
    pub fn reinit_chunk(&self, view: &PoolView<'_>) {
        if self.kind != BlockKind::Run {
            return;
        }
        let bitmap = self.run_bitmap(view);
        let tail = bitmap.tail_mask();
        if tail == 0 {
            return;
        }
        let off = bitmap.word_off(bitmap.nvals - 1);
        let mut cur = view.region.load(off);
        while cur & tail != tail {
            match view.region.compare_exchange(off, cur, cur | tail) {
                Ok(_) => {
                    view.persist(off, 8);
                    break;
                }
                Err(v) => cur = v,
            }
        }
    }

    /// Writes through the block header kind expected by the block's class.
    pub fn ensure_header_type(&mut self, view: &PoolView<'_>, ht: HeaderType) {
        match self.kind {
            BlockKind::Huge => {
                let hdr = self.chunk_header(view);
                if HeaderType::from_chunk_flags(hdr.flags) != ht {
                    write_chunk_header(
                        view.region,
                        self.zone_id,
                        self.chunk_id,
                        ChunkHeader::new(hdr.kind, ht.chunk_flags(), hdr.size_idx),
                    );
                    view.persist(chunk_header_offset(self.zone_id, self.chunk_id), 8);
                }
                if ht == HeaderType::Compact {
                    let size = self.size_idx as u64 * CHUNK_SIZE as u64;
                    write_compact_record(view, chunk_data_offset(self.zone_id, self.chunk_id), size);
                }
            }
            BlockKind::Run => {
                debug_assert_eq!(
                    HeaderType::from_chunk_flags(self.chunk_header(view).flags),
                    ht,
                    "run header type is fixed at run creation"
                );
                if ht == HeaderType::Compact {
                    let (block_size, _) = self.run_header(view);
                    let size = self.size_idx as u64 * block_size;
                    write_compact_record(view, self.cell_offset(view, self.block_off), size);
                }
            }
        }
        self.header_type = ht;
    }

    /// Calls `cb` for every allocated block inside this chunk extent,
    /// starting at `block_off` for runs.
    pub fn iterate_used(
        &self,
        view: &PoolView<'_>,
        cb: &mut dyn FnMut(&MemoryBlock) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        match self.kind {
            BlockKind::Huge => {
                let hdr = self.chunk_header(view);
                if hdr.kind == ChunkKind::Used {
                    let m = MemoryBlock {
                        size_idx: hdr.size_idx,
                        block_off: 0,
                        header_type: HeaderType::from_chunk_flags(hdr.flags),
                        ..*self
                    };
                    cb(&m)?;
                }
                ControlFlow::Continue(())
            }
            BlockKind::Run => {
                let hdr = self.chunk_header(view);
                let header_type = HeaderType::from_chunk_flags(hdr.flags);
                let (block_size, _) = self.run_header(view);
                let bitmap = self.run_bitmap(view);
                let mut bit = self.block_off;
                while bit < bitmap.nbits {
                    if !bitmap.is_set(view, bit) {
                        bit += 1;
                        continue;
                    }
                    let units = match header_type {
                        HeaderType::None => 1,
                        HeaderType::Compact => {
                            let size = view.region.load(self.cell_offset(view, bit));
                            ((size / block_size.max(1)) as u32).max(1)
                        }
                    };
                    let m = MemoryBlock {
                        size_idx: units.min(bitmap.nbits - bit),
                        block_off: bit,
                        header_type,
                        ..*self
                    };
                    cb(&m)?;
                    bit += m.size_idx;
                }
                ControlFlow::Continue(())
            }
        }
    }

    /// The key recovering this run's allocation class: persistent cell size,
    /// chunk flags, chunk extent.
    pub fn run_class_key(&self, view: &PoolView<'_>) -> (usize, u16, u32) {
        let hdr = self.chunk_header(view);
        let (block_size, _) = self.run_header(view);
        (block_size as usize, hdr.flags, hdr.size_idx)
    }
}

/// Writes the 16-byte compact block header (size, reserved) at `off`.
fn write_compact_record(view: &PoolView<'_>, off: usize, size: u64) {
    view.region.store(off, size);
    view.region.store(off + 8, 0);
    view.persist(off, 16);
}

/// Writes the chunk header of an extent plus the footer the prev-neighbor
/// lookup depends on. Intermediate headers are left alone.
fn write_extent_headers(
    view: &PoolView<'_>,
    zone_id: u32,
    chunk_id: u32,
    kind: ChunkKind,
    flags: u16,
    size_idx: u32,
) {
    if size_idx > 1 {
        write_chunk_header(
            view.region,
            zone_id,
            chunk_id + size_idx - 1,
            ChunkHeader::new(ChunkKind::Unknown, 0, size_idx),
        );
        view.persist(chunk_header_offset(zone_id, chunk_id + size_idx - 1), 8);
    }
    write_chunk_header(
        view.region,
        zone_id,
        chunk_id,
        ChunkHeader::new(kind, flags, size_idx),
    );
    view.persist(chunk_header_offset(zone_id, chunk_id), 8);
}

/// Initializes a FREE chunk extent and returns its block. Intermediate
/// headers are zeroed and the footer is written so neighbor lookups work.
pub fn huge_init(view: &PoolView<'_>, zone_id: u32, chunk_id: u32, size_idx: u32) -> MemoryBlock {
    debug_assert!(size_idx > 0);
    for i in 1..size_idx.saturating_sub(1) {
        write_chunk_header(
            view.region,
            zone_id,
            chunk_id + i,
            ChunkHeader::new(ChunkKind::Unknown, 0, 0),
        );
    }
    if size_idx > 1 {
        write_chunk_header(
            view.region,
            zone_id,
            chunk_id + size_idx - 1,
            ChunkHeader::new(ChunkKind::Unknown, 0, size_idx),
        );
    }
    write_chunk_header(
        view.region,
        zone_id,
        chunk_id,
        ChunkHeader::new(ChunkKind::Free, 0, size_idx),
    );
    view.persist(
        chunk_header_offset(zone_id, chunk_id),
        size_idx as usize * 8,
    );
    MemoryBlock::new_huge(zone_id, chunk_id, size_idx)
}

/// Initializes a run on a free chunk extent: run header, zeroed bitmap with
/// the unused tail pre-set, then the chunk headers. The header write comes
/// last so an interrupted init leaves the extent FREE.
pub fn run_init(
    view: &PoolView<'_>,
    zone_id: u32,
    chunk_id: u32,
    rdsc: &RunDescriptor,
    header_type: HeaderType,
) -> MemoryBlock {
    let data = chunk_data_offset(zone_id, chunk_id);
    view.region.store(data, rdsc.unit_size as u64);
    view.region.store(data + 8, rdsc.alignment as u64);

    let bitmap_off = data + RUN_BASE_METADATA_SIZE;
    for v in 0..rdsc.bitmap_nvals as usize {
        view.region.store(bitmap_off + v * 8, 0);
    }
    let tail_bits = rdsc.bitmap_nbits % 64;
    if tail_bits != 0 {
        view.region.store(
            bitmap_off + (rdsc.bitmap_nvals as usize - 1) * 8,
            !0u64 << tail_bits,
        );
    }
    view.persist(data, RUN_BASE_METADATA_SIZE + rdsc.bitmap_nvals as usize * 8);

    let flags = header_type.chunk_flags();
    for i in 1..rdsc.size_idx {
        write_chunk_header(
            view.region,
            zone_id,
            chunk_id + i,
            ChunkHeader::new(ChunkKind::RunData, flags, rdsc.size_idx - i),
        );
    }
    write_chunk_header(
        view.region,
        zone_id,
        chunk_id,
        ChunkHeader::new(ChunkKind::Run, flags, rdsc.size_idx),
    );
    view.persist(
        chunk_header_offset(zone_id, chunk_id),
        rdsc.size_idx as usize * 8,
    );

    MemoryBlock {
        zone_id,
        chunk_id,
        size_idx: rdsc.size_idx,
        block_off: 0,
        kind: BlockKind::Run,
        header_type,
    }
}

/// View over a run's allocation bitmap.
#[derive(Clone, Copy, Debug)]
pub struct RunBitmap {
    /// Real cell bits; bits past this up to `nvals * 64` are pinned set.
    pub nbits: u32,
    /// 64-bit words in the bitmap.
    pub nvals: u32,
    /// Byte offset of the first bitmap word.
    pub off: usize,
}

impl RunBitmap {
    fn word_off(&self, val: u32) -> usize {
        self.off + val as usize * 8
    }

    /// Mask for `units` bits starting at `bit`. Spans never cross a word.
    fn word_mask(&self, bit: u32, units: u32) -> (usize, u64) {
        let shift = bit % 64;
        debug_assert!(units >= 1 && shift + units <= 64, "span crosses a word");
        let mask = if units == 64 {
            u64::MAX
        } else {
            ((1u64 << units) - 1) << shift
        };
        (self.word_off(bit / 64), mask)
    }

    /// Mask of the pinned tail bits in the last word; 0 if none.
    pub fn tail_mask(&self) -> u64 {
        let tail = self.nbits % 64;
        if tail == 0 { 0 } else { !0u64 << tail }
    }

    pub fn is_set(&self, view: &PoolView<'_>, bit: u32) -> bool {
        view.region.load(self.word_off(bit / 64)) & (1 << (bit % 64)) != 0
    }

    /// Number of free cells. The pinned tail keeps unused bits out.
    pub fn free_count(&self, view: &PoolView<'_>) -> u32 {
        (0..self.nvals)
            .map(|v| view.region.load(self.word_off(v)).count_zeros())
            .sum()
    }

    /// Longest run of free cells within a single word, which is the largest
    /// span a single allocation can take.
    pub fn max_free_span(&self, view: &PoolView<'_>) -> u32 {
        let mut best = 0;
        for v in 0..self.nvals {
            let word = view.region.load(self.word_off(v));
            zero_runs(word, |_, len| best = best.max(len));
        }
        best
    }

    /// Calls `f(bit, len)` for every maximal free span; spans are bounded
    /// by word edges to match the allocation granularity.
    pub fn for_each_free_span(&self, view: &PoolView<'_>, mut f: impl FnMut(u32, u32)) {
        for v in 0..self.nvals {
            let word = view.region.load(self.word_off(v));
            zero_runs(word, |start, len| f(v * 64 + start, len));
        }
    }
}

fn zero_runs(word: u64, mut f: impl FnMut(u32, u32)) {
    let mut bit = 0;
    while bit < 64 {
        if word & (1 << bit) != 0 {
            bit += 1;
            continue;
        }
        let start = bit;
        while bit < 64 && word & (1 << bit) == 0 {
            bit += 1;
        }
        f(start, bit - start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc_class::AllocClassCollection;
    use crate::layout::{HEAP_HEADER_SIZE, ZONE_MIN_SIZE, read_chunk_header};
    use crate::persist::NoopPersist;
    use crate::region::PoolRegion;

    fn test_region() -> PoolRegion {
        PoolRegion::new(HEAP_HEADER_SIZE + ZONE_MIN_SIZE + 8 * CHUNK_SIZE)
    }

    fn rdsc_for(unit: usize) -> RunDescriptor {
        let classes = AllocClassCollection::new();
        match classes.by_alloc_size(unit).shape {
            crate::alloc_class::ClassShape::Run(rdsc) => rdsc,
            crate::alloc_class::ClassShape::Huge => panic!("expected run class"),
        }
    }

    #[test]
    fn test_huge_init_writes_header_and_footer() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let m = huge_init(&view, 0, 2, 5);
        assert_eq!(m.size_idx, 5);
        let hdr = read_chunk_header(&region, 0, 2);
        assert_eq!(hdr.kind, ChunkKind::Free);
        assert_eq!(hdr.size_idx, 5);
        let footer = read_chunk_header(&region, 0, 6);
        assert_eq!(footer.size_idx, 5);
        assert_eq!(read_chunk_header(&region, 0, 3).size_idx, 0);
    }

    #[test]
    fn test_run_init_pins_tail_bits() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(64);
        let m = run_init(&view, 0, 0, &rdsc, HeaderType::Compact);
        let bitmap = m.run_bitmap(&view);
        assert_eq!(bitmap.nbits, rdsc.nallocs);
        assert_eq!(bitmap.free_count(&view), rdsc.nallocs);
        let hdr = m.chunk_header(&view);
        assert_eq!(hdr.kind, ChunkKind::Run);
        assert_eq!(hdr.flags, HeaderType::Compact.chunk_flags());
    }

    #[test]
    fn test_run_init_marks_continuation_chunks() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(16384);
        assert!(rdsc.size_idx > 1);
        let m = run_init(&view, 0, 1, &rdsc, HeaderType::Compact);
        for i in 1..rdsc.size_idx {
            let hdr = read_chunk_header(&region, 0, 1 + i);
            assert_eq!(hdr.kind, ChunkKind::RunData);
            assert_eq!(hdr.size_idx, rdsc.size_idx - i);
        }
        assert_eq!(m.run_header(&view).0, 16384);
    }

    #[test]
    fn test_claim_and_free_cells() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(64);
        let run = run_init(&view, 0, 0, &rdsc, HeaderType::Compact);
        let cell = MemoryBlock {
            size_idx: 3,
            block_off: 8,
            ..run
        };
        assert!(cell.claim_cells(&view));
        assert!(!cell.claim_cells(&view), "double claim must fail");
        let bitmap = run.run_bitmap(&view);
        assert_eq!(bitmap.free_count(&view), rdsc.nallocs - 3);
        cell.free_cells(&view);
        assert_eq!(bitmap.free_count(&view), rdsc.nallocs);
    }

    #[test]
    fn test_free_spans_are_word_bounded() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(64);
        let run = run_init(&view, 0, 0, &rdsc, HeaderType::Compact);
        let cell = MemoryBlock {
            size_idx: 1,
            block_off: 10,
            ..run
        };
        assert!(cell.claim_cells(&view));
        let mut spans = Vec::new();
        run.run_bitmap(&view)
            .for_each_free_span(&view, |bit, len| {
                if bit < 128 {
                    spans.push((bit, len));
                }
            });
        assert_eq!(spans[0], (0, 10));
        assert_eq!(spans[1], (11, 53));
        assert_eq!(spans[2], (64, 64));
    }

    #[test]
    fn test_reinit_chunk_repairs_tail() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(64);
        let run = run_init(&view, 0, 0, &rdsc, HeaderType::Compact);
        let bitmap = run.run_bitmap(&view);
        if bitmap.tail_mask() == 0 {
            return;
        }
        // Clobber the tail, as a torn write would.
        region.store(bitmap.word_off(bitmap.nvals - 1), 0);
        run.reinit_chunk(&view);
        assert_eq!(bitmap.free_count(&view), rdsc.nallocs);
    }

    #[test]
    fn test_prep_hdr_huge_roundtrip() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let mut m = huge_init(&view, 0, 0, 4);
        m.ensure_header_type(&view, HeaderType::Compact);
        m.prep_hdr(&view, BlockState::Allocated);
        let hdr = m.chunk_header(&view);
        assert_eq!(hdr.kind, ChunkKind::Used);
        assert_eq!(hdr.flags, HeaderType::Compact.chunk_flags());
        m.prep_hdr(&view, BlockState::Free);
        assert_eq!(m.chunk_header(&view).kind, ChunkKind::Free);
    }

    #[test]
    fn test_iterate_used_reads_compact_headers() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(64);
        let run = run_init(&view, 0, 0, &rdsc, HeaderType::Compact);

        let mut a = MemoryBlock {
            size_idx: 2,
            block_off: 0,
            ..run
        };
        assert!(a.claim_cells(&view));
        a.ensure_header_type(&view, HeaderType::Compact);
        let mut b = MemoryBlock {
            size_idx: 1,
            block_off: 5,
            ..run
        };
        assert!(b.claim_cells(&view));
        b.ensure_header_type(&view, HeaderType::Compact);

        let mut seen = Vec::new();
        let flow = run.iterate_used(&view, &mut |m| {
            seen.push((m.block_off, m.size_idx));
            ControlFlow::Continue(())
        });
        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(seen, vec![(0, 2), (5, 1)]);
    }

    #[test]
    fn test_rebuild_classifies_by_header() {
        let region = test_region();
        let ops = NoopPersist;
        let view = PoolView {
            region: &region,
            p_ops: &ops,
        };
        let rdsc = rdsc_for(64);
        run_init(&view, 0, 0, &rdsc, HeaderType::Compact);
        huge_init(&view, 0, 1, 2);

        let mut m = MemoryBlock::new_huge(0, 0, 1);
        m.rebuild(&view);
        assert_eq!(m.kind, BlockKind::Run);
        let mut h = MemoryBlock::new_huge(0, 1, 2);
        h.rebuild(&view);
        assert_eq!(h.kind, BlockKind::Huge);
    }
}
