//! Allocation classes.
//!
//! A class decides how a requested size is serviced: small sizes map onto a
//! run class with a fixed cell size and a precomputed run geometry, anything
//! above the ladder falls through to the huge default class, which hands out
//! whole chunk extents.

use crate::error::HeapError;
use crate::layout::{
    CHUNK_FLAG_COMPACT_HEADER, CHUNK_FLAG_HEADER_NONE, CHUNK_SIZE, MAX_CHUNK,
    RUN_BASE_METADATA_SIZE,
};

/// Number of registrable allocation classes.
pub const MAX_ALLOCATION_CLASSES: usize = 255;

/// Id of the reserved huge default class.
pub const DEFAULT_ALLOC_CLASS_ID: u8 = 255;

/// Largest number of units a single run allocation may span. Free spans are
/// tracked per bitmap word, so this is also the span granularity.
pub const RUN_UNIT_MAX: u32 = 64;

/// Cell sizes of the default run ladder.
const DEFAULT_RUN_UNIT_SIZES: [usize; 16] = [
    64, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144, 8192, 12288, 16384,
];

/// Kind of block header embedded in allocated data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderType {
    /// 16-byte record carrying the block size.
    Compact,
    /// No header; every cell is exactly one unit.
    None,
}

impl HeaderType {
    /// Bytes the header takes out of the block payload.
    pub fn size(self) -> usize {
        match self {
            HeaderType::Compact => 16,
            HeaderType::None => 0,
        }
    }

    /// Chunk flag bits recording this header type.
    pub fn chunk_flags(self) -> u16 {
        match self {
            HeaderType::Compact => CHUNK_FLAG_COMPACT_HEADER,
            HeaderType::None => CHUNK_FLAG_HEADER_NONE,
        }
    }

    /// Recovers the header type from chunk flag bits.
    pub fn from_chunk_flags(flags: u16) -> Self {
        if flags & CHUNK_FLAG_HEADER_NONE != 0 {
            HeaderType::None
        } else {
            HeaderType::Compact
        }
    }
}

/// Whether a class hands out chunk extents or run cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassKind {
    Huge,
    Run,
}

/// Precomputed geometry shared by every run of one class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunDescriptor {
    /// Cell size in bytes.
    pub unit_size: usize,
    /// Required alignment of the first cell; 0 means none.
    pub alignment: usize,
    /// Chunks per run.
    pub size_idx: u32,
    /// Cells per run.
    pub nallocs: u32,
    /// Bits in the allocation bitmap; equals `nallocs`.
    pub bitmap_nbits: u32,
    /// 64-bit words in the allocation bitmap.
    pub bitmap_nvals: u32,
}

/// Computes how many cells of `unit_size` bytes fit into a run of
/// `size_idx` chunks next to the bitmap tracking them, and how many bitmap
/// words that takes. The two quantities depend on each other, so this
/// iterates to the fixpoint.
pub fn run_geometry(unit_size: usize, size_idx: u32) -> (u32, u32) {
    let content = size_idx as usize * CHUNK_SIZE - RUN_BASE_METADATA_SIZE;
    let mut nallocs = content / unit_size;
    loop {
        let nvals = nallocs.div_ceil(64);
        let fit = (content - nvals * 8) / unit_size;
        if fit >= nallocs {
            break;
        }
        nallocs = fit;
    }
    (nallocs as u32, nallocs.div_ceil(64) as u32)
}

fn run_descriptor(unit_size: usize, alignment: usize, size_idx: u32) -> RunDescriptor {
    let (nallocs, bitmap_nvals) = run_geometry(unit_size, size_idx);
    RunDescriptor {
        unit_size,
        alignment,
        size_idx,
        nallocs,
        bitmap_nbits: nallocs,
        bitmap_nvals,
    }
}

/// One allocation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocClass {
    pub id: u8,
    /// Cell size for runs, `CHUNK_SIZE` for the huge class.
    pub unit_size: usize,
    pub header_type: HeaderType,
    pub shape: ClassShape,
}

/// Run classes carry their geometry; the huge class has none.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassShape {
    Huge,
    Run(RunDescriptor),
}

impl AllocClass {
    pub fn kind(&self) -> ClassKind {
        match self.shape {
            ClassShape::Huge => ClassKind::Huge,
            ClassShape::Run(_) => ClassKind::Run,
        }
    }
}

/// Registry of all allocation classes of one heap.
pub struct AllocClassCollection {
    classes: Vec<Option<AllocClass>>,
    /// Run class ids sorted by unit size.
    run_ladder: Vec<u8>,
}

impl AllocClassCollection {
    /// Builds the registry with the huge default class and the default run
    /// ladder.
    pub fn new() -> Self {
        let mut c = Self {
            classes: vec![None; MAX_ALLOCATION_CLASSES + 1],
            run_ladder: Vec::new(),
        };
        c.classes[DEFAULT_ALLOC_CLASS_ID as usize] = Some(AllocClass {
            id: DEFAULT_ALLOC_CLASS_ID,
            unit_size: CHUNK_SIZE,
            header_type: HeaderType::Compact,
            shape: ClassShape::Huge,
        });
        for &unit in &DEFAULT_RUN_UNIT_SIZES {
            let size_idx = default_run_size_idx(unit);
            // The default ladder is statically valid; a failure here is a
            // table bug.
            c.register_run_class(unit, size_idx, HeaderType::Compact)
                .unwrap_or_else(|e| panic!("default run ladder: {e}"));
        }
        c
    }

    /// Registers a new run class and returns its id.
    pub fn register_run_class(
        &mut self,
        unit_size: usize,
        size_idx: u32,
        header_type: HeaderType,
    ) -> Result<u8, HeapError> {
        if unit_size < 8 || unit_size % 8 != 0 {
            return Err(HeapError::ClassConfig("unit size must be a multiple of 8"));
        }
        if size_idx == 0 || size_idx as usize > MAX_CHUNK {
            return Err(HeapError::ClassConfig("run size_idx out of range"));
        }
        if unit_size + RUN_BASE_METADATA_SIZE + 8 > size_idx as usize * CHUNK_SIZE {
            return Err(HeapError::ClassConfig("unit size does not fit in a run"));
        }
        if self
            .by_run(unit_size, header_type.chunk_flags(), size_idx)
            .is_some()
        {
            return Err(HeapError::ClassConfig("duplicate run class"));
        }
        let id = self
            .classes[..MAX_ALLOCATION_CLASSES]
            .iter()
            .position(Option::is_none)
            .ok_or(HeapError::ClassConfig("no free class id"))? as u8;
        let class = AllocClass {
            id,
            unit_size,
            header_type,
            shape: ClassShape::Run(run_descriptor(unit_size, 0, size_idx)),
        };
        self.classes[id as usize] = Some(class);
        let pos = self
            .run_ladder
            .partition_point(|&other| self.unit_of(other) < unit_size);
        self.run_ladder.insert(pos, id);
        Ok(id)
    }

    fn unit_of(&self, id: u8) -> usize {
        self.classes[id as usize]
            .as_ref()
            .map_or(usize::MAX, |c| c.unit_size)
    }

    /// Returns the class with the given id.
    pub fn by_id(&self, id: u8) -> Option<&AllocClass> {
        self.classes[id as usize].as_ref()
    }

    /// The reserved huge class.
    pub fn default_class(&self) -> &AllocClass {
        self.classes[DEFAULT_ALLOC_CLASS_ID as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("default class missing"))
    }

    /// Returns the class that best fits an allocation of `size` bytes: the
    /// smallest-unit run class whose unit holds `size`, or the huge class.
    pub fn by_alloc_size(&self, size: usize) -> &AllocClass {
        for &id in &self.run_ladder {
            if let Some(c) = self.classes[id as usize].as_ref()
                && c.unit_size >= size
            {
                return c;
            }
        }
        self.default_class()
    }

    /// Reverse lookup used during recovery: classifies an existing run by
    /// its persistent cell size, chunk flags and chunk extent.
    pub fn by_run(&self, unit_size: usize, flags: u16, size_idx: u32) -> Option<&AllocClass> {
        let header_type = HeaderType::from_chunk_flags(flags);
        self.run_ladder.iter().find_map(|&id| {
            let c = self.classes[id as usize].as_ref()?;
            match c.shape {
                ClassShape::Run(rdsc)
                    if rdsc.unit_size == unit_size
                        && rdsc.size_idx == size_idx
                        && c.header_type == header_type =>
                {
                    Some(c)
                }
                _ => None,
            }
        })
    }

    /// Largest cell size served by a run class.
    pub fn max_run_unit_size(&self) -> usize {
        self.run_ladder
            .last()
            .map_or(0, |&id| self.unit_of(id))
    }

    /// Ids of all registered run classes, smallest unit first.
    pub fn run_class_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.run_ladder.iter().copied()
    }
}

impl Default for AllocClassCollection {
    fn default() -> Self {
        Self::new()
    }
}

/// Chunks per run for a default-ladder class: enough for at least 32 cells,
/// minimum one chunk.
fn default_run_size_idx(unit_size: usize) -> u32 {
    ((32 * unit_size).div_ceil(CHUNK_SIZE)).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_is_monotonic() {
        let c = AllocClassCollection::new();
        let units: Vec<usize> = c.run_class_ids().map(|id| c.unit_of(id)).collect();
        assert!(!units.is_empty());
        for w in units.windows(2) {
            assert!(w[0] < w[1], "ladder must be strictly increasing");
        }
    }

    #[test]
    fn test_by_alloc_size_monotonicity() {
        let c = AllocClassCollection::new();
        for size in [1, 8, 63, 64, 65, 500, 4096, 10_000, 16384] {
            let class = c.by_alloc_size(size);
            assert_eq!(class.kind(), ClassKind::Run);
            assert!(class.unit_size >= size, "unit must hold the request");
        }
        let huge = c.by_alloc_size(c.max_run_unit_size() + 1);
        assert_eq!(huge.kind(), ClassKind::Huge);
        assert_eq!(huge.id, DEFAULT_ALLOC_CLASS_ID);
    }

    #[test]
    fn test_by_alloc_size_picks_smallest_fit() {
        let c = AllocClassCollection::new();
        assert_eq!(c.by_alloc_size(64).unit_size, 64);
        assert_eq!(c.by_alloc_size(65).unit_size, 128);
        assert_eq!(c.by_alloc_size(129).unit_size, 192);
    }

    #[test]
    fn test_run_geometry_conservation() {
        for &unit in &DEFAULT_RUN_UNIT_SIZES {
            let size_idx = default_run_size_idx(unit);
            let (nallocs, nvals) = run_geometry(unit, size_idx);
            let content = size_idx as usize * CHUNK_SIZE - RUN_BASE_METADATA_SIZE;
            assert!(nallocs >= 1);
            assert_eq!(nvals, nallocs.div_ceil(64));
            let used = nvals as usize * 8 + nallocs as usize * unit;
            assert!(used <= content, "unit {unit}: geometry overflows the run");
            // One more cell must not fit (possibly costing an extra bitmap
            // word).
            let extra = (nallocs + 1).div_ceil(64) as usize * 8 + (nallocs as usize + 1) * unit;
            assert!(extra > content, "unit {unit}: geometry is not maximal");
        }
    }

    #[test]
    fn test_by_run_reverse_lookup() {
        let c = AllocClassCollection::new();
        let class = c.by_alloc_size(64);
        let ClassShape::Run(rdsc) = class.shape else {
            panic!("expected run class");
        };
        let found = c
            .by_run(64, class.header_type.chunk_flags(), rdsc.size_idx)
            .expect("reverse lookup must find the registered class");
        assert_eq!(found.id, class.id);
        assert!(c.by_run(64, class.header_type.chunk_flags(), 99).is_none());
    }

    #[test]
    fn test_register_custom_class() {
        let mut c = AllocClassCollection::new();
        let id = c
            .register_run_class(24 * 1024, 4, HeaderType::None)
            .expect("custom class");
        let class = c.by_id(id).expect("registered class");
        assert_eq!(class.unit_size, 24 * 1024);
        assert_eq!(class.header_type, HeaderType::None);
        assert_eq!(c.by_alloc_size(20 * 1024).id, id);
    }

    #[test]
    fn test_register_rejects_bad_config() {
        let mut c = AllocClassCollection::new();
        assert!(c.register_run_class(7, 1, HeaderType::Compact).is_err());
        assert!(c.register_run_class(64, 0, HeaderType::Compact).is_err());
        assert!(
            c.register_run_class(64, 1, HeaderType::Compact).is_err(),
            "duplicate of the default ladder"
        );
    }

    #[test]
    fn test_default_class_is_huge() {
        let c = AllocClassCollection::new();
        assert_eq!(c.default_class().kind(), ClassKind::Huge);
        assert_eq!(c.default_class().unit_size, CHUNK_SIZE);
    }
}
