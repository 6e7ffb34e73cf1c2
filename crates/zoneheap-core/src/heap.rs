//! Top-level persistent heap.
//!
//! The heap owns the zones, the chunk metadata, and the volatile runtime
//! built around them: the allocation-class registry, the default zone set
//! with its buckets and recyclers, and the striped run locks. Zones are
//! initialized lazily the first time a refill reaches them.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::alloc_class::{
    AllocClass, AllocClassCollection, ClassKind, ClassShape, DEFAULT_ALLOC_CLASS_ID, HeaderType,
    MAX_ALLOCATION_CLASSES,
};
use crate::bucket::{Bucket, BucketGuard, BucketLocked};
use crate::error::HeapError;
use crate::layout::{
    CHUNK_FLAGS_ALL, CHUNK_HEADER_SIZE, CHUNK_SIZE, ChunkHeader, ChunkKind, HEAP_HEADER_SIZE,
    HEAP_MIN_SIZE, HeapHeader, MAX_CHUNK, ZONE_HEADER_SIZE, ZONE_MAGIC, ZONE_METADATA_SIZE,
    ZoneHeader, chunk_data_offset, chunk_header_offset, max_zone, read_chunk_header,
    read_zone_header, write_zone_header, zone_calc_size_idx, zone_offset,
};
use crate::memblock::{self, BlockKind, BlockState, MemoryBlock};
use crate::persist::{PersistOps, PoolView, RemoteReader};
use crate::recycler::{Recycler, element_new};
use crate::region::PoolRegion;
use crate::stats::HeapStats;

/// Number of striped mutexes protecting run chunk metadata.
pub const MAX_RUN_LOCKS: usize = MAX_CHUNK;

/// Collection of buckets and recyclers for one group of zones. There is a
/// single default set per heap; the accessor below keeps the seam where
/// per-zone sets would plug in.
pub struct ZoneSet {
    default_bucket: BucketLocked,
    buckets: Vec<Option<BucketLocked>>,
    recyclers: Vec<OnceLock<Recycler>>,
}

impl ZoneSet {
    fn new(classes: &AllocClassCollection) -> Self {
        let mut buckets: Vec<Option<BucketLocked>> =
            (0..MAX_ALLOCATION_CLASSES).map(|_| None).collect();
        for id in classes.run_class_ids() {
            if let Some(c) = classes.by_id(id) {
                buckets[id as usize] = Some(BucketLocked::new(Bucket::new_run(*c)));
            }
        }
        Self {
            default_bucket: BucketLocked::new(Bucket::new_huge(*classes.default_class())),
            buckets,
            recyclers: (0..MAX_ALLOCATION_CLASSES).map(|_| OnceLock::new()).collect(),
        }
    }
}

struct HeapRt {
    alloc_classes: AllocClassCollection,
    default_zset: ZoneSet,
    run_locks: Vec<Mutex<()>>,
    nzones: u32,
    /// Zones consumed by refills so far. Monotone; only ever advanced while
    /// the default bucket is held, which serializes the updates.
    zones_exhausted: AtomicU32,
}

/// The persistent heap: a mapped pool region plus the volatile runtime.
pub struct Heap {
    region: Arc<PoolRegion>,
    p_ops: Arc<dyn PersistOps>,
    stats: Arc<HeapStats>,
    /// Heap size in bytes, reconciled against the mapped region at boot.
    size: u64,
    /// Debug fill byte for fresh allocations: 0 = off, 0x100 | byte = on.
    debug_pattern: AtomicU16,
    rt: HeapRt,
}

impl Heap {
    /// Initializes a fresh heap in `region`: header plus zeroed zone
    /// headers. Zones themselves are laid out lazily at first use. Writes
    /// the established heap size into `sizep`.
    pub fn init(
        region: &PoolRegion,
        sizep: &mut u64,
        p_ops: &dyn PersistOps,
    ) -> Result<(), HeapError> {
        let size = region.size();
        if size < HEAP_MIN_SIZE {
            return Err(HeapError::InvalidSize {
                size,
                min: HEAP_MIN_SIZE,
            });
        }
        let header = HeapHeader::new().serialize();
        region.write_bytes(0, &header);
        p_ops.persist(region, 0, HEAP_HEADER_SIZE);
        for zone_id in 0..max_zone(size) {
            p_ops.memset(region, zone_offset(zone_id), 0, ZONE_HEADER_SIZE);
            p_ops.memset(region, chunk_header_offset(zone_id, 0), 0, CHUNK_HEADER_SIZE);
        }
        *sizep = size as u64;
        Ok(())
    }

    /// Opens the heap region and builds the volatile runtime.
    ///
    /// `sizep` is the caller's persistent heap-size field: zero on a first
    /// boot (it is established from the mapped size), otherwise it must not
    /// exceed the mapped region. If the pool grew between sessions the
    /// trailing zone's metadata is extended here.
    pub fn boot(
        region: Arc<PoolRegion>,
        sizep: &mut u64,
        p_ops: Arc<dyn PersistOps>,
        stats: Arc<HeapStats>,
    ) -> Result<Heap, HeapError> {
        if *sizep == 0 {
            *sizep = region.size() as u64;
        }
        if (region.size() as u64) < *sizep {
            log::error!("mapped region smaller than the heap size");
            return Err(HeapError::RegionTooSmall {
                mapped: region.size(),
                declared: *sizep,
            });
        }

        let alloc_classes = AllocClassCollection::new();
        let nzones = max_zone(region.size());
        let default_zset = ZoneSet::new(&alloc_classes);
        let heap = Heap {
            region,
            p_ops,
            stats,
            size: *sizep,
            debug_pattern: AtomicU16::new(0),
            rt: HeapRt {
                alloc_classes,
                default_zset,
                run_locks: (0..MAX_RUN_LOCKS).map(|_| Mutex::new(())).collect(),
                nzones,
                zones_exhausted: AtomicU32::new(0),
            },
        };
        heap.zone_update_if_needed();
        Ok(heap)
    }

    fn view(&self) -> PoolView<'_> {
        PoolView {
            region: &self.region,
            p_ops: &*self.p_ops,
        }
    }

    /// The region and persistence operations, for collaborators that drive
    /// block state transitions through the WAL.
    pub fn pool_view(&self) -> PoolView<'_> {
        self.view()
    }

    /// The zone set responsible for `zone_id`. Currently always the default
    /// set.
    fn zoneset(&self, _zone_id: u32) -> &ZoneSet {
        &self.rt.default_zset
    }

    /// The recycler of `class` in `zset`, created on first use.
    fn recycler<'a>(&self, zset: &'a ZoneSet, class: &AllocClass) -> &'a Recycler {
        let ClassShape::Run(rdsc) = class.shape else {
            unreachable!("recycler lookup for a huge class");
        };
        zset.recyclers[class.id as usize].get_or_init(|| Recycler::new(rdsc.nallocs))
    }

    /// The allocation-class registry.
    pub fn alloc_classes(&self) -> &AllocClassCollection {
        &self.rt.alloc_classes
    }

    /// The class that best fits an allocation of `size` bytes.
    pub fn get_best_class(&self, size: usize) -> &AllocClass {
        self.rt.alloc_classes.by_alloc_size(size)
    }

    /// Registers a run class and instantiates its bucket storage.
    pub fn register_alloc_class(
        &mut self,
        unit_size: usize,
        size_idx: u32,
        header_type: HeaderType,
    ) -> Result<u8, HeapError> {
        let id = self
            .rt
            .alloc_classes
            .register_run_class(unit_size, size_idx, header_type)?;
        self.create_alloc_class_buckets(id)?;
        Ok(id)
    }

    /// Instantiates bucket storage for a declared class if it is missing.
    pub fn create_alloc_class_buckets(&mut self, class_id: u8) -> Result<(), HeapError> {
        let class = *self
            .rt
            .alloc_classes
            .by_id(class_id)
            .ok_or(HeapError::UnknownClass(class_id))?;
        if self.rt.default_zset.buckets[class_id as usize].is_none() {
            self.rt.default_zset.buckets[class_id as usize] =
                Some(BucketLocked::new(Bucket::new_run(class)));
        }
        Ok(())
    }

    /// Acquires the bucket of `class_id` exclusively until the guard drops.
    pub fn bucket_acquire(&self, class_id: u8) -> Result<BucketGuard<'_>, HeapError> {
        let zset = self.zoneset(0);
        if class_id == DEFAULT_ALLOC_CLASS_ID {
            return Ok(zset.default_bucket.acquire());
        }
        zset.buckets[class_id as usize]
            .as_ref()
            .map(BucketLocked::acquire)
            .ok_or(HeapError::UnknownClass(class_id))
    }

    /// The striped lock covering run metadata of `chunk_id`.
    pub fn run_lock(&self, chunk_id: u32) -> &Mutex<()> {
        &self.rt.run_locks[chunk_id as usize % self.rt.run_locks.len()]
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    pub fn nzones(&self) -> u32 {
        self.rt.nzones
    }

    pub fn zones_exhausted(&self) -> u32 {
        self.rt.zones_exhausted.load(Ordering::Relaxed)
    }

    /// Turns on (or off) filling fresh allocations with a debug byte.
    pub fn set_alloc_pattern(&self, pattern: Option<u8>) {
        let v = pattern.map_or(0, |p| 0x100 | p as u16);
        self.debug_pattern.store(v, Ordering::Relaxed);
    }

    fn alloc_pattern(&self) -> Option<u8> {
        let v = self.debug_pattern.load(Ordering::Relaxed);
        if v == 0 { None } else { Some(v as u8) }
    }

    /// Writes a zone header and lays the chunks from `first_chunk_id` on as
    /// one free extent. Also used to extend the trailing zone of a grown
    /// pool, with `first_chunk_id` at the old boundary.
    fn zone_init(&self, zone_id: u32, first_chunk_id: u32) {
        let size_idx = zone_calc_size_idx(zone_id, self.rt.nzones, self.size as usize);
        debug_assert!(size_idx > first_chunk_id);
        memblock::huge_init(
            &self.view(),
            zone_id,
            first_chunk_id,
            size_idx - first_chunk_id,
        );
        write_zone_header(
            &self.region,
            zone_id,
            ZoneHeader {
                magic: ZONE_MAGIC,
                size_idx,
            },
        );
        self.view().persist(zone_offset(zone_id), 8);
    }

    fn zone_update_if_needed(&self) {
        for zone_id in 0..self.rt.nzones {
            let z = read_zone_header(&self.region, zone_id);
            if z.magic != ZONE_MAGIC {
                continue;
            }
            let size_idx = zone_calc_size_idx(zone_id, self.rt.nzones, self.size as usize);
            if size_idx != z.size_idx {
                self.zone_init(zone_id, z.size_idx);
            }
        }
    }

    /// Locates the free neighbor of `m` on the `prev` or next side.
    fn get_adjacent_free_block(&self, m: &MemoryBlock, prev: bool) -> Option<MemoryBlock> {
        let zone = read_zone_header(&self.region, m.zone_id);
        let hdr = read_chunk_header(&self.region, m.zone_id, m.chunk_id);
        let mut out = MemoryBlock::new_huge(m.zone_id, 0, 0);
        if prev {
            if m.chunk_id == 0 {
                return None;
            }
            // The slot right before an extent is its footer (or its whole
            // header for single-chunk extents) and carries the extent size.
            let prev_hdr = read_chunk_header(&self.region, m.zone_id, m.chunk_id - 1);
            debug_assert!(prev_hdr.size_idx > 0 && prev_hdr.size_idx <= m.chunk_id);
            out.chunk_id = m.chunk_id - prev_hdr.size_idx;
        } else {
            if m.chunk_id + hdr.size_idx == zone.size_idx {
                return None;
            }
            out.chunk_id = m.chunk_id + hdr.size_idx;
        }
        let neighbor = read_chunk_header(&self.region, m.zone_id, out.chunk_id);
        if neighbor.kind != ChunkKind::Free {
            return None;
        }
        out.size_idx = neighbor.size_idx;
        out.rebuild(&self.view());
        Some(out)
    }

    /// Finds free neighbors of `m`, removes them from the volatile state
    /// and returns the merged block. Purely volatile; the caller persists
    /// the merged header if the extent changed.
    fn coalesce_huge(&self, bucket: &mut Bucket, m: &MemoryBlock) -> MemoryBlock {
        let mut ret = *m;
        if let Some(prev) = self.get_adjacent_free_block(m, true)
            && bucket.remove_block(&prev)
        {
            ret.chunk_id = prev.chunk_id;
            ret.size_idx += prev.size_idx;
        }
        if let Some(next) = self.get_adjacent_free_block(m, false)
            && bucket.remove_block(&next)
        {
            ret.size_idx += next.size_idx;
        }
        ret.rebuild(&self.view());
        ret
    }

    /// Returns an existing free chunk to the bucket, coalescing it with any
    /// free neighbors first. The merged header is persisted before the
    /// block becomes observable through the bucket.
    pub fn free_chunk_reuse(&self, bucket: &mut Bucket, m: &mut MemoryBlock) {
        let nm = self.coalesce_huge(bucket, m);
        if nm.size_idx != m.size_idx {
            nm.prep_hdr(&self.view(), BlockState::Free);
        }
        *m = nm;
        bucket.insert_block(*m);
    }

    /// Demotes a run into a free chunk and hands it to `bucket`. The
    /// striped run lock orders this against concurrent free bookkeeping on
    /// the same chunk.
    fn run_into_free_chunk(&self, bucket: &mut Bucket, m: &mut MemoryBlock) {
        let hdr = read_chunk_header(&self.region, m.zone_id, m.chunk_id);
        m.block_off = 0;
        m.size_idx = hdr.size_idx;
        self.stats
            .sub_run_active(m.size_idx as u64 * CHUNK_SIZE as u64);
        let _guard = self.run_lock(m.chunk_id).lock();
        *m = memblock::huge_init(&self.view(), m.zone_id, m.chunk_id, m.size_idx);
        self.free_chunk_reuse(bucket, m);
    }

    /// Checks a run for available memory. Returns true if the run is
    /// completely empty and should become a free chunk; partially-empty
    /// runs are published to their class recycler.
    fn reclaim_run(&self, m: &MemoryBlock, startup: bool) -> bool {
        let view = self.view();
        let (unit_size, flags, size_idx) = m.run_class_key(&view);
        debug_assert_eq!(size_idx, m.size_idx);
        let e = element_new(&view, m);
        let Some(class) = self.rt.alloc_classes.by_run(unit_size, flags, size_idx) else {
            // A run of a class that is no longer registered; only reusable
            // as a whole once every cell is free.
            let bitmap = m.run_bitmap(&view);
            return e.free_space == bitmap.nbits;
        };
        let ClassShape::Run(rdsc) = class.shape else {
            unreachable!("run classified as huge");
        };
        if e.free_space == rdsc.nallocs {
            return true;
        }
        if startup {
            self.stats
                .inc_run_active(m.size_idx as u64 * CHUNK_SIZE as u64);
            self.stats
                .inc_run_allocated((rdsc.nallocs - e.free_space) as u64 * unit_size as u64);
        }
        let zset = self.zoneset(m.zone_id);
        self.recycler(zset, class).put(e);
        false
    }

    /// Rebuilds volatile state for every chunk of a zone: free chunks are
    /// coalesced into the bucket, runs are reclaimed or demoted, used
    /// chunks are skipped.
    fn reclaim_zone_garbage(&self, bucket: &mut Bucket, zone_id: u32) {
        let view = self.view();
        let zone = read_zone_header(&self.region, zone_id);
        let mut i = 0;
        while i < zone.size_idx {
            let hdr = read_chunk_header(&self.region, zone_id, i);
            debug_assert!(hdr.size_idx != 0);
            let mut m = MemoryBlock::new_huge(zone_id, i, hdr.size_idx);
            m.rebuild(&view);
            m.reinit_chunk(&view);
            match hdr.kind {
                ChunkKind::Run => {
                    if self.reclaim_run(&m, true) {
                        self.run_into_free_chunk(bucket, &mut m);
                    }
                }
                ChunkKind::Free => self.free_chunk_reuse(bucket, &mut m),
                ChunkKind::Used => {}
                ChunkKind::Unknown | ChunkKind::RunData => {
                    unreachable!("invalid top-level chunk in zone {zone_id} at index {i}")
                }
            }
            // The header may have moved or grown during coalescing.
            i = m.chunk_id + m.size_idx;
        }
    }

    /// Consumes one unexplored zone into the bucket's volatile state.
    fn populate_bucket(&self, bucket: &mut Bucket) -> Result<(), HeapError> {
        let exhausted = self.rt.zones_exhausted.load(Ordering::Relaxed);
        if exhausted == self.rt.nzones {
            return Err(HeapError::OutOfMemory);
        }
        // Serialized by the default bucket held by every caller.
        self.rt
            .zones_exhausted
            .store(exhausted + 1, Ordering::Relaxed);
        let zone_id = exhausted;

        if read_zone_header(&self.region, zone_id).magic != ZONE_MAGIC {
            self.zone_init(zone_id, 0);
        }
        self.reclaim_zone_garbage(bucket, zone_id);

        // Even an empty result is progress; later zones may still hold
        // free blocks for subsequent calls.
        Ok(())
    }

    /// Recalculates recycler scores and turns empty runs into free chunks.
    /// Without `force` this can be a no-op if not enough space was freed.
    fn recycle_unused(&self, recycler: &Recycler, defb: Option<&mut Bucket>, force: bool) -> bool {
        let mut empties = recycler.recalc(&self.view(), force);
        if empties.is_empty() {
            return false;
        }
        match defb {
            Some(bucket) => {
                for m in empties.iter_mut() {
                    self.run_into_free_chunk(bucket, m);
                }
            }
            None => {
                let mut guard = self.zoneset(0).default_bucket.acquire();
                for m in empties.iter_mut() {
                    self.run_into_free_chunk(&mut guard, m);
                }
            }
        }
        true
    }

    /// Force-recalculates every class recycler, demoting empty runs into
    /// `bucket`. Returns whether anything was reclaimed.
    fn reclaim_garbage(&self, bucket: &mut Bucket) -> bool {
        let zset = self.zoneset(0);
        let mut reclaimed = false;
        for slot in &zset.recyclers {
            if let Some(r) = slot.get()
                && self.recycle_unused(r, Some(bucket), true)
            {
                reclaimed = true;
            }
        }
        reclaimed
    }

    /// Refills the default bucket: reclaim garbage, then consume zones.
    /// Ends at out-of-memory once every zone is exhausted; the pool does
    /// not grow.
    fn ensure_huge_bucket_filled(&self, bucket: &mut Bucket) -> Result<(), HeapError> {
        if self.reclaim_garbage(bucket) {
            return Ok(());
        }
        if self.populate_bucket(bucket).is_ok() {
            return Ok(());
        }
        if self.populate_bucket(bucket).is_ok() {
            return Ok(());
        }
        Err(HeapError::OutOfMemory)
    }

    /// Puts a run back into the global heap: demoted to a free chunk when
    /// empty, otherwise returned to its class recycler.
    pub fn discard_run(&self, m: &mut MemoryBlock) {
        if self.reclaim_run(m, false) {
            let mut bucket = self.zoneset(m.zone_id).default_bucket.acquire();
            self.run_into_free_chunk(&mut bucket, m);
        }
    }

    /// Detaches the bucket's active run, if any, and hands it back to the
    /// heap.
    fn detach_and_try_discard_run(&self, bucket: &mut Bucket) {
        if let Some((mut run, _empty)) = bucket.detach_run(&self.view()) {
            self.discard_run(&mut run);
        }
    }

    /// Tries to attach a partially-empty run from the class recycler that
    /// can service `units` cells.
    fn reuse_from_recycler(&self, bucket: &mut Bucket, units: u32, force: bool) -> bool {
        let class = *bucket.class();
        let zset = self.zoneset(0);
        let recycler = self.recycler(zset, &class);

        let mut m = MemoryBlock::NONE;
        m.size_idx = units;

        if !force && recycler.get(&mut m) {
            bucket.attach_run(&self.view(), &m);
            return true;
        }

        self.recycle_unused(recycler, None, force);

        if recycler.get(&mut m) {
            bucket.attach_run(&self.view(), &m);
            return true;
        }

        false
    }

    /// Carves a new run out of a free chunk extent and attaches it.
    fn run_create(&self, bucket: &mut Bucket, m: &mut MemoryBlock) {
        let class = *bucket.class();
        let ClassShape::Run(rdsc) = class.shape else {
            unreachable!("run creation for a huge class");
        };
        *m = memblock::run_init(
            &self.view(),
            m.zone_id,
            m.chunk_id,
            &rdsc,
            class.header_type,
        );
        bucket.attach_run(&self.view(), m);
        self.stats
            .inc_run_active(m.size_idx as u64 * CHUNK_SIZE as u64);
    }

    /// Refills a run bucket so it can service `units` cells: retire the
    /// exhausted active run, prefer recycled runs, then bring in a new
    /// zone, and only then carve a fresh run.
    fn ensure_run_bucket_filled(&self, bucket: &mut Bucket, units: u32) -> Result<(), HeapError> {
        let class = *bucket.class();
        debug_assert_eq!(class.kind(), ClassKind::Run);
        let ClassShape::Run(rdsc) = class.shape else {
            unreachable!("run refill on a huge bucket");
        };

        self.detach_and_try_discard_run(bucket);

        if self.reuse_from_recycler(bucket, units, false) {
            return Ok(());
        }

        // Search the next zone before attempting to create a new run.
        {
            let mut defb = self.zoneset(0).default_bucket.acquire();
            let _ = self.populate_bucket(&mut defb);
        }

        if self.reuse_from_recycler(bucket, units, false) {
            return Ok(());
        }

        let mut m = MemoryBlock::NONE;
        m.size_idx = rdsc.size_idx;
        {
            let mut defb = self.zoneset(0).default_bucket.acquire();
            if self.get_bestfit_block(&mut defb, &mut m).is_ok() {
                debug_assert_eq!(m.block_off, 0);
                self.run_create(bucket, &mut m);
                return Ok(());
            }
        }

        // A parallel freer may have repopulated the recycler during the
        // failed carve.
        if self.reuse_from_recycler(bucket, units, false) {
            return Ok(());
        }

        Err(HeapError::OutOfMemory)
    }

    /// Splits the unused part off an oversized block: a persistent header
    /// split for huge blocks, a volatile span reinsert for runs.
    fn split_block(&self, bucket: &mut Bucket, m: &mut MemoryBlock, units: u32) {
        debug_assert!(units > 0 && units < m.size_idx);
        let view = self.view();
        match bucket.class().kind() {
            ClassKind::Run => {
                let remainder = MemoryBlock {
                    block_off: m.block_off + units,
                    size_idx: m.size_idx - units,
                    ..*m
                };
                bucket.insert_block(remainder);
            }
            ClassKind::Huge => {
                let remainder = memblock::huge_init(
                    &view,
                    m.zone_id,
                    m.chunk_id + units,
                    m.size_idx - units,
                );
                *m = memblock::huge_init(&view, m.zone_id, m.chunk_id, units);
                bucket.insert_block(remainder);
            }
        }
        m.size_idx = units;
    }

    /// Extracts a block of at least `m.size_idx` from the bucket, refilling
    /// it as needed, trimming the excess, and writing through the header
    /// kind of the bucket's class.
    pub fn get_bestfit_block(
        &self,
        bucket: &mut Bucket,
        m: &mut MemoryBlock,
    ) -> Result<(), HeapError> {
        let class = *bucket.class();
        let units = m.size_idx;
        let view = self.view();

        while !bucket.alloc_block(&view, m) {
            match class.kind() {
                ClassKind::Huge => self.ensure_huge_bucket_filled(bucket)?,
                ClassKind::Run => self.ensure_run_bucket_filled(bucket, units)?,
            }
        }

        debug_assert!(m.size_idx >= units);
        if units != m.size_idx {
            self.split_block(bucket, m, units);
        }

        m.ensure_header_type(&view, class.header_type);

        if let Some(pattern) = self.alloc_pattern() {
            let (off, len) = m.usable_data(&view);
            view.memset(off, pattern, len);
        }
        Ok(())
    }

    /// Bookkeeping executed after a block's free is durable. Run cells feed
    /// the class recycler; huge frees are delivered synchronously by the
    /// caller holding a bucket.
    pub fn memblock_on_free(&self, m: &MemoryBlock) {
        if m.kind != BlockKind::Run {
            return;
        }
        let view = self.view();
        let hdr = read_chunk_header(&self.region, m.zone_id, m.chunk_id);
        debug_assert_eq!(hdr.kind, ChunkKind::Run);
        let (unit_size, flags, size_idx) = m.run_class_key(&view);
        let Some(class) = self.rt.alloc_classes.by_run(unit_size, flags, size_idx) else {
            return;
        };
        let zset = self.zoneset(m.zone_id);
        self.recycler(zset, class)
            .inc_unaccounted(m.zone_id, m.chunk_id, size_idx);
    }

    /// The recycler of a run class, if it has been created.
    pub fn class_recycler(&self, class_id: u8) -> Option<&Recycler> {
        self.zoneset(0).recyclers.get(class_id as usize)?.get()
    }

    /// Drives a class recycler by hand: recalculates scores and demotes any
    /// empty runs. Returns whether anything was demoted.
    pub fn recycle_class_unused(&self, class_id: u8, force: bool) -> bool {
        match self.class_recycler(class_id) {
            Some(r) => self.recycle_unused(r, None, force),
            None => false,
        }
    }

    /// First byte offset past the heap.
    pub fn end(&self) -> usize {
        debug_assert!(self.rt.nzones > 0);
        let last = self.rt.nzones - 1;
        let z = read_zone_header(&self.region, last);
        chunk_data_offset(last, z.size_idx)
    }

    /// Walks every allocated block, starting from the `seed` cursor.
    pub fn foreach_object(
        &self,
        cb: &mut dyn FnMut(&MemoryBlock) -> ControlFlow<()>,
        seed: MemoryBlock,
    ) {
        let view = self.view();
        let mut m = seed;
        while m.zone_id < self.rt.nzones {
            let zone = read_zone_header(&self.region, m.zone_id);
            if zone.magic == ZONE_MAGIC {
                while m.chunk_id < zone.size_idx {
                    let hdr = read_chunk_header(&self.region, m.zone_id, m.chunk_id);
                    m.rebuild(&view);
                    m.size_idx = hdr.size_idx;
                    if m.iterate_used(&view, cb).is_break() {
                        return;
                    }
                    m.chunk_id += m.size_idx;
                    m.block_off = 0;
                }
            }
            m.zone_id += 1;
            m.chunk_id = 0;
            m.block_off = 0;
        }
    }

    /// Verifies that the heap in `region` is consistent and can be opened.
    pub fn check(region: &PoolRegion) -> Result<(), HeapError> {
        let size = region.size();
        if size < HEAP_MIN_SIZE {
            log::error!("heap: invalid heap size {size}");
            return Err(HeapError::InvalidSize {
                size,
                min: HEAP_MIN_SIZE,
            });
        }
        let mut header = [0u8; HEAP_HEADER_SIZE];
        region.read_bytes(0, &mut header);
        HeapHeader::verify(&header)?;
        let mut zone_buf = vec![0u8; ZONE_METADATA_SIZE];
        for zone_id in 0..max_zone(size) {
            region.read_bytes(zone_offset(zone_id), &mut zone_buf);
            verify_zone(zone_id, &zone_buf)?;
        }
        Ok(())
    }

    /// Verifies the heap of a remote pool through a read callback.
    pub fn check_remote(heap_size: usize, ops: &dyn RemoteReader) -> Result<(), HeapError> {
        if heap_size < HEAP_MIN_SIZE {
            log::error!("heap: invalid heap size {heap_size}");
            return Err(HeapError::InvalidSize {
                size: heap_size,
                min: HEAP_MIN_SIZE,
            });
        }
        let mut header = [0u8; HEAP_HEADER_SIZE];
        ops.read(0, &mut header).map_err(HeapError::RemoteRead)?;
        HeapHeader::verify(&header)?;
        let mut zone_buf = vec![0u8; ZONE_METADATA_SIZE];
        for zone_id in 0..max_zone(heap_size) {
            ops.read(zone_offset(zone_id), &mut zone_buf)
                .map_err(HeapError::RemoteRead)?;
            verify_zone(zone_id, &zone_buf)?;
        }
        Ok(())
    }
}

fn slice_u64(bytes: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Verifies one zone's metadata from a raw copy: magic, size, and a chunk
/// walk whose extents must exactly cover the zone.
fn verify_zone(zone_id: u32, bytes: &[u8]) -> Result<(), HeapError> {
    let zh = ZoneHeader::decode(slice_u64(bytes, 0));
    if zh.magic == 0 {
        // Not initialized, and that is fine.
        return Ok(());
    }
    if zh.magic != ZONE_MAGIC {
        log::error!("heap: invalid zone magic in zone {zone_id}");
        return Err(HeapError::Corrupt(format!(
            "invalid zone magic in zone {zone_id}"
        )));
    }
    if zh.size_idx == 0 || zh.size_idx as usize > MAX_CHUNK {
        log::error!("heap: invalid zone size in zone {zone_id}");
        return Err(HeapError::Corrupt(format!(
            "invalid zone size in zone {zone_id}"
        )));
    }
    let mut i = 0;
    while i < zh.size_idx {
        let off = ZONE_HEADER_SIZE + i as usize * CHUNK_HEADER_SIZE;
        let hdr = ChunkHeader::decode(slice_u64(bytes, off));
        if hdr.kind == ChunkKind::Unknown {
            log::error!("heap: invalid chunk type in zone {zone_id} at {i}");
            return Err(HeapError::Corrupt(format!(
                "invalid chunk type in zone {zone_id} at chunk {i}"
            )));
        }
        if hdr.flags & !CHUNK_FLAGS_ALL != 0 {
            log::error!("heap: invalid chunk flags in zone {zone_id} at {i}");
            return Err(HeapError::Corrupt(format!(
                "invalid chunk flags in zone {zone_id} at chunk {i}"
            )));
        }
        if hdr.size_idx == 0 {
            log::error!("heap: invalid chunk size in zone {zone_id} at {i}");
            return Err(HeapError::Corrupt(format!(
                "invalid chunk size in zone {zone_id} at chunk {i}"
            )));
        }
        i += hdr.size_idx;
    }
    if i != zh.size_idx {
        log::error!("heap: chunk sizes mismatch in zone {zone_id}");
        return Err(HeapError::Corrupt(format!(
            "chunk sizes mismatch in zone {zone_id}"
        )));
    }
    Ok(())
}
