//! Allocation throughput benchmarks over an in-memory pool.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use zoneheap_core::{
    BlockState, CHUNK_SIZE, DEFAULT_ALLOC_CLASS_ID, Heap, HeapStats, MemoryBlock, NoopPersist,
    PoolRegion,
};
use zoneheap_core::layout::{HEAP_HEADER_SIZE, ZONE_METADATA_SIZE};

fn bench_heap(chunks: usize) -> Heap {
    let region = Arc::new(PoolRegion::new(
        HEAP_HEADER_SIZE + ZONE_METADATA_SIZE + chunks * CHUNK_SIZE,
    ));
    let mut sizep = 0u64;
    Heap::init(&region, &mut sizep, &NoopPersist).expect("init");
    Heap::boot(
        region,
        &mut sizep,
        Arc::new(NoopPersist),
        Arc::new(HeapStats::new()),
    )
    .expect("boot")
}

fn run_alloc_free(c: &mut Criterion) {
    let heap = bench_heap(64);
    let class_id = heap.get_best_class(64).id;

    c.bench_function("run_alloc_free_64b", |b| {
        b.iter(|| {
            let view = heap.pool_view();
            let mut m = MemoryBlock::NONE;
            m.size_idx = 1;
            {
                let mut bucket = heap.bucket_acquire(class_id).expect("bucket");
                heap.get_bestfit_block(&mut bucket, &mut m).expect("alloc");
            }
            m.prep_hdr(&view, BlockState::Allocated);
            m.prep_hdr(&view, BlockState::Free);
            heap.memblock_on_free(&m);
        })
    });
}

fn huge_alloc_free(c: &mut Criterion) {
    let heap = bench_heap(64);

    c.bench_function("huge_alloc_free_1chunk", |b| {
        b.iter(|| {
            let view = heap.pool_view();
            let mut m = MemoryBlock::NONE;
            m.size_idx = 1;
            let mut bucket = heap
                .bucket_acquire(DEFAULT_ALLOC_CLASS_ID)
                .expect("bucket");
            heap.get_bestfit_block(&mut bucket, &mut m).expect("alloc");
            m.prep_hdr(&view, BlockState::Allocated);
            m.prep_hdr(&view, BlockState::Free);
            heap.free_chunk_reuse(&mut bucket, &mut m);
        })
    });
}

criterion_group!(benches, run_alloc_free, huge_alloc_free);
criterion_main!(benches);
