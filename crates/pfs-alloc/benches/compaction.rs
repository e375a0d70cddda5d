//! Benchmark: cost of compaction as a function of position.
//!
//! Resizing the first of many files slides every later byte; resizing the
//! tail file only moves the cursor.

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use pfs_alloc::ExtentAllocator;
use pfs_block::MemByteDevice;
use pfs_types::{DATA_START, Extent, NodeId};

const CAPACITY: usize = 1024 * 1024;
const FILES: u64 = 256;
const FILE_LEN: usize = 1024;

fn populated() -> (MemByteDevice, ExtentAllocator, Vec<Extent>) {
    let dev = MemByteDevice::new(CAPACITY);
    let mut alloc = ExtentAllocator::new(DATA_START, CAPACITY as u64).unwrap();
    let payload = vec![0xA5_u8; FILE_LEN];
    let extents = (0..FILES)
        .map(|i| {
            alloc
                .set_content(&dev, NodeId(i + 2), None, &payload)
                .unwrap()
                .extent
                .unwrap()
        })
        .collect();
    (dev, alloc, extents)
}

fn bench_resize(c: &mut Criterion) {
    let grown = vec![0x5A_u8; FILE_LEN + 1];
    let mut group = c.benchmark_group("resize");

    group.bench_function("head_migrate", |b| {
        b.iter_batched(
            populated,
            |(dev, mut alloc, extents)| {
                black_box(
                    alloc
                        .set_content(&dev, NodeId(2), Some(extents[0]), black_box(&grown))
                        .unwrap(),
                )
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("tail_in_place", |b| {
        let last = usize::try_from(FILES - 1).unwrap();
        b.iter_batched(
            populated,
            |(dev, mut alloc, extents)| {
                black_box(
                    alloc
                        .set_content(&dev, NodeId(FILES + 1), Some(extents[last]), black_box(&grown))
                        .unwrap(),
                )
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

fn bench_free(c: &mut Criterion) {
    c.bench_function("free_head", |b| {
        b.iter_batched(
            populated,
            |(dev, mut alloc, extents)| black_box(alloc.free(&dev, NodeId(2), extents[0]).unwrap()),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_resize, bench_free);
criterion_main!(benches);
