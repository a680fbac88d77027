//! Benchmark: bucket mark updates, atomic CAS vs plain store, and the
//! reference-checked pointer path.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ffs_alloc::{BucketArray, PtrRef, UpdateMode, mark_pointer_sectors};
use ffs_types::{BucketGen, BucketNumber, DataType, DeviceIndex};

fn bench_update(c: &mut Criterion) {
    let array = BucketArray::new(4096, 1);
    let mut group = c.benchmark_group("bucket_update");

    group.bench_function("atomic", |b| {
        let mut idx = 0_u64;
        b.iter(|| {
            idx = (idx + 1) % 4096;
            black_box(array.update(BucketNumber(idx), UpdateMode::Atomic, |m| {
                m.journal_seq = m.journal_seq.wrapping_add(1);
            }))
        });
    });

    group.bench_function("no_atomic", |b| {
        let mut idx = 0_u64;
        b.iter(|| {
            idx = (idx + 1) % 4096;
            black_box(array.update(BucketNumber(idx), UpdateMode::NoAtomic, |m| {
                m.journal_seq = m.journal_seq.wrapping_add(1);
            }))
        });
    });

    group.finish();
}

fn bench_mark_pointer(c: &mut Criterion) {
    let array = BucketArray::new(1024, 1);
    c.bench_function("mark_pointer_insert_then_remove", |b| {
        let mut idx = 0_u64;
        b.iter(|| {
            idx = (idx + 1) % 1024;
            let ptr = PtrRef {
                dev: DeviceIndex(0),
                bucket: BucketNumber(idx),
                generation: BucketGen(0),
                cached: false,
            };
            for sectors in [64_i64, -64] {
                let r = array.try_update(ptr.bucket, UpdateMode::Atomic, |m| {
                    mark_pointer_sectors(m, &ptr, sectors, DataType::User).map(|_| true)
                });
                black_box(r.is_ok());
            }
        });
    });
}

criterion_group!(benches, bench_update, bench_mark_pointer);
criterion_main!(benches);
