//! Benchmark: worker-local counter adds vs full snapshots vs buffer folds.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ffs_types::JournalSeq;
use ffs_usage::{FsAccumulator, FsCounter, UsageAcc, fs_usage_width};

fn bench_add(c: &mut Criterion) {
    let acc = FsAccumulator::new(fs_usage_width(64), 8);
    c.bench_function("worker_add", |b| {
        let mut seq = 0_u64;
        b.iter(|| {
            seq += 1;
            let mut h = acc.handle(JournalSeq(seq));
            h.add(FsCounter::Data, black_box(8));
            h.add(FsCounter::Replicas(3), black_box(8));
        });
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    for nr_replicas in [4_usize, 64, 512] {
        let acc = FsAccumulator::new(fs_usage_width(nr_replicas), 8);
        acc.add(JournalSeq(1), FsCounter::Data, 1);
        group.bench_function(format!("replicas_{nr_replicas}"), |b| {
            b.iter(|| black_box(acc.snapshot()));
        });
    }
    group.finish();
}

fn bench_fold(c: &mut Criterion) {
    let acc = FsAccumulator::new(fs_usage_width(64), 8);
    c.bench_function("fold_one_buffer", |b| {
        b.iter(|| {
            acc.add(JournalSeq(2), FsCounter::Btree, 1);
            acc.fold_worker_into_base(black_box(2));
        });
    });
}

criterion_group!(benches, bench_add, bench_snapshot, bench_fold);
criterion_main!(benches);
