use ffs_core::{
    AccountingOptions, AllocRecord, BucketFs, DecodedPtr, DeviceConfig, InconsistencyPolicy, Key,
    MemKeySource, Transaction, TriggerFlags,
};
use ffs_journal::MemJournal;
use ffs_types::{BucketGen, BucketNumber, DataType, DeviceIndex};
use ffs_usage::ReplicasEntry;
use std::sync::Arc;

const DEV: DeviceIndex = DeviceIndex(0);
const NBUCKETS: u64 = 64;
const THREADS: u64 = 4;
const OPS_PER_THREAD: u64 = 150;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

fn context() -> BucketFs {
    let options = AccountingOptions {
        workers: 4,
        inconsistency_policy: InconsistencyPolicy::Continue,
        ..AccountingOptions::default()
    };
    let fs = BucketFs::new(options, Arc::new(MemJournal::new(1)));
    fs.add_device(DeviceConfig::new(2048, NBUCKETS, 1))
        .expect("dev");
    fs.register_replicas(ReplicasEntry::new(DataType::User, 1, &[DEV]));
    fs
}

fn extent(inode: u64, end: u64, bucket: u64, size: u32) -> Key {
    Key::extent(
        inode,
        end,
        size,
        vec![DecodedPtr::new(DEV, BucketNumber(bucket), BucketGen(0), size)],
    )
}

fn dirty(fs: &BucketFs, bucket: u64) -> u16 {
    fs.bucket_mark(DEV, BucketNumber(bucket))
        .expect("mark")
        .dirty_sectors
}

/// One stored entry marked live, then walked by a fresh scan.
fn scan_past(fs: &BucketFs) -> Key {
    let first = extent(1, 16, 3, 16);
    fs.mark_key(&first, fs.cur_seq(), TriggerFlags::NONE)
        .expect("mark");
    fs.gc_start();
    fs.gc_mark_key(&first).expect("scan");
    first
}

#[test]
fn live_write_behind_the_scan_is_kept() {
    let fs = context();
    scan_past(&fs);

    let behind = extent(0, 8, 9, 8);
    assert!(fs.gc_visited(behind.pos));
    fs.mark_key(&behind, fs.cur_seq(), TriggerFlags::NONE)
        .expect("write");

    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(dirty(&fs, 9), 8);
    assert_eq!(fs.usage_snapshot().data, 24);
}

#[test]
fn write_ahead_of_the_scan_is_counted_once_reached() {
    let fs = context();
    scan_past(&fs);

    let ahead = extent(2, 32, 11, 32);
    assert!(!fs.gc_visited(ahead.pos));
    fs.mark_key(&ahead, fs.cur_seq(), TriggerFlags::NONE)
        .expect("write");
    fs.gc_mark_key(&ahead).expect("scan");

    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(dirty(&fs, 11), 32);
    assert_eq!(fs.usage_snapshot().data, 48);
}

#[test]
fn partial_overwrite_behind_the_scan_is_kept() {
    let fs = context();
    let first = scan_past(&fs);

    // [8, 16) of the scanned extent moves to bucket 10.
    let tail = extent(1, 16, 10, 8);
    fs.mark_extent_update(
        &tail,
        std::slice::from_ref(&first),
        None,
        fs.cur_seq(),
        TriggerFlags::NONE,
    )
    .expect("overwrite");

    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(dirty(&fs, 3), 8);
    assert_eq!(dirty(&fs, 10), 8);
    assert_eq!(fs.usage_snapshot().data, 16);
}

#[test]
fn committed_transaction_behind_the_scan_is_kept() {
    let fs = context();
    scan_past(&fs);

    let src = MemKeySource::new();
    let behind = extent(0, 40, 12, 40);
    let mut trans = Transaction::new(&src);
    fs.trans_mark_extent_update(&mut trans, &behind, &[], TriggerFlags::NONE)
        .expect("deferred");
    let mut res = fs.reserve(64, false).expect("reserve");
    fs.commit(trans, Some(&mut res)).expect("commit");
    fs.disk_reservation_put(&mut res);

    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(dirty(&fs, 12), 40);
    assert_eq!(fs.usage_snapshot().data, 56);
}

#[test]
fn invalidation_during_the_scan_is_kept() {
    let fs = context();
    scan_past(&fs);

    let old = fs
        .invalidate_bucket(DEV, BucketNumber(20), fs.cur_seq())
        .expect("invalidate");
    assert_eq!(old.generation, BucketGen(0));

    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");
    let mark = fs.bucket_mark(DEV, BucketNumber(20)).expect("mark");
    assert_eq!(mark.generation, BucketGen(1));
    assert!(mark.owned_by_allocator);
}

#[test]
fn write_rejected_by_the_shadow_view_is_undone_in_both() {
    let fs = context();
    scan_past(&fs);

    // Allocation records are rebuilt by the scan, so this new generation
    // reaches only the live view.
    let record = AllocRecord {
        generation: BucketGen(1),
        ..AllocRecord::default()
    };
    fs.mark_key(&Key::alloc(DEV, BucketNumber(6), record), fs.cur_seq(), TriggerFlags::NONE)
        .expect("alloc record");

    let behind = Key::extent(
        0,
        8,
        8,
        vec![
            DecodedPtr::new(DEV, BucketNumber(7), BucketGen(0), 8),
            DecodedPtr::new(DEV, BucketNumber(6), BucketGen(1), 8),
        ],
    );
    let err = fs
        .mark_key(&behind, fs.cur_seq(), TriggerFlags::NONE)
        .expect_err("shadow view has generation 0");
    assert!(err.is_inconsistency());
    assert_eq!(dirty(&fs, 6), 0);
    assert_eq!(dirty(&fs, 7), 0);
    assert_eq!(fs.usage_snapshot().data, 16);

    // Only the generation the shadow never saw differs; bucket 7 was
    // unwound in both views.
    let report = fs.gc_finish().expect("live failures leave the scan usable");
    assert_eq!(report.bucket_mismatches, 1);
    assert_eq!(report.fs_counter_mismatches, 0);
    assert_eq!(report.dev_counter_mismatches, 0);
    assert_eq!(dirty(&fs, 7), 0);
}

#[test]
fn scan_runs_alongside_concurrent_writers() {
    let fs = context();
    // Entries the scan walks, all in inode 1 and sharing four buckets.
    let stored: Vec<Key> = (1..=64_u64).map(|i| extent(1, i * 8, 1 + i % 4, 8)).collect();
    for k in &stored {
        fs.mark_key(k, fs.cur_seq(), TriggerFlags::NONE)
            .expect("mark");
    }
    fs.gc_start();
    // From here on every inode 0 position is behind the scan.
    fs.gc_mark_key(&stored[0]).expect("scan");

    let survivors: Vec<Vec<Key>> = std::thread::scope(|s| {
        let scanner = s.spawn(|| {
            for k in &stored[1..] {
                fs.gc_mark_key(k).expect("scan");
            }
        });
        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let fs = &fs;
                s.spawn(move || {
                    let mut rng = 0x2545_f491_4f6c_dd1d ^ t;
                    let mut end = t * OPS_PER_THREAD * 8;
                    let mut keys = Vec::new();
                    for _ in 0..OPS_PER_THREAD {
                        let bucket = 1 + lcg_next(&mut rng) % 8;
                        let size = 1 + u32::try_from(lcg_next(&mut rng) % 8).expect("small");
                        end += u64::from(size);
                        let key = extent(0, end, bucket, size);
                        fs.mark_key(&key, fs.cur_seq(), TriggerFlags::NONE)
                            .expect("insert");
                        keys.push(key);
                    }
                    for key in keys.iter().step_by(2) {
                        fs.mark_update(
                            key,
                            &Key::deleted(key.pos),
                            None,
                            fs.cur_seq(),
                            TriggerFlags::NONE,
                        )
                        .expect("delete");
                    }
                    keys.into_iter().skip(1).step_by(2).collect::<Vec<_>>()
                })
            })
            .collect();
        scanner.join().expect("scanner panicked");
        writers
            .into_iter()
            .map(|h| h.join().expect("writer panicked"))
            .collect()
    });

    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");

    let written: u64 = survivors
        .iter()
        .flatten()
        .map(|k| u64::from(k.size))
        .sum();
    assert_eq!(fs.usage_snapshot().data, 64 * 8 + written);
    assert_eq!(fs.inconsistency_count(), 0);

    // A second scan over everything that survived agrees as well.
    fs.gc_start();
    for k in survivors.iter().flatten().chain(&stored) {
        fs.gc_mark_key(k).expect("rescan");
    }
    assert!(fs.gc_finish().expect("finish").is_clean());
}
