use ffs_core::{
    AccountingOptions, BucketFs, DecodedPtr, DeviceConfig, DiskReservation, Key, TriggerFlags,
};
use ffs_error::FfsError;
use ffs_journal::MemJournal;
use ffs_types::{BucketGen, BucketNumber, DataType, DeviceIndex};
use ffs_usage::ReplicasEntry;
use std::collections::BTreeMap;
use std::sync::Arc;

const THREADS: u64 = 4;
const OPS_PER_THREAD: u64 = 200;
const NBUCKETS: u64 = 64;
const HOT_BUCKETS: u64 = 4;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

fn context() -> Arc<BucketFs> {
    let options = AccountingOptions {
        workers: 4,
        ..AccountingOptions::default()
    };
    let fs = BucketFs::new(options, Arc::new(MemJournal::new(1)));
    fs.add_device(DeviceConfig::new(2048, NBUCKETS, 1))
        .expect("dev");
    fs.register_replicas(ReplicasEntry::new(DataType::User, 1, &[DeviceIndex(0)]));
    Arc::new(fs)
}

/// Mostly a small shared hot set, otherwise anywhere on the device.
fn choose_bucket(rng: &mut u64) -> BucketNumber {
    let b = if lcg_next(rng) % 4 < 3 {
        1 + lcg_next(rng) % HOT_BUCKETS
    } else {
        1 + lcg_next(rng) % (NBUCKETS - 1)
    };
    BucketNumber(b)
}

#[test]
fn concurrent_inserts_and_deletes_sum_exactly() {
    let fs = context();

    let per_thread: Vec<(Vec<Key>, BTreeMap<u64, i64>)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let fs = Arc::clone(&fs);
                s.spawn(move || {
                    let mut rng = 0x9e37_79b9_7f4a_7c15 ^ t;
                    let mut end = 0_u64;
                    let mut keys = Vec::new();
                    let mut expected: BTreeMap<u64, i64> = BTreeMap::new();
                    for _ in 0..OPS_PER_THREAD {
                        let bucket = choose_bucket(&mut rng);
                        let size = 1 + u32::try_from(lcg_next(&mut rng) % 8).expect("small");
                        end += u64::from(size);
                        let key = Key::extent(
                            t + 1,
                            end,
                            size,
                            vec![DecodedPtr::new(DeviceIndex(0), bucket, BucketGen(0), size)],
                        );
                        fs.mark_key(&key, fs.cur_seq(), TriggerFlags::NONE)
                            .expect("insert");
                        *expected.entry(bucket.0).or_default() += i64::from(size);
                        keys.push(key);
                    }

                    // Drop every other extent again.
                    for key in keys.iter().step_by(2) {
                        fs.mark_update(
                            key,
                            &Key::deleted(key.pos),
                            None,
                            fs.cur_seq(),
                            TriggerFlags::NONE,
                        )
                        .expect("delete");
                        let bucket = key.ptrs()[0].ptr.bucket;
                        *expected.entry(bucket.0).or_default() -= i64::from(key.size);
                    }
                    (keys, expected)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("marking thread panicked"))
            .collect()
    });

    let mut expected: BTreeMap<u64, i64> = BTreeMap::new();
    for (_, per_bucket) in &per_thread {
        for (b, sectors) in per_bucket {
            *expected.entry(*b).or_default() += sectors;
        }
    }
    let total: i64 = expected.values().sum();
    let total = u64::try_from(total).expect("non-negative");

    for b in 1..NBUCKETS {
        let mark = fs
            .bucket_mark(DeviceIndex(0), BucketNumber(b))
            .expect("mark");
        let want = expected.get(&b).copied().unwrap_or(0);
        assert_eq!(i64::from(mark.dirty_sectors), want, "bucket {b}");
        if want == 0 {
            assert_eq!(mark.data_type, DataType::None, "bucket {b}");
        } else {
            assert_eq!(mark.data_type, DataType::User, "bucket {b}");
        }
    }

    let usage = fs.usage_snapshot();
    assert_eq!(usage.data, total);
    assert_eq!(usage.replicas, vec![total]);

    let dev = fs.device_usage_snapshot(DeviceIndex(0)).expect("dev usage");
    assert_eq!(dev.of(DataType::User).sectors, total);
    let used_buckets = u64::try_from(expected.values().filter(|v| **v != 0).count())
        .expect("bucket count");
    assert_eq!(dev.of(DataType::User).buckets, used_buckets);
    assert_eq!(fs.inconsistency_count(), 0);

    // The surviving extents, scanned from scratch, reproduce the live view.
    fs.gc_start();
    for (keys, _) in &per_thread {
        for key in keys.iter().skip(1).step_by(2) {
            fs.gc_mark_key(key).expect("scan");
        }
    }
    let report = fs.gc_finish().expect("finish");
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn concurrent_reservations_balance() {
    let fs = context();
    let held: u64 = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let fs = Arc::clone(&fs);
                s.spawn(move || {
                    let mut rng = 0x51ed_2701_u64 + t;
                    let mut kept = Vec::new();
                    for i in 0..OPS_PER_THREAD {
                        let sectors = 1 + lcg_next(&mut rng) % 64;
                        let mut res: DiskReservation =
                            fs.reserve(sectors, false).expect("space is plentiful");
                        if i % 2 == 0 {
                            fs.disk_reservation_put(&mut res);
                        } else {
                            kept.push(res);
                        }
                    }
                    kept.iter().map(DiskReservation::sectors).sum::<u64>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("reservation thread panicked"))
            .sum()
    });

    let usage = fs.usage_snapshot();
    assert_eq!(usage.online_reserved, held);
    assert!(fs.sectors_available() < fs.capacity());
    assert!(!fs.is_read_only());
}

#[test]
fn recalculations_count_every_concurrent_grant() {
    let fs = context();
    let capacity = fs.capacity();
    let held: u64 = std::thread::scope(|s| {
        // Requests that can never fit force a pool recalculation each time.
        let refuser = s.spawn(|| {
            for _ in 0..OPS_PER_THREAD {
                assert!(matches!(fs.reserve(capacity, false), Err(FfsError::NoSpace)));
            }
        });
        let takers: Vec<_> = (0..THREADS)
            .map(|t| {
                let fs = Arc::clone(&fs);
                s.spawn(move || {
                    let mut rng = 0x7f4a_7c15_u64 + t;
                    let mut kept = Vec::new();
                    for _ in 0..OPS_PER_THREAD {
                        let sectors = 1 + lcg_next(&mut rng) % 16;
                        kept.push(fs.reserve(sectors, false).expect("space is plentiful"));
                    }
                    kept.iter().map(DiskReservation::sectors).sum::<u64>()
                })
            })
            .collect();
        refuser.join().expect("refusing thread panicked");
        takers
            .into_iter()
            .map(|h| h.join().expect("reservation thread panicked"))
            .sum()
    });

    assert_eq!(fs.usage_snapshot().online_reserved, held);
    // The pool never holds more than what is actually free.
    assert!(fs.sectors_available() <= fs.usage_read_short().free);
}
