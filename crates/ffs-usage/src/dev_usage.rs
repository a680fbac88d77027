//! Per-device usage counters and the bucket-mark transition rule.

use crate::accumulator::{CounterLayout, UsageAcc};
use crate::fs_usage::FsCounter;
use ffs_alloc::BucketMark;
use ffs_types::DataType;
use serde::{Deserialize, Serialize};

/// One device usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DevCounter {
    BucketsAlloc,
    BucketsEc,
    BucketsUnavailable,
    Buckets(DataType),
    Sectors(DataType),
    Fragmented(DataType),
}

impl CounterLayout for DevCounter {
    fn index(self) -> usize {
        match self {
            Self::BucketsAlloc => 0,
            Self::BucketsEc => 1,
            Self::BucketsUnavailable => 2,
            Self::Buckets(t) => 3 + t.index(),
            Self::Sectors(t) => 3 + DataType::COUNT + t.index(),
            Self::Fragmented(t) => 3 + 2 * DataType::COUNT + t.index(),
        }
    }
}

/// Flat width of the device counter layout.
pub const DEV_USAGE_WIDTH: usize = 3 + 3 * DataType::COUNT;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevTypeUsage {
    pub buckets: u64,
    pub sectors: u64,
    pub fragmented: u64,
}

/// Point-in-time usage of one member device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevUsage {
    pub buckets_alloc: u64,
    pub buckets_ec: u64,
    pub buckets_unavailable: u64,
    /// Indexed by [`DataType::index`].
    pub d: [DevTypeUsage; DataType::COUNT],
}

impl DevUsage {
    #[must_use]
    pub fn from_raw(raw: &[i64]) -> Self {
        let at = |c: DevCounter| {
            u64::try_from(raw.get(c.index()).copied().unwrap_or(0)).unwrap_or(0)
        };
        let mut d = [DevTypeUsage::default(); DataType::COUNT];
        for ty in DataType::ALL {
            d[ty.index()] = DevTypeUsage {
                buckets: at(DevCounter::Buckets(ty)),
                sectors: at(DevCounter::Sectors(ty)),
                fragmented: at(DevCounter::Fragmented(ty)),
            };
        }
        Self {
            buckets_alloc: at(DevCounter::BucketsAlloc),
            buckets_ec: at(DevCounter::BucketsEc),
            buckets_unavailable: at(DevCounter::BucketsUnavailable),
            d,
        }
    }

    #[must_use]
    pub fn of(&self, ty: DataType) -> DevTypeUsage {
        self.d[ty.index()]
    }

    /// Buckets that can still be handed out.
    #[must_use]
    pub fn buckets_available(&self, nbuckets: u64, first_bucket: u64) -> u64 {
        nbuckets
            .saturating_sub(first_bucket)
            .saturating_sub(self.buckets_unavailable)
    }
}

/// Signed device delta, used where device updates must be staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevUsageDelta {
    counters: [i64; DEV_USAGE_WIDTH],
}

impl Default for DevUsageDelta {
    fn default() -> Self {
        Self {
            counters: [0; DEV_USAGE_WIDTH],
        }
    }
}

impl DevUsageDelta {
    #[must_use]
    pub fn get(&self, counter: DevCounter) -> i64 {
        self.counters[counter.index()]
    }
}

impl UsageAcc<DevCounter> for DevUsageDelta {
    fn add(&mut self, counter: DevCounter, delta: i64) {
        self.counters[counter.index()] += delta;
    }
}

fn account_bucket(
    fs: &mut impl UsageAcc<FsCounter>,
    dev: &mut impl UsageAcc<DevCounter>,
    ty: DataType,
    nr: i64,
    size: i64,
) {
    if ty.is_metadata_region() {
        fs.add(FsCounter::Hidden, size);
    }
    dev.add(DevCounter::Buckets(ty), nr);
}

/// Fold the usage implied by a bucket moving from `old` to `new`.
///
/// Device totals go to `dev`; hidden-space changes go to `fs`. Returns
/// `true` when the bucket became available, meaning the allocator should be
/// woken.
pub fn apply_delta(
    old: BucketMark,
    new: BucketMark,
    bucket_size: u32,
    fs: &mut impl UsageAcc<FsCounter>,
    dev: &mut impl UsageAcc<DevCounter>,
) -> bool {
    let size = i64::from(bucket_size);

    let old_type = old.bucket_type();
    if old_type != DataType::None {
        account_bucket(fs, dev, old_type, -1, -size);
    }
    let new_type = new.bucket_type();
    if new_type != DataType::None {
        account_bucket(fs, dev, new_type, 1, size);
    }

    dev.add(
        DevCounter::BucketsAlloc,
        i64::from(new.owned_by_allocator) - i64::from(old.owned_by_allocator),
    );
    dev.add(
        DevCounter::BucketsEc,
        i64::from(new.stripe) - i64::from(old.stripe),
    );
    dev.add(
        DevCounter::BucketsUnavailable,
        i64::from(!new.is_available()) - i64::from(!old.is_available()),
    );

    dev.add(
        DevCounter::Sectors(old.data_type),
        -i64::from(old.dirty_sectors),
    );
    dev.add(
        DevCounter::Sectors(new.data_type),
        i64::from(new.dirty_sectors),
    );
    dev.add(
        DevCounter::Sectors(DataType::Cached),
        i64::from(new.cached_sectors) - i64::from(old.cached_sectors),
    );

    dev.add(
        DevCounter::Fragmented(old.data_type),
        -i64::from(old.sectors_fragmented(bucket_size)),
    );
    dev.add(
        DevCounter::Fragmented(new.data_type),
        i64::from(new.sectors_fragmented(bucket_size)),
    );

    !old.is_available() && new.is_available()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_usage::FsUsageDelta;

    fn user(dirty: u16) -> BucketMark {
        BucketMark {
            data_type: DataType::User,
            dirty_sectors: dirty,
            ..BucketMark::default()
        }
    }

    #[test]
    fn layout_is_dense_and_distinct() {
        let mut seen = vec![false; DEV_USAGE_WIDTH];
        let mut mark = |c: DevCounter| {
            assert!(!seen[c.index()], "{c:?} collides");
            seen[c.index()] = true;
        };
        mark(DevCounter::BucketsAlloc);
        mark(DevCounter::BucketsEc);
        mark(DevCounter::BucketsUnavailable);
        for ty in DataType::ALL {
            mark(DevCounter::Buckets(ty));
            mark(DevCounter::Sectors(ty));
            mark(DevCounter::Fragmented(ty));
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn free_to_user_transition() {
        let mut fs = FsUsageDelta::new(0);
        let mut dev = DevUsageDelta::default();
        let woke = apply_delta(BucketMark::default(), user(100), 512, &mut fs, &mut dev);
        assert!(!woke);
        assert_eq!(dev.get(DevCounter::Buckets(DataType::User)), 1);
        assert_eq!(dev.get(DevCounter::Sectors(DataType::User)), 100);
        assert_eq!(dev.get(DevCounter::Fragmented(DataType::User)), 412);
        assert_eq!(dev.get(DevCounter::BucketsUnavailable), 1);
        assert!(fs.is_zero());
    }

    #[test]
    fn emptying_bucket_wakes_allocator() {
        let mut fs = FsUsageDelta::new(0);
        let mut dev = DevUsageDelta::default();
        let woke = apply_delta(user(100), BucketMark::default(), 512, &mut fs, &mut dev);
        assert!(woke);
        assert_eq!(dev.get(DevCounter::Buckets(DataType::User)), -1);
        assert_eq!(dev.get(DevCounter::Sectors(DataType::User)), -100);
        assert_eq!(dev.get(DevCounter::Fragmented(DataType::User)), -412);
        assert_eq!(dev.get(DevCounter::BucketsUnavailable), -1);
    }

    #[test]
    fn metadata_buckets_are_hidden() {
        let mut fs = FsUsageDelta::new(0);
        let mut dev = DevUsageDelta::default();
        let sb = BucketMark {
            data_type: DataType::Sb,
            dirty_sectors: 8,
            ..BucketMark::default()
        };
        apply_delta(BucketMark::default(), sb, 256, &mut fs, &mut dev);
        assert_eq!(fs.get(FsCounter::Hidden), 256);
        assert_eq!(dev.get(DevCounter::Buckets(DataType::Sb)), 1);
    }

    #[test]
    fn cached_sectors_counted_under_cached() {
        let mut fs = FsUsageDelta::new(0);
        let mut dev = DevUsageDelta::default();
        let cached = BucketMark {
            data_type: DataType::User,
            cached_sectors: 40,
            ..BucketMark::default()
        };
        apply_delta(BucketMark::default(), cached, 128, &mut fs, &mut dev);
        assert_eq!(dev.get(DevCounter::Buckets(DataType::Cached)), 1);
        assert_eq!(dev.get(DevCounter::Sectors(DataType::Cached)), 40);
        assert_eq!(dev.get(DevCounter::Sectors(DataType::User)), 0);
        assert_eq!(dev.get(DevCounter::BucketsUnavailable), 0);
    }

    #[test]
    fn allocator_ownership_and_stripe_counts() {
        let mut fs = FsUsageDelta::new(0);
        let mut dev = DevUsageDelta::default();
        let owned = BucketMark {
            owned_by_allocator: true,
            stripe: true,
            ..BucketMark::default()
        };
        apply_delta(BucketMark::default(), owned, 128, &mut fs, &mut dev);
        assert_eq!(dev.get(DevCounter::BucketsAlloc), 1);
        assert_eq!(dev.get(DevCounter::BucketsEc), 1);
        assert_eq!(dev.get(DevCounter::BucketsUnavailable), 1);
    }

    #[test]
    fn snapshot_decoding() {
        let mut raw = vec![0_i64; DEV_USAGE_WIDTH];
        raw[DevCounter::Buckets(DataType::Btree).index()] = 3;
        raw[DevCounter::BucketsUnavailable.index()] = 5;
        raw[DevCounter::Sectors(DataType::User).index()] = -1;
        let usage = DevUsage::from_raw(&raw);
        assert_eq!(usage.of(DataType::Btree).buckets, 3);
        assert_eq!(usage.of(DataType::User).sectors, 0);
        assert_eq!(usage.buckets_available(100, 1), 94);
    }
}
