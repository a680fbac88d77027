//! Accounting options and member-device geometry.

use ffs_error::FfsError;
use ffs_types::SB_SECTOR;
use serde::{Deserialize, Serialize};

/// What happens after an inconsistency has been reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyPolicy {
    /// Log, flag for offline check, return the error.
    Continue,
    /// As `Continue`, then latch the context read-only.
    #[default]
    ReadOnly,
    /// Log, then panic.
    Panic,
}

/// Options fixed when the accounting context is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingOptions {
    /// Btree node size in sectors; every btree pointer charges this much.
    pub btree_node_size: u32,
    /// Accumulator shard count. `0` picks one per CPU, capped at 16.
    pub workers: usize,
    pub inconsistency_policy: InconsistencyPolicy,
    /// Batch size pulled from the global pool into a worker's reservation
    /// cache.
    pub reservation_cache_sectors: u64,
}

impl Default for AccountingOptions {
    fn default() -> Self {
        Self {
            btree_node_size: 512,
            workers: 0,
            inconsistency_policy: InconsistencyPolicy::default(),
            reservation_cache_sectors: ffs_types::SECTORS_CACHE,
        }
    }
}

/// Geometry of one member device, plus where its superblocks and journal
/// live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bucket size in sectors.
    pub bucket_size: u32,
    pub nbuckets: u64,
    /// Buckets below this index are never handed out.
    pub first_bucket: u64,
    /// Sector offsets of each superblock copy.
    pub sb_offsets: Vec<u64>,
    /// Each superblock copy spans `1 << sb_max_size_bits` sectors.
    pub sb_max_size_bits: u8,
    pub journal_buckets: Vec<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bucket_size: 512,
            nbuckets: 0,
            first_bucket: 0,
            sb_offsets: vec![SB_SECTOR],
            sb_max_size_bits: 7,
            journal_buckets: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Plain geometry with the default superblock layout and no journal.
    #[must_use]
    pub fn new(bucket_size: u32, nbuckets: u64, first_bucket: u64) -> Self {
        Self {
            bucket_size,
            nbuckets,
            first_bucket,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), FfsError> {
        if self.bucket_size == 0 || self.bucket_size > u32::from(u16::MAX) {
            return Err(FfsError::InvalidGeometry(format!(
                "bucket_size {} outside 1..={}",
                self.bucket_size,
                u16::MAX
            )));
        }
        if self.first_bucket >= self.nbuckets {
            return Err(FfsError::InvalidGeometry(format!(
                "first_bucket {} >= nbuckets {}",
                self.first_bucket, self.nbuckets
            )));
        }
        if self.sb_max_size_bits >= 32 {
            return Err(FfsError::InvalidGeometry(format!(
                "sb_max_size_bits {} too large",
                self.sb_max_size_bits
            )));
        }
        if let Some(b) = self
            .journal_buckets
            .iter()
            .find(|b| **b < self.first_bucket || **b >= self.nbuckets)
        {
            return Err(FfsError::InvalidGeometry(format!(
                "journal bucket {b} outside {}..{}",
                self.first_bucket, self.nbuckets
            )));
        }
        Ok(())
    }

    /// Usable sectors: every bucket from `first_bucket` on.
    #[must_use]
    pub fn capacity_sectors(&self) -> u64 {
        self.nbuckets
            .saturating_sub(self.first_bucket)
            .saturating_mul(u64::from(self.bucket_size))
    }

    /// Bucket containing sector `sector`.
    #[must_use]
    pub fn sector_to_bucket(&self, sector: u64) -> u64 {
        sector / u64::from(self.bucket_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = AccountingOptions::default();
        assert_eq!(opts.btree_node_size, 512);
        assert_eq!(opts.reservation_cache_sectors, 1024);
        assert_eq!(opts.inconsistency_policy, InconsistencyPolicy::ReadOnly);
    }

    #[test]
    fn options_serde_round_trip() {
        let opts = AccountingOptions {
            workers: 3,
            inconsistency_policy: InconsistencyPolicy::Continue,
            ..AccountingOptions::default()
        };
        let json = serde_json::to_string(&opts).expect("serialize");
        assert!(json.contains("\"continue\""));
        let back: AccountingOptions = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, opts);
    }

    #[test]
    fn partial_options_fill_defaults() {
        let opts: AccountingOptions =
            serde_json::from_str(r#"{"inconsistency_policy":"panic"}"#).expect("deserialize");
        assert_eq!(opts.inconsistency_policy, InconsistencyPolicy::Panic);
        assert_eq!(opts.btree_node_size, 512);
    }

    #[test]
    fn geometry_validation() {
        assert!(DeviceConfig::new(512, 100, 1).validate().is_ok());
        assert!(matches!(
            DeviceConfig::new(0, 100, 1).validate(),
            Err(FfsError::InvalidGeometry(_))
        ));
        assert!(DeviceConfig::new(70_000, 100, 1).validate().is_err());
        assert!(DeviceConfig::new(512, 4, 4).validate().is_err());

        let journal_outside = DeviceConfig {
            journal_buckets: vec![100],
            ..DeviceConfig::new(512, 100, 1)
        };
        assert!(journal_outside.validate().is_err());
    }

    #[test]
    fn capacity_excludes_reserved_head() {
        assert_eq!(DeviceConfig::new(381, 5, 1).capacity_sectors(), 1524);
        assert_eq!(DeviceConfig::new(512, 5, 1).sector_to_bucket(1023), 1);
    }
}
