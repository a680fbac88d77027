//! Superblock and journal placement on a member device.

use crate::config::DeviceConfig;
use ffs_types::{BucketNumber, DataType, SB_SECTOR};

/// Every bucket holding superblock or journal data on a device, with the
/// sectors of that data it holds, in ascending sector order.
///
/// Each superblock copy spans `1 << sb_max_size_bits` sectors from its
/// offset; the copy at the default offset also claims the sectors before it.
/// Ranges landing in the same bucket are summed. Journal buckets are charged
/// in full.
#[must_use]
pub fn sb_layout_buckets(config: &DeviceConfig) -> Vec<(BucketNumber, DataType, u32)> {
    let mut out: Vec<(BucketNumber, DataType, u32)> = Vec::new();
    let mut charge = |start: u64, end: u64| {
        let mut start = start;
        let bucket_size = u64::from(config.bucket_size);
        while start < end {
            let bucket = config.sector_to_bucket(start);
            let bucket_end = ((bucket + 1) * bucket_size).min(end);
            #[expect(clippy::cast_possible_truncation)] // at most one bucket
            let sectors = (bucket_end - start) as u32;
            match out.iter_mut().find(|(b, _, _)| b.0 == bucket) {
                Some(entry) => entry.2 += sectors,
                None => out.push((BucketNumber(bucket), DataType::Sb, sectors)),
            }
            start = bucket_end;
        }
    };

    for offset in &config.sb_offsets {
        if *offset == SB_SECTOR {
            charge(0, SB_SECTOR);
        }
        charge(*offset, offset + (1_u64 << config.sb_max_size_bits));
    }

    for bucket in &config.journal_buckets {
        out.push((BucketNumber(*bucket), DataType::Journal, config.bucket_size));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_fills_head_of_device() {
        let config = DeviceConfig::new(128, 16, 2);
        // Sectors 0..8 and 8..136: bucket 0 whole, 8 sectors of bucket 1.
        assert_eq!(
            sb_layout_buckets(&config),
            vec![
                (BucketNumber(0), DataType::Sb, 128),
                (BucketNumber(1), DataType::Sb, 8),
            ]
        );
    }

    #[test]
    fn backup_copies_and_journal() {
        let config = DeviceConfig {
            sb_offsets: vec![SB_SECTOR, 1024],
            sb_max_size_bits: 4,
            journal_buckets: vec![5, 6],
            ..DeviceConfig::new(512, 16, 3)
        };
        assert_eq!(
            sb_layout_buckets(&config),
            vec![
                (BucketNumber(0), DataType::Sb, 24),
                (BucketNumber(2), DataType::Sb, 16),
                (BucketNumber(5), DataType::Journal, 512),
                (BucketNumber(6), DataType::Journal, 512),
            ]
        );
    }
}
