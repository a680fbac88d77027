#![forbid(unsafe_code)]
//! Bucket mark store.
//!
//! Every bucket on every member device carries one [`BucketMark`]: its
//! generation, what it holds, how many live and cached sectors reference it,
//! and whether its state is already durable in the journal. The mark packs
//! into a single `u64` so it can be read and replaced with one atomic word.
//!
//! ## Design
//!
//! The store is layered:
//!
//! 1. **BucketMark**: the decoded record and its bit layout.
//! 2. **Reference checks** ([`refcheck`]): validate a pointer against a mark
//!    before its sectors are applied.
//! 3. **Bucket / BucketArray** ([`bucket`]): the atomic cell per bucket plus
//!    auxiliary per-bucket fields, and the per-device array with the
//!    compare-and-swap update loop.
//!
//! # Logging
//!
//! Target `ffs::buckets`: TRACE on each CAS retry and commit.

pub mod bucket;
pub mod refcheck;

pub use bucket::{Bucket, BucketArray, BucketAux, UpdateMode};
pub use refcheck::{PtrRef, RefCheck, RefError, check_bucket_ref, mark_pointer_sectors};

use ffs_types::{BucketGen, DataType, ParseError};
use serde::{Deserialize, Serialize};

// ── Packed layout ───────────────────────────────────────────────────────────

const GEN_SHIFT: u32 = 0;
const DATA_TYPE_SHIFT: u32 = 8;
const DATA_TYPE_MASK: u64 = 0b111;
const OWNED_BIT: u32 = 11;
const JOURNAL_SEQ_VALID_BIT: u32 = 12;
const STRIPE_BIT: u32 = 13;
const DIRTY_SHIFT: u32 = 16;
const CACHED_SHIFT: u32 = 32;
const JOURNAL_SEQ_SHIFT: u32 = 48;

/// Decoded state of one bucket.
///
/// A zeroed mark is a free bucket. `data_type` is `None` iff both sector
/// counts are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMark {
    pub generation: BucketGen,
    pub data_type: DataType,
    pub owned_by_allocator: bool,
    pub journal_seq_valid: bool,
    pub stripe: bool,
    pub dirty_sectors: u16,
    pub cached_sectors: u16,
    pub journal_seq: u16,
}

impl BucketMark {
    /// Pack into the single-word representation.
    #[must_use]
    pub fn to_bits(self) -> u64 {
        (u64::from(self.generation.0) << GEN_SHIFT)
            | ((u64::from(self.data_type as u8) & DATA_TYPE_MASK) << DATA_TYPE_SHIFT)
            | (u64::from(self.owned_by_allocator) << OWNED_BIT)
            | (u64::from(self.journal_seq_valid) << JOURNAL_SEQ_VALID_BIT)
            | (u64::from(self.stripe) << STRIPE_BIT)
            | (u64::from(self.dirty_sectors) << DIRTY_SHIFT)
            | (u64::from(self.cached_sectors) << CACHED_SHIFT)
            | (u64::from(self.journal_seq) << JOURNAL_SEQ_SHIFT)
    }

    /// Decode a word produced by [`BucketMark::to_bits`].
    pub fn try_from_bits(bits: u64) -> Result<Self, ParseError> {
        #[expect(clippy::cast_possible_truncation)] // masked to 3 bits
        let raw_type = ((bits >> DATA_TYPE_SHIFT) & DATA_TYPE_MASK) as u8;
        Ok(Self::unpack(bits, DataType::try_from(raw_type)?))
    }

    /// Decode a word read back from a bucket cell. Cells only ever hold
    /// words built by `to_bits`, so the data-type field is always valid.
    #[must_use]
    pub(crate) fn from_cell(bits: u64) -> Self {
        #[expect(clippy::cast_possible_truncation)] // masked to 3 bits
        let raw_type = ((bits >> DATA_TYPE_SHIFT) & DATA_TYPE_MASK) as u8;
        Self::unpack(bits, DataType::try_from(raw_type).unwrap_or_default())
    }

    #[expect(clippy::cast_possible_truncation)] // each field is masked by its shift width
    fn unpack(bits: u64, data_type: DataType) -> Self {
        Self {
            generation: BucketGen((bits >> GEN_SHIFT) as u8),
            data_type,
            owned_by_allocator: bits & (1 << OWNED_BIT) != 0,
            journal_seq_valid: bits & (1 << JOURNAL_SEQ_VALID_BIT) != 0,
            stripe: bits & (1 << STRIPE_BIT) != 0,
            dirty_sectors: (bits >> DIRTY_SHIFT) as u16,
            cached_sectors: (bits >> CACHED_SHIFT) as u16,
            journal_seq: (bits >> JOURNAL_SEQ_SHIFT) as u16,
        }
    }

    #[must_use]
    pub fn sectors_used(self) -> u32 {
        u32::from(self.dirty_sectors) + u32::from(self.cached_sectors)
    }

    /// Reusable by the allocator: nobody owns it, nothing live in it, and it
    /// is not pinned by a stripe or a superblock/journal region.
    #[must_use]
    pub fn is_available(self) -> bool {
        !self.owned_by_allocator
            && self.dirty_sectors == 0
            && !self.stripe
            && !self.data_type.is_metadata_region()
    }

    /// Effective type for bucket counting: a bucket holding only cached
    /// sectors counts as cached regardless of its recorded type.
    #[must_use]
    pub fn bucket_type(self) -> DataType {
        if self.cached_sectors != 0 && self.dirty_sectors == 0 {
            DataType::Cached
        } else {
            self.data_type
        }
    }

    /// Wasted sectors in a partially used bucket.
    #[must_use]
    pub fn sectors_fragmented(self, bucket_size: u32) -> u32 {
        let used = self.sectors_used();
        if used == 0 {
            0
        } else {
            bucket_size.saturating_sub(used)
        }
    }

    #[must_use]
    pub fn is_stripe_data_bucket(self) -> bool {
        self.stripe && self.data_type != DataType::Parity
    }

    /// The tagged journal sequence has not reached disk yet.
    #[must_use]
    pub fn needs_journal_commit(self, last_seq_ondisk: u16) -> bool {
        #[expect(clippy::cast_possible_wrap)] // wrapping comparison
        let ahead = self.journal_seq.wrapping_sub(last_seq_ondisk) as i16;
        self.journal_seq_valid && ahead > 0
    }

    /// Add metadata sectors, saturating at `u16::MAX`. Returns `false` when
    /// the counter saturated.
    pub fn add_dirty_saturating(&mut self, sectors: u16) -> bool {
        match self.dirty_sectors.checked_add(sectors) {
            Some(total) => {
                self.dirty_sectors = total;
                true
            }
            None => {
                self.dirty_sectors = u16::MAX;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BucketMark {
        BucketMark {
            generation: BucketGen(0xA5),
            data_type: DataType::User,
            owned_by_allocator: false,
            journal_seq_valid: true,
            stripe: true,
            dirty_sectors: 0x1234,
            cached_sectors: 0x00FF,
            journal_seq: 0xBEEF,
        }
    }

    #[test]
    fn packed_layout_positions() {
        let bits = sample().to_bits();
        assert_eq!(bits & 0xFF, 0xA5);
        assert_eq!((bits >> 8) & 0b111, 4);
        assert_eq!((bits >> 11) & 1, 0);
        assert_eq!((bits >> 12) & 1, 1);
        assert_eq!((bits >> 13) & 1, 1);
        assert_eq!((bits >> 16) & 0xFFFF, 0x1234);
        assert_eq!((bits >> 32) & 0xFFFF, 0x00FF);
        assert_eq!(bits >> 48, 0xBEEF);
        assert_eq!(BucketMark::try_from_bits(bits).expect("decode"), sample());
    }

    #[test]
    fn zero_word_is_free_bucket() {
        let mark = BucketMark::try_from_bits(0).expect("decode");
        assert_eq!(mark, BucketMark::default());
        assert!(mark.is_available());
        assert_eq!(mark.bucket_type(), DataType::None);
    }

    #[test]
    fn invalid_data_type_rejected() {
        let bits = 7_u64 << 8;
        assert!(BucketMark::try_from_bits(bits).is_err());
    }

    #[test]
    fn availability_rules() {
        let owned = BucketMark {
            owned_by_allocator: true,
            ..BucketMark::default()
        };
        assert!(!owned.is_available());

        let cached = BucketMark {
            cached_sectors: 10,
            data_type: DataType::Cached,
            ..BucketMark::default()
        };
        assert!(cached.is_available(), "cached-only bucket is reclaimable");

        let dirty = BucketMark {
            dirty_sectors: 1,
            data_type: DataType::User,
            ..BucketMark::default()
        };
        assert!(!dirty.is_available());

        let striped = BucketMark {
            stripe: true,
            ..BucketMark::default()
        };
        assert!(!striped.is_available());
    }

    #[test]
    fn cached_only_bucket_type() {
        let mut m = BucketMark {
            data_type: DataType::User,
            cached_sectors: 8,
            ..BucketMark::default()
        };
        assert_eq!(m.bucket_type(), DataType::Cached);
        m.dirty_sectors = 8;
        assert_eq!(m.bucket_type(), DataType::User);
    }

    #[test]
    fn fragmentation() {
        let mut m = BucketMark::default();
        assert_eq!(m.sectors_fragmented(512), 0);
        m.dirty_sectors = 100;
        m.cached_sectors = 12;
        assert_eq!(m.sectors_fragmented(512), 400);
        m.dirty_sectors = 600;
        assert_eq!(m.sectors_fragmented(512), 0);
    }

    #[test]
    fn journal_commit_wraps() {
        let mut m = BucketMark {
            journal_seq: 10,
            ..BucketMark::default()
        };
        assert!(!m.needs_journal_commit(5), "tag not valid");
        m.journal_seq_valid = true;
        assert!(m.needs_journal_commit(5));
        assert!(!m.needs_journal_commit(10));
        assert!(!m.needs_journal_commit(11));
        m.journal_seq = 2;
        assert!(m.needs_journal_commit(0xFFF0));
    }

    #[test]
    fn saturating_metadata_add() {
        let mut m = BucketMark::default();
        assert!(m.add_dirty_saturating(u16::MAX - 1));
        assert!(!m.add_dirty_saturating(5));
        assert_eq!(m.dirty_sectors, u16::MAX);
    }
}
