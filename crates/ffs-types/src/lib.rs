#![forbid(unsafe_code)]
//! Identifier newtypes, data-type classification, and accounting constants
//! shared by every bucket-accounting crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Accounting constants ────────────────────────────────────────────────────

/// Maximum distance (in generations) a pointer may lag its bucket before it
/// is no longer trusted at all.
pub const BUCKET_GC_GEN_MAX: u8 = 96;

/// Largest replication factor tracked in per-replica reservation buckets.
pub const REPLICAS_MAX: usize = 4;

/// Number of in-flight journal buffers; usage accumulators rotate with it.
pub const JOURNAL_BUF_NR: usize = 4;
pub const JOURNAL_BUF_MASK: u64 = (JOURNAL_BUF_NR as u64) - 1;

/// Reservation inflation shift: reserved sectors are charged `r + r/64`.
pub const RESERVE_FACTOR: u32 = 6;

/// Default per-worker reservation batch, in sectors.
pub const SECTORS_CACHE: u64 = 1024;

/// First sector of the primary superblock region.
pub const SB_SECTOR: u64 = 8;

/// Width of the truncated journal sequence carried in a bucket mark.
pub const BUCKET_JOURNAL_SEQ_BITS: u32 = 16;

/// Maximum number of blocks in one erasure-coded stripe.
pub const STRIPE_BLOCKS_MAX: usize = 16;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Member device index within the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIndex(pub u32);

/// Bucket number within one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketNumber(pub u64);

/// Journal sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    pub const ZERO: Self = Self(0);

    /// Which usage accumulator rotation slot this sequence charges.
    #[must_use]
    pub fn buf_index(self) -> usize {
        #[expect(clippy::cast_possible_truncation)] // masked to JOURNAL_BUF_NR
        let idx = (self.0 & JOURNAL_BUF_MASK) as usize;
        idx
    }

    /// Truncated form stored in bucket marks.
    #[must_use]
    pub fn truncated(self) -> u16 {
        #[expect(clippy::cast_possible_truncation)] // intentional low-16 fold
        let low = self.0 as u16;
        low
    }
}

/// Erasure-coding stripe identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StripeId(pub u64);

/// 8-bit wrapping bucket generation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BucketGen(pub u8);

impl BucketGen {
    /// Signed wrapping distance `self - other`.
    #[must_use]
    pub fn cmp_wrapping(self, other: Self) -> i32 {
        #[expect(clippy::cast_possible_wrap)] // wrap is the comparison
        let diff = self.0.wrapping_sub(other.0) as i8;
        i32::from(diff)
    }

    /// True when `self` is strictly newer than `other` under wraparound.
    #[must_use]
    pub fn is_after(self, other: Self) -> bool {
        self.cmp_wrapping(other) > 0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Position of a stored entry in the key space.
///
/// For extent-like entries `offset` is the *end* of the range.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Pos {
    pub inode: u64,
    pub offset: u64,
}

impl Pos {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }
}

// ── Data types ──────────────────────────────────────────────────────────────

/// What occupies a bucket or a replicas configuration.
///
/// Discriminants are stable: they are the 3-bit value packed into marks.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum DataType {
    #[default]
    None = 0,
    Sb = 1,
    Journal = 2,
    Btree = 3,
    User = 4,
    Cached = 5,
    Parity = 6,
}

impl DataType {
    pub const COUNT: usize = 7;

    pub const ALL: [Self; Self::COUNT] = [
        Self::None,
        Self::Sb,
        Self::Journal,
        Self::Btree,
        Self::User,
        Self::Cached,
        Self::Parity,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Superblock and journal buckets: accounted as hidden space.
    #[must_use]
    pub fn is_metadata_region(self) -> bool {
        matches!(self, Self::Sb | Self::Journal)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "free",
            Self::Sb => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::Parity => "parity",
        }
    }
}

impl TryFrom<u8> for DataType {
    type Error = ParseError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(raw))
            .copied()
            .ok_or(ParseError::InvalidField {
                field: "data_type",
                reason: "unknown data type discriminant",
            })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

/// Narrow a sector count into a 16-bit mark field.
pub fn sectors_to_u16(value: u64, field: &'static str) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StripeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BucketGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}
