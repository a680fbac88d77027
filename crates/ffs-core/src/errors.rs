//! Marking failures that are not bucket-reference errors.
//!
//! Every variant describes stored state contradicting in-memory state and
//! surfaces as [`FfsError::Inconsistency`] after passing through the
//! context's inconsistency channel.

use ffs_error::FfsError;
use ffs_types::{BucketGen, BucketNumber, DataType, DeviceIndex, ParseError, Pos, StripeId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarkError {
    #[error("pointer to nonexistent device {0}")]
    NoDevice(DeviceIndex),

    #[error("bucket {dev}:{bucket} beyond end of device ({nbuckets} buckets)")]
    BucketOutOfRange {
        dev: DeviceIndex,
        bucket: BucketNumber,
        nbuckets: u64,
    },

    #[error("pointer to nonexistent stripe {0}")]
    NonexistentStripe(StripeId),

    #[error("stripe pointer doesn't match stripe {idx} block {block}")]
    StripePtrMismatch { idx: StripeId, block: u8 },

    #[error("stripe {idx} block {block} sector count out of range: {current} + {delta}")]
    StripeBlockRange {
        idx: StripeId,
        block: u8,
        current: u32,
        delta: i64,
    },

    #[error("bucket {dev}:{bucket} gen {generation}: multiple stripes using same bucket ({existing}, {new})")]
    MultipleStripes {
        dev: DeviceIndex,
        bucket: BucketNumber,
        generation: BucketGen,
        existing: StripeId,
        new: StripeId,
    },

    #[error("{pos} len {size} points to nonexistent indirect extent {idx}")]
    NonexistentIndirect { pos: Pos, size: u32, idx: u64 },

    #[error("indirect extent {idx} refcount underflow")]
    RefcountUnderflow { idx: u64 },

    #[error("bucket {dev}:{bucket} gen {generation} different types of data in same bucket: {existing}, {new}")]
    MetadataCollision {
        dev: DeviceIndex,
        bucket: BucketNumber,
        generation: BucketGen,
        existing: DataType,
        new: DataType,
    },

    #[error("bucket {dev}:{bucket} gen {generation} data type {data_type} sector count overflow: {sectors} > {limit}")]
    MetadataOverflow {
        dev: DeviceIndex,
        bucket: BucketNumber,
        generation: BucketGen,
        data_type: DataType,
        sectors: u64,
        limit: u64,
    },

    #[error("bucket {dev}:{bucket} gen {generation} invalidated while in use ({data_type}, {dirty} dirty sectors)")]
    InvalidateInUse {
        dev: DeviceIndex,
        bucket: BucketNumber,
        generation: BucketGen,
        data_type: DataType,
        dirty: u16,
    },
}

impl From<MarkError> for FfsError {
    fn from(err: MarkError) -> Self {
        Self::Inconsistency(err.to_string())
    }
}

/// Decoding failures: bad field values are format errors, failed integer
/// narrowing is a parse error.
pub(crate) fn parse_error_to_ffs(e: &ParseError) -> FfsError {
    match e {
        ParseError::InvalidField { .. } => FfsError::Format(e.to_string()),
        ParseError::IntegerConversion { .. } => FfsError::Parse(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_by_kind() {
        let e = parse_error_to_ffs(&ParseError::InvalidField {
            field: "stripe.nr_redundant",
            reason: "no data blocks left",
        });
        assert!(matches!(e, FfsError::Format(ref m) if m.contains("stripe.nr_redundant")));

        let e = parse_error_to_ffs(&ParseError::IntegerConversion { field: "sectors" });
        assert!(matches!(e, FfsError::Parse(_)));
        assert_eq!(e.to_errno(), FfsError::Format(String::new()).to_errno());
    }

    #[test]
    fn mark_errors_are_inconsistencies() {
        let err: FfsError = MarkError::NonexistentStripe(StripeId(7)).into();
        assert!(err.is_inconsistency());
        assert_eq!(
            err.to_string(),
            "filesystem inconsistency: pointer to nonexistent stripe 7"
        );
    }
}
