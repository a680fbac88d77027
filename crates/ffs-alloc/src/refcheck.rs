//! Pointer-versus-bucket reference validation.
//!
//! Before a pointer's sectors are folded into a bucket mark, its generation
//! and data type are checked against the mark. A cached pointer whose
//! generation lags is merely stale: the bucket was reclaimed and the copy is
//! gone. Everything else that disagrees is an inconsistency.

use crate::BucketMark;
use ffs_error::FfsError;
use ffs_types::{BUCKET_GC_GEN_MAX, BucketGen, BucketNumber, DataType, DeviceIndex};
use thiserror::Error;

/// One device pointer as seen by the mark store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtrRef {
    pub dev: DeviceIndex,
    pub bucket: BucketNumber,
    pub generation: BucketGen,
    pub cached: bool,
}

/// Outcome of a successful reference check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCheck {
    /// Pointer matches its bucket; apply the sectors.
    Live,
    /// Cached pointer into a reclaimed bucket; contributes nothing.
    Stale,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefError {
    #[error(
        "bucket {dev}:{bucket} gen {bucket_gen} data type {data_type}: ptr gen {ptr_gen} newer than bucket gen"
    )]
    GenNewer {
        dev: DeviceIndex,
        bucket: BucketNumber,
        bucket_gen: BucketGen,
        ptr_gen: BucketGen,
        data_type: DataType,
    },
    #[error(
        "bucket {dev}:{bucket} gen {bucket_gen} data type {data_type}: ptr gen {ptr_gen} too stale"
    )]
    TooStale {
        dev: DeviceIndex,
        bucket: BucketNumber,
        bucket_gen: BucketGen,
        ptr_gen: BucketGen,
        data_type: DataType,
    },
    #[error(
        "bucket {dev}:{bucket} gen {bucket_gen} data type {data_type}: stale dirty ptr (gen {ptr_gen})"
    )]
    StaleDirty {
        dev: DeviceIndex,
        bucket: BucketNumber,
        bucket_gen: BucketGen,
        ptr_gen: BucketGen,
        data_type: DataType,
    },
    #[error("bucket {dev}:{bucket} gen {bucket_gen} different types of data in same bucket: {bucket_type}, {ptr_type}")]
    TypeCollision {
        dev: DeviceIndex,
        bucket: BucketNumber,
        bucket_gen: BucketGen,
        bucket_type: DataType,
        ptr_type: DataType,
    },
    #[error(
        "bucket {dev}:{bucket} gen {bucket_gen} data type {data_type} sector count overflow: {current} + {delta} > u16::MAX"
    )]
    SectorOverflow {
        dev: DeviceIndex,
        bucket: BucketNumber,
        bucket_gen: BucketGen,
        data_type: DataType,
        current: u16,
        delta: i64,
    },
}

impl From<RefError> for FfsError {
    fn from(err: RefError) -> Self {
        Self::Inconsistency(err.to_string())
    }
}

/// Validate `ptr` (contributing `sectors` of `ptr_type`) against `mark`.
pub fn check_bucket_ref(
    ptr: &PtrRef,
    sectors: i64,
    ptr_type: DataType,
    mark: &BucketMark,
) -> Result<RefCheck, RefError> {
    let bucket_gen = mark.generation;
    let (dev, bucket) = (ptr.dev, ptr.bucket);

    if ptr.generation.is_after(bucket_gen) {
        return Err(RefError::GenNewer {
            dev,
            bucket,
            bucket_gen,
            ptr_gen: ptr.generation,
            data_type: ptr_type,
        });
    }

    if bucket_gen.cmp_wrapping(ptr.generation) > i32::from(BUCKET_GC_GEN_MAX) {
        return Err(RefError::TooStale {
            dev,
            bucket,
            bucket_gen,
            ptr_gen: ptr.generation,
            data_type: ptr_type,
        });
    }

    if bucket_gen != ptr.generation {
        if !ptr.cached {
            return Err(RefError::StaleDirty {
                dev,
                bucket,
                bucket_gen,
                ptr_gen: ptr.generation,
                data_type: ptr_type,
            });
        }
        return Ok(RefCheck::Stale);
    }

    if mark.data_type != DataType::None
        && ptr_type != DataType::None
        && mark.data_type != ptr_type
    {
        return Err(RefError::TypeCollision {
            dev,
            bucket,
            bucket_gen,
            bucket_type: mark.data_type,
            ptr_type,
        });
    }

    let current = if ptr.cached {
        mark.cached_sectors
    } else {
        mark.dirty_sectors
    };
    let total = i64::from(current) + sectors;
    if !(0..=i64::from(u16::MAX)).contains(&total) {
        return Err(RefError::SectorOverflow {
            dev,
            bucket,
            bucket_gen,
            data_type: ptr_type,
            current,
            delta: sectors,
        });
    }

    Ok(RefCheck::Live)
}

/// Apply a pointer's sectors to `mark` after checking the reference.
///
/// Live pointers charge dirty sectors, cached pointers charge cached
/// sectors. The bucket's data type follows the pointer while anything
/// remains in it and clears when both counts reach zero. On
/// [`RefCheck::Stale`] the mark is left untouched.
pub fn mark_pointer_sectors(
    mark: &mut BucketMark,
    ptr: &PtrRef,
    sectors: i64,
    ptr_type: DataType,
) -> Result<RefCheck, RefError> {
    let check = check_bucket_ref(ptr, sectors, ptr_type, mark)?;
    if check == RefCheck::Stale {
        return Ok(check);
    }

    let dst = if ptr.cached {
        &mut mark.cached_sectors
    } else {
        &mut mark.dirty_sectors
    };
    // Bounds of this counter were checked above.
    let total = i64::from(*dst) + sectors;
    *dst = u16::try_from(total).map_err(|_| RefError::SectorOverflow {
        dev: ptr.dev,
        bucket: ptr.bucket,
        bucket_gen: mark.generation,
        data_type: ptr_type,
        current: *dst,
        delta: sectors,
    })?;

    mark.data_type = if mark.dirty_sectors != 0 || mark.cached_sectors != 0 {
        ptr_type
    } else {
        DataType::None
    };
    Ok(RefCheck::Live)
}
