#![forbid(unsafe_code)]
//! Error types for bucket and usage accounting.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Decoding | `ParseError` | `ffs-types` | Raw discriminants or packed words that do not decode |
//! | Runtime | `FfsError` | `ffs-error` (this crate) | Errors returned from marking, reservation, and GC APIs |
//!
//! ## Failure classes
//!
//! - **Inconsistency**: a stored entry disagrees with bucket state (generation
//!   mismatch, data-type collision, sector overflow, missing stripe or
//!   indirect record, two stripes on one bucket). Always routed through the
//!   filesystem inconsistency channel before being returned.
//! - **Resource exhaustion**: `NoSpace`. A normal failure; never reported as
//!   an inconsistency.
//! - **Stale reference**: not an error at all. Marking excludes the pointer
//!   and reports `RefCheck::Stale` to its caller.
//!
//! ## errno Mapping
//!
//! Every `FfsError` variant maps to exactly one POSIX errno via
//! [`FfsError::to_errno`]. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Inconsistency` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |
//!
//! ## Design Constraints
//!
//! - `ffs-error` MUST NOT depend on `ffs-types` (no cyclic deps); the
//!   `ParseError` conversion lives in `ffs-core`.
//! - All string payloads are owned (`String`).

use thiserror::Error;

/// Unified error type for all accounting operations.
#[derive(Debug, Error)]
pub enum FfsError {
    /// Collaborator I/O failure (journal flush, key source).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk state contradicts in-memory accounting.
    #[error("filesystem inconsistency: {0}")]
    Inconsistency(String),

    /// Malformed stored entry (bad pointer set, impossible field values).
    #[error("invalid format: {0}")]
    Format(String),

    /// Decoding failure surfaced from `ffs-types`.
    #[error("parse error: {0}")]
    Parse(String),

    /// Device geometry out of range (zero bucket size, empty device).
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A disk reservation could not be satisfied.
    #[error("no space left on device")]
    NoSpace,

    /// Device, stripe, or replicas configuration not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Accounting latched read-only after an inconsistency.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl FfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// - `Inconsistency` → `EIO`: the caller cannot trust the on-disk state.
    /// - `ReadOnly` → `EROFS`: accounting refused writes after an error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Inconsistency(_) => libc::EIO,
            Self::Format(_) | Self::Parse(_) | Self::InvalidGeometry(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
        }
    }

    /// True for errors that the inconsistency channel has already seen.
    #[must_use]
    pub fn is_inconsistency(&self) -> bool {
        matches!(self, Self::Inconsistency(_))
    }
}

/// Result alias using `FfsError`.
pub type Result<T> = std::result::Result<T, FfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(FfsError, libc::c_int)> = vec![
            (FfsError::Io(std::io::Error::other("test")), libc::EIO),
            (FfsError::Inconsistency("gen mismatch".into()), libc::EIO),
            (FfsError::Format("test".into()), libc::EINVAL),
            (FfsError::Parse("test".into()), libc::EINVAL),
            (
                FfsError::InvalidGeometry("bucket_size=0".into()),
                libc::EINVAL,
            ),
            (FfsError::NoSpace, libc::ENOSPC),
            (FfsError::NotFound("stripe 4".into()), libc::ENOENT),
            (FfsError::ReadOnly, libc::EROFS),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        let ffs = FfsError::Io(raw);
        assert_eq!(ffs.to_errno(), libc::EPERM);
    }

    #[test]
    fn display_formatting() {
        let err = FfsError::Inconsistency("bucket 0:12 gen 3 data type user".into());
        assert_eq!(
            err.to_string(),
            "filesystem inconsistency: bucket 0:12 gen 3 data type user"
        );
        assert_eq!(FfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(FfsError::ReadOnly.to_string(), "read-only filesystem");
        let geom = FfsError::InvalidGeometry("nbuckets=0".into());
        assert_eq!(geom.to_string(), "invalid geometry: nbuckets=0");
    }

    #[test]
    fn only_inconsistency_is_flagged() {
        assert!(FfsError::Inconsistency("x".into()).is_inconsistency());
        assert!(!FfsError::NoSpace.is_inconsistency());
        assert!(!FfsError::ReadOnly.is_inconsistency());
    }
}
