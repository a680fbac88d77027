#![forbid(unsafe_code)]
//! Bucket and usage accounting for a copy-on-write filesystem.
//!
//! One import for callers that drive accounting from outside: the context
//! and its operations from `ffs-core`, plus the identifier, usage, and error
//! types its signatures mention.
//!
//! ```
//! use ffs::{AccountingOptions, BucketFs, DeviceConfig};
//! use ffs::journal::MemJournal;
//! use std::sync::Arc;
//!
//! let fs = BucketFs::new(AccountingOptions::default(), Arc::new(MemJournal::new(1)));
//! fs.add_device(DeviceConfig::new(128, 64, 1)).unwrap();
//! let res = fs.reserve(64, false).unwrap();
//! assert_eq!(fs.usage_snapshot().online_reserved, res.sectors());
//! ```

pub use ffs_alloc::{BucketAux, BucketMark, PtrRef};
pub use ffs_core::*;
pub use ffs_error::{FfsError, Result};
pub use ffs_types::{BucketGen, BucketNumber, DataType, DeviceIndex, JournalSeq, Pos, StripeId};
pub use ffs_usage::{DevUsage, FsUsage, FsUsageShort, ReplicasEntry};

/// Journal sequence sources and the in-memory journal.
pub mod journal {
    pub use ffs_journal::{JournalBufHook, JournalSeqSource, MemJournal};
}
