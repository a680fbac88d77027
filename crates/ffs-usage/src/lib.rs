#![forbid(unsafe_code)]
//! Usage accounting: sharded accumulators, device and filesystem usage
//! layouts, the replicas registry, and the transaction delta ledger.
//!
//! ## Design
//!
//! 1. **Accumulator** ([`accumulator`]): base totals plus per-worker
//!    shards, one shard set per journal buffer, read under a sequence
//!    counter.
//! 2. **Layouts** ([`fs_usage`], [`dev_usage`]): typed counters mapped
//!    onto flat vectors, decoded snapshots, and the rule that turns a bucket
//!    mark transition into device deltas.
//! 3. **Replicas** ([`replicas`]): configuration-to-slot registry and the
//!    all-or-nothing delta ledger.
//!
//! # Logging
//!
//! Target `ffs::usage`: DEBUG on every buffer fold, TRACE when a snapshot
//! had to retry, INFO when a replicas configuration is registered.

pub mod accumulator;
pub mod dev_usage;
pub mod fs_usage;
pub mod replicas;

pub use accumulator::{
    CounterLayout, SeqCount, UsageAcc, UsageAccumulator, WorkerHandle, current_worker,
    resolve_workers,
};
pub use dev_usage::{DEV_USAGE_WIDTH, DevCounter, DevTypeUsage, DevUsage, DevUsageDelta, apply_delta};
pub use fs_usage::{
    FsCounter, FsUsage, FsUsageDelta, FsUsageShort, avail_factor, data_type_to_base,
    fs_usage_width, reserve_factor,
};
pub use replicas::{
    LedgerMark, ReplicasDelta, ReplicasDeltaList, ReplicasEntry, ReplicasError, ReplicasRegistry,
    update_cached_sectors, update_replicas,
};

/// Filesystem usage accumulator.
pub type FsAccumulator = UsageAccumulator<FsCounter>;

/// Device usage accumulator.
pub type DevAccumulator = UsageAccumulator<DevCounter>;
