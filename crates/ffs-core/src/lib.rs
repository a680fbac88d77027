#![forbid(unsafe_code)]
//! Bucket and usage accounting.
//!
//! [`BucketFs`] is the accounting context created at mount and dropped at
//! unmount. It owns the bucket marks of every member device, the device and
//! filesystem usage accumulators, the replicas registry, the in-memory
//! stripe table, the consistency-scan shadow view, and the global pool that
//! disk reservations draw from. Every operation takes it by reference; there
//! is no ambient state.
//!
//! ## Design
//!
//! 1. **Marking** (`mark`) applies stored-entry changes to bucket marks and
//!    usage immediately. All effects of one call are staged and published
//!    together; a failure reverses the pointers already applied.
//! 2. **Deferred marking** ([`trans`]) records the same effects into a
//!    [`Transaction`]: replicas deltas into its ledger, allocation, stripe,
//!    and indirect-extent rewrites into its update list. [`BucketFs::commit`]
//!    applies them as one unit.
//! 3. **Consistency scan** (`gc`) marks into a shadow [`View`] selected by
//!    [`TriggerFlags::GC`] and reconciles it into the live view under the
//!    exclusive mark lock.
//! 4. **Reservations** (`reservation`) gate space consumption through a
//!    per-worker cache over one global counter.
//!
//! The mark lock is shared by marking and taken exclusively only for
//! structural changes: adding or resizing a device, registering a replicas
//! configuration, starting or finishing a scan.
//!
//! # Logging
//!
//! - `ffs::buckets`: ERROR for every inconsistency, DEBUG on allocator wake,
//!   device changes, and journal-sequence cleanup.
//! - `ffs::reserve`: TRACE on the fast path, DEBUG on recalculation, WARN
//!   once when a commit outgrows its reservation.
//! - `ffs::gc`: INFO on scan start and finish, WARN per repaired mismatch.

pub mod config;
pub mod errors;
mod gc;
pub mod keys;
mod mark;
mod metadata;
pub mod report;
mod reservation;
pub mod stripe;
pub mod trans;
mod usage;

pub use config::{AccountingOptions, DeviceConfig, InconsistencyPolicy};
pub use errors::MarkError;
pub use gc::GcReport;
pub use keys::{
    AllocRecord, Crc, DecodedPtr, ExtentOverlap, Key, KeyKind, KeyValue, StripePtr, StripeRecord,
    TriggerFlags, extent_overlap, overwrite_delta, ptr_disk_sectors_delta,
};
pub use mark::Trigger;
pub use metadata::sb_layout_buckets;
pub use report::{DevUsageReport, UsageReport, dev_usage_to_text, usage_to_text};
pub use reservation::DiskReservation;
pub use stripe::{NullStripeHeap, StripeHeap, StripeState, StripeTable};
pub use trans::{
    CommitOutcome, KeySource, MemKeySource, PendingUpdate, Transaction, TransSavepoint, TreeId,
};

use ffs_alloc::BucketArray;
use ffs_error::{FfsError, Result};
use ffs_journal::{JournalBufHook, JournalSeqSource, MemJournal};
use ffs_types::{BucketNumber, DeviceIndex, JournalSeq, Pos};
use ffs_usage::{
    DEV_USAGE_WIDTH, DevAccumulator, FsAccumulator, ReplicasEntry, ReplicasRegistry,
    UsageAccumulator, fs_usage_width, resolve_workers,
};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Wake-up signal to the free-bucket allocator, sent when a bucket becomes
/// available.
pub trait AllocatorWaker: Send + Sync {
    fn wake(&self, dev: DeviceIndex);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullWaker;

impl AllocatorWaker for NullWaker {
    fn wake(&self, _dev: DeviceIndex) {}
}

// ── Views ───────────────────────────────────────────────────────────────────

pub(crate) fn dev_slot(dev: DeviceIndex) -> usize {
    usize::try_from(dev.0).unwrap_or(usize::MAX)
}

/// One complete set of marks and usage. The live view and the scan's shadow
/// view have the same shape.
#[derive(Debug)]
pub(crate) struct View {
    pub(crate) buckets: Vec<BucketArray>,
    pub(crate) dev_usage: Vec<DevAccumulator>,
    pub(crate) fs_usage: FsAccumulator,
    pub(crate) stripes: Mutex<StripeTable>,
}

impl View {
    fn new(nr_replicas: usize, nr_workers: usize) -> Self {
        Self {
            buckets: Vec::new(),
            dev_usage: Vec::new(),
            fs_usage: UsageAccumulator::new(fs_usage_width(nr_replicas), nr_workers),
            stripes: Mutex::new(StripeTable::new()),
        }
    }

    fn push_device(&mut self, buckets: BucketArray, nr_workers: usize) {
        self.buckets.push(buckets);
        self.dev_usage
            .push(UsageAccumulator::new(DEV_USAGE_WIDTH, nr_workers));
    }

    pub(crate) fn buckets(&self, dev: DeviceIndex) -> std::result::Result<&BucketArray, MarkError> {
        self.buckets
            .get(dev_slot(dev))
            .ok_or(MarkError::NoDevice(dev))
    }

    /// Bucket array of `dev`, checked to contain `bucket`.
    pub(crate) fn bucket_array(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
    ) -> std::result::Result<&BucketArray, MarkError> {
        let array = self.buckets(dev)?;
        if array.get(bucket).is_none() {
            return Err(MarkError::BucketOutOfRange {
                dev,
                bucket,
                nbuckets: array.nbuckets(),
            });
        }
        Ok(array)
    }
}

/// Shadow view plus scan progress.
#[derive(Debug)]
pub(crate) struct GcState {
    pub(crate) view: View,
    pub(crate) pos: Mutex<Pos>,
    /// A scan-mode marking failed; the shadow view cannot be trusted.
    pub(crate) failed: AtomicBool,
}

/// Everything guarded by the mark lock.
#[derive(Debug)]
pub(crate) struct MarkState {
    pub(crate) devices: Vec<DeviceConfig>,
    pub(crate) replicas: ReplicasRegistry,
    pub(crate) live: View,
    pub(crate) gc: Option<GcState>,
}

impl MarkState {
    pub(crate) fn view(&self, gc: bool) -> Result<&View> {
        if !gc {
            return Ok(&self.live);
        }
        self.gc
            .as_ref()
            .map(|g| &g.view)
            .ok_or_else(|| FfsError::NotFound("consistency scan is not running".to_owned()))
    }

    pub(crate) fn device(&self, dev: DeviceIndex) -> std::result::Result<&DeviceConfig, MarkError> {
        self.devices
            .get(dev_slot(dev))
            .ok_or(MarkError::NoDevice(dev))
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.devices.iter().map(DeviceConfig::capacity_sectors).sum()
    }

    pub(crate) fn gc_visited(&self, pos: Pos) -> bool {
        self.gc.as_ref().is_some_and(|g| pos <= *g.pos.lock())
    }
}

#[derive(Debug, Default)]
struct Health {
    needs_fsck: AtomicBool,
    read_only: AtomicBool,
    inconsistencies: AtomicU64,
}

// ── Context ─────────────────────────────────────────────────────────────────

/// The accounting context.
pub struct BucketFs {
    options: AccountingOptions,
    nr_workers: usize,
    journal: Arc<dyn JournalSeqSource>,
    stripe_heap: Arc<dyn StripeHeap>,
    waker: Arc<dyn AllocatorWaker>,
    mark_lock: RwLock<MarkState>,
    /// Global pool reservations are pulled from.
    sectors_available: AtomicU64,
    /// Shared by fast-path grants until their sectors are charged,
    /// exclusive while the pool is recalculated.
    sectors_available_lock: RwLock<()>,
    /// Per-worker reservation caches.
    reserve_cache: Box<[AtomicU64]>,
    last_bucket_seq_cleanup: AtomicU64,
    warned_disk_usage: AtomicBool,
    health: Health,
}

impl fmt::Debug for BucketFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketFs")
            .field("options", &self.options)
            .field("nr_workers", &self.nr_workers)
            .field(
                "sectors_available",
                &self.sectors_available.load(Ordering::Relaxed),
            )
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

impl BucketFs {
    /// Empty context: no devices, no replicas configurations.
    #[must_use]
    pub fn new(options: AccountingOptions, journal: Arc<dyn JournalSeqSource>) -> Self {
        let nr_workers = resolve_workers(options.workers);
        Self {
            nr_workers,
            journal,
            stripe_heap: Arc::new(NullStripeHeap),
            waker: Arc::new(NullWaker),
            mark_lock: RwLock::new(MarkState {
                devices: Vec::new(),
                replicas: ReplicasRegistry::new(),
                live: View::new(0, nr_workers),
                gc: None,
            }),
            sectors_available: AtomicU64::new(0),
            sectors_available_lock: RwLock::new(()),
            reserve_cache: (0..nr_workers).map(|_| AtomicU64::new(0)).collect(),
            last_bucket_seq_cleanup: AtomicU64::new(0),
            warned_disk_usage: AtomicBool::new(false),
            health: Health::default(),
            options,
        }
    }

    #[must_use]
    pub fn with_stripe_heap(mut self, heap: Arc<dyn StripeHeap>) -> Self {
        self.stripe_heap = heap;
        self
    }

    #[must_use]
    pub fn with_allocator_waker(mut self, waker: Arc<dyn AllocatorWaker>) -> Self {
        self.waker = waker;
        self
    }

    /// Fold usage buffers whenever `journal` finishes writing an entry.
    pub fn subscribe_to(self: &Arc<Self>, journal: &MemJournal) {
        let hook: Weak<dyn JournalBufHook> = Arc::downgrade(self) as Weak<dyn JournalBufHook>;
        journal.subscribe(hook);
    }

    #[must_use]
    pub fn options(&self) -> &AccountingOptions {
        &self.options
    }

    #[must_use]
    pub fn journal(&self) -> &Arc<dyn JournalSeqSource> {
        &self.journal
    }

    // ── Devices and replicas ────────────────────────────────────────────────

    /// Add a member device with zeroed marks.
    pub fn add_device(&self, config: DeviceConfig) -> Result<DeviceIndex> {
        config.validate()?;
        let mut state = self.mark_lock.write();
        let dev = DeviceIndex(u32::try_from(state.devices.len()).map_err(|_| {
            FfsError::InvalidGeometry("too many member devices".to_owned())
        })?);

        state.live.push_device(
            BucketArray::new(config.nbuckets, config.first_bucket),
            self.nr_workers,
        );
        if let Some(gc) = state.gc.as_mut() {
            gc.view.push_device(
                BucketArray::new(config.nbuckets, config.first_bucket),
                self.nr_workers,
            );
        }
        info!(
            target: "ffs::buckets",
            event = "device_add",
            dev = dev.0,
            bucket_size = config.bucket_size,
            nbuckets = config.nbuckets,
            first_bucket = config.first_bucket
        );
        state.devices.push(config);
        Ok(dev)
    }

    /// Grow or shrink `dev`'s bucket array, preserving existing marks.
    /// Buckets cut off by a shrink must be free.
    pub fn resize_device(&self, dev: DeviceIndex, nbuckets: u64) -> Result<()> {
        let mut state = self.mark_lock.write();
        let config = state
            .device(dev)
            .map_err(|e| FfsError::NotFound(e.to_string()))?
            .clone();
        if nbuckets <= config.first_bucket {
            return Err(FfsError::InvalidGeometry(format!(
                "nbuckets {nbuckets} <= first_bucket {}",
                config.first_bucket
            )));
        }
        if config.journal_buckets.iter().any(|b| *b >= nbuckets) {
            return Err(FfsError::InvalidGeometry(format!(
                "resize to {nbuckets} buckets drops journal buckets"
            )));
        }
        let slot = dev_slot(dev);
        if let Some((b, _)) = state.live.buckets[slot]
            .iter()
            .skip(usize::try_from(nbuckets).unwrap_or(usize::MAX))
            .find(|(_, bucket)| {
                let m = bucket.mark();
                !m.is_available() || m.cached_sectors != 0
            })
        {
            return Err(FfsError::InvalidGeometry(format!(
                "bucket {dev}:{b} still in use"
            )));
        }

        let next = state.live.buckets[slot].resized(nbuckets);
        state.live.buckets[slot] = next;
        if let Some(gc) = state.gc.as_mut() {
            let next = gc.view.buckets[slot].resized(nbuckets);
            gc.view.buckets[slot] = next;
        }
        state.devices[slot].nbuckets = nbuckets;
        debug!(
            target: "ffs::buckets",
            event = "device_resize",
            dev = dev.0,
            from = config.nbuckets,
            to = nbuckets
        );
        Ok(())
    }

    /// Register a replicas configuration, growing the usage layout when it
    /// is new. Returns its slot.
    pub fn register_replicas(&self, entry: ReplicasEntry) -> usize {
        if let Some(idx) = self.mark_lock.read().replicas.entry_index(&entry) {
            return idx;
        }
        let mut state = self.mark_lock.write();
        let (idx, new) = state.replicas.register(entry);
        if new {
            let width = fs_usage_width(state.replicas.len());
            state.live.fs_usage.resize(width);
            if let Some(gc) = state.gc.as_mut() {
                gc.view.fs_usage.resize(width);
            }
        }
        idx
    }

    /// Register every configuration marking `key` would charge.
    pub fn register_key_replicas(&self, key: &Key) -> Vec<usize> {
        let entries = self.key_replicas(key);
        entries
            .into_iter()
            .map(|e| self.register_replicas(e))
            .collect()
    }

    fn key_replicas(&self, key: &Key) -> Vec<ReplicasEntry> {
        if let Some(stripe) = key.as_stripe() {
            return vec![stripe.replicas_entry()];
        }
        let data_type = match key.kind() {
            KeyKind::BtreePtr => ffs_types::DataType::Btree,
            KeyKind::Extent | KeyKind::ReflinkV => ffs_types::DataType::User,
            _ => return Vec::new(),
        };

        let state = self.mark_lock.read();
        let stripes = state.live.stripes.lock();
        let mut out = Vec::new();
        let mut dirty = ReplicasEntry::empty(data_type);
        for p in key.ptrs() {
            if p.ptr.cached {
                out.push(ReplicasEntry::cached(p.ptr.dev));
            } else if let Some(ec) = p.ec {
                dirty.nr_required = 0;
                if let Some(s) = stripes.get(&ec.idx) {
                    let mut r = s.replicas.clone();
                    r.data_type = data_type;
                    out.push(r);
                }
            } else {
                dirty.push_dev(p.ptr.dev);
            }
        }
        if dirty.nr_devs() > 0 {
            out.push(dirty);
        }
        out
    }

    // ── Health ──────────────────────────────────────────────────────────────

    /// Route an inconsistency through the configured policy.
    pub(crate) fn inconsistent(&self, err: impl fmt::Display) -> FfsError {
        let detail = err.to_string();
        self.health.inconsistencies.fetch_add(1, Ordering::Relaxed);
        self.health.needs_fsck.store(true, Ordering::Release);
        let policy = self.options.inconsistency_policy;
        error!(
            target: "ffs::buckets",
            event = "inconsistency",
            policy = ?policy,
            detail = %detail
        );
        match policy {
            InconsistencyPolicy::Continue => {}
            InconsistencyPolicy::ReadOnly => {
                if !self.health.read_only.swap(true, Ordering::AcqRel) {
                    warn!(target: "ffs::buckets", event = "read_only_latched");
                }
            }
            InconsistencyPolicy::Panic => panic!("filesystem inconsistency: {detail}"),
        }
        FfsError::Inconsistency(detail)
    }

    #[must_use]
    pub fn inconsistency_count(&self) -> u64 {
        self.health.inconsistencies.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn needs_fsck(&self) -> bool {
        self.health.needs_fsck.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.health.read_only.load(Ordering::Acquire)
    }

    /// Usable sectors across every member device.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.mark_lock.read().capacity()
    }

    // ── Inspection ──────────────────────────────────────────────────────────

    /// Current live mark of one bucket.
    pub fn bucket_mark(&self, dev: DeviceIndex, bucket: BucketNumber) -> Result<ffs_alloc::BucketMark> {
        let state = self.mark_lock.read();
        let array = state
            .live
            .bucket_array(dev, bucket)
            .map_err(|e| FfsError::NotFound(e.to_string()))?;
        array
            .get(bucket)
            .map(ffs_alloc::Bucket::mark)
            .ok_or_else(|| FfsError::NotFound(format!("bucket {dev}:{bucket}")))
    }

    /// Current live auxiliary state of one bucket.
    pub fn bucket_aux(&self, dev: DeviceIndex, bucket: BucketNumber) -> Result<ffs_alloc::BucketAux> {
        let state = self.mark_lock.read();
        let array = state
            .live
            .bucket_array(dev, bucket)
            .map_err(|e| FfsError::NotFound(e.to_string()))?;
        array
            .get(bucket)
            .map(ffs_alloc::Bucket::aux)
            .ok_or_else(|| FfsError::NotFound(format!("bucket {dev}:{bucket}")))
    }

    /// Live in-memory state of stripe `idx`.
    #[must_use]
    pub fn stripe_state(&self, idx: ffs_types::StripeId) -> Option<StripeState> {
        self.mark_lock.read().live.stripes.lock().get(&idx).cloned()
    }

    // ── Journal sequence tags ───────────────────────────────────────────────

    /// Drop journal-sequence tags that are already durable, so the 16-bit
    /// truncated tags never wrap. Runs only once the journal has advanced by
    /// `1 << 14` entries since the previous pass; returns whether it ran.
    pub fn bucket_seq_cleanup(&self) -> bool {
        let journal_seq = self.journal.cur_seq().0;
        let last = self.last_bucket_seq_cleanup.load(Ordering::Acquire);
        if journal_seq.saturating_sub(last) < 1 << 14 {
            return false;
        }
        self.last_bucket_seq_cleanup
            .store(journal_seq, Ordering::Release);

        let ondisk = self.journal.last_seq_ondisk().truncated();
        let state = self.mark_lock.read();
        let mut cleared = 0_u64;
        for array in &state.live.buckets {
            for (b, bucket) in array.iter() {
                let m = bucket.mark();
                if !m.journal_seq_valid || m.needs_journal_commit(ondisk) {
                    continue;
                }
                let result = array.try_update::<std::convert::Infallible, _>(
                    b,
                    ffs_alloc::UpdateMode::Atomic,
                    |m| {
                        if !m.journal_seq_valid || m.needs_journal_commit(ondisk) {
                            return Ok(false);
                        }
                        m.journal_seq_valid = false;
                        Ok(true)
                    },
                );
                if matches!(result, Ok(Some(_))) {
                    cleared += 1;
                }
            }
        }
        debug!(
            target: "ffs::buckets",
            event = "bucket_seq_cleanup",
            journal_seq,
            ondisk,
            cleared
        );
        true
    }

    /// The bucket's state was tagged with a journal entry that has not
    /// reached disk yet.
    pub fn bucket_needs_journal_commit(&self, dev: DeviceIndex, bucket: BucketNumber) -> Result<bool> {
        let mark = self.bucket_mark(dev, bucket)?;
        Ok(mark.needs_journal_commit(self.journal.last_seq_ondisk().truncated()))
    }

    /// Sequence new immediate updates are charged to.
    #[must_use]
    pub fn cur_seq(&self) -> JournalSeq {
        self.journal.cur_seq()
    }
}

impl JournalBufHook for BucketFs {
    fn buf_written(&self, seq: JournalSeq) {
        let state = self.mark_lock.read();
        let idx = seq.buf_index();
        state.live.fs_usage.fold_worker_into_base(idx);
        for dev in &state.live.dev_usage {
            dev.fold_worker_into_base(idx);
        }
        if let Some(gc) = &state.gc {
            gc.view.fs_usage.fold_worker_into_base(idx);
            for dev in &gc.view.dev_usage {
                dev.fold_worker_into_base(idx);
            }
        }
    }
}
