//! Sharded per-worker counters with a sequence-counter guarded base.
//!
//! Writers only ever touch the shard owned by their worker slot in the
//! rotation buffer picked by the journal sequence. Readers sum the base and
//! every shard of every buffer; a fold that moves a buffer into the base
//! bumps the sequence counter so a concurrent reader retries instead of
//! counting the moved value twice or not at all.

use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering, fence};
use tracing::{debug, trace};

use ffs_types::{JOURNAL_BUF_NR, JournalSeq};

/// Maps a typed counter onto its slot in a flat counter vector.
pub trait CounterLayout: Copy {
    fn index(self) -> usize;
}

/// Anything that can absorb signed counter deltas.
pub trait UsageAcc<C: CounterLayout> {
    fn add(&mut self, counter: C, delta: i64);
}

// ── Worker slot assignment ─────────────────────────────────────────────────

static NEXT_WORKER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static WORKER_SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Stable small integer for the calling thread, assigned on first use.
#[must_use]
pub fn current_worker() -> usize {
    WORKER_SLOT.with(|slot| {
        if let Some(id) = slot.get() {
            id
        } else {
            let id = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(id));
            id
        }
    })
}

/// Resolved shard count: `0` means one per available CPU, capped at 16.
#[must_use]
pub fn resolve_workers(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism().map_or(4, |n| n.get().min(16))
    } else {
        configured
    }
}

// ── Sequence counter ───────────────────────────────────────────────────────

/// Reader-retry sequence counter. Odd values mean a fold is in progress.
#[derive(Debug, Default)]
pub struct SeqCount {
    seq: AtomicU64,
    writer: Mutex<()>,
}

pub struct SeqWriteGuard<'a> {
    seq: &'a AtomicU64,
    _lock: MutexGuard<'a, ()>,
}

impl Drop for SeqWriteGuard<'_> {
    fn drop(&mut self) {
        self.seq.fetch_add(1, Ordering::Release);
    }
}

impl SeqCount {
    #[must_use]
    pub fn read_begin(&self) -> u64 {
        loop {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            std::hint::spin_loop();
        }
    }

    #[must_use]
    pub fn read_retry(&self, start: u64) -> bool {
        fence(Ordering::Acquire);
        self.seq.load(Ordering::Relaxed) != start
    }

    /// Enter the write side. Writers are serialized with each other; readers
    /// spin until the guard drops.
    pub fn write(&self) -> SeqWriteGuard<'_> {
        let lock = self.writer.lock();
        self.seq.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);
        SeqWriteGuard {
            seq: &self.seq,
            _lock: lock,
        }
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

// ── Sharded counters ───────────────────────────────────────────────────────

#[derive(Debug)]
struct ShardedCounters {
    shards: Box<[Box<[AtomicI64]>]>,
}

fn zeroed(width: usize) -> Box<[AtomicI64]> {
    (0..width).map(|_| AtomicI64::new(0)).collect()
}

impl ShardedCounters {
    fn new(nr_shards: usize, width: usize) -> Self {
        Self {
            shards: (0..nr_shards.max(1)).map(|_| zeroed(width)).collect(),
        }
    }

    fn shard(&self, worker: usize) -> &[AtomicI64] {
        &self.shards[worker % self.shards.len()]
    }

    fn sum_into(&self, out: &mut [i64]) {
        for shard in &*self.shards {
            for (dst, v) in out.iter_mut().zip(shard.iter()) {
                *dst += v.load(Ordering::Relaxed);
            }
        }
    }

    fn sum_one(&self, idx: usize) -> i64 {
        self.shards
            .iter()
            .map(|s| s.get(idx).map_or(0, |v| v.load(Ordering::Relaxed)))
            .sum()
    }

    fn drain_into(&self, out: &[AtomicI64]) {
        for shard in &*self.shards {
            for (dst, v) in out.iter().zip(shard.iter()) {
                let moved = v.swap(0, Ordering::AcqRel);
                if moved != 0 {
                    dst.fetch_add(moved, Ordering::Relaxed);
                }
            }
        }
    }

    fn clear(&self) {
        for shard in &*self.shards {
            for v in shard.iter() {
                v.store(0, Ordering::Relaxed);
            }
        }
    }
}

// ── Accumulator ────────────────────────────────────────────────────────────

/// Base totals plus one sharded delta set per journal buffer.
#[derive(Debug)]
pub struct UsageAccumulator<C> {
    width: usize,
    nr_shards: usize,
    base: Box<[AtomicI64]>,
    bufs: Box<[ShardedCounters]>,
    seq: SeqCount,
    _layout: PhantomData<fn(C)>,
}

/// Write handle bound to one worker shard of one rotation buffer.
pub struct WorkerHandle<'a, C> {
    shard: &'a [AtomicI64],
    _layout: PhantomData<fn(C)>,
}

impl<C: CounterLayout> UsageAcc<C> for WorkerHandle<'_, C> {
    fn add(&mut self, counter: C, delta: i64) {
        if delta == 0 {
            return;
        }
        if let Some(slot) = self.shard.get(counter.index()) {
            slot.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

impl<C: CounterLayout> UsageAccumulator<C> {
    #[must_use]
    pub fn new(width: usize, nr_shards: usize) -> Self {
        let nr_shards = nr_shards.max(1);
        Self {
            width,
            nr_shards,
            base: zeroed(width),
            bufs: (0..JOURNAL_BUF_NR)
                .map(|_| ShardedCounters::new(nr_shards, width))
                .collect(),
            seq: SeqCount::default(),
            _layout: PhantomData,
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Handle for the calling worker in the buffer selected by `seq`.
    #[must_use]
    pub fn handle(&self, seq: JournalSeq) -> WorkerHandle<'_, C> {
        WorkerHandle {
            shard: self.bufs[seq.buf_index()].shard(current_worker()),
            _layout: PhantomData,
        }
    }

    pub fn add(&self, seq: JournalSeq, counter: C, delta: i64) {
        self.handle(seq).add(counter, delta);
    }

    /// Consistent aggregate of base and every worker shard.
    #[must_use]
    pub fn snapshot(&self) -> Vec<i64> {
        let mut out = vec![0_i64; self.width];
        let mut retries = 0_u32;
        loop {
            let start = self.seq.read_begin();
            for (dst, v) in out.iter_mut().zip(self.base.iter()) {
                *dst = v.load(Ordering::Relaxed);
            }
            for buf in &*self.bufs {
                buf.sum_into(&mut out);
            }
            if !self.seq.read_retry(start) {
                break;
            }
            retries += 1;
        }
        if retries > 0 {
            trace!(target: "ffs::usage", event = "snapshot_retry", retries);
        }
        out
    }

    /// Consistent read of a single counter.
    #[must_use]
    pub fn read_one(&self, counter: C) -> i64 {
        let idx = counter.index();
        loop {
            let start = self.seq.read_begin();
            let mut total = self.base.get(idx).map_or(0, |v| v.load(Ordering::Relaxed));
            for buf in &*self.bufs {
                total += buf.sum_one(idx);
            }
            if !self.seq.read_retry(start) {
                return total;
            }
        }
    }

    /// Drain rotation buffer `idx` into the base.
    ///
    /// # Panics
    ///
    /// Panics if `idx >= JOURNAL_BUF_NR`.
    pub fn fold_worker_into_base(&self, idx: usize) {
        assert!(idx < JOURNAL_BUF_NR, "rotation buffer {idx} out of range");
        let _guard = self.seq.write();
        self.bufs[idx].drain_into(&self.base);
        debug!(target: "ffs::usage", event = "usage_fold", buf = idx, seq = self.seq.current());
    }

    pub fn fold_all(&self) {
        for idx in 0..JOURNAL_BUF_NR {
            self.fold_worker_into_base(idx);
        }
    }

    /// Adjust a base total directly, under the sequence counter.
    pub fn add_to_base(&self, counter: C, delta: i64) {
        let _guard = self.seq.write();
        if let Some(v) = self.base.get(counter.index()) {
            v.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Replace every total with `totals` (a flat snapshot of the same
    /// layout), discarding in-flight worker deltas.
    pub fn replace_with(&self, totals: &[i64]) {
        let _guard = self.seq.write();
        for buf in &*self.bufs {
            buf.clear();
        }
        for (dst, v) in self.base.iter().zip(totals.iter().chain(std::iter::repeat(&0))) {
            dst.store(*v, Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.replace_with(&[]);
    }

    /// Grow or shrink the counter vector, preserving folded totals.
    ///
    /// Requires exclusive access, so no writer can hold a handle.
    pub fn resize(&mut self, width: usize) {
        let totals = self.snapshot();
        let next = Self::new(width, self.nr_shards);
        for (dst, v) in next.base.iter().zip(totals.iter()) {
            dst.store(*v, Ordering::Relaxed);
        }
        *self = next;
    }
}
