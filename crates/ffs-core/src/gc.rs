//! Consistency scan.
//!
//! [`BucketFs::gc_start`] creates a shadow view holding only bucket
//! generations and allocator ownership. The scan then marks every stored
//! entry into it with [`TriggerFlags::GC`], advancing its position as it
//! goes; live updates at positions the scan has already passed are marked
//! into both views. [`BucketFs::gc_finish`] compares the shadow view with
//! the live one under the exclusive mark lock, repairs every difference in
//! the live view, and drops the shadow.

use crate::keys::{Key, TriggerFlags};
use crate::mark::Trigger;
use crate::{BucketFs, GcState, MarkState, View};
use ffs_alloc::{BucketAux, BucketMark, UpdateMode};
use ffs_error::{FfsError, Result};
use ffs_types::{JournalSeq, Pos};
use ffs_usage::{CounterLayout, FsCounter, FsUsageDelta, apply_delta};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// What reconciliation found and repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub buckets_checked: u64,
    pub bucket_mismatches: u64,
    /// Filesystem counters that differed, online reservations excluded.
    pub fs_counter_mismatches: u64,
    pub dev_counter_mismatches: u64,
    pub stripe_mismatches: u64,
}

impl GcReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.bucket_mismatches == 0
            && self.fs_counter_mismatches == 0
            && self.dev_counter_mismatches == 0
            && self.stripe_mismatches == 0
    }
}

/// Fields the scan rebuilds; the rest of the mark stays live-owned.
fn scanned_fields_differ(live: BucketMark, scanned: BucketMark) -> bool {
    live.generation != scanned.generation
        || live.data_type != scanned.data_type
        || live.dirty_sectors != scanned.dirty_sectors
        || live.cached_sectors != scanned.cached_sectors
        || live.stripe != scanned.stripe
}

impl BucketFs {
    /// Start a scan.
    ///
    /// # Panics
    ///
    /// Panics if a scan is already running.
    pub fn gc_start(&self) {
        let mut state = self.mark_lock.write();
        assert!(state.gc.is_none(), "consistency scan already running");

        let mut view = View::new(state.replicas.len(), self.nr_workers);
        let mut scratch = FsUsageDelta::new(0);
        for (slot, config) in state.devices.iter().enumerate() {
            let live = &state.live.buckets[slot];
            view.push_device(
                ffs_alloc::BucketArray::new(live.nbuckets(), config.first_bucket),
                self.nr_workers,
            );
            let shadow = &view.buckets[slot];
            let mut usage = view.dev_usage[slot].handle(JournalSeq::ZERO);
            for (b, cell) in live.iter() {
                let m = cell.mark();
                let aux = cell.aux();
                let (old, new) = shadow.update(b, UpdateMode::NoAtomic, |s| {
                    s.generation = m.generation;
                    s.owned_by_allocator = m.owned_by_allocator;
                });
                if let Some(target) = shadow.get(b) {
                    target.set_aux(BucketAux {
                        oldest_gen: aux.oldest_gen,
                        gen_valid: aux.gen_valid,
                        ..BucketAux::default()
                    });
                }
                apply_delta(old, new, config.bucket_size, &mut scratch, &mut usage);
            }
        }

        state.gc = Some(GcState {
            view,
            pos: Mutex::new(Pos::MIN),
            failed: AtomicBool::new(false),
        });
        info!(
            target: "ffs::gc",
            event = "gc_start",
            devices = state.devices.len(),
            replicas = state.replicas.len()
        );
    }

    /// Record scan progress: live updates at or below `pos` are mirrored
    /// into the shadow view from now on.
    pub fn set_gc_pos(&self, pos: Pos) {
        if let Some(gc) = &self.mark_lock.read().gc {
            *gc.pos.lock() = pos;
        }
    }

    /// Position the running scan has reached.
    #[must_use]
    pub fn gc_pos(&self) -> Option<Pos> {
        self.mark_lock.read().gc.as_ref().map(|g| *g.pos.lock())
    }

    /// The scan has already passed `pos`.
    #[must_use]
    pub fn gc_visited(&self, pos: Pos) -> bool {
        self.mark_lock.read().gc_visited(pos)
    }

    /// Mark one stored entry into the shadow view and advance the scan
    /// position to it.
    pub fn gc_mark_key(&self, key: &Key) -> Result<()> {
        self.mark_entry(
            // Live calls behind the scan update the shadow view concurrently.
            Trigger::insert(key, TriggerFlags::GC),
            None,
            JournalSeq::ZERO,
        )?;
        self.set_gc_pos(key.pos);
        Ok(())
    }

    /// Drop the shadow view without reconciling.
    pub fn gc_abort(&self) {
        if self.mark_lock.write().gc.take().is_some() {
            info!(target: "ffs::gc", event = "gc_abort");
        }
    }

    /// Reconcile the shadow view into the live one and end the scan.
    ///
    /// Fails without touching the live view if no scan is running or a
    /// scan-mode marking failed.
    pub fn gc_finish(&self) -> Result<GcReport> {
        let mut state = self.mark_lock.write();
        let Some(gc) = state.gc.take() else {
            return Err(FfsError::NotFound(
                "consistency scan is not running".to_owned(),
            ));
        };
        if gc.failed.load(Ordering::Acquire) {
            warn!(target: "ffs::gc", event = "gc_discarded");
            return Err(FfsError::Inconsistency(
                "consistency scan failed; shadow view discarded".to_owned(),
            ));
        }

        let mut report = GcReport::default();
        reconcile_buckets(&state, &gc.view, &mut report);
        reconcile_dev_usage(&state, &gc.view, &mut report);
        reconcile_fs_usage(&state.live, &gc.view, &mut report);
        self.reconcile_stripes(&state.live, &gc.view, &mut report);

        info!(
            target: "ffs::gc",
            event = "gc_finish",
            buckets_checked = report.buckets_checked,
            bucket_mismatches = report.bucket_mismatches,
            fs_counter_mismatches = report.fs_counter_mismatches,
            dev_counter_mismatches = report.dev_counter_mismatches,
            stripe_mismatches = report.stripe_mismatches
        );
        Ok(report)
    }

    fn reconcile_stripes(&self, live: &View, scanned: &View, report: &mut GcReport) {
        let mut live_stripes = live.stripes.lock();
        let scanned_stripes = scanned.stripes.lock();

        for (idx, want) in scanned_stripes.iter() {
            if live_stripes.get(idx) == Some(want) {
                continue;
            }
            report.stripe_mismatches += 1;
            warn!(
                target: "ffs::gc",
                event = "stripe_mismatch",
                stripe = idx.0,
                have = ?live_stripes.get(idx).map(|s| &s.block_sectors),
                want = ?want.block_sectors
            );
            live_stripes.insert(*idx, want.clone());
            self.stripe_heap.update(*idx, want.blocks_nonempty);
        }

        let stale: Vec<_> = live_stripes
            .keys()
            .filter(|idx| !scanned_stripes.contains_key(idx))
            .copied()
            .collect();
        for idx in stale {
            report.stripe_mismatches += 1;
            warn!(target: "ffs::gc", event = "stripe_unreferenced", stripe = idx.0);
            live_stripes.remove(&idx);
            self.stripe_heap.remove(idx);
        }
    }
}

fn reconcile_buckets(state: &MarkState, scanned: &View, report: &mut GcReport) {
    for (slot, shadow) in scanned.buckets.iter().enumerate() {
        let Some(live) = state.live.buckets.get(slot) else {
            continue;
        };
        for (b, cell) in shadow.iter() {
            let Some(target) = live.get(b) else {
                continue;
            };
            report.buckets_checked += 1;
            let want = cell.mark();
            let have = target.mark();
            if scanned_fields_differ(have, want) {
                report.bucket_mismatches += 1;
                warn!(
                    target: "ffs::gc",
                    event = "bucket_mismatch",
                    dev = slot,
                    bucket = b.0,
                    have_gen = have.generation.0,
                    want_gen = want.generation.0,
                    have_type = %have.data_type,
                    want_type = %want.data_type,
                    have_dirty = have.dirty_sectors,
                    want_dirty = want.dirty_sectors,
                    have_cached = have.cached_sectors,
                    want_cached = want.cached_sectors
                );
                live.update(b, UpdateMode::NoAtomic, |m| {
                    m.generation = want.generation;
                    m.data_type = want.data_type;
                    m.dirty_sectors = want.dirty_sectors;
                    m.cached_sectors = want.cached_sectors;
                    m.stripe = want.stripe;
                });
            }
            let aux = cell.aux();
            target.set_stripe(aux.stripe, aux.stripe_redundancy);
        }
    }
}

fn reconcile_dev_usage(state: &MarkState, scanned: &View, report: &mut GcReport) {
    for (slot, shadow) in scanned.dev_usage.iter().enumerate() {
        let Some(live) = state.live.dev_usage.get(slot) else {
            continue;
        };
        let want = shadow.snapshot();
        let have = live.snapshot();
        let differing = count_differences(&have, &want, None);
        if differing > 0 {
            report.dev_counter_mismatches += differing;
            warn!(
                target: "ffs::gc",
                event = "dev_usage_mismatch",
                dev = slot,
                counters = differing
            );
        }
        live.replace_with(&want);
    }
}

fn reconcile_fs_usage(live: &View, scanned: &View, report: &mut GcReport) {
    let online = FsCounter::OnlineReserved.index();
    let mut want = scanned.fs_usage.snapshot();
    let have = live.fs_usage.snapshot();
    let differing = count_differences(&have, &want, Some(online));
    if differing > 0 {
        report.fs_counter_mismatches += differing;
        warn!(
            target: "ffs::gc",
            event = "fs_usage_mismatch",
            counters = differing
        );
    }
    // Reservations in flight are not visible to the scan.
    if let (Some(dst), Some(src)) = (want.get_mut(online), have.get(online)) {
        *dst = *src;
    }
    live.fs_usage.replace_with(&want);
}

fn count_differences(have: &[i64], want: &[i64], skip: Option<usize>) -> u64 {
    let len = have.len().max(want.len());
    let at = |v: &[i64], i: usize| v.get(i).copied().unwrap_or(0);
    let count = (0..len)
        .filter(|i| Some(*i) != skip && at(have, *i) != at(want, *i))
        .count();
    u64::try_from(count).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::keys::DecodedPtr;
    use crate::tests::context;
    use crate::InconsistencyPolicy;
    use ffs_types::{BucketGen, BucketNumber, DataType};
    use ffs_usage::ReplicasEntry;

    fn extent(dev: ffs_types::DeviceIndex, end: u64, bucket: u64, size: u32) -> Key {
        Key::extent(
            1,
            end,
            size,
            vec![DecodedPtr::new(dev, BucketNumber(bucket), BucketGen(0), size)],
        )
    }

    #[test]
    fn clean_scan_reports_nothing() {
        let fs = context(InconsistencyPolicy::Continue);
        let dev = fs.add_device(DeviceConfig::new(128, 8, 1)).expect("dev");
        fs.register_replicas(ReplicasEntry::new(DataType::User, 1, &[dev]));
        let keys = [extent(dev, 16, 2, 16), extent(dev, 48, 3, 32)];
        for k in &keys {
            fs.mark_key(k, fs.cur_seq(), TriggerFlags::NONE).expect("mark");
        }

        fs.gc_start();
        for k in &keys {
            fs.gc_mark_key(k).expect("scan");
        }
        assert_eq!(fs.gc_pos(), Some(keys[1].pos));
        let report = fs.gc_finish().expect("finish");
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.buckets_checked, 8);
        assert_eq!(fs.gc_pos(), None);
    }

    #[test]
    fn scan_repairs_a_drifted_bucket() {
        let fs = context(InconsistencyPolicy::Continue);
        let dev = fs.add_device(DeviceConfig::new(128, 8, 1)).expect("dev");
        fs.register_replicas(ReplicasEntry::new(DataType::User, 1, &[dev]));
        let stored = extent(dev, 16, 2, 16);
        // Live marks claim 40 sectors; the stored entries only hold 16.
        fs.mark_key(&extent(dev, 40, 2, 40), fs.cur_seq(), TriggerFlags::NONE)
            .expect("mark");

        fs.gc_start();
        fs.gc_mark_key(&stored).expect("scan");
        let report = fs.gc_finish().expect("finish");
        assert_eq!(report.bucket_mismatches, 1);
        assert!(report.fs_counter_mismatches > 0);
        assert!(report.dev_counter_mismatches > 0);

        assert_eq!(fs.bucket_mark(dev, BucketNumber(2)).expect("mark").dirty_sectors, 16);
        assert_eq!(fs.usage_snapshot().data, 16);
        let du = fs.device_usage_snapshot(dev).expect("usage");
        assert_eq!(du.of(DataType::User).sectors, 16);

        fs.gc_start();
        fs.gc_mark_key(&stored).expect("scan");
        assert!(fs.gc_finish().expect("finish").is_clean());
    }

    #[test]
    fn updates_behind_the_scan_reach_both_views() {
        let fs = context(InconsistencyPolicy::Continue);
        let dev = fs.add_device(DeviceConfig::new(128, 8, 1)).expect("dev");
        fs.register_replicas(ReplicasEntry::new(DataType::User, 1, &[dev]));
        let first = extent(dev, 16, 2, 16);
        fs.mark_key(&first, fs.cur_seq(), TriggerFlags::NONE).expect("mark");

        fs.gc_start();
        fs.gc_mark_key(&first).expect("scan");
        assert!(fs.gc_visited(Pos::new(1, 8)));
        assert!(!fs.gc_visited(Pos::new(1, 100)));
        fs.mark_alloc_bucket(dev, BucketNumber(5), true, Pos::new(1, 8), TriggerFlags::NONE)
            .expect("own");
        let report = fs.gc_finish().expect("finish");
        assert_eq!(report.dev_counter_mismatches, 0);
        assert!(fs.bucket_mark(dev, BucketNumber(5)).expect("mark").owned_by_allocator);
    }

    #[test]
    fn extent_writes_behind_the_scan_survive_reconciliation() {
        let fs = context(InconsistencyPolicy::Continue);
        let dev = fs.add_device(DeviceConfig::new(128, 16, 1)).expect("dev");
        fs.register_replicas(ReplicasEntry::new(DataType::User, 1, &[dev]));
        let first = extent(dev, 16, 2, 16);
        fs.mark_key(&first, fs.cur_seq(), TriggerFlags::NONE).expect("mark");

        fs.gc_start();
        fs.gc_mark_key(&first).expect("scan");
        let behind = Key::extent(
            0,
            8,
            8,
            vec![DecodedPtr::new(dev, BucketNumber(9), BucketGen(0), 8)],
        );
        assert!(fs.gc_visited(behind.pos));
        fs.mark_key(&behind, fs.cur_seq(), TriggerFlags::NONE).expect("write");
        fs.mark_update(&first, &Key::deleted(first.pos), None, fs.cur_seq(), TriggerFlags::NONE)
            .expect("delete");

        let report = fs.gc_finish().expect("finish");
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(fs.bucket_mark(dev, BucketNumber(9)).expect("mark").dirty_sectors, 8);
        assert_eq!(fs.bucket_mark(dev, BucketNumber(2)).expect("mark").dirty_sectors, 0);
        assert_eq!(fs.usage_snapshot().data, 8);
    }

    #[test]
    fn failed_scan_is_discarded() {
        let fs = context(InconsistencyPolicy::Continue);
        let dev = fs.add_device(DeviceConfig::new(128, 8, 1)).expect("dev");
        fs.gc_start();
        // No replicas configuration registered for this pointer.
        assert!(fs.gc_mark_key(&extent(dev, 16, 2, 16)).is_err());
        assert!(matches!(fs.gc_finish(), Err(FfsError::Inconsistency(_))));
        assert!(matches!(fs.gc_finish(), Err(FfsError::NotFound(_))));
        assert_eq!(fs.bucket_mark(dev, BucketNumber(2)).expect("mark").dirty_sectors, 0);
    }

    #[test]
    #[should_panic(expected = "already running")]
    fn nested_scan_is_a_defect() {
        let fs = context(InconsistencyPolicy::Continue);
        fs.gc_start();
        fs.gc_start();
    }
}
