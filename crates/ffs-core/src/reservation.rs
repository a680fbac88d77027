//! Disk reservations.
//!
//! Space is handed out from a global pool of available sectors through a
//! per-worker cache, so the common case touches one worker-local counter.
//! When the pool cannot cover a request it is recomputed from current usage
//! with `sectors_available_lock` held exclusively; caches are emptied at the
//! same time. Fast-path grants hold the lock shared until their sectors are
//! charged, so a recalculation never sees sectors that left the pool but
//! are not yet counted as used.
//! Granted sectors are charged to `OnlineReserved` until a commit converts
//! them into real usage or the reservation is put back.

use crate::{BucketFs, MarkState};
use ffs_error::{FfsError, Result};
use ffs_types::JournalSeq;
use ffs_usage::{FsCounter, FsUsageDelta, UsageAcc, avail_factor, current_worker};
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};

/// Sectors held against future writes.
///
/// Must be returned with [`BucketFs::disk_reservation_put`] or consumed by a
/// commit; dropping a non-empty reservation leaks `OnlineReserved` usage.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DiskReservation {
    sectors: u64,
}

impl DiskReservation {
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.sectors
    }
}

impl BucketFs {
    /// Sectors left in the global pool, excluding worker caches.
    #[must_use]
    pub fn sectors_available(&self) -> u64 {
        self.sectors_available.load(Ordering::Acquire)
    }

    /// Reserve `sectors` more into `res`. With `nofail` the reservation is
    /// granted even when free space does not cover it.
    pub fn disk_reservation_add(
        &self,
        res: &mut DiskReservation,
        sectors: u64,
        nofail: bool,
    ) -> Result<()> {
        if self.is_read_only() {
            return Err(FfsError::ReadOnly);
        }
        if sectors == 0 {
            return Ok(());
        }
        let taken = {
            let _shared = self.sectors_available_lock.read();
            let taken = self.take_fast(sectors);
            if taken {
                self.add_online_reserved(to_i64(sectors));
            }
            taken
        };
        if !taken {
            let _exclusive = self.sectors_available_lock.write();
            self.recalc_and_take(sectors, nofail)?;
            self.add_online_reserved(to_i64(sectors));
        }
        res.sectors += sectors;
        Ok(())
    }

    fn add_online_reserved(&self, sectors: i64) {
        let state = self.mark_lock.read();
        state.live.fs_usage.add(
            self.journal.cur_seq(),
            FsCounter::OnlineReserved,
            sectors,
        );
    }

    /// New reservation of `sectors`.
    pub fn reserve(&self, sectors: u64, nofail: bool) -> Result<DiskReservation> {
        let mut res = DiskReservation::default();
        self.disk_reservation_add(&mut res, sectors, nofail)?;
        Ok(res)
    }

    /// Return whatever `res` still holds.
    pub fn disk_reservation_put(&self, res: &mut DiskReservation) {
        if res.sectors == 0 {
            return;
        }
        let state = self.mark_lock.read();
        state.live.fs_usage.add(
            self.journal.cur_seq(),
            FsCounter::OnlineReserved,
            -to_i64(res.sectors),
        );
        res.sectors = 0;
    }

    /// Worker cache first, then a batch from the global pool.
    fn take_fast(&self, sectors: u64) -> bool {
        let cache = &self.reserve_cache[current_worker() % self.reserve_cache.len()];
        if cache
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(sectors))
            .is_ok()
        {
            trace!(target: "ffs::reserve", event = "reserve_cached", sectors);
            return true;
        }

        let batch = self.options.reservation_cache_sectors;
        let mut old = self.sectors_available.load(Ordering::Acquire);
        loop {
            let get = sectors.saturating_add(batch).min(old);
            if get < sectors {
                return false;
            }
            match self.sectors_available.compare_exchange_weak(
                old,
                old - get,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    cache.fetch_add(get - sectors, Ordering::AcqRel);
                    trace!(target: "ffs::reserve", event = "reserve_refill", sectors, batch = get);
                    return true;
                }
                Err(current) => old = current,
            }
        }
    }

    /// Rebuild the pool from current usage and take `sectors` from it.
    /// The caller holds `sectors_available_lock` exclusively.
    fn recalc_and_take(&self, sectors: u64, nofail: bool) -> Result<()> {
        for cache in &*self.reserve_cache {
            cache.store(0, Ordering::Release);
        }
        let free = self.usage_read_short().free;
        let avail = avail_factor(free);
        let granted = sectors <= avail || nofail;
        let pool = if granted {
            avail.saturating_sub(sectors)
        } else {
            avail
        };
        self.sectors_available.store(pool, Ordering::Release);
        debug!(
            target: "ffs::reserve",
            event = "reserve_recalc",
            sectors,
            free,
            avail,
            nofail,
            granted
        );
        if granted { Ok(()) } else { Err(FfsError::NoSpace) }
    }

    /// Fold a commit's usage delta into live usage at `journal_seq`,
    /// drawing the sectors it adds from `disk_res`. Returns whether the
    /// commit added more than it had reserved.
    pub fn fs_usage_apply(
        &self,
        delta: FsUsageDelta,
        disk_res: Option<&mut DiskReservation>,
        journal_seq: JournalSeq,
    ) -> bool {
        let state = self.mark_lock.read();
        self.fs_usage_apply_locked(&state, delta, disk_res, journal_seq)
    }

    pub(crate) fn fs_usage_apply_locked(
        &self,
        state: &MarkState,
        mut delta: FsUsageDelta,
        disk_res: Option<&mut DiskReservation>,
        journal_seq: JournalSeq,
    ) -> bool {
        let held = disk_res.as_ref().map_or(0, |r| r.sectors);
        let mut added = delta.get(FsCounter::Data) + delta.get(FsCounter::Reserved);
        let over = added - to_i64(held);
        let overran = over > 0;

        if overran {
            // Not covered by the reservation: take it from the pool directly.
            let _ = self.sectors_available.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |v| Some(v.saturating_sub(over.unsigned_abs())),
            );
            added -= over;
            if !self.warned_disk_usage.swap(true, Ordering::AcqRel) {
                warn!(
                    target: "ffs::reserve",
                    event = "usage_exceeds_reservation",
                    over,
                    held
                );
            }
        }

        if added > 0 {
            if let Some(res) = disk_res {
                res.sectors -= added.unsigned_abs();
            }
            delta.add(FsCounter::OnlineReserved, -added);
        }

        delta.fold_into(&mut state.live.fs_usage.handle(journal_seq));
        overran
    }
}

fn to_i64(sectors: u64) -> i64 {
    i64::try_from(sectors).unwrap_or(i64::MAX)
}
