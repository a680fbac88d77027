//! Immediate marking.
//!
//! Applies stored-entry changes straight to the bucket marks and usage of
//! one view. Every marking call stages its filesystem usage privately and
//! records an undo step for each mark it publishes; the usage is folded in
//! only once the whole call succeeded, and on failure the undo steps run in
//! reverse so no partial effect survives.
//!
//! Which view a call touches is decided by [`TriggerFlags::GC`]: without it
//! the live view, with it the consistency scan's shadow view. A live call
//! at a position the scan has already walked past marks both views, so
//! reconciliation does not drop it.

use crate::errors::{MarkError, parse_error_to_ffs};
use crate::keys::{
    DELETED_KEY, DecodedPtr, Key, KeyKind, KeyValue, StripePtr, StripeRecord, TriggerFlags,
    overwritten, ptr_disk_sectors_delta, reservation_replicas,
};
use crate::metadata::sb_layout_buckets;
use crate::stripe::StripeState;
use crate::{BucketFs, MarkState, View, dev_slot};
use ffs_alloc::{
    BucketAux, BucketMark, PtrRef, RefCheck, RefError, UpdateMode, check_bucket_ref,
    mark_pointer_sectors,
};
use ffs_error::{FfsError, Result};
use ffs_types::{BucketNumber, DataType, DeviceIndex, JournalSeq, Pos, StripeId, sectors_to_u16};
use ffs_usage::{
    FsCounter, FsUsageDelta, ReplicasEntry, UsageAcc, apply_delta, update_cached_sectors,
    update_replicas,
};
use std::cell::Cell;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace};

/// One marking call: both sides of the entry change, the affected range,
/// and the direction.
///
/// Extent-like keys take one direction per call; `sectors` is positive for
/// [`TriggerFlags::INSERT`] and negative for [`TriggerFlags::OVERWRITE`].
#[derive(Debug, Clone, Copy)]
pub struct Trigger<'a> {
    pub old: &'a Key,
    pub new: &'a Key,
    /// Offset of the affected range within the extent being marked.
    pub offset: u32,
    pub sectors: i64,
    pub flags: TriggerFlags,
}

impl<'a> Trigger<'a> {
    /// Insert of `new` over nothing, covering its whole size.
    #[must_use]
    pub fn insert(new: &'a Key, flags: TriggerFlags) -> Self {
        Self {
            old: &DELETED_KEY,
            new,
            offset: 0,
            sectors: i64::from(new.size),
            flags: flags.modifiers() | TriggerFlags::INSERT,
        }
    }

    /// Both sides of an update of a kind that reads old and new together.
    #[must_use]
    pub fn combined(old: &'a Key, new: &'a Key, flags: TriggerFlags) -> Self {
        Self {
            old,
            new,
            offset: 0,
            sectors: i64::from(new.size),
            flags: flags.modifiers() | TriggerFlags::INSERT | TriggerFlags::OVERWRITE,
        }
    }

    /// The key whose kind selects the marking routine.
    pub(crate) fn subject(&self) -> &'a Key {
        if self.flags.contains(TriggerFlags::INSERT) {
            self.new
        } else {
            self.old
        }
    }

    /// Inode count change: +1 for an inserted inode, -1 for an overwritten one.
    pub(crate) fn inode_delta(&self) -> i64 {
        i64::from(self.flags.contains(TriggerFlags::INSERT) && self.new.kind() == KeyKind::Inode)
            - i64::from(
                self.flags.contains(TriggerFlags::OVERWRITE) && self.old.kind() == KeyKind::Inode,
            )
    }
}

// ── Staging ─────────────────────────────────────────────────────────────────

/// Reversal of one published effect.
#[derive(Debug)]
enum Undo {
    Pointer {
        ptr: PtrRef,
        sectors: i64,
        data_type: DataType,
    },
    Bucket {
        dev: DeviceIndex,
        bucket: BucketNumber,
        mark: BucketMark,
        aux: BucketAux,
    },
    StripeBlock {
        ec: StripePtr,
        sectors: i64,
    },
    Stripe {
        idx: StripeId,
        prev: Option<StripeState>,
    },
}

/// Effects of one marking call that are not yet visible.
#[derive(Debug)]
pub(crate) struct Staged {
    pub(crate) usage: FsUsageDelta,
    undo: Vec<Undo>,
}

impl Staged {
    fn new(nr_replicas: usize) -> Self {
        Self {
            usage: FsUsageDelta::new(nr_replicas),
            undo: Vec::new(),
        }
    }
}

/// One marking call bound to its view.
pub(crate) struct Marker<'a> {
    fs: &'a BucketFs,
    state: &'a MarkState,
    view: &'a View,
    gc: bool,
    seq: JournalSeq,
    mode: UpdateMode,
}

impl BucketFs {
    fn marker<'a>(
        &'a self,
        state: &'a MarkState,
        flags: TriggerFlags,
        journal_seq: JournalSeq,
    ) -> Result<Marker<'a>> {
        let gc = flags.contains(TriggerFlags::GC);
        Ok(Marker {
            fs: self,
            state,
            view: state.view(gc)?,
            gc,
            seq: journal_seq,
            mode: if flags.contains(TriggerFlags::NOATOMIC) {
                UpdateMode::NoAtomic
            } else {
                UpdateMode::Atomic
            },
        })
    }

    /// Run `body` against the view `flags` selects. Staged usage goes to
    /// `usage_out` when given, otherwise into the view's accumulator at
    /// `journal_seq`. A failing body is unwound.
    pub(crate) fn run_marking<F>(
        &self,
        state: &MarkState,
        flags: TriggerFlags,
        journal_seq: JournalSeq,
        usage_out: Option<&mut FsUsageDelta>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&Marker<'_>, &mut Staged) -> Result<()>,
    {
        let marker = self.marker(state, flags, journal_seq)?;
        let mut staged = Staged::new(state.replicas.len());
        match body(&marker, &mut staged) {
            Ok(()) => {
                marker.publish(&staged, usage_out);
                Ok(())
            }
            Err(err) => {
                marker.unwind(staged);
                if let (true, Some(scan)) = (marker.gc, &state.gc) {
                    scan.failed.store(true, Ordering::Release);
                }
                Err(err)
            }
        }
    }

    /// Like [`BucketFs::run_marking`] for a live call at `pos`, but once
    /// the scan has passed `pos` the body also runs against the shadow
    /// view. Nothing is published unless both runs succeed; the shadow's
    /// usage always goes to its own accumulator.
    pub(crate) fn run_marking_at<F>(
        &self,
        state: &MarkState,
        pos: Pos,
        flags: TriggerFlags,
        journal_seq: JournalSeq,
        usage_out: Option<&mut FsUsageDelta>,
        body: F,
    ) -> Result<()>
    where
        F: Fn(&Marker<'_>, &mut Staged) -> Result<()>,
    {
        if flags.contains(TriggerFlags::GC) || !state.gc_visited(pos) {
            return self.run_marking(state, flags, journal_seq, usage_out, body);
        }

        let live = self.marker(state, flags, journal_seq)?;
        let mut live_staged = Staged::new(state.replicas.len());
        if let Err(err) = body(&live, &mut live_staged) {
            live.unwind(live_staged);
            return Err(err);
        }
        let shadow = match self.marker(state, flags | TriggerFlags::GC, journal_seq) {
            Ok(shadow) => shadow,
            Err(err) => {
                live.unwind(live_staged);
                return Err(err);
            }
        };
        let mut shadow_staged = Staged::new(state.replicas.len());
        if let Err(err) = body(&shadow, &mut shadow_staged) {
            shadow.unwind(shadow_staged);
            live.unwind(live_staged);
            return Err(err);
        }

        live.publish(&live_staged, usage_out);
        shadow.publish(&shadow_staged, None);
        trace!(target: "ffs::gc", event = "behind_scan", inode = pos.inode, offset = pos.offset);
        Ok(())
    }

    /// Mark one trigger immediately.
    ///
    /// # Panics
    ///
    /// Panics if `trigger.flags` carries neither `INSERT` nor `OVERWRITE`.
    pub fn mark_entry(
        &self,
        trigger: Trigger<'_>,
        usage_out: Option<&mut FsUsageDelta>,
        journal_seq: JournalSeq,
    ) -> Result<()> {
        assert!(
            trigger
                .flags
                .intersects(TriggerFlags::INSERT | TriggerFlags::OVERWRITE),
            "marking call without a direction"
        );
        let state = self.mark_lock.read();
        let pos = trigger.subject().pos;
        self.run_marking_at(&state, pos, trigger.flags, journal_seq, usage_out, |m, staged| {
            m.mark_trigger(&trigger, staged)
        })
    }

    /// Mark the insertion of `new` over nothing.
    pub fn mark_key(&self, new: &Key, journal_seq: JournalSeq, flags: TriggerFlags) -> Result<()> {
        self.mark_entry(Trigger::insert(new, flags), None, journal_seq)
    }

    /// Mark `old` being replaced by `new` at the same position.
    pub fn mark_update(
        &self,
        old: &Key,
        new: &Key,
        usage_out: Option<&mut FsUsageDelta>,
        journal_seq: JournalSeq,
        flags: TriggerFlags,
    ) -> Result<()> {
        let state = self.mark_lock.read();
        self.run_marking_at(&state, new.pos, flags, journal_seq, usage_out, |m, staged| {
            m.mark_pair(old, new, flags, staged)
        })
    }

    /// Mark the insertion of extent `new` and the overwrite of every entry
    /// of `overlapping` (in key order) it covers, as one call.
    pub fn mark_extent_update(
        &self,
        new: &Key,
        overlapping: &[Key],
        usage_out: Option<&mut FsUsageDelta>,
        journal_seq: JournalSeq,
        flags: TriggerFlags,
    ) -> Result<()> {
        let state = self.mark_lock.read();
        self.run_marking_at(&state, new.pos, flags, journal_seq, usage_out, |m, staged| {
            m.mark_trigger(&Trigger::insert(new, flags), staged)?;
            for (old, offset, sectors, extra) in overwritten(new, overlapping) {
                let trigger = Trigger {
                    old,
                    new,
                    offset,
                    sectors,
                    flags: flags.modifiers() | TriggerFlags::OVERWRITE | extra,
                };
                m.mark_trigger(&trigger, staged)?;
            }
            Ok(())
        })
    }

    /// Hand an available bucket back to the allocator with a new
    /// generation, dropping any cached data in it. Returns the mark it had.
    pub fn invalidate_bucket(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
        journal_seq: JournalSeq,
    ) -> Result<BucketMark> {
        let state = self.mark_lock.read();
        let previous = Cell::new(BucketMark::default());
        // A running scan copied every generation at its start, so the bump
        // goes to both views whatever its position.
        self.run_marking_at(&state, Pos::MIN, TriggerFlags::NONE, journal_seq, None, |m, staged| {
            let old = m.invalidate(dev, bucket, staged)?;
            if !m.gc {
                previous.set(old);
            }
            Ok(())
        })?;
        Ok(previous.get())
    }

    /// Set or clear allocator ownership of a bucket.
    pub fn mark_alloc_bucket(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
        owned: bool,
        pos: Pos,
        flags: TriggerFlags,
    ) -> Result<()> {
        let state = self.mark_lock.read();
        for gc in [false, true] {
            if !marks_view(&state, gc, flags, pos) {
                continue;
            }
            self.run_marking(&state, view_flags(flags, gc), JournalSeq::ZERO, None, |m, staged| {
                let array = m.view.bucket_array(dev, bucket).map_err(|e| m.fail(e))?;
                let (old, new) = array.update(bucket, m.mode, |mark| {
                    mark.owned_by_allocator = owned;
                });
                m.account(dev, old, new, &mut staged.usage);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Charge `sectors` of superblock or journal data to a bucket.
    ///
    /// The mark is published even when it then turns out to collide with
    /// another data type or to overflow; the inconsistency is reported after.
    ///
    /// # Panics
    ///
    /// Panics if `data_type` is neither superblock nor journal.
    pub fn mark_metadata_bucket(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
        data_type: DataType,
        sectors: u32,
        pos: Pos,
        flags: TriggerFlags,
    ) -> Result<()> {
        assert!(
            data_type.is_metadata_region(),
            "metadata bucket marked as {data_type}"
        );
        let sectors = sectors_to_u16(u64::from(sectors), "metadata sectors")
            .map_err(|e| parse_error_to_ffs(&e))?;
        let state = self.mark_lock.read();
        for gc in [false, true] {
            if !marks_view(&state, gc, flags, pos) {
                continue;
            }
            let mut reported = None;
            self.run_marking(&state, view_flags(flags, gc), JournalSeq::ZERO, None, |m, staged| {
                reported = m.mark_metadata(dev, bucket, data_type, sectors, staged)?;
                Ok(())
            })?;
            if let Some(err) = reported {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Mark every superblock and journal bucket of `dev`.
    pub fn mark_dev_superblock(&self, dev: DeviceIndex, pos: Pos, flags: TriggerFlags) -> Result<()> {
        let layout = {
            let state = self.mark_lock.read();
            let config = state
                .device(dev)
                .map_err(|e| FfsError::NotFound(e.to_string()))?;
            sb_layout_buckets(config)
        };
        for (bucket, data_type, sectors) in layout {
            self.mark_metadata_bucket(dev, bucket, data_type, sectors, pos, flags)?;
        }
        Ok(())
    }
}

/// A helper marking both views applies to the live one unless the caller
/// is the scan, and to the shadow one when the caller is the scan or the
/// scan has already passed `pos`.
fn marks_view(state: &MarkState, gc: bool, flags: TriggerFlags, pos: Pos) -> bool {
    let scan_caller = flags.contains(TriggerFlags::GC);
    if gc {
        scan_caller || state.gc_visited(pos)
    } else {
        !scan_caller
    }
}

fn view_flags(flags: TriggerFlags, gc: bool) -> TriggerFlags {
    if gc {
        flags | TriggerFlags::GC
    } else {
        flags.difference(TriggerFlags::GC)
    }
}

// ── Marker ──────────────────────────────────────────────────────────────────

impl Marker<'_> {
    fn fail(&self, err: impl std::fmt::Display) -> FfsError {
        self.fs.inconsistent(err)
    }

    fn publish(&self, staged: &Staged, usage_out: Option<&mut FsUsageDelta>) {
        match usage_out {
            Some(out) => out.merge(&staged.usage),
            None => staged.usage.fold_into(&mut self.view.fs_usage.handle(self.seq)),
        }
    }

    /// Reverse every published effect, newest first.
    fn unwind(&self, staged: Staged) {
        // Usage from the reversal only mirrors the staged usage being dropped.
        let mut scratch = FsUsageDelta::new(0);
        for step in staged.undo.into_iter().rev() {
            match step {
                Undo::Pointer {
                    ptr,
                    sectors,
                    data_type,
                } => {
                    let Ok(array) = self.view.bucket_array(ptr.dev, ptr.bucket) else {
                        continue;
                    };
                    let result = array.try_update(ptr.bucket, self.mode, |m| {
                        Ok::<bool, RefError>(
                            mark_pointer_sectors(m, &ptr, -sectors, data_type)? == RefCheck::Live,
                        )
                    });
                    match result {
                        Ok(Some((old, new))) => self.account(ptr.dev, old, new, &mut scratch),
                        Ok(None) => {}
                        Err(err) => error!(
                            target: "ffs::buckets",
                            event = "unwind_failed",
                            detail = %err
                        ),
                    }
                }
                Undo::Bucket {
                    dev,
                    bucket,
                    mark,
                    aux,
                } => {
                    let Ok(array) = self.view.bucket_array(dev, bucket) else {
                        continue;
                    };
                    let (old, new) = array.update(bucket, self.mode, |m| *m = mark);
                    if let Some(cell) = array.get(bucket) {
                        cell.set_aux(aux);
                    }
                    self.account(dev, old, new, &mut scratch);
                }
                Undo::StripeBlock { ec, sectors } => {
                    let mut stripes = self.view.stripes.lock();
                    if let Some(m) = stripes.get_mut(&ec.idx) {
                        if matches!(m.add_block_sectors(ec.idx, ec.block, -sectors), Ok(true))
                            && !self.gc
                        {
                            self.fs.stripe_heap.update(ec.idx, m.blocks_nonempty);
                        }
                    }
                }
                Undo::Stripe { idx, prev } => {
                    let mut stripes = self.view.stripes.lock();
                    match prev {
                        Some(p) => {
                            let nonempty = p.blocks_nonempty;
                            stripes.insert(idx, p);
                            if !self.gc {
                                self.fs.stripe_heap.update(idx, nonempty);
                            }
                        }
                        None => {
                            stripes.remove(&idx);
                            if !self.gc {
                                self.fs.stripe_heap.remove(idx);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Fold a bucket transition into device usage, hidden space into `fs`.
    fn account(&self, dev: DeviceIndex, old: BucketMark, new: BucketMark, fs: &mut FsUsageDelta) {
        let slot = dev_slot(dev);
        let (Some(config), Some(usage)) =
            (self.state.devices.get(slot), self.view.dev_usage.get(slot))
        else {
            return;
        };
        let available = apply_delta(old, new, config.bucket_size, fs, &mut usage.handle(self.seq));
        if available && !self.gc {
            self.fs.waker.wake(dev);
            debug!(target: "ffs::buckets", event = "allocator_wake", dev = dev.0);
        }
    }

    fn tag(seq: JournalSeq, mark: &mut BucketMark) {
        if seq != JournalSeq::ZERO {
            mark.journal_seq_valid = true;
            mark.journal_seq = seq.truncated();
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────────────

    pub(crate) fn mark_trigger(&self, t: &Trigger<'_>, staged: &mut Staged) -> Result<()> {
        let k = t.subject();
        match &k.value {
            KeyValue::Alloc(_) => self.mark_alloc(t.new, t.flags, staged),
            KeyValue::BtreePtr { .. } => {
                let size = i64::from(self.fs.options.btree_node_size);
                let sectors = if t.flags.contains(TriggerFlags::INSERT) {
                    size
                } else {
                    -size
                };
                self.mark_extent(k, t.offset, sectors, t.flags, DataType::Btree, staged)
            }
            KeyValue::Extent { .. } | KeyValue::ReflinkV { .. } => {
                self.mark_extent(k, t.offset, t.sectors, t.flags, DataType::User, staged)
            }
            KeyValue::Stripe(_) => self.mark_stripe(t.old, t.new, staged),
            KeyValue::Inode => {
                staged.usage.add(FsCounter::NrInodes, t.inode_delta());
                Ok(())
            }
            KeyValue::Reservation { nr_replicas } => {
                let replicas = reservation_replicas(*nr_replicas);
                let sectors = t.sectors * i64::from(replicas);
                staged.usage.add(FsCounter::Reserved, sectors);
                staged
                    .usage
                    .add(FsCounter::PersistentReserved(usize::from(replicas) - 1), sectors);
                Ok(())
            }
            // Indirect references are charged only through transactions.
            KeyValue::ReflinkP { .. } | KeyValue::IndirectInlineData { .. } | KeyValue::Deleted => {
                Ok(())
            }
        }
    }

    /// `old` replaced by `new`: one combined call for kinds that read both
    /// sides, otherwise an insert followed by a full overwrite.
    pub(crate) fn mark_pair(
        &self,
        old: &Key,
        new: &Key,
        flags: TriggerFlags,
        staged: &mut Staged,
    ) -> Result<()> {
        if old.kind() == new.kind() && new.kind().wants_old_and_new() {
            return self.mark_trigger(&Trigger::combined(old, new, flags), staged);
        }
        self.mark_trigger(&Trigger::insert(new, flags), staged)?;
        let gone = Key::deleted(old.pos);
        let trigger = Trigger {
            old,
            new: &gone,
            offset: 0,
            sectors: -i64::from(old.size),
            flags: flags.modifiers() | TriggerFlags::OVERWRITE,
        };
        self.mark_trigger(&trigger, staged)
    }

    // ── Extents ─────────────────────────────────────────────────────────────

    fn mark_extent(
        &self,
        k: &Key,
        offset: u32,
        sectors: i64,
        flags: TriggerFlags,
        data_type: DataType,
        staged: &mut Staged,
    ) -> Result<()> {
        assert!(sectors != 0, "zero-sector marking of {k:?}");
        let registry = &self.state.replicas;
        let mut dirty = ReplicasEntry::empty(data_type);
        let mut dirty_sectors = 0_i64;

        for p in k.ptrs() {
            let disk = if data_type == DataType::Btree {
                sectors
            } else {
                ptr_disk_sectors_delta(&p.crc, offset, sectors, flags)
            };
            let stale = self.mark_pointer(p, disk, data_type, staged)?;

            if p.ptr.cached {
                if !stale {
                    update_cached_sectors(registry, &mut staged.usage, p.ptr.dev, disk)
                        .map_err(|e| self.fail(e))?;
                }
            } else if !stale {
                if let Some(ec) = p.ec {
                    self.mark_stripe_ptr(ec, data_type, disk, staged)?;
                    dirty.nr_required = 0;
                } else {
                    dirty_sectors += disk;
                    dirty.push_dev(p.ptr.dev);
                }
            }
        }

        if dirty.nr_devs() > 0 {
            update_replicas(registry, &mut staged.usage, &dirty, dirty_sectors)
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Charge one pointer to its bucket. Returns whether the pointer was
    /// stale and therefore skipped.
    fn mark_pointer(
        &self,
        p: &DecodedPtr,
        sectors: i64,
        data_type: DataType,
        staged: &mut Staged,
    ) -> Result<bool> {
        let ptr = p.ptr;
        let array = self
            .view
            .bucket_array(ptr.dev, ptr.bucket)
            .map_err(|e| self.fail(e))?;
        let seq = self.seq;
        let result = array.try_update(ptr.bucket, self.mode, |m| {
            if mark_pointer_sectors(m, &ptr, sectors, data_type)? == RefCheck::Stale {
                return Ok(false);
            }
            Self::tag(seq, m);
            Ok::<bool, RefError>(true)
        });
        match result {
            Err(err) => Err(self.fail(err)),
            Ok(None) => Ok(true),
            Ok(Some((old, new))) => {
                staged.undo.push(Undo::Pointer {
                    ptr,
                    sectors,
                    data_type,
                });
                self.account(ptr.dev, old, new, &mut staged.usage);
                Ok(false)
            }
        }
    }

    /// Charge an erasure-coded pointer's sectors to its stripe block and
    /// to the stripe's redundancy configuration.
    fn mark_stripe_ptr(
        &self,
        ec: StripePtr,
        data_type: DataType,
        sectors: i64,
        staged: &mut Staged,
    ) -> Result<()> {
        let (changed, nonempty, mut replicas) = {
            let mut stripes = self.view.stripes.lock();
            let Some(m) = stripes.get_mut(&ec.idx).filter(|m| m.alive) else {
                return Err(self.fail(MarkError::NonexistentStripe(ec.idx)));
            };
            let changed = m
                .add_block_sectors(ec.idx, ec.block, sectors)
                .map_err(|e| self.fail(e))?;
            (changed, m.blocks_nonempty, m.replicas.clone())
        };
        staged.undo.push(Undo::StripeBlock { ec, sectors });
        if changed && !self.gc {
            self.fs.stripe_heap.update(ec.idx, nonempty);
        }

        replicas.data_type = data_type;
        update_replicas(&self.state.replicas, &mut staged.usage, &replicas, sectors)
            .map_err(|e| self.fail(e))
    }

    // ── Stripes ─────────────────────────────────────────────────────────────

    fn mark_stripe(&self, old: &Key, new: &Key, staged: &mut Staged) -> Result<()> {
        let idx = StripeId(new.pos.offset);
        let (old_record, new_record) = (old.as_stripe(), new.as_stripe());
        if let Some(record) = new_record {
            record.validate().map_err(|e| parse_error_to_ffs(&e))?;
        }

        let mut stripes = self.view.stripes.lock();
        let prev = stripes.get(&idx).cloned();
        let prev_alive = prev.clone().filter(|s| s.alive);
        if old_record.is_some() && prev_alive.is_none() {
            drop(stripes);
            return Err(self.fail(MarkError::NonexistentStripe(idx)));
        }
        // The shadow view counts blocks only from the extents it marks.
        let next = new_record.map(|record| {
            let mut state = StripeState::from_record(record);
            if self.gc {
                match &prev_alive {
                    Some(p) => state.carry_block_counts(p),
                    None => state.clear_block_counts(),
                }
            }
            state
        });
        match &next {
            Some(state) => {
                stripes.insert(idx, state.clone());
            }
            None => {
                stripes.remove(&idx);
            }
        }
        drop(stripes);
        staged.undo.push(Undo::Stripe { idx, prev });

        let registry = &self.state.replicas;
        if !self.gc {
            match &next {
                Some(state) => self.fs.stripe_heap.update(idx, state.blocks_nonempty),
                None => self.fs.stripe_heap.remove(idx),
            }
            if let Some(p) = &prev_alive {
                update_replicas(registry, &mut staged.usage, &p.replicas, -p.parity_sectors())
                    .map_err(|e| self.fail(e))?;
            }
            if let Some(state) = &next {
                update_replicas(registry, &mut staged.usage, &state.replicas, state.parity_sectors())
                    .map_err(|e| self.fail(e))?;
            }
            return Ok(());
        }

        if let Some(p) = &prev_alive {
            update_replicas(registry, &mut staged.usage, &p.replicas, -p.parity_sectors())
                .map_err(|e| self.fail(e))?;
        }
        if let (Some(record), Some(state)) = (new_record, &next) {
            for block in 0..record.nr_blocks() {
                self.mark_stripe_bucket(record, idx, block, staged)?;
            }
            update_replicas(registry, &mut staged.usage, &state.replicas, state.parity_sectors())
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Scan-mode marking of the bucket holding one stripe block.
    fn mark_stripe_bucket(
        &self,
        record: &StripeRecord,
        idx: StripeId,
        block: usize,
        staged: &mut Staged,
    ) -> Result<()> {
        let Some(ptr) = record.ptrs.get(block).copied() else {
            return Ok(());
        };
        let parity = record.is_parity_block(block);
        let array = self
            .view
            .bucket_array(ptr.dev, ptr.bucket)
            .map_err(|e| self.fail(e))?;
        let Some(cell) = array.get(ptr.bucket) else {
            return Ok(());
        };
        let aux = cell.aux();
        if let Some(existing) = aux.stripe.filter(|s| *s != idx) {
            return Err(self.fail(MarkError::MultipleStripes {
                dev: ptr.dev,
                bucket: ptr.bucket,
                generation: cell.mark().generation,
                existing,
                new: idx,
            }));
        }

        let seq = self.seq;
        let result = array.try_update(ptr.bucket, self.mode, |m| {
            check_bucket_ref(&ptr, 0, DataType::None, m)?;
            if parity {
                m.data_type = DataType::Parity;
                m.dirty_sectors = record.sectors;
            }
            m.stripe = true;
            Self::tag(seq, m);
            Ok::<bool, RefError>(true)
        });
        let (old, new) = match result {
            Err(err) => return Err(self.fail(err)),
            Ok(None) => return Ok(()),
            Ok(Some(pair)) => pair,
        };
        staged.undo.push(Undo::Bucket {
            dev: ptr.dev,
            bucket: ptr.bucket,
            mark: old,
            aux,
        });
        cell.set_stripe(Some(idx), record.nr_redundant);
        self.account(ptr.dev, old, new, &mut staged.usage);
        Ok(())
    }

    // ── Buckets ─────────────────────────────────────────────────────────────

    /// Load an allocation record into the in-memory bucket it describes.
    fn mark_alloc(&self, new: &Key, flags: TriggerFlags, staged: &mut Staged) -> Result<()> {
        let Some(record) = new.as_alloc().copied() else {
            return Ok(());
        };
        // The scan rebuilds marks from extents; only invalidations reach it.
        if self.gc && !flags.contains(TriggerFlags::BUCKET_INVALIDATE) {
            return Ok(());
        }
        let Ok(raw_dev) = u32::try_from(new.pos.inode) else {
            return Err(self.fail(format!("allocation record at {} names no device", new.pos)));
        };
        let dev = DeviceIndex(raw_dev);
        let array = self.view.buckets(dev).map_err(|e| self.fail(e))?;
        let bucket = BucketNumber(new.pos.offset);
        let Some(cell) = array.get(bucket) else {
            return Ok(());
        };

        let aux = cell.aux();
        let seq = self.seq;
        let (old, updated) = array.update(bucket, self.mode, |m| {
            m.generation = record.generation;
            m.data_type = record.data_type;
            m.dirty_sectors = record.dirty_sectors;
            m.cached_sectors = record.cached_sectors;
            m.stripe = record.stripe.is_some();
            Self::tag(seq, m);
        });
        staged.undo.push(Undo::Bucket {
            dev,
            bucket,
            mark: old,
            aux,
        });
        cell.set_aux(record.aux());
        self.account(dev, old, updated, &mut staged.usage);

        if flags.contains(TriggerFlags::BUCKET_INVALIDATE) && old.cached_sectors != 0 {
            update_cached_sectors(
                &self.state.replicas,
                &mut staged.usage,
                dev,
                -i64::from(old.cached_sectors),
            )
            .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    fn invalidate(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
        staged: &mut Staged,
    ) -> Result<BucketMark> {
        let array = self
            .view
            .bucket_array(dev, bucket)
            .map_err(|e| self.fail(e))?;
        let Some(cell) = array.get(bucket) else {
            return Err(self.fail(MarkError::BucketOutOfRange {
                dev,
                bucket,
                nbuckets: array.nbuckets(),
            }));
        };
        let aux = cell.aux();
        let seq = self.seq;
        let result = array.try_update(bucket, self.mode, |m| {
            if !m.is_available() {
                return Err(MarkError::InvalidateInUse {
                    dev,
                    bucket,
                    generation: m.generation,
                    data_type: m.data_type,
                    dirty: m.dirty_sectors,
                });
            }
            m.owned_by_allocator = true;
            m.data_type = DataType::None;
            m.dirty_sectors = 0;
            m.cached_sectors = 0;
            m.generation = m.generation.next();
            Self::tag(seq, m);
            Ok(true)
        });
        let (old, new) = match result {
            Err(err) => return Err(self.fail(err)),
            Ok(None) => return Ok(cell.mark()),
            Ok(Some(pair)) => pair,
        };
        staged.undo.push(Undo::Bucket {
            dev,
            bucket,
            mark: old,
            aux,
        });
        cell.set_gen_valid();
        self.account(dev, old, new, &mut staged.usage);

        if old.cached_sectors != 0 {
            update_cached_sectors(
                &self.state.replicas,
                &mut staged.usage,
                dev,
                -i64::from(old.cached_sectors),
            )
            .map_err(|e| self.fail(e))?;
        }
        Ok(old)
    }

    /// Publish a metadata charge. A collision or overflow found afterwards
    /// is reported through the returned error, not by failing the call.
    fn mark_metadata(
        &self,
        dev: DeviceIndex,
        bucket: BucketNumber,
        data_type: DataType,
        sectors: u16,
        staged: &mut Staged,
    ) -> Result<Option<FfsError>> {
        let array = self
            .view
            .bucket_array(dev, bucket)
            .map_err(|e| self.fail(e))?;
        let mut collision = None;
        let mut fits = true;
        let (old, new) = array.update(bucket, self.mode, |m| {
            collision = (m.data_type != DataType::None && m.data_type != data_type)
                .then_some(m.data_type);
            m.data_type = data_type;
            fits = m.add_dirty_saturating(sectors);
        });
        self.account(dev, old, new, &mut staged.usage);

        if let Some(existing) = collision {
            return Ok(Some(self.fail(MarkError::MetadataCollision {
                dev,
                bucket,
                generation: new.generation,
                existing,
                new: data_type,
            })));
        }
        if !fits {
            return Ok(Some(self.fail(MarkError::MetadataOverflow {
                dev,
                bucket,
                generation: new.generation,
                data_type,
                sectors: u64::from(old.dirty_sectors) + u64::from(sectors),
                limit: u64::from(u16::MAX),
            })));
        }
        Ok(None)
    }
}
