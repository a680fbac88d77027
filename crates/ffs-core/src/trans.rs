//! Deferred marking.
//!
//! A [`Transaction`] collects the effects of marking several entries without
//! touching shared state: replicas deltas, inode and persistent-reservation
//! deltas go into its ledger, and rewritten allocation, stripe, and indirect
//! extent records go into its update list. [`BucketFs::commit`] applies the
//! whole transaction as one unit at a single journal sequence; dropping the
//! transaction instead discards everything.
//!
//! Records are looked up in the transaction's own updates first, so a
//! bucket or stripe touched twice in one transaction sees its first change.
//! Allocation records not yet in the transaction start from the live
//! in-memory bucket; stripe and indirect records come from the
//! [`KeySource`].
//!
//! The transaction also keeps each marking step it recorded. When a
//! consistency scan is running, commit marks the steps at positions the
//! scan has passed straight into the scan's shadow view.

use crate::errors::{MarkError, parse_error_to_ffs};
use crate::keys::{
    AllocRecord, DecodedPtr, Key, KeyValue, StripeRecord, TriggerFlags, overwritten,
    ptr_disk_sectors_delta, reservation_replicas,
};
use crate::mark::Trigger;
use crate::metadata::sb_layout_buckets;
use crate::reservation::DiskReservation;
use crate::stripe::StripeState;
use crate::{BucketFs, MarkState, dev_slot};
use ffs_alloc::{RefCheck, check_bucket_ref, mark_pointer_sectors};
use ffs_error::{FfsError, Result};
use ffs_types::{BucketNumber, DataType, DeviceIndex, JournalSeq, Pos, StripeId};
use ffs_usage::{FsUsageDelta, LedgerMark, ReplicasDeltaList, ReplicasEntry};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Trees deferred marking reads from and writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TreeId {
    Alloc,
    Stripes,
    /// Indirect extents, keyed like extents by their end offset.
    Reflink,
}

/// Read access to stored records.
pub trait KeySource: Send + Sync {
    /// For [`TreeId::Reflink`], the entry whose range contains
    /// `pos.offset`; for the other trees, the entry exactly at `pos`.
    fn peek(&self, tree: TreeId, pos: Pos) -> Result<Option<Key>>;
}

/// Ordered in-memory [`KeySource`].
#[derive(Debug, Clone, Default)]
pub struct MemKeySource {
    entries: BTreeMap<(TreeId, Pos), Key>,
}

impl MemKeySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tree: TreeId, key: Key) {
        self.entries.insert((tree, key.pos), key);
    }

    /// Persist committed updates. Deleted entries are removed.
    pub fn apply(&mut self, updates: &[PendingUpdate]) {
        for u in updates {
            if matches!(u.key.value, KeyValue::Deleted) {
                self.entries.remove(&(u.tree, u.key.pos));
            } else {
                self.insert(u.tree, u.key.clone());
            }
        }
    }

    #[must_use]
    pub fn get(&self, tree: TreeId, pos: Pos) -> Option<&Key> {
        self.entries.get(&(tree, pos))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeySource for MemKeySource {
    fn peek(&self, tree: TreeId, pos: Pos) -> Result<Option<Key>> {
        if tree != TreeId::Reflink {
            return Ok(self.entries.get(&(tree, pos)).cloned());
        }
        let after = Pos::new(pos.inode, pos.offset.saturating_add(1));
        Ok(self
            .entries
            .range((tree, after)..=(tree, Pos::new(pos.inode, u64::MAX)))
            .map(|(_, k)| k)
            .next()
            .filter(|k| k.start_offset() <= pos.offset)
            .cloned())
    }
}

/// A record rewrite produced by deferred marking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub tree: TreeId,
    pub key: Key,
}

impl PendingUpdate {
    fn covers(&self, tree: TreeId, pos: Pos) -> bool {
        if self.tree != tree {
            return false;
        }
        if tree == TreeId::Reflink {
            self.key.pos.inode == pos.inode
                && self.key.start_offset() <= pos.offset
                && pos.offset < self.key.pos.offset
        } else {
            self.key.pos == pos
        }
    }
}

/// One recorded marking step, replayed at commit into the shadow view of
/// a scan that has already passed `pos`.
#[derive(Debug, Clone)]
struct ScanReplay {
    pos: Pos,
    old: Key,
    new: Key,
    offset: u32,
    sectors: i64,
    flags: TriggerFlags,
}

impl ScanReplay {
    fn new(pos: Pos, t: &Trigger<'_>) -> Self {
        Self {
            pos,
            old: t.old.clone(),
            new: t.new.clone(),
            offset: t.offset,
            sectors: t.sectors,
            flags: t.flags,
        }
    }

    fn trigger(&self) -> Trigger<'_> {
        Trigger {
            old: &self.old,
            new: &self.new,
            offset: self.offset,
            sectors: self.sectors,
            flags: self.flags | TriggerFlags::GC,
        }
    }
}

/// Saved transaction state.
#[derive(Debug, Clone)]
pub struct TransSavepoint {
    ledger: LedgerMark,
    updates: Vec<PendingUpdate>,
    replay: usize,
}

/// Pending marking effects, applied together by [`BucketFs::commit`].
pub struct Transaction<'a> {
    source: &'a dyn KeySource,
    ledger: ReplicasDeltaList,
    updates: Vec<PendingUpdate>,
    replay: Vec<ScanReplay>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("ledger", &self.ledger)
            .field("updates", &self.updates)
            .finish_non_exhaustive()
    }
}

impl<'a> Transaction<'a> {
    #[must_use]
    pub fn new(source: &'a dyn KeySource) -> Self {
        Self {
            source,
            ledger: ReplicasDeltaList::new(),
            updates: Vec::new(),
            replay: Vec::new(),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &ReplicasDeltaList {
        &self.ledger
    }

    #[must_use]
    pub fn updates(&self) -> &[PendingUpdate] {
        &self.updates
    }

    #[must_use]
    pub fn savepoint(&self) -> TransSavepoint {
        TransSavepoint {
            ledger: self.ledger.savepoint(),
            updates: self.updates.clone(),
            replay: self.replay.len(),
        }
    }

    pub fn rollback(&mut self, sp: TransSavepoint) {
        self.ledger.rollback(sp.ledger);
        self.updates = sp.updates;
        self.replay.truncate(sp.replay);
    }

    /// Latest pending rewrite covering `pos` in `tree`.
    fn get_update(&self, tree: TreeId, pos: Pos) -> Option<&Key> {
        self.updates
            .iter()
            .rev()
            .find(|u| u.covers(tree, pos))
            .map(|u| &u.key)
    }

    fn lookup(&self, tree: TreeId, pos: Pos) -> Result<Option<Key>> {
        match self.get_update(tree, pos) {
            Some(k) => Ok(Some(k.clone())),
            None => self.source.peek(tree, pos),
        }
    }

    /// Queue a rewrite, replacing an earlier one at the same position.
    fn put_update(&mut self, tree: TreeId, key: Key) {
        match self
            .updates
            .iter_mut()
            .find(|u| u.tree == tree && u.key.pos == key.pos)
        {
            Some(existing) => existing.key = key,
            None => self.updates.push(PendingUpdate { tree, key }),
        }
    }
}

/// What a committed transaction changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Journal sequence the usage was charged to.
    pub seq: JournalSeq,
    /// Record rewrites for the caller to persist.
    pub updates: Vec<PendingUpdate>,
}

// ── Deferred marking ────────────────────────────────────────────────────────

struct TransMarker<'a> {
    fs: &'a BucketFs,
    state: &'a MarkState,
    /// Position of the entry being marked, when its steps are replayable.
    pos: Option<Pos>,
}

impl BucketFs {
    /// Run `body` against `trans`, restoring it if `body` fails.
    fn with_savepoint<F>(
        &self,
        trans: &mut Transaction<'_>,
        pos: Option<Pos>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&TransMarker<'_>, &mut Transaction<'_>) -> Result<()>,
    {
        let state = self.mark_lock.read();
        let marker = TransMarker {
            fs: self,
            state: &state,
            pos,
        };
        let sp = trans.savepoint();
        let result = body(&marker, trans);
        if result.is_err() {
            trans.rollback(sp);
        }
        result
    }

    /// Record one trigger into `trans`.
    pub fn trans_mark_key(&self, trans: &mut Transaction<'_>, trigger: Trigger<'_>) -> Result<()> {
        assert!(
            trigger
                .flags
                .intersects(TriggerFlags::INSERT | TriggerFlags::OVERWRITE),
            "marking call without a direction"
        );
        let pos = trigger.subject().pos;
        self.with_savepoint(trans, Some(pos), |m, trans| m.mark_trigger(trans, &trigger))
    }

    /// Record `old` being replaced by `new` into `trans`, composed the same
    /// way as [`BucketFs::mark_update`]. A failure leaves `trans` unchanged.
    pub fn mark_entry_deferred(
        &self,
        trans: &mut Transaction<'_>,
        old: &Key,
        new: &Key,
        flags: TriggerFlags,
    ) -> Result<()> {
        self.with_savepoint(trans, Some(new.pos), |m, trans| {
            if old.kind() == new.kind() && new.kind().wants_old_and_new() {
                return m.mark_trigger(trans, &Trigger::combined(old, new, flags));
            }
            m.mark_trigger(trans, &Trigger::insert(new, flags))?;
            let gone = Key::deleted(old.pos);
            m.mark_trigger(
                trans,
                &Trigger {
                    old,
                    new: &gone,
                    offset: 0,
                    sectors: -i64::from(old.size),
                    flags: flags.modifiers() | TriggerFlags::OVERWRITE,
                },
            )
        })
    }

    /// Record the insertion of extent `new` and the overwrite of every entry
    /// of `overlapping` it covers.
    pub fn trans_mark_extent_update(
        &self,
        trans: &mut Transaction<'_>,
        new: &Key,
        overlapping: &[Key],
        flags: TriggerFlags,
    ) -> Result<()> {
        self.with_savepoint(trans, Some(new.pos), |m, trans| {
            m.mark_trigger(trans, &Trigger::insert(new, flags))?;
            for (old, offset, sectors, extra) in overwritten(new, overlapping) {
                let trigger = Trigger {
                    old,
                    new,
                    offset,
                    sectors,
                    flags: flags.modifiers() | TriggerFlags::OVERWRITE | extra,
                };
                m.mark_trigger(trans, &trigger)?;
            }
            Ok(())
        })
    }

    /// Set a superblock or journal bucket's allocation record to hold
    /// exactly `sectors` of `data_type`.
    ///
    /// # Panics
    ///
    /// Panics if `data_type` is neither superblock nor journal.
    pub fn trans_mark_metadata_bucket(
        &self,
        trans: &mut Transaction<'_>,
        dev: DeviceIndex,
        bucket: BucketNumber,
        data_type: DataType,
        sectors: u32,
    ) -> Result<()> {
        assert!(
            data_type.is_metadata_region(),
            "metadata bucket marked as {data_type}"
        );
        self.with_savepoint(trans, None, |m, trans| {
            m.mark_metadata_bucket(trans, dev, bucket, data_type, sectors)
        })
    }

    /// Record every superblock and journal bucket of `dev`.
    pub fn trans_mark_dev_sb(&self, trans: &mut Transaction<'_>, dev: DeviceIndex) -> Result<()> {
        self.with_savepoint(trans, None, |m, trans| {
            let config = m
                .state
                .device(dev)
                .map_err(|e| FfsError::NotFound(e.to_string()))?;
            for (bucket, data_type, sectors) in sb_layout_buckets(config) {
                m.mark_metadata_bucket(trans, dev, bucket, data_type, sectors)?;
            }
            Ok(())
        })
    }

    /// Apply `trans` at the current journal sequence: fold its ledger into
    /// usage against `disk_res`, load its allocation records into the
    /// bucket marks, and refresh the stripe table from its stripe records.
    pub fn commit(
        &self,
        trans: Transaction<'_>,
        disk_res: Option<&mut DiskReservation>,
    ) -> Result<CommitOutcome> {
        let Transaction {
            ledger,
            updates,
            replay,
            ..
        } = trans;
        let seq = self.journal.cur_seq();
        let state = self.mark_lock.read();

        let mut delta = FsUsageDelta::new(state.replicas.len());
        ledger
            .apply(&state.replicas, &mut delta)
            .map_err(|e| self.inconsistent(e))?;

        self.run_marking(&state, TriggerFlags::INSERT, seq, Some(&mut delta), |m, staged| {
            for u in updates.iter().filter(|u| u.tree == TreeId::Alloc) {
                m.mark_trigger(&Trigger::insert(&u.key, TriggerFlags::NONE), staged)?;
            }
            Ok(())
        })?;

        {
            let mut stripes = state.live.stripes.lock();
            for u in updates.iter().filter(|u| u.tree == TreeId::Stripes) {
                let idx = StripeId(u.key.pos.offset);
                match u.key.as_stripe() {
                    Some(record) => {
                        let s = StripeState::from_record(record);
                        self.stripe_heap.update(idx, s.blocks_nonempty);
                        stripes.insert(idx, s);
                    }
                    None => {
                        stripes.remove(&idx);
                        self.stripe_heap.remove(idx);
                    }
                }
            }
        }

        self.replay_behind_scan(&state, &replay, seq);
        self.fs_usage_apply_locked(&state, delta, disk_res, seq);
        debug!(
            target: "ffs::buckets",
            event = "trans_commit",
            seq = seq.0,
            deltas = ledger.deltas().len(),
            updates = updates.len()
        );
        Ok(CommitOutcome { seq, updates })
    }

    /// Mark the committed steps the running scan has already passed into
    /// its shadow view. A failure discards the scan, not the commit.
    fn replay_behind_scan(&self, state: &MarkState, replay: &[ScanReplay], seq: JournalSeq) {
        if state.gc.is_none() {
            return;
        }
        let behind: Vec<&ScanReplay> = replay.iter().filter(|r| state.gc_visited(r.pos)).collect();
        if behind.is_empty() {
            return;
        }
        let result = self.run_marking(state, TriggerFlags::GC, seq, None, |m, staged| {
            for r in &behind {
                m.mark_trigger(&r.trigger(), staged)?;
            }
            Ok(())
        });
        if let Err(err) = result {
            warn!(target: "ffs::gc", event = "scan_replay_failed", detail = %err);
        }
    }
}

impl TransMarker<'_> {
    fn fail(&self, err: impl std::fmt::Display) -> FfsError {
        self.fs.inconsistent(err)
    }

    fn mark_trigger(&self, trans: &mut Transaction<'_>, t: &Trigger<'_>) -> Result<()> {
        if let Some(pos) = self.pos {
            trans.replay.push(ScanReplay::new(pos, t));
        }
        let k = t.subject();
        match &k.value {
            KeyValue::BtreePtr { .. } => {
                let size = i64::from(self.fs.options.btree_node_size);
                let sectors = if t.flags.contains(TriggerFlags::INSERT) {
                    size
                } else {
                    -size
                };
                self.mark_extent(trans, k, t.offset, sectors, t.flags, DataType::Btree)
            }
            KeyValue::Extent { .. } | KeyValue::ReflinkV { .. } => {
                self.mark_extent(trans, k, t.offset, t.sectors, t.flags, DataType::User)
            }
            KeyValue::Stripe(_) => self.mark_stripe(trans, t.old, t.new),
            KeyValue::Inode => {
                trans.ledger.add_inodes(t.inode_delta());
                Ok(())
            }
            KeyValue::Reservation { nr_replicas } => {
                let replicas = reservation_replicas(*nr_replicas);
                trans
                    .ledger
                    .add_persistent_reserved(usize::from(replicas), t.sectors * i64::from(replicas));
                Ok(())
            }
            KeyValue::ReflinkP { idx } => self.mark_reflink_p(trans, k, *idx, t.offset, t.sectors, t.flags),
            // Allocation records are themselves the output of deferred marking.
            KeyValue::Alloc(_) | KeyValue::IndirectInlineData { .. } | KeyValue::Deleted => Ok(()),
        }
    }

    /// Allocation record of `bucket` as this transaction sees it.
    fn start_alloc_update(
        &self,
        trans: &Transaction<'_>,
        dev: DeviceIndex,
        bucket: BucketNumber,
    ) -> Result<AllocRecord> {
        let pos = Pos::new(u64::from(dev.0), bucket.0);
        if let Some(rec) = trans.get_update(TreeId::Alloc, pos).and_then(Key::as_alloc) {
            return Ok(*rec);
        }
        let array = self
            .state
            .live
            .bucket_array(dev, bucket)
            .map_err(|e| self.fail(e))?;
        let cell = array.get(bucket).ok_or_else(|| {
            self.fail(MarkError::BucketOutOfRange {
                dev,
                bucket,
                nbuckets: array.nbuckets(),
            })
        })?;
        Ok(AllocRecord::from_bucket(cell.mark(), cell.aux()))
    }

    fn mark_extent(
        &self,
        trans: &mut Transaction<'_>,
        k: &Key,
        offset: u32,
        sectors: i64,
        flags: TriggerFlags,
        data_type: DataType,
    ) -> Result<()> {
        assert!(sectors != 0, "zero-sector marking of {k:?}");
        let mut dirty = ReplicasEntry::empty(data_type);
        let mut dirty_sectors = 0_i64;

        for p in k.ptrs() {
            let disk = if data_type == DataType::Btree {
                sectors
            } else {
                ptr_disk_sectors_delta(&p.crc, offset, sectors, flags)
            };
            let stale = self.mark_pointer(trans, p, disk, data_type)?;

            if p.ptr.cached {
                if !stale {
                    trans
                        .ledger
                        .record(&ReplicasEntry::cached(p.ptr.dev), disk);
                }
            } else if !stale {
                if p.ec.is_some() {
                    self.mark_stripe_ptr(trans, p, data_type, disk)?;
                    dirty.nr_required = 0;
                } else {
                    dirty_sectors += disk;
                    dirty.push_dev(p.ptr.dev);
                }
            }
        }

        if dirty.nr_devs() > 0 {
            trans.ledger.record(&dirty, dirty_sectors);
        }
        Ok(())
    }

    /// Charge one pointer to its bucket's allocation record. Returns whether
    /// the pointer was stale.
    fn mark_pointer(
        &self,
        trans: &mut Transaction<'_>,
        p: &DecodedPtr,
        sectors: i64,
        data_type: DataType,
    ) -> Result<bool> {
        let (dev, bucket) = (p.ptr.dev, p.ptr.bucket);
        let mut record = self.start_alloc_update(trans, dev, bucket)?;
        let mut mark = record.as_mark();
        match mark_pointer_sectors(&mut mark, &p.ptr, sectors, data_type) {
            Err(err) => return Err(self.fail(err)),
            Ok(RefCheck::Stale) => return Ok(true),
            Ok(RefCheck::Live) => {}
        }
        record.absorb(&mark);
        trans.put_update(TreeId::Alloc, Key::alloc(dev, bucket, record));
        Ok(false)
    }

    fn mark_stripe_ptr(
        &self,
        trans: &mut Transaction<'_>,
        p: &DecodedPtr,
        data_type: DataType,
        sectors: i64,
    ) -> Result<()> {
        let Some(ec) = p.ec else {
            return Ok(());
        };
        let pos = Pos::new(0, ec.idx.0);
        let Some(mut key) = trans.lookup(TreeId::Stripes, pos)? else {
            return Err(self.fail(MarkError::NonexistentStripe(ec.idx)));
        };
        let KeyValue::Stripe(record) = &mut key.value else {
            return Err(self.fail(MarkError::NonexistentStripe(ec.idx)));
        };
        if !record.matches_ptr(p) {
            return Err(self.fail(MarkError::StripePtrMismatch {
                idx: ec.idx,
                block: ec.block,
            }));
        }
        let Some(slot) = record.block_sectors.get_mut(usize::from(ec.block)) else {
            return Err(self.fail(MarkError::StripePtrMismatch {
                idx: ec.idx,
                block: ec.block,
            }));
        };
        let current = *slot;
        *slot = u16::try_from(i64::from(current) + sectors).map_err(|_| {
            self.fail(MarkError::StripeBlockRange {
                idx: ec.idx,
                block: ec.block,
                current: u32::from(current),
                delta: sectors,
            })
        })?;

        let mut replicas = record.replicas_entry();
        replicas.data_type = data_type;
        trans.put_update(TreeId::Stripes, key);
        trans.ledger.record(&replicas, sectors);
        Ok(())
    }

    fn mark_stripe(&self, trans: &mut Transaction<'_>, old: &Key, new: &Key) -> Result<()> {
        let (old_record, new_record) = (old.as_stripe(), new.as_stripe());
        if let (Some(o), Some(n)) = (old_record, new_record) {
            if o.same_pointers(n) {
                return Ok(());
            }
        }
        if let Some(record) = new_record {
            record.validate().map_err(|e| parse_error_to_ffs(&e))?;
            let idx = StripeId(new.pos.offset);
            trans
                .ledger
                .record(&record.replicas_entry(), record.parity_sectors());
            for block in 0..record.nr_blocks() {
                self.alloc_stripe_ref(trans, idx, record, block, false)?;
            }
        }
        if let Some(record) = old_record {
            let idx = StripeId(old.pos.offset);
            trans
                .ledger
                .record(&record.replicas_entry(), -record.parity_sectors());
            for block in 0..record.nr_blocks() {
                self.alloc_stripe_ref(trans, idx, record, block, true)?;
            }
        }
        Ok(())
    }

    /// Link or unlink one stripe block's bucket; parity blocks also gain or
    /// lose the block's sectors.
    fn alloc_stripe_ref(
        &self,
        trans: &mut Transaction<'_>,
        idx: StripeId,
        record: &StripeRecord,
        block: usize,
        deleting: bool,
    ) -> Result<()> {
        let Some(ptr) = record.ptrs.get(block).copied() else {
            return Ok(());
        };
        let mut alloc = self.start_alloc_update(trans, ptr.dev, ptr.bucket)?;

        if deleting {
            alloc.stripe = None;
            alloc.stripe_redundancy = 0;
        } else {
            if let Some(existing) = alloc.stripe.filter(|s| *s != idx) {
                return Err(self.fail(MarkError::MultipleStripes {
                    dev: ptr.dev,
                    bucket: ptr.bucket,
                    generation: alloc.generation,
                    existing,
                    new: idx,
                }));
            }
            alloc.stripe = Some(idx);
            alloc.stripe_redundancy = record.nr_redundant;
        }

        if record.is_parity_block(block) {
            let sectors = if deleting {
                -i64::from(record.sectors)
            } else {
                i64::from(record.sectors)
            };
            check_bucket_ref(&ptr, sectors, DataType::Parity, &alloc.as_mark())
                .map_err(|e| self.fail(e))?;
            let total = i64::from(alloc.dirty_sectors) + sectors;
            alloc.dirty_sectors = u16::try_from(total).unwrap_or(0);
            alloc.data_type = if alloc.dirty_sectors == 0 {
                DataType::None
            } else {
                DataType::Parity
            };
        }

        trans.put_update(TreeId::Alloc, Key::alloc(ptr.dev, ptr.bucket, alloc));
        Ok(())
    }

    /// Adjust the reference counts of every indirect extent `p` covers.
    fn mark_reflink_p(
        &self,
        trans: &mut Transaction<'_>,
        p: &Key,
        target: u64,
        offset: u32,
        sectors: i64,
        flags: TriggerFlags,
    ) -> Result<()> {
        let overwrite = flags.contains(TriggerFlags::OVERWRITE);
        let mut idx = target + u64::from(offset);
        let mut remaining = sectors.unsigned_abs();
        assert!(
            u64::from(offset) + remaining <= u64::from(p.size),
            "reflink marking of {remaining} sectors at {offset} past {p:?}"
        );

        while remaining > 0 {
            let found = trans.lookup(TreeId::Reflink, Pos::new(0, idx))?;
            let Some(mut indirect) = found.filter(|k| k.refcount().is_some()) else {
                return Err(self.fail(MarkError::NonexistentIndirect {
                    pos: p.pos,
                    size: p.size,
                    idx,
                }));
            };
            // Overwrites of a partial span leave the refcount alone.
            if overwrite
                && (indirect.start_offset() < idx || indirect.pos.offset > idx + remaining)
            {
                break;
            }

            if let Some(refcount) = indirect.refcount_mut() {
                *refcount = if overwrite {
                    refcount
                        .checked_sub(1)
                        .ok_or_else(|| self.fail(MarkError::RefcountUnderflow { idx }))?
                } else {
                    *refcount + 1
                };
                if *refcount == 0 {
                    indirect.value = KeyValue::Deleted;
                }
            }

            let step = (indirect.pos.offset - idx).min(remaining);
            trans.put_update(TreeId::Reflink, indirect);
            idx += step;
            remaining -= step;
        }
        Ok(())
    }

    /// Set semantics: the bucket ends up holding exactly `sectors`.
    fn mark_metadata_bucket(
        &self,
        trans: &mut Transaction<'_>,
        dev: DeviceIndex,
        bucket: BucketNumber,
        data_type: DataType,
        sectors: u32,
    ) -> Result<()> {
        let bucket_size = self
            .state
            .devices
            .get(dev_slot(dev))
            .map(|d| d.bucket_size)
            .ok_or_else(|| self.fail(MarkError::NoDevice(dev)))?;
        let mut record = self.start_alloc_update(trans, dev, bucket)?;

        if record.data_type != DataType::None && record.data_type != data_type {
            return Err(self.fail(MarkError::MetadataCollision {
                dev,
                bucket,
                generation: record.generation,
                existing: record.data_type,
                new: data_type,
            }));
        }
        if sectors > bucket_size {
            return Err(self.fail(MarkError::MetadataOverflow {
                dev,
                bucket,
                generation: record.generation,
                data_type,
                sectors: u64::from(sectors),
                limit: u64::from(bucket_size),
            }));
        }
        let sectors = ffs_types::sectors_to_u16(u64::from(sectors), "metadata sectors")
            .map_err(|e| parse_error_to_ffs(&e))?;
        if record.data_type == data_type && record.dirty_sectors == sectors {
            return Ok(());
        }
        record.data_type = data_type;
        record.dirty_sectors = sectors;
        trans.put_update(TreeId::Alloc, Key::alloc(dev, bucket, record));
        Ok(())
    }
}
