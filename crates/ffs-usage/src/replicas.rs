//! Replicas registry and the transaction-scoped delta ledger.
//!
//! Each distinct replication configuration (data type, required replica
//! count, device set) gets a stable slot in the registry; usage is charged
//! per slot. The ledger batches signed per-configuration deltas together
//! with inode and persistent-reservation deltas so a whole transaction can
//! be applied, or rejected, as one unit.

use crate::accumulator::UsageAcc;
use crate::fs_usage::{FsCounter, data_type_to_base};
use ffs_error::FfsError;
use ffs_types::{DataType, DeviceIndex, REPLICAS_MAX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::info;

/// One replication configuration. Devices are kept sorted and unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicasEntry {
    pub data_type: DataType,
    pub nr_required: u8,
    devs: Vec<DeviceIndex>,
}

impl ReplicasEntry {
    #[must_use]
    pub fn new(data_type: DataType, nr_required: u8, devs: &[DeviceIndex]) -> Self {
        let mut entry = Self {
            data_type,
            nr_required,
            devs: Vec::with_capacity(devs.len()),
        };
        for dev in devs {
            entry.push_dev(*dev);
        }
        entry
    }

    /// Empty configuration to be filled pointer by pointer.
    #[must_use]
    pub fn empty(data_type: DataType) -> Self {
        Self::new(data_type, 1, &[])
    }

    /// Single-device configuration used for cached copies.
    #[must_use]
    pub fn cached(dev: DeviceIndex) -> Self {
        Self::new(DataType::Cached, 1, &[dev])
    }

    pub fn push_dev(&mut self, dev: DeviceIndex) {
        if let Err(pos) = self.devs.binary_search(&dev) {
            self.devs.insert(pos, dev);
        }
    }

    #[must_use]
    pub fn devs(&self) -> &[DeviceIndex] {
        &self.devs
    }

    #[must_use]
    pub fn nr_devs(&self) -> usize {
        self.devs.len()
    }
}

impl fmt::Display for ReplicasEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} [",
            self.data_type,
            self.nr_required,
            self.devs.len()
        )?;
        for (i, dev) in self.devs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{dev}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicasError {
    #[error("no replicas entry for {0}")]
    NotFound(ReplicasEntry),
}

impl From<ReplicasError> for FfsError {
    fn from(err: ReplicasError) -> Self {
        Self::Inconsistency(err.to_string())
    }
}

// ── Registry ───────────────────────────────────────────────────────────────

/// Append-only mapping from configuration to stable slot.
#[derive(Debug, Clone, Default)]
pub struct ReplicasRegistry {
    entries: Vec<ReplicasEntry>,
    index: HashMap<ReplicasEntry, usize>,
}

impl ReplicasRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry_index(&self, entry: &ReplicasEntry) -> Option<usize> {
        self.index.get(entry).copied()
    }

    /// Resolve, or fail with [`ReplicasError::NotFound`].
    pub fn resolve(&self, entry: &ReplicasEntry) -> Result<usize, ReplicasError> {
        self.entry_index(entry)
            .ok_or_else(|| ReplicasError::NotFound(entry.clone()))
    }

    /// Register `entry`, returning its slot and whether it was new.
    pub fn register(&mut self, entry: ReplicasEntry) -> (usize, bool) {
        if let Some(idx) = self.entry_index(&entry) {
            return (idx, false);
        }
        let idx = self.entries.len();
        info!(target: "ffs::usage", event = "replicas_register", slot = idx, entry = %entry);
        self.index.insert(entry.clone(), idx);
        self.entries.push(entry);
        (idx, true)
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&ReplicasEntry> {
        self.entries.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ReplicasEntry)> {
        self.entries.iter().enumerate()
    }
}

/// Charge `sectors` to `entry`'s slot and its summary total.
pub fn update_replicas(
    registry: &ReplicasRegistry,
    acc: &mut impl UsageAcc<FsCounter>,
    entry: &ReplicasEntry,
    sectors: i64,
) -> Result<(), ReplicasError> {
    let idx = registry.resolve(entry)?;
    data_type_to_base(acc, entry.data_type, sectors);
    acc.add(FsCounter::Replicas(idx), sectors);
    Ok(())
}

/// Charge cached sectors on a single device.
pub fn update_cached_sectors(
    registry: &ReplicasRegistry,
    acc: &mut impl UsageAcc<FsCounter>,
    dev: DeviceIndex,
    sectors: i64,
) -> Result<(), ReplicasError> {
    update_replicas(registry, acc, &ReplicasEntry::cached(dev), sectors)
}

// ── Delta ledger ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicasDelta {
    pub entry: ReplicasEntry,
    pub sectors: i64,
}

const LEDGER_INITIAL: usize = 128;

/// Saved ledger position for rolling back a failed marking step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerMark {
    len: usize,
    nr_inodes: i64,
    persistent_reserved: [i64; REPLICAS_MAX],
}

/// Pending usage deltas owned by one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicasDeltaList {
    deltas: Vec<ReplicasDelta>,
    nr_inodes: i64,
    persistent_reserved: [i64; REPLICAS_MAX],
}

impl ReplicasDeltaList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta; zero deltas are dropped.
    pub fn record(&mut self, entry: &ReplicasEntry, sectors: i64) {
        if sectors == 0 {
            return;
        }
        self.grow(1);
        self.deltas.push(ReplicasDelta {
            entry: entry.clone(),
            sectors,
        });
    }

    /// Ensure room for `more` entries; storage grows to `(size + more) * 2`.
    fn grow(&mut self, more: usize) {
        let size = self.deltas.capacity();
        if self.deltas.len() + more <= size {
            return;
        }
        let target = if size == 0 {
            LEDGER_INITIAL
        } else {
            (size + more) * 2
        };
        self.deltas.reserve_exact(target - self.deltas.len());
    }

    pub fn add_inodes(&mut self, delta: i64) {
        self.nr_inodes += delta;
    }

    /// Record a persistent reservation declared with `replicas` copies.
    ///
    /// # Panics
    ///
    /// Panics if `replicas` is zero or above `REPLICAS_MAX`; callers clamp.
    pub fn add_persistent_reserved(&mut self, replicas: usize, sectors: i64) {
        assert!(
            (1..=REPLICAS_MAX).contains(&replicas),
            "replica count {replicas} out of range"
        );
        self.persistent_reserved[replicas - 1] += sectors;
    }

    #[must_use]
    pub fn deltas(&self) -> &[ReplicasDelta] {
        &self.deltas
    }

    #[must_use]
    pub fn nr_inodes(&self) -> i64 {
        self.nr_inodes
    }

    #[must_use]
    pub fn persistent_reserved(&self) -> &[i64; REPLICAS_MAX] {
        &self.persistent_reserved
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
            && self.nr_inodes == 0
            && self.persistent_reserved.iter().all(|v| *v == 0)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.deltas.capacity()
    }

    #[must_use]
    pub fn savepoint(&self) -> LedgerMark {
        LedgerMark {
            len: self.deltas.len(),
            nr_inodes: self.nr_inodes,
            persistent_reserved: self.persistent_reserved,
        }
    }

    pub fn rollback(&mut self, mark: LedgerMark) {
        self.deltas.truncate(mark.len);
        self.nr_inodes = mark.nr_inodes;
        self.persistent_reserved = mark.persistent_reserved;
    }

    /// Fold every delta into `acc` as one unit.
    ///
    /// If any entry is not registered, the entries already folded by this
    /// call are folded again negated and the failure is returned; `acc`
    /// then holds exactly what it held before.
    pub fn apply(
        &self,
        registry: &ReplicasRegistry,
        acc: &mut impl UsageAcc<FsCounter>,
    ) -> Result<(), ReplicasError> {
        for (done, d) in self.deltas.iter().enumerate() {
            if let Err(err) = update_replicas(registry, acc, &d.entry, d.sectors) {
                for undo in &self.deltas[..done] {
                    // Each of these resolved a moment ago.
                    let _ = update_replicas(registry, acc, &undo.entry, -undo.sectors);
                }
                return Err(err);
            }
        }

        acc.add(FsCounter::NrInodes, self.nr_inodes);
        for (i, sectors) in self.persistent_reserved.iter().enumerate() {
            acc.add(FsCounter::Reserved, *sectors);
            acc.add(FsCounter::PersistentReserved(i), *sectors);
        }
        Ok(())
    }

    /// Configurations the registry does not know yet.
    #[must_use]
    pub fn unregistered<'a>(&'a self, registry: &ReplicasRegistry) -> Vec<&'a ReplicasEntry> {
        let mut out: Vec<&ReplicasEntry> = self
            .deltas
            .iter()
            .map(|d| &d.entry)
            .filter(|e| registry.entry_index(e).is_none())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
