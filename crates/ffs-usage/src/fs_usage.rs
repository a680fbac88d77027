//! Filesystem-level usage counters, snapshots, and free-space derivation.

use crate::accumulator::{CounterLayout, UsageAcc};
use ffs_types::{DataType, REPLICAS_MAX, RESERVE_FACTOR};
use serde::{Deserialize, Serialize};

/// One filesystem usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsCounter {
    Hidden,
    Btree,
    Data,
    Cached,
    Reserved,
    NrInodes,
    OnlineReserved,
    /// Persistent reservations declared with `n + 1` replicas.
    PersistentReserved(usize),
    /// Sectors attributed to replicas registry slot `n`.
    Replicas(usize),
}

const PERSISTENT_BASE: usize = 7;
const REPLICAS_BASE: usize = PERSISTENT_BASE + REPLICAS_MAX;

impl CounterLayout for FsCounter {
    fn index(self) -> usize {
        match self {
            Self::Hidden => 0,
            Self::Btree => 1,
            Self::Data => 2,
            Self::Cached => 3,
            Self::Reserved => 4,
            Self::NrInodes => 5,
            Self::OnlineReserved => 6,
            Self::PersistentReserved(i) => {
                assert!(i < REPLICAS_MAX, "persistent reservation slot {i}");
                PERSISTENT_BASE + i
            }
            Self::Replicas(i) => REPLICAS_BASE + i,
        }
    }
}

/// Flat counter width for a registry holding `nr_replicas` entries.
#[must_use]
pub fn fs_usage_width(nr_replicas: usize) -> usize {
    REPLICAS_BASE + nr_replicas
}

/// Fold a replicas-attributed delta into the matching summary total.
pub fn data_type_to_base(acc: &mut impl UsageAcc<FsCounter>, data_type: DataType, sectors: i64) {
    match data_type {
        DataType::Btree => acc.add(FsCounter::Btree, sectors),
        DataType::User | DataType::Parity => acc.add(FsCounter::Data, sectors),
        DataType::Cached => acc.add(FsCounter::Cached, sectors),
        DataType::None | DataType::Sb | DataType::Journal => {}
    }
}

// ── Reserve factor ─────────────────────────────────────────────────────────

/// Inflate a reservation to cover fragmentation: `r + round_up(r, 64) / 64`.
#[must_use]
pub fn reserve_factor(r: u64) -> u64 {
    let unit = 1_u64 << RESERVE_FACTOR;
    r.saturating_add(r.div_ceil(unit))
}

/// Inverse of [`reserve_factor`]: `r * 64 / 65`.
#[must_use]
pub fn avail_factor(r: u64) -> u64 {
    let scaled = (u128::from(r) << RESERVE_FACTOR) / ((1_u128 << RESERVE_FACTOR) + 1);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

// ── Signed delta ───────────────────────────────────────────────────────────

/// A plain, non-shared usage delta in the filesystem counter layout.
///
/// Used as scratch space for immediate marking and as the transport for
/// commit-time usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsUsageDelta {
    counters: Vec<i64>,
}

impl FsUsageDelta {
    #[must_use]
    pub fn new(nr_replicas: usize) -> Self {
        Self {
            counters: vec![0; fs_usage_width(nr_replicas)],
        }
    }

    #[must_use]
    pub fn get(&self, counter: FsCounter) -> i64 {
        self.counters.get(counter.index()).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[i64] {
        &self.counters
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.counters.iter().all(|v| *v == 0)
    }

    /// Add every counter of `self` into `acc`.
    pub fn fold_into(&self, acc: &mut impl UsageAcc<FsCounter>) {
        for (idx, v) in self.counters.iter().enumerate() {
            if *v != 0 {
                acc.add(counter_at(idx), *v);
            }
        }
    }

    /// Add `other` (possibly of a narrower width) into `self`.
    pub fn merge(&mut self, other: &Self) {
        other.fold_into(self);
    }

    /// Negate every counter in place.
    pub fn negate(&mut self) {
        for v in &mut self.counters {
            *v = -*v;
        }
    }
}

impl UsageAcc<FsCounter> for FsUsageDelta {
    fn add(&mut self, counter: FsCounter, delta: i64) {
        let idx = counter.index();
        if idx >= self.counters.len() {
            self.counters.resize(idx + 1, 0);
        }
        self.counters[idx] += delta;
    }
}

fn counter_at(idx: usize) -> FsCounter {
    match idx {
        0 => FsCounter::Hidden,
        1 => FsCounter::Btree,
        2 => FsCounter::Data,
        3 => FsCounter::Cached,
        4 => FsCounter::Reserved,
        5 => FsCounter::NrInodes,
        6 => FsCounter::OnlineReserved,
        i if i < REPLICAS_BASE => FsCounter::PersistentReserved(i - PERSISTENT_BASE),
        i => FsCounter::Replicas(i - REPLICAS_BASE),
    }
}

// ── Snapshots ──────────────────────────────────────────────────────────────

/// Point-in-time filesystem usage totals, in sectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    pub hidden: u64,
    pub btree: u64,
    pub data: u64,
    pub cached: u64,
    pub reserved: u64,
    pub nr_inodes: u64,
    pub online_reserved: u64,
    pub persistent_reserved: [u64; REPLICAS_MAX],
    /// Indexed by replicas registry slot.
    pub replicas: Vec<u64>,
}

fn clamp(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

impl FsUsage {
    /// Decode a flat counter snapshot. Negative transients clamp to zero.
    #[must_use]
    pub fn from_raw(raw: &[i64]) -> Self {
        let at = |c: FsCounter| clamp(raw.get(c.index()).copied().unwrap_or(0));
        let mut persistent_reserved = [0_u64; REPLICAS_MAX];
        for (i, slot) in persistent_reserved.iter_mut().enumerate() {
            *slot = at(FsCounter::PersistentReserved(i));
        }
        Self {
            hidden: at(FsCounter::Hidden),
            btree: at(FsCounter::Btree),
            data: at(FsCounter::Data),
            cached: at(FsCounter::Cached),
            reserved: at(FsCounter::Reserved),
            nr_inodes: at(FsCounter::NrInodes),
            online_reserved: at(FsCounter::OnlineReserved),
            persistent_reserved,
            replicas: raw
                .iter()
                .skip(REPLICAS_BASE)
                .map(|v| clamp(*v))
                .collect(),
        }
    }

    /// Sectors in use including the reservation fudge, capped at capacity.
    #[must_use]
    pub fn sectors_used(&self, capacity: u64) -> u64 {
        let used = self
            .hidden
            .saturating_add(self.btree)
            .saturating_add(self.data)
            .saturating_add(reserve_factor(
                self.reserved.saturating_add(self.online_reserved),
            ));
        used.min(capacity)
    }
}

/// Compact free-space summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsageShort {
    pub capacity: u64,
    pub used: u64,
    pub free: u64,
    pub nr_inodes: u64,
}

impl FsUsageShort {
    /// Derive from raw totals. Hidden sectors are carved out of capacity.
    #[must_use]
    pub fn compute(capacity: u64, hidden: u64, data: u64, reserved: u64, nr_inodes: u64) -> Self {
        let capacity = capacity.saturating_sub(hidden);
        let used = capacity.min(data.saturating_add(reserve_factor(reserved)));
        Self {
            capacity,
            used,
            free: capacity - used,
            nr_inodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_factor_rounds_up_per_64() {
        assert_eq!(reserve_factor(0), 0);
        assert_eq!(reserve_factor(1), 2);
        assert_eq!(reserve_factor(64), 65);
        assert_eq!(reserve_factor(65), 67);
        assert_eq!(reserve_factor(1000), 1016);
    }

    #[test]
    fn avail_factor_inverts_reserve_factor() {
        assert_eq!(avail_factor(65), 64);
        assert_eq!(avail_factor(1524), 1500);
        assert_eq!(avail_factor(508), 500);
        for r in [0_u64, 64, 640, 64_000] {
            assert!(reserve_factor(avail_factor(r)) <= r + 1);
        }
        assert!(avail_factor(u64::MAX) < u64::MAX);
    }

    #[test]
    fn counter_indices_are_distinct() {
        let counters = [
            FsCounter::Hidden,
            FsCounter::Btree,
            FsCounter::Data,
            FsCounter::Cached,
            FsCounter::Reserved,
            FsCounter::NrInodes,
            FsCounter::OnlineReserved,
            FsCounter::PersistentReserved(0),
            FsCounter::PersistentReserved(3),
            FsCounter::Replicas(0),
            FsCounter::Replicas(5),
        ];
        let mut seen: Vec<usize> = counters.iter().map(|c| c.index()).collect();
        for (idx, c) in counters.iter().enumerate() {
            assert_eq!(counter_at(c.index()), *c, "slot {idx}");
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), counters.len());
    }

    #[test]
    fn data_types_map_to_summary_totals() {
        let mut d = FsUsageDelta::new(0);
        data_type_to_base(&mut d, DataType::Btree, 8);
        data_type_to_base(&mut d, DataType::User, 100);
        data_type_to_base(&mut d, DataType::Parity, 28);
        data_type_to_base(&mut d, DataType::Cached, 5);
        data_type_to_base(&mut d, DataType::Journal, 999);
        assert_eq!(d.get(FsCounter::Btree), 8);
        assert_eq!(d.get(FsCounter::Data), 128);
        assert_eq!(d.get(FsCounter::Cached), 5);
        assert_eq!(d.get(FsCounter::Hidden), 0);
    }

    #[test]
    fn delta_grows_for_new_replicas_slots() {
        let mut d = FsUsageDelta::new(1);
        d.add(FsCounter::Replicas(3), 12);
        assert_eq!(d.get(FsCounter::Replicas(3)), 12);
        let usage = FsUsage::from_raw(d.as_slice());
        assert_eq!(usage.replicas, vec![0, 0, 0, 12]);
    }

    #[test]
    fn merge_and_negate() {
        let mut a = FsUsageDelta::new(2);
        a.add(FsCounter::Data, 10);
        let mut b = FsUsageDelta::new(2);
        b.add(FsCounter::Data, 5);
        b.add(FsCounter::Replicas(1), 5);
        a.merge(&b);
        assert_eq!(a.get(FsCounter::Data), 15);
        a.negate();
        assert_eq!(a.get(FsCounter::Replicas(1)), -5);
        let mut undo = a.clone();
        undo.negate();
        a.merge(&undo);
        assert!(a.is_zero());
    }

    #[test]
    fn negative_transients_clamp_in_snapshot() {
        let mut d = FsUsageDelta::new(0);
        d.add(FsCounter::OnlineReserved, -4);
        assert_eq!(FsUsage::from_raw(d.as_slice()).online_reserved, 0);
    }

    #[test]
    fn short_usage_carves_out_hidden() {
        let short = FsUsageShort::compute(10_000, 1_000, 2_000, 1000, 3);
        assert_eq!(short.capacity, 9_000);
        assert_eq!(short.used, 3_016);
        assert_eq!(short.free, 5_984);
        assert_eq!(short.nr_inodes, 3);

        let full = FsUsageShort::compute(100, 0, 500, 0, 0);
        assert_eq!(full.used, 100);
        assert_eq!(full.free, 0);
    }

    #[test]
    fn snapshot_exports_as_json() {
        let usage = FsUsage {
            data: 300,
            persistent_reserved: [0, 64, 0, 0],
            replicas: vec![300],
            ..FsUsage::default()
        };
        let json = serde_json::to_value(&usage).expect("serialize");
        assert_eq!(json["data"], 300);
        assert_eq!(json["persistent_reserved"][1], 64);
        let back: FsUsage = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, usage);
    }

    #[test]
    fn sectors_used_caps_at_capacity() {
        let usage = FsUsage {
            hidden: 10,
            btree: 20,
            data: 30,
            reserved: 64,
            ..FsUsage::default()
        };
        assert_eq!(usage.sectors_used(1_000), 10 + 20 + 30 + 65);
        assert_eq!(usage.sectors_used(50), 50);
    }
}
