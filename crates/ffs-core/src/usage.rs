//! Usage snapshots, mount-time initialization, and journal replay of usage.

use crate::report::{DevUsageReport, UsageReport};
use crate::{BucketFs, MarkState};
use ffs_error::{FfsError, Result};
use ffs_types::{DataType, DeviceIndex, REPLICAS_MAX};
use ffs_usage::{
    DevUsage, FsCounter, FsUsage, FsUsageShort, ReplicasEntry, UsageAccumulator,
};
use tracing::{debug, info};

impl MarkState {
    pub(crate) fn usage_snapshot(&self) -> FsUsage {
        FsUsage::from_raw(&self.live.fs_usage.snapshot())
    }

    pub(crate) fn read_short(&self) -> FsUsageShort {
        let u = self.usage_snapshot();
        FsUsageShort::compute(
            self.capacity(),
            u.hidden,
            u.data.saturating_add(u.btree),
            u.reserved.saturating_add(u.online_reserved),
            u.nr_inodes,
        )
    }

    fn dev_usage(&self, dev: DeviceIndex) -> Result<DevUsage> {
        self.live
            .dev_usage
            .get(crate::dev_slot(dev))
            .map(|acc| DevUsage::from_raw(&acc.snapshot()))
            .ok_or_else(|| FfsError::NotFound(format!("device {dev}")))
    }
}

impl BucketFs {
    /// Consistent copy of live filesystem usage.
    #[must_use]
    pub fn usage_snapshot(&self) -> FsUsage {
        self.mark_lock.read().usage_snapshot()
    }

    /// Capacity, used, and free sectors, with hidden space carved out of
    /// capacity and reservations inflated by the reserve factor.
    #[must_use]
    pub fn usage_read_short(&self) -> FsUsageShort {
        self.mark_lock.read().read_short()
    }

    /// Sectors in use, reservations included, capped at capacity.
    #[must_use]
    pub fn sectors_used(&self) -> u64 {
        let state = self.mark_lock.read();
        state.usage_snapshot().sectors_used(state.capacity())
    }

    /// Consistent copy of one device's live usage.
    pub fn device_usage_snapshot(&self, dev: DeviceIndex) -> Result<DevUsage> {
        self.mark_lock.read().dev_usage(dev)
    }

    /// Derive the summary counters from the per-replicas counters, the
    /// persistent reservations, and the superblock and journal buckets.
    /// Run once replay and initial marking are done; running it again
    /// changes nothing.
    pub fn fs_usage_initialize(&self) -> FsUsage {
        let state = self.mark_lock.write();
        let acc = &state.live.fs_usage;
        acc.fold_all();
        let current = FsUsage::from_raw(&acc.snapshot());

        let reserved: u64 = current.persistent_reserved.iter().sum();
        let (mut btree, mut data, mut cached) = (0_u64, 0_u64, 0_u64);
        for (idx, entry) in state.replicas.iter() {
            let v = current.replicas.get(idx).copied().unwrap_or(0);
            match entry.data_type {
                DataType::Btree => btree += v,
                DataType::User | DataType::Parity => data += v,
                DataType::Cached => cached += v,
                DataType::None | DataType::Sb | DataType::Journal => {}
            }
        }

        let mut hidden = 0_u64;
        for (slot, config) in state.devices.iter().enumerate() {
            let Some(dev) = state.live.dev_usage.get(slot) else {
                continue;
            };
            let u = DevUsage::from_raw(&dev.snapshot());
            let buckets = u.of(DataType::Sb).buckets + u.of(DataType::Journal).buckets;
            hidden += buckets * u64::from(config.bucket_size);
        }

        set_base(acc, FsCounter::Reserved, current.reserved, reserved);
        set_base(acc, FsCounter::Btree, current.btree, btree);
        set_base(acc, FsCounter::Data, current.data, data);
        set_base(acc, FsCounter::Cached, current.cached, cached);
        set_base(acc, FsCounter::Hidden, current.hidden, hidden);

        let usage = FsUsage::from_raw(&acc.snapshot());
        info!(
            target: "ffs::buckets",
            event = "usage_initialized",
            hidden = usage.hidden,
            btree = usage.btree,
            data = usage.data,
            cached = usage.cached,
            reserved = usage.reserved
        );
        usage
    }

    /// Load usage counters read back from the journal. Each value replaces
    /// the current one; unknown configurations are registered first.
    pub fn replay_usage(
        &self,
        entries: &[(ReplicasEntry, u64)],
        nr_inodes: u64,
        persistent_reserved: [u64; REPLICAS_MAX],
    ) {
        let slots: Vec<usize> = entries
            .iter()
            .map(|(e, _)| self.register_replicas(e.clone()))
            .collect();

        let state = self.mark_lock.write();
        let acc = &state.live.fs_usage;
        acc.fold_all();
        let current = FsUsage::from_raw(&acc.snapshot());

        for (slot, (_, v)) in slots.iter().zip(entries) {
            let have = current.replicas.get(*slot).copied().unwrap_or(0);
            set_base(acc, FsCounter::Replicas(*slot), have, *v);
        }
        set_base(acc, FsCounter::NrInodes, current.nr_inodes, nr_inodes);
        for (i, v) in persistent_reserved.iter().enumerate() {
            set_base(
                acc,
                FsCounter::PersistentReserved(i),
                current.persistent_reserved[i],
                *v,
            );
        }
        debug!(
            target: "ffs::buckets",
            event = "usage_replayed",
            entries = entries.len(),
            nr_inodes
        );
    }

    /// Human-readable filesystem usage.
    #[must_use]
    pub fn usage_report(&self) -> String {
        let state = self.mark_lock.read();
        UsageReport {
            usage: &state.usage_snapshot(),
            capacity: state.capacity(),
            replicas: &state.replicas,
        }
        .to_string()
    }

    /// Human-readable usage of one device.
    pub fn dev_usage_report(&self, dev: DeviceIndex) -> Result<String> {
        let state = self.mark_lock.read();
        let usage = state.dev_usage(dev)?;
        let config = state
            .device(dev)
            .map_err(|e| FfsError::NotFound(e.to_string()))?;
        Ok(DevUsageReport {
            dev,
            usage: &usage,
            config,
        }
        .to_string())
    }
}

fn set_base<C: ffs_usage::CounterLayout>(
    acc: &UsageAccumulator<C>,
    counter: C,
    have: u64,
    want: u64,
) {
    let delta = i128::from(want) - i128::from(have);
    if delta != 0 {
        acc.add_to_base(counter, i64::try_from(delta).unwrap_or(0));
    }
}
