//! Text rendering of usage for status output.

use crate::config::DeviceConfig;
use ffs_types::{DataType, DeviceIndex};
use ffs_usage::{DevUsage, FsUsage, ReplicasRegistry};
use std::fmt;

/// Filesystem usage with one line per counter and one per replicas
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct UsageReport<'a> {
    pub usage: &'a FsUsage,
    pub capacity: u64,
    pub replicas: &'a ReplicasRegistry,
}

impl fmt::Display for UsageReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = self.usage;
        writeln!(f, "capacity:\t\t{}", self.capacity)?;
        writeln!(f, "hidden:\t\t\t{}", u.hidden)?;
        writeln!(f, "btree:\t\t\t{}", u.btree)?;
        writeln!(f, "data:\t\t\t{}", u.data)?;
        writeln!(f, "cached:\t\t\t{}", u.cached)?;
        writeln!(f, "reserved:\t\t{}", u.reserved)?;
        writeln!(f, "nr_inodes:\t\t{}", u.nr_inodes)?;
        writeln!(f, "online reserved:\t{}", u.online_reserved)?;

        for (i, reserved) in u.persistent_reserved.iter().enumerate() {
            writeln!(f, "{} replicas:", i + 1)?;
            writeln!(f, "\treserved:\t{reserved}")?;
        }
        for (idx, entry) in self.replicas.iter() {
            let sectors = u.replicas.get(idx).copied().unwrap_or(0);
            writeln!(f, "\t{entry}:\t{sectors}")?;
        }
        Ok(())
    }
}

/// Per-type bucket, sector, and fragmentation counts of one device.
#[derive(Debug, Clone, Copy)]
pub struct DevUsageReport<'a> {
    pub dev: DeviceIndex,
    pub usage: &'a DevUsage,
    pub config: &'a DeviceConfig,
}

impl fmt::Display for DevUsageReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let u = self.usage;
        writeln!(f, "device {}:\tbuckets\tsectors\tfragmented", self.dev)?;
        for ty in DataType::ALL {
            let d = u.of(ty);
            writeln!(f, "{ty}:\t\t{}\t{}\t{}", d.buckets, d.sectors, d.fragmented)?;
        }
        writeln!(f, "ec:\t\t{}", u.buckets_ec)?;
        writeln!(
            f,
            "available:\t{}",
            u.buckets_available(self.config.nbuckets, self.config.first_bucket)
        )?;
        writeln!(f, "capacity:\t{}", self.config.nbuckets)
    }
}

#[must_use]
pub fn usage_to_text(usage: &FsUsage, capacity: u64, replicas: &ReplicasRegistry) -> String {
    UsageReport {
        usage,
        capacity,
        replicas,
    }
    .to_string()
}

#[must_use]
pub fn dev_usage_to_text(dev: DeviceIndex, usage: &DevUsage, config: &DeviceConfig) -> String {
    DevUsageReport { dev, usage, config }.to_string()
}
