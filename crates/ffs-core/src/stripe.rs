//! In-memory stripe table and the reclaim-priority collaborator.

use crate::errors::MarkError;
use crate::keys::StripeRecord;
use ffs_types::StripeId;
use ffs_usage::ReplicasEntry;
use std::collections::BTreeMap;

/// Live state of one erasure-coding group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeState {
    pub alive: bool,
    /// Sectors per block.
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_blocks: u8,
    pub nr_redundant: u8,
    /// Blocks with at least one live sector.
    pub blocks_nonempty: u8,
    pub block_sectors: Vec<u32>,
    /// Parity overhead configuration.
    pub replicas: ReplicasEntry,
}

impl StripeState {
    /// State for a freshly inserted record, block counts taken from it.
    #[must_use]
    pub fn from_record(record: &StripeRecord) -> Self {
        #[expect(clippy::cast_possible_truncation)] // validated <= STRIPE_BLOCKS_MAX
        let nr_blocks = record.nr_blocks() as u8;
        let mut state = Self {
            alive: true,
            sectors: record.sectors,
            algorithm: record.algorithm,
            nr_blocks,
            nr_redundant: record.nr_redundant,
            blocks_nonempty: 0,
            block_sectors: record.block_sectors.iter().map(|s| u32::from(*s)).collect(),
            replicas: record.replicas_entry(),
        };
        state.recount();
        state
    }

    /// Forget every block count; the scan rebuilds them from extents.
    pub fn clear_block_counts(&mut self) {
        self.block_sectors.iter_mut().for_each(|s| *s = 0);
        self.blocks_nonempty = 0;
    }

    /// Take block counts from `prev` when the block layout is the same,
    /// otherwise start from zero.
    pub fn carry_block_counts(&mut self, prev: &Self) {
        if prev.block_sectors.len() == self.block_sectors.len() {
            self.block_sectors.clone_from(&prev.block_sectors);
            self.recount();
        } else {
            self.clear_block_counts();
        }
    }

    /// Adjust block `block`'s live sectors. Returns whether the nonempty
    /// block count changed.
    pub fn add_block_sectors(
        &mut self,
        idx: StripeId,
        block: u8,
        delta: i64,
    ) -> Result<bool, MarkError> {
        let Some(slot) = self.block_sectors.get_mut(usize::from(block)) else {
            return Err(MarkError::StripePtrMismatch { idx, block });
        };
        let current = *slot;
        *slot = u32::try_from(i64::from(current) + delta).map_err(|_| {
            MarkError::StripeBlockRange {
                idx,
                block,
                current,
                delta,
            }
        })?;
        let before = self.blocks_nonempty;
        self.recount();
        Ok(before != self.blocks_nonempty)
    }

    /// Total parity sectors charged to the group.
    #[must_use]
    pub fn parity_sectors(&self) -> i64 {
        i64::from(self.sectors) * i64::from(self.nr_redundant)
    }

    fn recount(&mut self) {
        #[expect(clippy::cast_possible_truncation)] // at most STRIPE_BLOCKS_MAX blocks
        let nonempty = self.block_sectors.iter().filter(|s| **s != 0).count() as u8;
        self.blocks_nonempty = nonempty;
    }
}

/// Stripes by id.
pub type StripeTable = BTreeMap<StripeId, StripeState>;

/// Reclaim-priority structure owned by the erasure-coding layer. Stripes
/// with fewer nonempty blocks are reclaimed first.
pub trait StripeHeap: Send + Sync {
    fn update(&self, idx: StripeId, blocks_nonempty: u8);
    fn remove(&self, idx: StripeId);
}

/// Heap for configurations without erasure coding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStripeHeap;

impl StripeHeap for NullStripeHeap {
    fn update(&self, _idx: StripeId, _blocks_nonempty: u8) {}

    fn remove(&self, _idx: StripeId) {}
}
