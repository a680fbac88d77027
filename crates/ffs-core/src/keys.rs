//! Stored entries as seen by the marking protocol.
//!
//! The on-disk key encoding is owned elsewhere; this module models only the
//! fields marking reads: positions and sizes, device pointers with their
//! compression ratios, allocation records, stripe records, and reference
//! counts on indirect extents.

use ffs_alloc::{BucketAux, BucketMark, PtrRef};
use ffs_types::{
    BucketGen, BucketNumber, DataType, DeviceIndex, ParseError, Pos, REPLICAS_MAX, STRIPE_BLOCKS_MAX,
    StripeId,
};
use ffs_usage::ReplicasEntry;
use serde::{Deserialize, Serialize};
use std::ops::BitOr;

// ── Trigger flags ───────────────────────────────────────────────────────────

/// Direction and mode of one marking call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TriggerFlags(u32);

impl TriggerFlags {
    pub const NONE: Self = Self(0);
    /// The new entry is being added.
    pub const INSERT: Self = Self(1 << 0);
    /// The old entry is being removed or trimmed.
    pub const OVERWRITE: Self = Self(1 << 1);
    /// The overwrite punches a hole in the middle of the old extent.
    pub const OVERWRITE_SPLIT: Self = Self(1 << 2);
    /// Mark into the consistency-scan shadow view.
    pub const GC: Self = Self(1 << 3);
    /// Publish marks with plain stores; no concurrent writer exists.
    pub const NOATOMIC: Self = Self(1 << 4);
    /// Allocation record written by bucket invalidation.
    pub const BUCKET_INVALIDATE: Self = Self(1 << 5);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Mode bits with the direction bits stripped.
    #[must_use]
    pub const fn modifiers(self) -> Self {
        self.difference(
            Self::INSERT
                .union(Self::OVERWRITE)
                .union(Self::OVERWRITE_SPLIT),
        )
    }
}

impl BitOr for TriggerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ── Pointers ────────────────────────────────────────────────────────────────

/// Compression descriptor of the region a pointer references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crc {
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Uncompressed sectors still referenced by the key.
    pub live_size: u32,
}

impl Crc {
    #[must_use]
    pub fn uncompressed(size: u32) -> Self {
        Self {
            compressed_size: size,
            uncompressed_size: size,
            live_size: size,
        }
    }
}

/// Erasure-coded pointer: block `block` of stripe `idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StripePtr {
    pub idx: StripeId,
    pub block: u8,
}

/// One device pointer of an extent, decoded together with its compression
/// descriptor and optional stripe membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPtr {
    pub ptr: PtrRef,
    pub crc: Crc,
    pub ec: Option<StripePtr>,
}

impl DecodedPtr {
    /// Dirty, uncompressed pointer covering `size` sectors.
    #[must_use]
    pub fn new(dev: DeviceIndex, bucket: BucketNumber, generation: BucketGen, size: u32) -> Self {
        Self {
            ptr: PtrRef {
                dev,
                bucket,
                generation,
                cached: false,
            },
            crc: Crc::uncompressed(size),
            ec: None,
        }
    }

    #[must_use]
    pub fn cached(mut self) -> Self {
        self.ptr.cached = true;
        self
    }

    #[must_use]
    pub fn with_crc(mut self, crc: Crc) -> Self {
        self.crc = crc;
        self
    }

    #[must_use]
    pub fn with_ec(mut self, idx: StripeId, block: u8) -> Self {
        self.ec = Some(StripePtr { idx, block });
        self
    }
}

// ── Allocation records ──────────────────────────────────────────────────────

/// Unpacked allocation record of one bucket.
///
/// Stored at `Pos { inode: dev, offset: bucket }`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRecord {
    pub generation: BucketGen,
    pub oldest_gen: BucketGen,
    pub data_type: DataType,
    pub dirty_sectors: u16,
    pub cached_sectors: u16,
    pub read_time: u64,
    pub write_time: u64,
    pub stripe: Option<StripeId>,
    pub stripe_redundancy: u8,
}

impl AllocRecord {
    /// Record reflecting the in-memory state of a bucket.
    #[must_use]
    pub fn from_bucket(mark: BucketMark, aux: BucketAux) -> Self {
        Self {
            generation: mark.generation,
            oldest_gen: aux.oldest_gen,
            data_type: mark.data_type,
            dirty_sectors: mark.dirty_sectors,
            cached_sectors: mark.cached_sectors,
            read_time: aux.read_time,
            write_time: aux.write_time,
            stripe: aux.stripe,
            stripe_redundancy: aux.stripe_redundancy,
        }
    }

    /// The mark fields this record carries.
    #[must_use]
    pub fn as_mark(&self) -> BucketMark {
        BucketMark {
            generation: self.generation,
            data_type: self.data_type,
            dirty_sectors: self.dirty_sectors,
            cached_sectors: self.cached_sectors,
            stripe: self.stripe.is_some(),
            ..BucketMark::default()
        }
    }

    /// Copy sector counts and type back from a mark edited in place.
    pub fn absorb(&mut self, mark: &BucketMark) {
        self.data_type = mark.data_type;
        self.dirty_sectors = mark.dirty_sectors;
        self.cached_sectors = mark.cached_sectors;
    }

    #[must_use]
    pub fn aux(&self) -> BucketAux {
        BucketAux {
            oldest_gen: self.oldest_gen,
            gen_valid: true,
            read_time: self.read_time,
            write_time: self.write_time,
            stripe: self.stripe,
            stripe_redundancy: self.stripe_redundancy,
        }
    }
}

// ── Stripe records ──────────────────────────────────────────────────────────

/// Erasure-coding group as stored: one pointer per block, the trailing
/// `nr_redundant` blocks holding parity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeRecord {
    /// Sectors per block.
    pub sectors: u16,
    pub algorithm: u8,
    pub nr_redundant: u8,
    pub ptrs: Vec<PtrRef>,
    /// Live sectors per block.
    pub block_sectors: Vec<u16>,
}

impl StripeRecord {
    /// Record with every block count zero.
    #[must_use]
    pub fn new(sectors: u16, nr_redundant: u8, ptrs: Vec<PtrRef>) -> Self {
        let block_sectors = vec![0; ptrs.len()];
        Self {
            sectors,
            algorithm: 0,
            nr_redundant,
            ptrs,
            block_sectors,
        }
    }

    #[must_use]
    pub fn nr_blocks(&self) -> usize {
        self.ptrs.len()
    }

    #[must_use]
    pub fn nr_data(&self) -> usize {
        self.ptrs.len().saturating_sub(usize::from(self.nr_redundant))
    }

    #[must_use]
    pub fn is_parity_block(&self, block: usize) -> bool {
        block >= self.nr_data()
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.ptrs.is_empty() || self.ptrs.len() > STRIPE_BLOCKS_MAX {
            return Err(ParseError::InvalidField {
                field: "stripe.nr_blocks",
                reason: "block count out of range",
            });
        }
        if usize::from(self.nr_redundant) >= self.ptrs.len() {
            return Err(ParseError::InvalidField {
                field: "stripe.nr_redundant",
                reason: "no data blocks left",
            });
        }
        if self.block_sectors.len() != self.ptrs.len() {
            return Err(ParseError::InvalidField {
                field: "stripe.block_sectors",
                reason: "one count per block required",
            });
        }
        Ok(())
    }

    /// Parity overhead configuration: every member device, data blocks
    /// required.
    #[must_use]
    pub fn replicas_entry(&self) -> ReplicasEntry {
        let devs: Vec<DeviceIndex> = self.ptrs.iter().map(|p| p.dev).collect();
        #[expect(clippy::cast_possible_truncation)] // nr_blocks <= STRIPE_BLOCKS_MAX
        let nr_required = self.nr_data() as u8;
        ReplicasEntry::new(DataType::Parity, nr_required, &devs)
    }

    /// `p` names a block of this stripe and points where that block lives.
    #[must_use]
    pub fn matches_ptr(&self, p: &DecodedPtr) -> bool {
        let Some(ec) = p.ec else {
            return false;
        };
        self.ptrs.get(usize::from(ec.block)).is_some_and(|block| {
            block.dev == p.ptr.dev
                && block.bucket == p.ptr.bucket
                && block.generation == p.ptr.generation
        })
    }

    /// Same block layout; only block counts may differ.
    #[must_use]
    pub fn same_pointers(&self, other: &Self) -> bool {
        self.nr_redundant == other.nr_redundant && self.ptrs == other.ptrs
    }

    /// Total parity sectors: `sectors * nr_redundant`.
    #[must_use]
    pub fn parity_sectors(&self) -> i64 {
        i64::from(self.sectors) * i64::from(self.nr_redundant)
    }
}

// ── Keys ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    Deleted,
    Alloc(AllocRecord),
    BtreePtr { ptrs: Vec<DecodedPtr> },
    Extent { ptrs: Vec<DecodedPtr> },
    ReflinkV { refcount: u64, ptrs: Vec<DecodedPtr> },
    IndirectInlineData { refcount: u64 },
    ReflinkP { idx: u64 },
    Stripe(StripeRecord),
    Inode,
    Reservation { nr_replicas: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Deleted,
    Alloc,
    BtreePtr,
    Extent,
    ReflinkV,
    IndirectInlineData,
    ReflinkP,
    Stripe,
    Inode,
    Reservation,
}

impl KeyKind {
    /// Kinds whose trigger reads both sides of an update in a single call.
    /// Everything else is marked as an insert of the new entry followed by
    /// an overwrite of the old one.
    #[must_use]
    pub fn wants_old_and_new(self) -> bool {
        matches!(self, Self::Alloc | Self::Stripe | Self::Inode)
    }
}

#[expect(clippy::cast_possible_truncation)] // REPLICAS_MAX is 4
const REPLICAS_MAX_U8: u8 = REPLICAS_MAX as u8;

/// Replica count a reservation is charged under, clamped to `1..=REPLICAS_MAX`.
#[must_use]
pub fn reservation_replicas(nr_replicas: u8) -> u8 {
    nr_replicas.clamp(1, REPLICAS_MAX_U8)
}

/// A stored entry. For extent-like keys `pos.offset` is the end of the
/// range and `size` its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub pos: Pos,
    pub size: u32,
    pub value: KeyValue,
}

/// Placeholder for "no entry" on the old side of a pure insert.
pub(crate) static DELETED_KEY: Key = Key {
    pos: Pos::MIN,
    size: 0,
    value: KeyValue::Deleted,
};

impl Key {
    #[must_use]
    pub fn new(pos: Pos, size: u32, value: KeyValue) -> Self {
        Self { pos, size, value }
    }

    #[must_use]
    pub fn deleted(pos: Pos) -> Self {
        Self::new(pos, 0, KeyValue::Deleted)
    }

    /// Allocation record key for `bucket` on `dev`.
    #[must_use]
    pub fn alloc(dev: DeviceIndex, bucket: BucketNumber, record: AllocRecord) -> Self {
        Self::new(
            Pos::new(u64::from(dev.0), bucket.0),
            0,
            KeyValue::Alloc(record),
        )
    }

    /// Stripe record key for stripe `idx`.
    #[must_use]
    pub fn stripe(idx: StripeId, record: StripeRecord) -> Self {
        Self::new(Pos::new(0, idx.0), 0, KeyValue::Stripe(record))
    }

    /// Extent covering `[end - size, end)` of `inode`.
    #[must_use]
    pub fn extent(inode: u64, end: u64, size: u32, ptrs: Vec<DecodedPtr>) -> Self {
        Self::new(Pos::new(inode, end), size, KeyValue::Extent { ptrs })
    }

    #[must_use]
    pub fn kind(&self) -> KeyKind {
        match &self.value {
            KeyValue::Deleted => KeyKind::Deleted,
            KeyValue::Alloc(_) => KeyKind::Alloc,
            KeyValue::BtreePtr { .. } => KeyKind::BtreePtr,
            KeyValue::Extent { .. } => KeyKind::Extent,
            KeyValue::ReflinkV { .. } => KeyKind::ReflinkV,
            KeyValue::IndirectInlineData { .. } => KeyKind::IndirectInlineData,
            KeyValue::ReflinkP { .. } => KeyKind::ReflinkP,
            KeyValue::Stripe(_) => KeyKind::Stripe,
            KeyValue::Inode => KeyKind::Inode,
            KeyValue::Reservation { .. } => KeyKind::Reservation,
        }
    }

    #[must_use]
    pub fn start_offset(&self) -> u64 {
        self.pos.offset.saturating_sub(u64::from(self.size))
    }

    #[must_use]
    pub fn start_pos(&self) -> Pos {
        Pos::new(self.pos.inode, self.start_offset())
    }

    /// Device pointers, for keys that carry them.
    #[must_use]
    pub fn ptrs(&self) -> &[DecodedPtr] {
        match &self.value {
            KeyValue::BtreePtr { ptrs }
            | KeyValue::Extent { ptrs }
            | KeyValue::ReflinkV { ptrs, .. } => ptrs,
            _ => &[],
        }
    }

    /// Keys whose marking walks a pointer set.
    #[must_use]
    pub fn is_extent_like(&self) -> bool {
        matches!(
            self.value,
            KeyValue::BtreePtr { .. } | KeyValue::Extent { .. } | KeyValue::ReflinkV { .. }
        )
    }

    #[must_use]
    pub fn refcount(&self) -> Option<u64> {
        match self.value {
            KeyValue::ReflinkV { refcount, .. } | KeyValue::IndirectInlineData { refcount } => {
                Some(refcount)
            }
            _ => None,
        }
    }

    pub(crate) fn refcount_mut(&mut self) -> Option<&mut u64> {
        match &mut self.value {
            KeyValue::ReflinkV { refcount, .. } | KeyValue::IndirectInlineData { refcount } => {
                Some(refcount)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_stripe(&self) -> Option<&StripeRecord> {
        match &self.value {
            KeyValue::Stripe(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_alloc(&self) -> Option<&AllocRecord> {
        match &self.value {
            KeyValue::Alloc(a) => Some(a),
            _ => None,
        }
    }
}

// ── Extent overlap ──────────────────────────────────────────────────────────

/// How a new extent overlaps an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtentOverlap {
    /// New covers old entirely.
    All,
    /// New covers the back of old.
    Back,
    /// New covers the front of old.
    Front,
    /// New sits strictly inside old, splitting it.
    Middle,
}

/// Classify the overlap of `new` over `old`. Callers guarantee the two
/// ranges intersect.
#[must_use]
pub fn extent_overlap(new: &Key, old: &Key) -> ExtentOverlap {
    let ends_before = new.pos < old.pos;
    let starts_after = new.start_pos() > old.start_pos();
    match (ends_before, starts_after) {
        (false, false) => ExtentOverlap::All,
        (false, true) => ExtentOverlap::Back,
        (true, false) => ExtentOverlap::Front,
        (true, true) => ExtentOverlap::Middle,
    }
}

/// `(offset, sectors, extra_flags)` of the overwrite trigger for `old`.
///
/// `sectors` is always negative; its magnitude never exceeds `old.size`.
#[must_use]
pub fn overwrite_delta(new: &Key, old: &Key) -> (u32, i64, TriggerFlags) {
    let new_start = new.start_offset();
    let old_start = old.start_offset();
    let offset_in_old = || {
        u32::try_from(new_start - old_start).unwrap_or(u32::MAX)
    };
    let (offset, sectors, flags) = match extent_overlap(new, old) {
        ExtentOverlap::All => (0, -i64::from(old.size), TriggerFlags::NONE),
        ExtentOverlap::Back => (
            offset_in_old(),
            signed_diff(new_start, old.pos.offset),
            TriggerFlags::NONE,
        ),
        ExtentOverlap::Front => (
            0,
            signed_diff(old_start, new.pos.offset),
            TriggerFlags::NONE,
        ),
        ExtentOverlap::Middle => (
            offset_in_old(),
            -i64::from(new.size),
            TriggerFlags::OVERWRITE_SPLIT,
        ),
    };
    assert!(sectors < 0, "overwrite of {old:?} by {new:?} removes nothing");
    (offset, sectors, flags)
}

/// Old entries of `overlapping` (in key order) that `new` overwrites, each
/// with its `(offset, sectors, extra_flags)`. Stops at the first entry that
/// starts at or after the end of `new`.
pub(crate) fn overwritten<'a>(
    new: &'a Key,
    overlapping: &'a [Key],
) -> impl Iterator<Item = (&'a Key, u32, i64, TriggerFlags)> + 'a {
    overlapping
        .iter()
        .filter(move |old| old.size > 0 && old.pos > new.start_pos())
        .take_while(move |old| new.pos > old.start_pos())
        .map(move |old| {
            let (offset, sectors, flags) = overwrite_delta(new, old);
            (old, offset, sectors, flags)
        })
}

#[expect(clippy::cast_possible_wrap)] // extent offsets are far below i64::MAX
fn signed_diff(a: u64, b: u64) -> i64 {
    (a as i64) - (b as i64)
}

// ── Disk sector deltas ──────────────────────────────────────────────────────

fn disk_sectors_scaled(n: u32, d: u32, sectors: u64) -> i64 {
    let scaled = (u128::from(sectors) * u128::from(n)).div_ceil(u128::from(d));
    i64::try_from(scaled).unwrap_or(i64::MAX)
}

/// On-disk sector change for one pointer when `delta` uncompressed sectors
/// are added or removed at `offset` within the referenced region.
///
/// Compressed regions are charged by ratio, rounding up, and a region that
/// is split in two keeps paying for both surviving pieces.
#[must_use]
pub fn ptr_disk_sectors_delta(crc: &Crc, offset: u32, delta: i64, flags: TriggerFlags) -> i64 {
    let (n, d) = (crc.compressed_size, crc.uncompressed_size);
    assert!(n != 0 && d != 0, "pointer with empty compression region");

    let old_size = u64::from(crc.live_size);
    let offset = u64::from(offset);

    if flags.intersects(TriggerFlags::OVERWRITE | TriggerFlags::OVERWRITE_SPLIT) {
        assert!(delta <= 0, "overwrite adds {delta} sectors");
        let removed = delta.unsigned_abs();
        assert!(
            offset + removed <= old_size,
            "overwrite of {removed} sectors at {offset} past live size {old_size}"
        );
        if flags.contains(TriggerFlags::OVERWRITE_SPLIT) {
            -disk_sectors_scaled(n, d, old_size)
                + disk_sectors_scaled(n, d, offset)
                + disk_sectors_scaled(n, d, old_size - offset - removed)
        } else {
            -disk_sectors_scaled(n, d, old_size) + disk_sectors_scaled(n, d, old_size - removed)
        }
    } else {
        assert!(delta >= 0, "insert removes {delta} sectors");
        disk_sectors_scaled(n, d, delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(start: u64, end: u64) -> Key {
        Key::extent(1, end, u32::try_from(end - start).expect("size"), Vec::new())
    }

    #[test]
    fn flags_compose() {
        let f = TriggerFlags::INSERT | TriggerFlags::GC;
        assert!(f.contains(TriggerFlags::INSERT));
        assert!(!f.contains(TriggerFlags::INSERT | TriggerFlags::OVERWRITE));
        assert!(f.intersects(TriggerFlags::INSERT | TriggerFlags::OVERWRITE));
        assert_eq!(f.modifiers(), TriggerFlags::GC);
    }

    #[test]
    fn overlap_classes() {
        let old = ext(10, 20);
        assert_eq!(extent_overlap(&ext(5, 25), &old), ExtentOverlap::All);
        assert_eq!(extent_overlap(&ext(10, 20), &old), ExtentOverlap::All);
        assert_eq!(extent_overlap(&ext(15, 25), &old), ExtentOverlap::Back);
        assert_eq!(extent_overlap(&ext(5, 15), &old), ExtentOverlap::Front);
        assert_eq!(extent_overlap(&ext(12, 18), &old), ExtentOverlap::Middle);
    }

    #[test]
    fn overwrite_deltas_per_class() {
        let old = ext(10, 20);
        assert_eq!(overwrite_delta(&ext(0, 30), &old), (0, -10, TriggerFlags::NONE));
        assert_eq!(overwrite_delta(&ext(15, 30), &old), (5, -5, TriggerFlags::NONE));
        assert_eq!(overwrite_delta(&ext(0, 13), &old), (0, -3, TriggerFlags::NONE));
        assert_eq!(
            overwrite_delta(&ext(12, 18), &old),
            (2, -6, TriggerFlags::OVERWRITE_SPLIT)
        );
    }

    #[test]
    fn overwrite_never_exceeds_old_length() {
        let old = ext(100, 164);
        for start in 90..170_u64 {
            for end in (start + 1)..180 {
                if end <= 100 || start >= 164 {
                    continue;
                }
                let (_, sectors, _) = overwrite_delta(&ext(start, end), &old);
                assert!(sectors < 0);
                assert!(sectors.unsigned_abs() <= u64::from(old.size));
            }
        }
    }

    #[test]
    fn uncompressed_deltas_are_exact() {
        let crc = Crc::uncompressed(100);
        assert_eq!(ptr_disk_sectors_delta(&crc, 0, 100, TriggerFlags::INSERT), 100);
        assert_eq!(ptr_disk_sectors_delta(&crc, 0, -100, TriggerFlags::OVERWRITE), -100);
        assert_eq!(ptr_disk_sectors_delta(&crc, 40, -60, TriggerFlags::OVERWRITE), -60);
        assert_eq!(
            ptr_disk_sectors_delta(
                &crc,
                20,
                -30,
                TriggerFlags::OVERWRITE | TriggerFlags::OVERWRITE_SPLIT
            ),
            -30
        );
    }

    #[test]
    fn compressed_split_keeps_both_pieces() {
        // 128 uncompressed sectors stored in 32.
        let crc = Crc {
            compressed_size: 32,
            uncompressed_size: 128,
            live_size: 128,
        };
        assert_eq!(ptr_disk_sectors_delta(&crc, 0, 128, TriggerFlags::INSERT), 32);
        // Dropping the whole thing releases all of it.
        assert_eq!(ptr_disk_sectors_delta(&crc, 0, -128, TriggerFlags::OVERWRITE), -32);
        assert_eq!(ptr_disk_sectors_delta(&crc, 0, -64, TriggerFlags::OVERWRITE), -16);
        // Two sectors punched from the middle: the rounded-up pieces (1 and
        // 31) still pay for the whole compressed region.
        let split = TriggerFlags::OVERWRITE | TriggerFlags::OVERWRITE_SPLIT;
        assert_eq!(ptr_disk_sectors_delta(&crc, 3, -2, split), 0);
    }

    #[test]
    #[should_panic(expected = "past live size")]
    fn overwrite_past_live_size_is_a_defect() {
        let crc = Crc::uncompressed(10);
        let _ = ptr_disk_sectors_delta(&crc, 8, -5, TriggerFlags::OVERWRITE);
    }

    #[test]
    fn stripe_record_validation() {
        let ptr = |dev: u32| PtrRef {
            dev: DeviceIndex(dev),
            bucket: BucketNumber(1),
            generation: BucketGen(0),
            cached: false,
        };
        let ok = StripeRecord::new(128, 1, (0..5).map(ptr).collect());
        ok.validate().expect("valid");
        assert_eq!(ok.nr_data(), 4);
        assert!(ok.is_parity_block(4));
        assert_eq!(ok.parity_sectors(), 128);
        assert_eq!(ok.replicas_entry().to_string(), "parity: 4/5 [0 1 2 3 4]");

        let bad = StripeRecord::new(128, 5, (0..5).map(ptr).collect());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn alloc_record_mirrors_mark() {
        let mark = BucketMark {
            generation: BucketGen(4),
            data_type: DataType::User,
            dirty_sectors: 12,
            ..BucketMark::default()
        };
        let rec = AllocRecord::from_bucket(mark, BucketAux::default());
        assert_eq!(rec.as_mark(), mark);
        assert!(rec.aux().gen_valid);
    }
}
