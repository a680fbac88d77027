//! Atomic bucket cells and per-device bucket arrays.

use crate::BucketMark;
use ffs_types::{BucketGen, BucketNumber, StripeId};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tracing::trace;

/// How a mark update is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// Compare-and-swap until uncontended.
    Atomic,
    /// Plain store; caller guarantees no concurrent writer (replay, GC
    /// reconciliation under the exclusive mark lock).
    NoAtomic,
}

/// Auxiliary per-bucket fields maintained from allocation records.
///
/// These are not part of the packed mark and are not covered by its CAS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketAux {
    pub oldest_gen: BucketGen,
    pub gen_valid: bool,
    pub read_time: u64,
    pub write_time: u64,
    pub stripe: Option<StripeId>,
    pub stripe_redundancy: u8,
}

/// One bucket: the packed mark plus auxiliary state.
#[derive(Debug, Default)]
pub struct Bucket {
    mark: AtomicU64,
    oldest_gen: AtomicU8,
    gen_valid: AtomicBool,
    read_time: AtomicU64,
    write_time: AtomicU64,
    /// Stripe id plus one; zero means "no stripe".
    stripe: AtomicU64,
    stripe_redundancy: AtomicU8,
}

impl Bucket {
    #[must_use]
    pub fn mark(&self) -> BucketMark {
        BucketMark::from_cell(self.mark.load(Ordering::Acquire))
    }

    /// Overwrite the mark unconditionally.
    pub fn set_mark(&self, mark: BucketMark) {
        self.mark.store(mark.to_bits(), Ordering::Release);
    }

    #[must_use]
    pub fn aux(&self) -> BucketAux {
        let stripe = self.stripe.load(Ordering::Acquire);
        BucketAux {
            oldest_gen: BucketGen(self.oldest_gen.load(Ordering::Relaxed)),
            gen_valid: self.gen_valid.load(Ordering::Relaxed),
            read_time: self.read_time.load(Ordering::Relaxed),
            write_time: self.write_time.load(Ordering::Relaxed),
            stripe: stripe.checked_sub(1).map(StripeId),
            stripe_redundancy: self.stripe_redundancy.load(Ordering::Relaxed),
        }
    }

    pub fn set_aux(&self, aux: BucketAux) {
        self.oldest_gen.store(aux.oldest_gen.0, Ordering::Relaxed);
        self.gen_valid.store(aux.gen_valid, Ordering::Relaxed);
        self.read_time.store(aux.read_time, Ordering::Relaxed);
        self.write_time.store(aux.write_time, Ordering::Relaxed);
        self.set_stripe(aux.stripe, aux.stripe_redundancy);
    }

    pub fn set_stripe(&self, stripe: Option<StripeId>, redundancy: u8) {
        let raw = stripe.map_or(0, |id| id.0.saturating_add(1));
        self.stripe.store(raw, Ordering::Release);
        self.stripe_redundancy.store(redundancy, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stripe(&self) -> Option<StripeId> {
        self.stripe
            .load(Ordering::Acquire)
            .checked_sub(1)
            .map(StripeId)
    }

    pub fn set_gen_valid(&self) {
        self.gen_valid.store(true, Ordering::Relaxed);
    }
}

/// All buckets of one member device.
#[derive(Debug)]
pub struct BucketArray {
    first_bucket: u64,
    buckets: Box<[Bucket]>,
}

impl BucketArray {
    /// Zeroed array of `nbuckets` buckets; those below `first_bucket` exist
    /// but are never handed out.
    #[must_use]
    pub fn new(nbuckets: u64, first_bucket: u64) -> Self {
        let buckets = (0..nbuckets).map(|_| Bucket::default()).collect();
        Self {
            first_bucket,
            buckets,
        }
    }

    /// Copy of `self` grown or shrunk to `nbuckets`, preserving marks and
    /// auxiliary state of surviving buckets.
    #[must_use]
    pub fn resized(&self, nbuckets: u64) -> Self {
        let next = Self::new(nbuckets, self.first_bucket);
        for (src, dst) in self.buckets.iter().zip(next.buckets.iter()) {
            dst.set_mark(src.mark());
            dst.set_aux(src.aux());
        }
        next
    }

    #[must_use]
    pub fn nbuckets(&self) -> u64 {
        self.buckets.len() as u64
    }

    #[must_use]
    pub fn first_bucket(&self) -> u64 {
        self.first_bucket
    }

    #[must_use]
    pub fn get(&self, bucket: BucketNumber) -> Option<&Bucket> {
        usize::try_from(bucket.0)
            .ok()
            .and_then(|idx| self.buckets.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BucketNumber, &Bucket)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(idx, b)| (BucketNumber(idx as u64), b))
    }

    /// Apply `transform` to bucket `bucket`'s mark.
    ///
    /// The transform runs against a private copy of the current mark and
    /// may be re-run if another writer wins the race. It returns `Ok(true)`
    /// to publish, `Ok(false)` to leave the bucket untouched (the result is
    /// then `Ok(None)`), or an error which aborts without publishing.
    ///
    /// Returns the `(old, new)` pair that was installed.
    ///
    /// # Panics
    ///
    /// Panics if `bucket` is out of range; callers resolve pointers against
    /// device geometry first.
    pub fn try_update<E, F>(
        &self,
        bucket: BucketNumber,
        mode: UpdateMode,
        mut transform: F,
    ) -> Result<Option<(BucketMark, BucketMark)>, E>
    where
        F: FnMut(&mut BucketMark) -> Result<bool, E>,
    {
        let Some(cell) = self.get(bucket) else {
            panic!(
                "bucket {bucket} out of range (nbuckets {})",
                self.nbuckets()
            );
        };

        let mut current = cell.mark.load(Ordering::Acquire);
        loop {
            let old = BucketMark::from_cell(current);
            let mut new = old;
            if !transform(&mut new)? {
                return Ok(None);
            }
            let new_bits = new.to_bits();

            if mode == UpdateMode::NoAtomic {
                cell.mark.store(new_bits, Ordering::Release);
                return Ok(Some((old, new)));
            }

            match cell.mark.compare_exchange_weak(
                current,
                new_bits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(
                        target: "ffs::buckets",
                        event = "bucket_cas_commit",
                        bucket = bucket.0,
                        old = current,
                        new = new_bits
                    );
                    return Ok(Some((old, new)));
                }
                Err(observed) => {
                    trace!(
                        target: "ffs::buckets",
                        event = "bucket_cas_retry",
                        bucket = bucket.0,
                        expected = current,
                        observed
                    );
                    current = observed;
                }
            }
        }
    }

    /// Infallible form of [`BucketArray::try_update`] that always publishes.
    pub fn update<F>(
        &self,
        bucket: BucketNumber,
        mode: UpdateMode,
        mut transform: F,
    ) -> (BucketMark, BucketMark)
    where
        F: FnMut(&mut BucketMark),
    {
        let result = self.try_update::<std::convert::Infallible, _>(bucket, mode, |m| {
            transform(m);
            Ok(true)
        });
        match result {
            Ok(Some(pair)) => pair,
            Ok(None) => unreachable!("transform always publishes"),
            Err(never) => match never {},
        }
    }
}
