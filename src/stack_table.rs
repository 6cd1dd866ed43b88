//! StackTable: fixed-capacity, hash-indexed store of deduplicated call
//! stacks.
//!
//! The table holds one optional record per slot; a record's hash reduced
//! modulo the capacity *is* its slot index, and that index is the key
//! handed back to callers. There are no bucket chains: a collision is
//! resolved by caller policy (reject or overwrite), never by probing.
//! Slot reads are wait-free; insert and remove publish through a single
//! atomic swap and retire the displaced record through the epoch
//! reclamation scheme, so a concurrent reader holding a `Guard` keeps
//! whichever record it observed alive until its read window closes.

use crate::errors::Error;
use core::mem;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use log::debug;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::atomic::Ordering;

/// Upper bound on frames stored per record, matching the depth limit of
/// the capture collaborator.
pub const MAX_STACK_DEPTH: usize = 127;

/// Creation budget: total projected cost must stay below a 32-bit byte
/// count, less one page of slack.
const COST_BUDGET: u64 = u32::MAX as u64 - PAGE_SIZE;
const PAGE_SIZE: u64 = 4096;

/// Table sizing, validated at creation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TableConfig {
    /// Requested slot count; rounded up to the next power of two.
    pub max_entries: usize,
    /// Maximum frames kept per record, `1..=MAX_STACK_DEPTH`.
    pub max_depth: usize,
}

/// Per-call policy bits for `capture_and_insert`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CaptureFlags {
    /// Accept hash equality as record identity, skipping the full frame
    /// comparison. Distinct stacks whose hashes collide are then conflated
    /// into one slot; that false-positive risk is the documented price of
    /// the cheaper compare, not a bug.
    pub fast_compare: bool,
    /// Permit replacing a colliding resident record instead of failing
    /// with `AlreadyExists`.
    pub allow_overwrite: bool,
}

/// Immutable once published. Owned by exactly one slot at a time; readers
/// may hold references to a retired record until their guard drops.
struct StackRecord {
    hash: u32,
    len: u32,
    /// Always `max_depth` long; slots past `len` are zero.
    frames: Box<[u64]>,
}

impl StackRecord {
    fn try_new(hash: u32, effective: &[u64], max_depth: usize) -> Result<Self, Error> {
        let mut frames = Vec::new();
        frames
            .try_reserve_exact(max_depth)
            .map_err(|_| Error::ResourceExhausted)?;
        frames.extend_from_slice(effective);
        frames.resize(max_depth, 0);
        Ok(Self {
            hash,
            len: effective.len() as u32,
            frames: frames.into_boxed_slice(),
        })
    }

    fn frames(&self) -> &[u64] {
        &self.frames[..self.len as usize]
    }
}

/// Fixed-capacity dedup table for captured call stacks.
///
/// Iteration is intentionally unsupported: slots are addressed purely by
/// hash-derived index and have no meaningful total order, so there is no
/// stable "next key" to offer.
#[derive(Debug)]
pub struct StackTable<S = RandomState> {
    hasher: S,
    max_depth: usize,
    slots: Box<[Atomic<StackRecord>]>,
}

impl StackTable<RandomState> {
    /// Create a table with the default hasher.
    pub fn new(config: TableConfig) -> Result<Self, Error> {
        Self::with_hasher(config, RandomState::new())
    }
}

impl<S: BuildHasher> StackTable<S> {
    /// Create a table with an explicit hasher. The hasher only needs to be
    /// deterministic for the table's lifetime and well-mixing for
    /// stack-trace-sized inputs.
    pub fn with_hasher(config: TableConfig, hasher: S) -> Result<Self, Error> {
        if config.max_entries == 0 {
            return Err(Error::InvalidConfiguration);
        }
        if config.max_depth == 0 || config.max_depth > MAX_STACK_DEPTH {
            return Err(Error::InvalidConfiguration);
        }
        let capacity = config
            .max_entries
            .checked_next_power_of_two()
            .ok_or(Error::ResourceExhausted)?;
        let cost =
            projected_cost(capacity as u64, config.max_depth as u64).ok_or(Error::ResourceExhausted)?;
        if cost >= COST_BUDGET {
            return Err(Error::ResourceExhausted);
        }

        let slots: Box<[Atomic<StackRecord>]> =
            (0..capacity).map(|_| Atomic::null()).collect();
        debug!(
            "stack table created: capacity={} max_depth={} projected_cost={}B",
            capacity, config.max_depth, cost
        );
        Ok(Self {
            hasher,
            max_depth: config.max_depth,
            slots,
        })
    }

    /// Slot count after power-of-two round-up.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Maximum frames stored per record.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Deduplicate the captured stack `raw`, dropping `skip` leading
    /// frames, and return the slot index that now identifies it.
    ///
    /// At most one allocation and one deferred retirement per call; never
    /// blocks. Concurrent inserts to the same slot race benignly: the last
    /// swap wins and every displaced record is retired through the epoch
    /// scheme.
    pub fn capture_and_insert(
        &self,
        raw: &[u64],
        skip: usize,
        flags: CaptureFlags,
    ) -> Result<usize, Error> {
        if skip >= raw.len() {
            return Err(Error::InsufficientFrames);
        }
        let mut effective = &raw[skip..];
        if effective.len() > self.max_depth {
            effective = &effective[..self.max_depth];
        }

        let hash = self.hasher.hash_one(effective) as u32;
        let index = hash as usize & (self.capacity() - 1);

        let guard = epoch::pin();
        let current = self.slots[index].load(Ordering::Acquire, &guard);
        if let Some(resident) = unsafe { current.as_ref() } {
            if resident.hash == hash {
                if flags.fast_compare {
                    return Ok(index);
                }
                if resident.frames() == effective {
                    return Ok(index);
                }
            }
            if !flags.allow_overwrite {
                return Err(Error::AlreadyExists);
            }
        }

        let record = StackRecord::try_new(hash, effective, self.max_depth)?;
        let old = self.slots[index].swap(Owned::new(record), Ordering::Release, &guard);
        if !old.is_null() {
            // Safety: `old` was just unlinked from its slot under the
            // update above; no new reader can reach it.
            unsafe { guard.defer_destroy(old) };
        }
        Ok(index)
    }

    /// Read the frames stored at `index`. Out-of-range indices yield
    /// `None`; unknown keys are tolerated by contract.
    ///
    /// The returned view is valid only while `guard` is held. Callers must
    /// not retain it past their protected read window.
    pub fn lookup<'g>(&'g self, index: usize, guard: &'g Guard) -> Option<&'g [u64]> {
        let slot = self.slots.get(index)?;
        let shared = slot.load(Ordering::Acquire, guard);
        // Safety: a non-null record reached through a slot stays alive for
        // the lifetime of `guard`; retirement is deferred past it.
        unsafe { shared.as_ref() }.map(StackRecord::frames)
    }

    /// Atomically take ownership of the record at `index` and retire it.
    pub fn remove(&self, index: usize) -> Result<(), Error> {
        if index >= self.capacity() {
            return Err(Error::OutOfRange);
        }
        let guard = epoch::pin();
        let old = self.slots[index].swap(Shared::null(), Ordering::AcqRel, &guard);
        if old.is_null() {
            return Err(Error::NotFound);
        }
        // Safety: unlinked above; unreachable to new readers.
        unsafe { guard.defer_destroy(old) };
        Ok(())
    }
}

impl<S> Drop for StackTable<S> {
    /// Teardown. Exclusive access (`&mut self`) is the read barrier: no
    /// lookup can be in flight once drop begins, so every occupied slot is
    /// reclaimed directly.
    fn drop(&mut self) {
        // Safety: `&mut self` guarantees no concurrent reader; records
        // still pending epoch retirement are freed by the collector.
        let guard = unsafe { epoch::unprotected() };
        for slot in self.slots.iter() {
            let shared = slot.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(unsafe { shared.into_owned() });
            }
        }
    }
}

fn projected_cost(capacity: u64, max_depth: u64) -> Option<u64> {
    let slot_ptrs = capacity.checked_mul(mem::size_of::<Atomic<StackRecord>>() as u64)?;
    let record = (mem::size_of::<StackRecord>() as u64)
        .checked_add(max_depth.checked_mul(mem::size_of::<u64>() as u64)?)?;
    slot_ptrs.checked_add(capacity.checked_mul(record)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::{BuildHasher, Hasher};

    fn cfg(max_entries: usize, max_depth: usize) -> TableConfig {
        TableConfig {
            max_entries,
            max_depth,
        }
    }

    const OVERWRITE: CaptureFlags = CaptureFlags {
        fast_compare: false,
        allow_overwrite: true,
    };
    const FAST: CaptureFlags = CaptureFlags {
        fast_compare: true,
        allow_overwrite: false,
    };

    /// Hasher whose output is the last `u64` fed to it, i.e. the last
    /// frame of the hashed slice. Lets tests place stacks in known slots.
    #[derive(Clone, Default)]
    struct LastFrame;
    struct LastFrameHasher(u64);
    impl BuildHasher for LastFrame {
        type Hasher = LastFrameHasher;
        fn build_hasher(&self) -> LastFrameHasher {
            LastFrameHasher(0)
        }
    }
    impl Hasher for LastFrameHasher {
        fn write(&mut self, bytes: &[u8]) {
            // `Hash for [u64]` feeds the frames as one byte-slice write, so
            // take the trailing 8 bytes as the last frame.
            if bytes.len() >= 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[bytes.len() - 8..]);
                self.0 = u64::from_ne_bytes(buf);
            }
        }
        fn write_u64(&mut self, n: u64) {
            self.0 = n;
        }
        fn write_usize(&mut self, _n: usize) {}
        fn finish(&self) -> u64 {
            self.0
        }
    }

    /// Invariant: creation rejects zero capacity and out-of-bounds depth.
    #[test]
    fn creation_validates_configuration() {
        assert_eq!(
            StackTable::new(cfg(0, 8)).err(),
            Some(Error::InvalidConfiguration)
        );
        assert_eq!(
            StackTable::new(cfg(16, 0)).err(),
            Some(Error::InvalidConfiguration)
        );
        assert_eq!(
            StackTable::new(cfg(16, MAX_STACK_DEPTH + 1)).err(),
            Some(Error::InvalidConfiguration)
        );
        assert!(StackTable::new(cfg(16, MAX_STACK_DEPTH)).is_ok());
    }

    /// Invariant: requested capacity 100 rounds up to 128 slots.
    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let t = StackTable::new(cfg(100, 16)).unwrap();
        assert_eq!(t.capacity(), 128);
        let t = StackTable::new(cfg(128, 16)).unwrap();
        assert_eq!(t.capacity(), 128);
    }

    /// Invariant: creation fails when the projected memory cost would
    /// overflow the 32-bit byte budget.
    #[test]
    fn creation_rejects_oversized_cost() {
        assert_eq!(
            StackTable::new(cfg(1 << 40, 8)).err(),
            Some(Error::ResourceExhausted)
        );
    }

    /// Invariant: skipping at least as many frames as were captured fails
    /// with `InsufficientFrames`; one fewer succeeds.
    #[test]
    fn skip_exceeding_captured_depth_fails() {
        let t = StackTable::new(cfg(16, 16)).unwrap();
        let frames: Vec<u64> = (1..=8).collect();
        assert_eq!(
            t.capture_and_insert(&frames, 10, CaptureFlags::default()).err(),
            Some(Error::InsufficientFrames)
        );
        assert_eq!(
            t.capture_and_insert(&frames, 8, CaptureFlags::default()).err(),
            Some(Error::InsufficientFrames)
        );
        assert!(t.capture_and_insert(&frames, 7, CaptureFlags::default()).is_ok());
        assert_eq!(
            t.capture_and_insert(&[], 0, CaptureFlags::default()).err(),
            Some(Error::InsufficientFrames)
        );
    }

    /// Invariant: inserting byte-identical stacks returns the same slot
    /// index and keeps a single live record (dedup).
    #[test]
    fn identical_stacks_deduplicate() {
        let t = StackTable::new(cfg(64, 16)).unwrap();
        let frames = [0x4000u64, 0x4100, 0x4200];
        let a = t.capture_and_insert(&frames, 0, CaptureFlags::default()).unwrap();
        let b = t.capture_and_insert(&frames, 0, CaptureFlags::default()).unwrap();
        assert_eq!(a, b);

        let guard = epoch::pin();
        assert_eq!(t.lookup(a, &guard), Some(&frames[..]));
    }

    /// Invariant: `skip` drops leading frames before hashing, so a skipped
    /// capture deduplicates against the bare suffix.
    #[test]
    fn skip_drops_leading_frames() {
        let t = StackTable::new(cfg(64, 16)).unwrap();
        let full = [0xdead_u64, 0xbeef, 0x4000, 0x4100];
        let suffix = [0x4000u64, 0x4100];
        let a = t.capture_and_insert(&full, 2, CaptureFlags::default()).unwrap();
        let b = t.capture_and_insert(&suffix, 0, CaptureFlags::default()).unwrap();
        assert_eq!(a, b);
        let guard = epoch::pin();
        assert_eq!(t.lookup(a, &guard), Some(&suffix[..]));
    }

    /// Invariant: captures deeper than `max_depth` are clamped to the
    /// leading `max_depth` frames.
    #[test]
    fn deep_captures_are_clamped() {
        let t = StackTable::new(cfg(16, 4)).unwrap();
        let frames: Vec<u64> = (1..=10).collect();
        let id = t.capture_and_insert(&frames, 0, CaptureFlags::default()).unwrap();
        let guard = epoch::pin();
        assert_eq!(t.lookup(id, &guard), Some(&frames[..4]));
    }

    /// Scenario: with a deterministic hasher, a stack whose hash reduces
    /// to 5 lands in slot 5 of a 128-slot table; a distinct colliding
    /// stack without overwrite permission fails with `AlreadyExists`.
    #[test]
    fn collision_without_overwrite_is_rejected() {
        let t = StackTable::with_hasher(cfg(100, 16), LastFrame).unwrap();
        assert_eq!(t.capacity(), 128);

        let first = [10u64, 5];
        let id = t.capture_and_insert(&first, 0, CaptureFlags::default()).unwrap();
        assert_eq!(id, 5);

        let colliding = [11u64, 5];
        assert_eq!(
            t.capture_and_insert(&colliding, 0, CaptureFlags::default()).err(),
            Some(Error::AlreadyExists)
        );

        // The resident record is untouched by the failed insert.
        let guard = epoch::pin();
        assert_eq!(t.lookup(5, &guard), Some(&first[..]));
    }

    /// Invariant: overwrite permission atomically replaces the colliding
    /// resident; readers see either the old or the new record in full.
    #[test]
    fn collision_with_overwrite_replaces() {
        let t = StackTable::with_hasher(cfg(8, 16), LastFrame).unwrap();
        let first = [10u64, 3];
        let second = [11u64, 22, 3];
        let a = t.capture_and_insert(&first, 0, CaptureFlags::default()).unwrap();
        let b = t.capture_and_insert(&second, 0, OVERWRITE).unwrap();
        assert_eq!(a, b);
        let guard = epoch::pin();
        assert_eq!(t.lookup(a, &guard), Some(&second[..]));
    }

    /// Policy: fast compare accepts hash equality as identity, so a
    /// distinct stack with a colliding hash is reported as a hit and the
    /// resident record is left in place.
    #[test]
    fn fast_compare_conflates_hash_collisions() {
        let t = StackTable::with_hasher(cfg(8, 16), LastFrame).unwrap();
        let first = [10u64, 3];
        let colliding = [99u64, 3];
        let a = t.capture_and_insert(&first, 0, CaptureFlags::default()).unwrap();
        let b = t.capture_and_insert(&colliding, 0, FAST).unwrap();
        assert_eq!(a, b);
        let guard = epoch::pin();
        assert_eq!(t.lookup(a, &guard), Some(&first[..]));
    }

    /// Invariant: lookup tolerates unknown keys; empty and out-of-range
    /// slots both yield an empty result rather than an error.
    #[test]
    fn lookup_tolerates_unknown_keys() {
        let t = StackTable::new(cfg(8, 8)).unwrap();
        let guard = epoch::pin();
        assert_eq!(t.lookup(3, &guard), None);
        assert_eq!(t.lookup(10_000, &guard), None);
    }

    /// Invariant: remove empties the slot exactly once; a second remove
    /// reports `NotFound` and out-of-range indices report `OutOfRange`.
    #[test]
    fn remove_then_lookup_is_empty() {
        let t = StackTable::new(cfg(8, 8)).unwrap();
        let frames = [1u64, 2, 3];
        let id = t.capture_and_insert(&frames, 0, CaptureFlags::default()).unwrap();

        assert_eq!(t.remove(id), Ok(()));
        let guard = epoch::pin();
        assert_eq!(t.lookup(id, &guard), None);
        assert_eq!(t.remove(id), Err(Error::NotFound));
        assert_eq!(t.remove(t.capacity()), Err(Error::OutOfRange));
    }

    /// Invariant: records are padded with zeroed trailing frames up to
    /// `max_depth`, while the public view exposes only the live prefix.
    #[test]
    fn records_pad_unused_frames_with_zero() {
        let rec = StackRecord::try_new(7, &[5, 6], 4).unwrap();
        assert_eq!(&*rec.frames, &[5, 6, 0, 0]);
        assert_eq!(rec.frames(), &[5, 6]);
        assert_eq!(rec.len, 2);
    }

    /// Invariant: a reader whose guard predates a replacement can still
    /// read the record it observed after the slot has moved on.
    #[test]
    fn replaced_record_outlives_prior_reader_window() {
        let t = StackTable::with_hasher(cfg(8, 8), LastFrame).unwrap();
        let first = [10u64, 3];
        let second = [20u64, 3];
        let id = t.capture_and_insert(&first, 0, CaptureFlags::default()).unwrap();

        let guard = epoch::pin();
        let view = t.lookup(id, &guard).unwrap();
        t.capture_and_insert(&second, 0, OVERWRITE).unwrap();

        // The pre-replacement view stays valid and unchanged.
        assert_eq!(view, &first[..]);
        // A fresh window observes the replacement.
        let fresh = epoch::pin();
        assert_eq!(t.lookup(id, &fresh), Some(&second[..]));
    }
}
