//! Boundary-tag bootstrap allocation.
//!
//! An arena needs boundary tags to describe the very ranges it hands out, so
//! tags cannot come from the arena itself. They are accounted against a
//! [`TagAllocator`] that exists independently of every arena, and stored in
//! a per-arena [`TagSlab`].
//!
//! Tags are obtained in two steps. Before entering a critical section an
//! arena tops up its reserve of granted tags (possibly blocking, always with
//! the arena lock released); inside the critical section tags are then taken
//! from that reserve, which cannot fail.

use alloc::vec::Vec;
use core::{
    hint,
    ops::{Index, IndexMut},
    sync::atomic::{AtomicUsize, Ordering},
};

use snafu::ensure;

use crate::{
    error::{MetadataExhaustedSnafu, Result},
    flags::Blocking,
    tag::{BoundaryTag, TagId},
};

/// Number of tags kept in reserve before any mutating operation.
///
/// A single critical section consumes at most two tags (two splits on
/// allocation, or a span marker and its free tag when adding a span).
pub(crate) const TAG_RESERVE: usize = 4;

/// Upper bound of the reserve retained after an operation.
const TAG_RESERVE_MAX: usize = 16;

const BACKOFF_MAX_SPINS: u32 = 1 << 12;

/// Supplier of boundary-tag records.
///
/// Implementations are shared between arenas and must never call back into
/// an arena.
pub trait TagAllocator: Send + Sync {
    /// Takes `count` tag records. Returns `false` without side effects if
    /// that many records are not available right now.
    fn try_alloc(&self, count: usize) -> bool;

    /// Returns `count` records taken earlier.
    fn free(&self, count: usize);
}

/// Fixed-capacity pool of boundary-tag records.
///
/// The pool only keeps count; the records themselves live inside each
/// arena's slab.
#[derive(Debug)]
pub struct TagPool {
    capacity: Option<usize>,
    in_use: AtomicUsize,
}

/// Pool used by arenas that are not configured with their own.
pub static DEFAULT_TAG_POOL: TagPool = TagPool::unbounded();

impl TagPool {
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            capacity: None,
            in_use: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            in_use: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

impl TagAllocator for TagPool {
    fn try_alloc(&self, count: usize) -> bool {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use
                    .checked_add(count)
                    .filter(|&n| self.capacity.is_none_or(|cap| n <= cap))
            })
            .is_ok()
    }

    fn free(&self, count: usize) {
        let prev = self.in_use.fetch_sub(count, Ordering::AcqRel);
        assert!(prev >= count, "tag pool underflow: {prev} < {count}");
    }
}

/// Tag records granted by a [`TagAllocator`] but not yet deposited into a
/// slab. Dropping a budget gives the records back.
#[must_use]
pub(crate) struct TagBudget {
    allocator: &'static dyn TagAllocator,
    count: usize,
}

impl TagBudget {
    /// Takes `count` records, backing off while the allocator is exhausted
    /// if `blocking` allows it.
    pub(crate) fn take(
        allocator: &'static dyn TagAllocator,
        count: usize,
        blocking: Blocking,
        name: &str,
    ) -> Result<Self> {
        let mut budget = Self {
            allocator,
            count: 0,
        };
        let mut backoff = Backoff::new(blocking, name, "boundary tags");
        while budget.count < count {
            if allocator.try_alloc(1) {
                budget.count += 1;
                continue;
            }
            backoff.wait()?;
        }
        Ok(budget)
    }
}

/// Exponential spin back-off for blocking metadata allocation.
struct Backoff<'a> {
    blocking: Blocking,
    name: &'a str,
    what: &'static str,
    spins: u32,
    warned: bool,
}

impl<'a> Backoff<'a> {
    fn new(blocking: Blocking, name: &'a str, what: &'static str) -> Self {
        Self {
            blocking,
            name,
            what,
            spins: 1,
            warned: false,
        }
    }

    /// Waits before the next attempt, or fails if the caller may not block.
    fn wait(&mut self) -> Result<()> {
        ensure!(self.blocking.is_sleep(), MetadataExhaustedSnafu);
        if !self.warned {
            log::warn!("{}: {} exhausted, waiting", self.name, self.what);
            self.warned = true;
        }
        for _ in 0..self.spins {
            hint::spin_loop();
        }
        self.spins = (self.spins * 2).min(BACKOFF_MAX_SPINS);
        Ok(())
    }
}

impl Drop for TagBudget {
    fn drop(&mut self) {
        if self.count > 0 {
            self.allocator.free(self.count);
        }
    }
}

#[derive(Debug)]
pub(crate) enum Slot {
    Occupied(BoundaryTag),
    Vacant { next: Option<TagId> },
}

/// Empty slot storage of a given capacity, allocated with no arena lock held
/// and then installed into a [`TagSlab`].
#[derive(Debug)]
pub(crate) struct SlotStorage(Vec<Slot>);

impl SlotStorage {
    /// Allocates room for `capacity` slots, backing off while memory is
    /// short if `blocking` allows it.
    pub(crate) fn allocate(capacity: usize, blocking: Blocking, name: &str) -> Result<Self> {
        Self::allocate_with(blocking, name, || {
            let mut slots = Vec::new();
            slots.try_reserve_exact(capacity).ok()?;
            Some(slots)
        })
    }

    fn allocate_with(
        blocking: Blocking,
        name: &str,
        mut try_alloc: impl FnMut() -> Option<Vec<Slot>>,
    ) -> Result<Self> {
        let mut backoff = Backoff::new(blocking, name, "boundary tag storage");
        loop {
            if let Some(slots) = try_alloc() {
                return Ok(Self(slots));
            }
            backoff.wait()?;
        }
    }
}

/// Storage for the boundary tags of one arena.
///
/// Slots are recycled through an intrusive vacant list, so a [`TagId`] stays
/// valid until the tag is freed.
pub(crate) struct TagSlab {
    allocator: &'static dyn TagAllocator,
    slots: Vec<Slot>,
    vacant: Option<TagId>,
    vacant_count: usize,
    occupied: usize,
    reserve: usize,
}

impl TagSlab {
    pub(crate) fn new(allocator: &'static dyn TagAllocator) -> Self {
        Self {
            allocator,
            slots: Vec::new(),
            vacant: None,
            vacant_count: 0,
            occupied: 0,
            reserve: 0,
        }
    }

    pub(crate) fn allocator(&self) -> &'static dyn TagAllocator {
        self.allocator
    }

    /// Number of records missing from the reserve.
    pub(crate) fn deficit(&self) -> usize {
        TAG_RESERVE.saturating_sub(self.reserve)
    }

    pub(crate) fn deposit(&mut self, mut budget: TagBudget) {
        self.reserve += budget.count;
        budget.count = 0;
    }

    /// Capacity the slot storage must grow to before every reserved tag can
    /// be taken without reallocating, or `None` if it already suffices.
    pub(crate) fn capacity_needed(&self) -> Option<usize> {
        let spare = self.vacant_count + (self.slots.capacity() - self.slots.len());
        (spare < self.reserve).then(|| {
            let required = self.slots.len() + (self.reserve - self.vacant_count);
            required.max(self.slots.capacity() * 2)
        })
    }

    /// Moves every slot into `storage` if it is larger than the current
    /// storage. Returns the storage that is no longer used, to be dropped
    /// once the arena lock is released.
    pub(crate) fn install(&mut self, storage: SlotStorage) -> SlotStorage {
        let SlotStorage(mut slots) = storage;
        if slots.capacity() <= self.slots.capacity() {
            return SlotStorage(slots);
        }
        debug_assert!(slots.is_empty());
        slots.append(&mut self.slots);
        SlotStorage(core::mem::replace(&mut self.slots, slots))
    }

    /// Hands surplus reserve back to the allocator.
    pub(crate) fn trim(&mut self) {
        if self.reserve > TAG_RESERVE_MAX {
            self.allocator.free(self.reserve - TAG_RESERVE);
            self.reserve = TAG_RESERVE;
        }
    }

    pub(crate) fn occupied(&self) -> usize {
        self.occupied
    }

    /// Stores a tag, consuming one reserved record.
    pub(crate) fn alloc(&mut self, tag: BoundaryTag) -> TagId {
        assert!(self.reserve > 0, "boundary tag reserve is empty");
        self.reserve -= 1;
        self.occupied += 1;
        if let Some(id) = self.vacant {
            let Slot::Vacant { next } = self.slots[id.index()] else {
                unreachable!("vacant list points at an occupied slot");
            };
            self.vacant = next;
            self.vacant_count -= 1;
            self.slots[id.index()] = Slot::Occupied(tag);
            return id;
        }
        let id = TagId::new(self.slots.len());
        self.slots.push(Slot::Occupied(tag));
        id
    }

    /// Releases a tag; its record goes back into the reserve.
    pub(crate) fn free(&mut self, id: TagId) -> BoundaryTag {
        let slot = core::mem::replace(
            &mut self.slots[id.index()],
            Slot::Vacant { next: self.vacant },
        );
        let Slot::Occupied(tag) = slot else {
            panic!("double free of boundary tag {id:?}");
        };
        self.vacant = Some(id);
        self.vacant_count += 1;
        self.occupied -= 1;
        self.reserve += 1;
        tag
    }
}

impl Index<TagId> for TagSlab {
    type Output = BoundaryTag;

    fn index(&self, id: TagId) -> &Self::Output {
        match &self.slots[id.index()] {
            Slot::Occupied(tag) => tag,
            Slot::Vacant { .. } => panic!("dangling boundary tag {id:?}"),
        }
    }
}

impl IndexMut<TagId> for TagSlab {
    fn index_mut(&mut self, id: TagId) -> &mut Self::Output {
        match &mut self.slots[id.index()] {
            Slot::Occupied(tag) => tag,
            Slot::Vacant { .. } => panic!("dangling boundary tag {id:?}"),
        }
    }
}

impl Drop for TagSlab {
    fn drop(&mut self) {
        let held = self.reserve + self.occupied;
        if held > 0 {
            self.allocator.free(held);
        }
    }
}
