//! Hash table of busy tags keyed by start address.
//!
//! Chains are threaded through the tags' `list` links, so the table itself
//! is only an array of chain heads. The table doubles once the number of
//! busy tags exceeds [`HASH_LOAD_FACTOR`] times the number of buckets.

use alloc::{vec, vec::Vec};

use crate::{
    Addr,
    bootstrap::TagSlab,
    tag::{TagId, TagKind},
};

pub(crate) const HASH_INITIAL_BUCKETS: usize = 16;
pub(crate) const HASH_LOAD_FACTOR: usize = 2;

const FIBONACCI_MULTIPLIER: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Debug)]
pub(crate) struct BusyHash {
    quantum_shift: u32,
    buckets: Vec<Option<TagId>>,
    len: usize,
}

impl BusyHash {
    pub(crate) fn new(quantum_shift: u32) -> Self {
        Self {
            quantum_shift,
            buckets: vec![None; HASH_INITIAL_BUCKETS],
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[expect(clippy::cast_possible_truncation)]
    fn bucket_index(&self, addr: Addr, bucket_count: usize) -> usize {
        debug_assert!(bucket_count.is_power_of_two() && bucket_count > 1);
        let key = (addr >> self.quantum_shift) as u64;
        let hash = key.wrapping_mul(FIBONACCI_MULTIPLIER);
        (hash >> (u64::BITS - bucket_count.trailing_zeros())) as usize
    }

    pub(crate) fn insert(&mut self, slab: &mut TagSlab, id: TagId) {
        assert_eq!(slab[id].kind, TagKind::Busy, "only busy tags go in the hash");
        let index = self.bucket_index(slab[id].start, self.buckets.len());
        Self::link_head(&mut self.buckets[index], slab, id);
        self.len += 1;
    }

    fn link_head(head: &mut Option<TagId>, slab: &mut TagSlab, id: TagId) {
        slab[id].list.prev = None;
        slab[id].list.next = *head;
        if let Some(old) = *head {
            slab[old].list.prev = Some(id);
        }
        *head = Some(id);
    }

    pub(crate) fn lookup(&self, slab: &TagSlab, addr: Addr) -> Option<TagId> {
        let mut cursor = self.buckets[self.bucket_index(addr, self.buckets.len())];
        while let Some(id) = cursor {
            if slab[id].start == addr {
                return Some(id);
            }
            cursor = slab[id].list.next;
        }
        None
    }

    pub(crate) fn remove(&mut self, slab: &mut TagSlab, id: TagId) {
        let link = slab[id].list;
        match link.prev {
            Some(prev) => slab[prev].list.next = link.next,
            None => {
                let index = self.bucket_index(slab[id].start, self.buckets.len());
                assert_eq!(self.buckets[index], Some(id), "busy tag is not in its chain");
                self.buckets[index] = link.next;
            }
        }
        if let Some(next) = link.next {
            slab[next].list.prev = link.prev;
        }
        slab[id].list.prev = None;
        slab[id].list.next = None;
        self.len -= 1;
    }

    pub(crate) fn needs_grow(&self) -> bool {
        self.len > self.buckets.len() * HASH_LOAD_FACTOR
    }

    /// Doubles the bucket array and moves every chain over.
    ///
    /// Returns `false` if the new array could not be allocated; the old table
    /// stays in place and lookups keep working with longer chains.
    pub(crate) fn grow(&mut self, slab: &mut TagSlab) -> bool {
        let Some(new_count) = self.buckets.len().checked_mul(2) else {
            return false;
        };
        let mut buckets = Vec::new();
        if buckets.try_reserve_exact(new_count).is_err() {
            return false;
        }
        buckets.resize(new_count, None);

        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(id) = cursor {
                cursor = slab[id].list.next;
                let index = self.bucket_index(slab[id].start, new_count);
                Self::link_head(&mut buckets[index], slab, id);
            }
        }
        self.buckets = buckets;
        true
    }

    pub(crate) fn iter<'a>(&'a self, slab: &'a TagSlab) -> impl Iterator<Item = TagId> + 'a {
        self.buckets.iter().flat_map(move |head| {
            let mut cursor = *head;
            core::iter::from_fn(move || {
                let id = cursor?;
                cursor = slab[id].list.next;
                Some(id)
            })
        })
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;
    use crate::{
        TagPool,
        bootstrap::TagBudget,
        flags::Blocking,
        tag::BoundaryTag,
    };

    static POOL: TagPool = TagPool::unbounded();

    fn busy(slab: &mut TagSlab, start: usize) -> TagId {
        slab.deposit(TagBudget::take(&POOL, 1, Blocking::Sleep, "test").unwrap());
        slab.alloc(BoundaryTag::new(start, 0x10, TagKind::Busy))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut slab = TagSlab::new(&POOL);
        let mut hash = BusyHash::new(4);
        let a = busy(&mut slab, 0x1000);
        let b = busy(&mut slab, 0x2000);
        hash.insert(&mut slab, a);
        hash.insert(&mut slab, b);
        assert_eq!(hash.len(), 2);
        assert_eq!(hash.lookup(&slab, 0x1000), Some(a));
        assert_eq!(hash.lookup(&slab, 0x2000), Some(b));
        assert_eq!(hash.lookup(&slab, 0x1010), None);

        hash.remove(&mut slab, a);
        assert_eq!(hash.lookup(&slab, 0x1000), None);
        assert_eq!(hash.lookup(&slab, 0x2000), Some(b));
        assert_eq!(hash.len(), 1);
    }

    #[test]
    fn test_grow_keeps_every_entry() {
        let mut slab = TagSlab::new(&POOL);
        let mut hash = BusyHash::new(4);
        let ids = (0..200)
            .map(|i| {
                let id = busy(&mut slab, 0x10 * i);
                hash.insert(&mut slab, id);
                if hash.needs_grow() {
                    assert!(hash.grow(&mut slab));
                }
                id
            })
            .collect::<Vec<_>>();

        assert!(hash.bucket_count() >= 200 / HASH_LOAD_FACTOR);
        assert!(!hash.needs_grow());
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(hash.lookup(&slab, 0x10 * i), Some(*id));
        }
        assert_eq!(hash.iter(&slab).count(), 200);

        for (i, id) in ids.iter().enumerate().step_by(2) {
            hash.remove(&mut slab, *id);
            assert_eq!(hash.lookup(&slab, 0x10 * i), None);
        }
        assert_eq!(hash.len(), 100);
        assert_eq!(hash.iter(&slab).count(), 100);
    }
}
