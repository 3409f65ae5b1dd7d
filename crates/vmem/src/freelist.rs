//! Segregated free lists.
//!
//! Free tags are bucketed by `order = floor(log2(size / quantum))`, so every
//! tag in bucket `n` is at least `2^n` quanta long and shorter than
//! `2^(n + 1)` quanta.

use core::iter;

use crate::{
    Size,
    bootstrap::TagSlab,
    tag::{TagId, TagKind},
};

/// Number of size-class buckets.
pub(crate) const MAX_ORDER: usize = usize::BITS as usize;

/// Bucket holding free tags of `size`.
pub(crate) fn floor_order(size: Size, quantum_shift: u32) -> usize {
    let quanta = size >> quantum_shift;
    assert!(quanta > 0, "size {size:#x} is smaller than one quantum");
    quanta.ilog2() as usize
}

/// First bucket whose every tag is at least `size` long.
///
/// Returns [`MAX_ORDER`] if no bucket can guarantee that.
pub(crate) fn ceil_order(size: Size, quantum_shift: u32) -> usize {
    let quanta = size >> quantum_shift;
    let order = floor_order(size, quantum_shift);
    if quanta.is_power_of_two() {
        order
    } else {
        order + 1
    }
}

#[derive(Debug)]
pub(crate) struct FreeLists {
    quantum_shift: u32,
    heads: [Option<TagId>; MAX_ORDER],
}

impl FreeLists {
    pub(crate) const fn new(quantum_shift: u32) -> Self {
        Self {
            quantum_shift,
            heads: [None; MAX_ORDER],
        }
    }

    pub(crate) fn order_of(&self, size: Size) -> usize {
        floor_order(size, self.quantum_shift)
    }

    /// Pushes a free tag at the head of its bucket.
    pub(crate) fn insert(&mut self, slab: &mut TagSlab, id: TagId) {
        assert_eq!(slab[id].kind, TagKind::Free, "only free tags go on free lists");
        let order = self.order_of(slab[id].size);
        let head = self.heads[order];
        slab[id].list.prev = None;
        slab[id].list.next = head;
        if let Some(head) = head {
            slab[head].list.prev = Some(id);
        }
        self.heads[order] = Some(id);
    }

    /// Unlinks a free tag. Must be called before its size changes.
    pub(crate) fn remove(&mut self, slab: &mut TagSlab, id: TagId) {
        let link = slab[id].list;
        match link.prev {
            Some(prev) => slab[prev].list.next = link.next,
            None => {
                let order = self.order_of(slab[id].size);
                assert_eq!(self.heads[order], Some(id), "free tag is not in its bucket");
                self.heads[order] = link.next;
            }
        }
        if let Some(next) = link.next {
            slab[next].list.prev = link.prev;
        }
        slab[id].list.prev = None;
        slab[id].list.next = None;
    }

    pub(crate) fn is_empty(&self, order: usize) -> bool {
        self.heads[order].is_none()
    }

    pub(crate) fn bucket<'a>(
        &self,
        slab: &'a TagSlab,
        order: usize,
    ) -> impl Iterator<Item = TagId> + use<'a> {
        let mut cursor = self.heads[order];
        iter::from_fn(move || {
            let id = cursor?;
            cursor = slab[id].list.next;
            Some(id)
        })
    }
}
