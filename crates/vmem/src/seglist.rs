//! Address-ordered list of every boundary tag of an arena.
//!
//! A span marker is always immediately followed by the free and busy tags
//! that cover it, in address order, so the neighbours of a tag in this list
//! are exactly the candidates for coalescing.

use core::iter;

use crate::{
    bootstrap::TagSlab,
    tag::{BoundaryTag, TagId},
};

#[derive(Debug, Default)]
pub(crate) struct SegmentList {
    head: Option<TagId>,
    tail: Option<TagId>,
    len: usize,
}

impl SegmentList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn next(slab: &TagSlab, id: TagId) -> Option<TagId> {
        slab[id].seg.next
    }

    pub(crate) fn prev(slab: &TagSlab, id: TagId) -> Option<TagId> {
        slab[id].seg.prev
    }

    /// Links `id` right after `after`, or at the head if `after` is `None`.
    pub(crate) fn insert_after(&mut self, slab: &mut TagSlab, after: Option<TagId>, id: TagId) {
        let next = match after {
            Some(after) => slab[after].seg.next,
            None => self.head,
        };
        slab[id].seg.prev = after;
        slab[id].seg.next = next;
        match after {
            Some(after) => slab[after].seg.next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => slab[next].seg.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    /// Links `id` right before `before`.
    pub(crate) fn insert_before(&mut self, slab: &mut TagSlab, before: TagId, id: TagId) {
        let prev = slab[before].seg.prev;
        self.insert_after(slab, prev, id);
    }

    pub(crate) fn remove(&mut self, slab: &mut TagSlab, id: TagId) {
        let link = slab[id].seg;
        match link.prev {
            Some(prev) => slab[prev].seg.next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => slab[next].seg.prev = link.prev,
            None => self.tail = link.prev,
        }
        slab[id].seg.prev = None;
        slab[id].seg.next = None;
        self.len -= 1;
    }

    /// Finds the span marker after which a new span starting at `start`
    /// must be linked, i.e. the last tag of the last span below `start`.
    ///
    /// Returns `Err(())` if `start..start + size` intersects an existing
    /// span.
    pub(crate) fn span_insertion_point(
        &self,
        slab: &TagSlab,
        start: usize,
        size: usize,
    ) -> Result<Option<TagId>, ()> {
        let last = start + (size - 1);
        let mut after = None;
        for id in self.iter(slab) {
            let tag = &slab[id];
            if tag.kind.is_any_span() {
                if tag.start > last {
                    break;
                }
                if tag.last() >= start {
                    return Err(());
                }
            }
            after = Some(id);
        }
        Ok(after)
    }

    pub(crate) fn iter<'a>(&self, slab: &'a TagSlab) -> impl Iterator<Item = TagId> + use<'a> {
        let mut cursor = self.head;
        iter::from_fn(move || {
            let id = cursor?;
            cursor = slab[id].seg.next;
            Some(id)
        })
    }

    pub(crate) fn tags<'a>(&self, slab: &'a TagSlab) -> impl Iterator<Item = &'a BoundaryTag> + use<'a> {
        self.iter(slab).map(move |id| &slab[id])
    }

    pub(crate) fn tail(&self) -> Option<TagId> {
        self.tail
    }
}
