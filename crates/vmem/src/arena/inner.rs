//! State of an arena that is only touched with the arena lock held.

use alloc::vec::Vec;

use snafu::ensure;

use super::{Constraints, Segment};
use crate::{
    Addr, Size, TagAllocator,
    bootstrap::TagSlab,
    error::{InvalidArgumentSnafu, ProtocolViolationSnafu, Result},
    flags::FitStrategy,
    freelist::{FreeLists, MAX_ORDER, ceil_order, floor_order},
    hash::BusyHash,
    seglist::SegmentList,
    tag::{BoundaryTag, TagId, TagKind},
};

/// Extent that became idle and has to be returned to the parent source once
/// the arena lock is released.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Export {
    pub(crate) addr: Addr,
    pub(crate) size: Size,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Totals {
    pub(crate) allocated: Size,
    pub(crate) free: Size,
    pub(crate) total: Size,
}

pub(crate) struct ArenaInner {
    name: &'static str,
    quantum_shift: u32,
    pub(crate) slab: TagSlab,
    segs: SegmentList,
    free: FreeLists,
    busy: BusyHash,
    totals: Totals,
    rehashes: usize,
}

impl ArenaInner {
    pub(crate) fn new(
        name: &'static str,
        quantum_shift: u32,
        tags: &'static dyn TagAllocator,
    ) -> Self {
        Self {
            name,
            quantum_shift,
            slab: TagSlab::new(tags),
            segs: SegmentList::new(),
            free: FreeLists::new(quantum_shift),
            busy: BusyHash::new(quantum_shift),
            totals: Totals::default(),
            rehashes: 0,
        }
    }

    pub(crate) fn totals(&self) -> Totals {
        self.totals
    }

    pub(crate) fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub(crate) fn rehashes(&self) -> usize {
        self.rehashes
    }

    /// Registers `[start, start + size)` as a new span covered by one free
    /// tag. Consumes two reserved tags.
    #[track_caller]
    pub(crate) fn add_span(&mut self, start: Addr, size: Size, kind: TagKind) -> Result<()> {
        debug_assert!(kind.is_any_span());
        let Ok(after) = self.segs.span_insertion_point(&self.slab, start, size) else {
            return InvalidArgumentSnafu {
                reason: "span overlaps an existing span",
            }
            .fail();
        };

        let span = self.slab.alloc(BoundaryTag::new(start, size, kind));
        let free = self.slab.alloc(BoundaryTag::new(start, size, TagKind::Free));
        self.segs.insert_after(&mut self.slab, after, span);
        self.segs.insert_after(&mut self.slab, Some(span), free);
        self.free.insert(&mut self.slab, free);

        self.totals.total += size;
        self.totals.free += size;
        Ok(())
    }

    /// Finds a free tag and the address inside it at which `size` can be
    /// placed under `constraints`.
    pub(crate) fn find(
        &self,
        size: Size,
        constraints: &Constraints,
        strategy: FitStrategy,
    ) -> Option<(TagId, Addr)> {
        match strategy {
            FitStrategy::InstantFit => {
                let first = ceil_order(size, self.quantum_shift);
                (first..MAX_ORDER)
                    .filter(|&order| !self.free.is_empty(order))
                    .find_map(|order| {
                        self.free.bucket(&self.slab, order).find_map(|id| {
                            let tag = &self.slab[id];
                            constraints
                                .fit(tag.start, tag.last(), size)
                                .map(|addr| (id, addr))
                        })
                    })
            }
            FitStrategy::BestFit => {
                let first = floor_order(size, self.quantum_shift);
                (first..MAX_ORDER)
                    .filter(|&order| !self.free.is_empty(order))
                    .find_map(|order| {
                        self.free
                            .bucket(&self.slab, order)
                            .filter_map(|id| {
                                let tag = &self.slab[id];
                                constraints
                                    .fit(tag.start, tag.last(), size)
                                    .map(|addr| (tag.size, id, addr))
                            })
                            .min_by_key(|&(tag_size, _, _)| tag_size)
                            .map(|(_, id, addr)| (id, addr))
                    })
            }
        }
    }

    /// Carves `[addr, addr + size)` out of free tag `id` and marks it busy.
    /// Consumes up to two reserved tags.
    pub(crate) fn claim(&mut self, id: TagId, addr: Addr, size: Size) {
        let tag = self.slab[id];
        assert_eq!(tag.kind, TagKind::Free, "claiming a tag that is not free");
        assert!(
            tag.start <= addr && addr + (size - 1) <= tag.last(),
            "claimed range is outside its free tag"
        );
        self.free.remove(&mut self.slab, id);

        if addr > tag.start {
            let lead = self
                .slab
                .alloc(BoundaryTag::new(tag.start, addr - tag.start, TagKind::Free));
            self.segs.insert_before(&mut self.slab, id, lead);
            self.free.insert(&mut self.slab, lead);
            self.slab[id].start = addr;
            self.slab[id].size -= addr - tag.start;
        }

        let busy = if self.slab[id].size > size {
            let busy = self.slab.alloc(BoundaryTag::new(addr, size, TagKind::Busy));
            self.segs.insert_before(&mut self.slab, id, busy);
            self.slab[id].start += size;
            self.slab[id].size -= size;
            self.free.insert(&mut self.slab, id);
            busy
        } else {
            self.slab[id].kind = TagKind::Busy;
            id
        };
        self.busy.insert(&mut self.slab, busy);
        self.totals.free -= size;
        self.totals.allocated += size;

        if self.busy.needs_grow() && self.busy.grow(&mut self.slab) {
            self.rehashes += 1;
            log::debug!(
                "{}: busy hash grown to {} buckets",
                self.name,
                self.busy.bucket_count()
            );
        }
    }

    /// Marks busy range `[addr, addr + size)` free again and coalesces it
    /// with its neighbours.
    ///
    /// Returns the span to export if the whole of an imported span is now
    /// free. Nothing is changed if `addr` and `size` do not name a busy
    /// range exactly.
    #[track_caller]
    pub(crate) fn release(&mut self, addr: Addr, size: Size) -> Result<Option<Export>> {
        let Some(mut id) = self.busy.lookup(&self.slab, addr) else {
            return ProtocolViolationSnafu {
                addr,
                size,
                reason: "address is not allocated",
            }
            .fail();
        };
        ensure!(
            self.slab[id].size == size,
            ProtocolViolationSnafu {
                addr,
                size,
                reason: "size does not match the allocation",
            }
        );

        self.busy.remove(&mut self.slab, id);
        self.slab[id].kind = TagKind::Free;
        self.totals.allocated -= size;
        self.totals.free += size;

        if let Some(next) = SegmentList::next(&self.slab, id)
            && self.slab[next].kind.is_free()
        {
            self.free.remove(&mut self.slab, next);
            self.segs.remove(&mut self.slab, next);
            let next = self.slab.free(next);
            self.slab[id].size += next.size;
        }
        if let Some(prev) = SegmentList::prev(&self.slab, id)
            && self.slab[prev].kind.is_free()
        {
            self.free.remove(&mut self.slab, prev);
            self.segs.remove(&mut self.slab, id);
            let merged = self.slab.free(id);
            self.slab[prev].size += merged.size;
            id = prev;
        }

        if let Some(span) = SegmentList::prev(&self.slab, id)
            && Self::is_idle_span(&self.slab[span], &self.slab[id])
        {
            return Ok(Some(self.remove_idle_span(span, id)));
        }
        self.free.insert(&mut self.slab, id);
        Ok(None)
    }

    fn is_idle_span(span: &BoundaryTag, free: &BoundaryTag) -> bool {
        span.kind == TagKind::Span
            && free.kind == TagKind::Free
            && span.start == free.start
            && span.size == free.size
    }

    /// Unlinks an imported span and the single free tag covering it. The
    /// free tag must already be off its free list.
    fn remove_idle_span(&mut self, span: TagId, free: TagId) -> Export {
        self.segs.remove(&mut self.slab, free);
        self.segs.remove(&mut self.slab, span);
        self.slab.free(free);
        let span = self.slab.free(span);
        self.totals.total -= span.size;
        self.totals.free -= span.size;
        Export {
            addr: span.start,
            size: span.size,
        }
    }

    /// Removes every imported span that is entirely free.
    pub(crate) fn drain_idle_spans(&mut self) -> Vec<Export> {
        let idle = self
            .segs
            .iter(&self.slab)
            .filter_map(|span| {
                let free = SegmentList::next(&self.slab, span)?;
                Self::is_idle_span(&self.slab[span], &self.slab[free]).then_some((span, free))
            })
            .collect::<Vec<_>>();
        idle.into_iter()
            .map(|(span, free)| {
                self.free.remove(&mut self.slab, free);
                self.remove_idle_span(span, free)
            })
            .collect()
    }

    pub(crate) fn segments(&self) -> Vec<Segment> {
        self.segs
            .tags(&self.slab)
            .map(|tag| Segment {
                start: tag.start,
                size: tag.size,
                kind: tag.kind,
            })
            .collect()
    }

    /// Verifies the structural invariants of the arena.
    #[track_caller]
    pub(crate) fn check(&self) -> Result<()> {
        let mut sums = Totals::default();
        let mut busy = 0;
        let mut free = 0;
        // end of the current span, and the address the next tag must start at
        let mut cover: Option<(Addr, Addr)> = None;
        let mut prev_span_last = None;
        let mut prev_kind = None;

        for id in self.segs.iter(&self.slab) {
            let tag = &self.slab[id];
            let violation = |reason: &'static str| {
                ProtocolViolationSnafu {
                    addr: tag.start,
                    size: tag.size,
                    reason,
                }
                .fail()
            };

            if tag.kind.is_any_span() {
                if cover.is_some_and(|(expected, end)| expected != end) {
                    return violation("previous span is not fully covered");
                }
                if prev_span_last.is_some_and(|last| last >= tag.start) {
                    return violation("span overlaps or precedes the previous span");
                }
                prev_span_last = Some(tag.last());
                cover = Some((tag.start, tag.end()));
                sums.total += tag.size;
                prev_kind = Some(tag.kind);
                continue;
            }

            let Some((expected, end)) = cover else {
                return violation("tag outside of any span");
            };
            if tag.start != expected || tag.end() > end {
                return violation("tag does not continue its span");
            }
            cover = Some((tag.end(), end));

            match tag.kind {
                TagKind::Free => {
                    if prev_kind == Some(TagKind::Free) {
                        return violation("adjacent free tags are not coalesced");
                    }
                    let order = self.free.order_of(tag.size);
                    if !self.free.bucket(&self.slab, order).any(|f| f == id) {
                        return violation("free tag is not in its size class");
                    }
                    sums.free += tag.size;
                    free += 1;
                }
                TagKind::Busy => {
                    if self.busy.lookup(&self.slab, tag.start) != Some(id) {
                        return violation("busy tag is not in the busy hash");
                    }
                    sums.allocated += tag.size;
                    busy += 1;
                }
                TagKind::Span | TagKind::StaticSpan => unreachable!(),
            }
            prev_kind = Some(tag.kind);
        }

        let violation = |reason: &'static str| {
            ProtocolViolationSnafu {
                addr: 0_usize,
                size: sums.total,
                reason,
            }
            .fail()
        };
        if cover.is_some_and(|(expected, end)| expected != end) {
            return violation("last span is not fully covered");
        }
        if sums != self.totals {
            return violation("size counters disagree with the segment list");
        }
        if busy != self.busy.len() || self.busy.iter(&self.slab).count() != busy {
            return violation("busy hash holds tags missing from the segment list");
        }
        let listed = (0..MAX_ORDER)
            .map(|order| self.free.bucket(&self.slab, order).count())
            .sum::<usize>();
        if listed != free {
            return violation("free lists hold tags missing from the segment list");
        }
        if self.segs.iter(&self.slab).last() != self.segs.tail() {
            return violation("segment list tail is stale");
        }
        if self.slab.occupied() != self.segs.len() {
            return violation("boundary tags leaked");
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ErrorKind, TagPool,
        bootstrap::TagBudget,
        flags::Blocking,
    };

    static POOL: TagPool = TagPool::unbounded();

    fn refill(inner: &mut ArenaInner) {
        let deficit = inner.slab.deficit();
        if deficit > 0 {
            inner
                .slab
                .deposit(TagBudget::take(&POOL, deficit, Blocking::Sleep, "test").unwrap());
        }
    }

    fn arena(start: Addr, size: Size, quantum_shift: u32) -> ArenaInner {
        let mut inner = ArenaInner::new("test", quantum_shift, &POOL);
        refill(&mut inner);
        inner.add_span(start, size, TagKind::StaticSpan).unwrap();
        inner
    }

    fn place(inner: &mut ArenaInner, size: Size, strategy: FitStrategy) -> Option<Addr> {
        refill(inner);
        let (id, addr) = inner.find(size, &Constraints::unbounded(1 << inner.quantum_shift), strategy)?;
        inner.claim(id, addr, size);
        inner.check().unwrap();
        Some(addr)
    }

    fn kinds(inner: &ArenaInner) -> Vec<(Addr, Size, TagKind)> {
        inner
            .segments()
            .into_iter()
            .map(|s| (s.start, s.size, s.kind))
            .collect()
    }

    #[test]
    fn test_claim_splits_and_release_coalesces() {
        let mut inner = arena(0x1000, 0x1000, 4);
        let a = place(&mut inner, 0x100, FitStrategy::InstantFit).unwrap();
        let b = place(&mut inner, 0x100, FitStrategy::InstantFit).unwrap();
        assert_eq!((a, b), (0x1000, 0x1100));
        assert_eq!(
            kinds(&inner),
            [
                (0x1000, 0x1000, TagKind::StaticSpan),
                (0x1000, 0x100, TagKind::Busy),
                (0x1100, 0x100, TagKind::Busy),
                (0x1200, 0xe00, TagKind::Free),
            ]
        );

        assert_eq!(inner.release(a, 0x100).unwrap(), None);
        inner.check().unwrap();
        assert_eq!(inner.release(b, 0x100).unwrap(), None);
        inner.check().unwrap();
        assert_eq!(
            kinds(&inner),
            [
                (0x1000, 0x1000, TagKind::StaticSpan),
                (0x1000, 0x1000, TagKind::Free),
            ]
        );
        assert_eq!(inner.totals().free, 0x1000);
        assert_eq!(inner.busy_count(), 0);
    }

    #[test]
    fn test_claim_with_leading_remainder() {
        let mut inner = arena(0x1000, 0x1000, 4);
        refill(&mut inner);
        let free = inner.segs.iter(&inner.slab).nth(1).unwrap();
        inner.claim(free, 0x1800, 0x100);
        inner.check().unwrap();
        assert_eq!(
            kinds(&inner),
            [
                (0x1000, 0x1000, TagKind::StaticSpan),
                (0x1000, 0x800, TagKind::Free),
                (0x1800, 0x100, TagKind::Busy),
                (0x1900, 0x700, TagKind::Free),
            ]
        );
        assert_eq!(inner.release(0x1800, 0x100).unwrap(), None);
        inner.check().unwrap();
        assert_eq!(kinds(&inner).len(), 2);
    }

    #[test]
    fn test_best_fit_prefers_smallest_tag() {
        let mut inner = arena(0, 0x1000, 4);
        let a = place(&mut inner, 0x300, FitStrategy::BestFit).unwrap();
        let _guard = place(&mut inner, 0x10, FitStrategy::BestFit).unwrap();
        let b = place(&mut inner, 0x200, FitStrategy::BestFit).unwrap();
        let _guard = place(&mut inner, 0x10, FitStrategy::BestFit).unwrap();
        inner.release(a, 0x300).unwrap();
        inner.release(b, 0x200).unwrap();
        inner.check().unwrap();

        // free tags: 0x300 at 0, 0x200 after the first guard, and the tail
        assert_eq!(place(&mut inner, 0x180, FitStrategy::BestFit), Some(b));
    }

    #[test]
    fn test_release_rejects_mismatches() {
        let mut inner = arena(0x1000, 0x1000, 4);
        let a = place(&mut inner, 0x100, FitStrategy::InstantFit).unwrap();
        let before = kinds(&inner);

        let err = inner.release(a + 0x10, 0x100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        let err = inner.release(a, 0x80).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(kinds(&inner), before);
        inner.check().unwrap();

        inner.release(a, 0x100).unwrap();
        let err = inner.release(a, 0x100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_imported_span_is_exported_when_idle() {
        let mut inner = arena(0x1000, 0x1000, 4);
        refill(&mut inner);
        inner.add_span(0x10_0000, 0x1000, TagKind::Span).unwrap();
        inner.check().unwrap();
        assert_eq!(inner.totals().total, 0x2000);

        let mut placed = [
            place(&mut inner, 0x1000, FitStrategy::BestFit).unwrap(),
            place(&mut inner, 0x1000, FitStrategy::BestFit).unwrap(),
        ];
        placed.sort_unstable();
        assert_eq!(placed, [0x1000, 0x10_0000]);

        assert_eq!(
            inner.release(0x10_0000, 0x1000).unwrap(),
            Some(Export {
                addr: 0x10_0000,
                size: 0x1000
            })
        );
        inner.check().unwrap();
        assert_eq!(inner.totals().total, 0x1000);

        // static spans are never exported
        assert_eq!(inner.release(0x1000, 0x1000).unwrap(), None);
        inner.check().unwrap();
    }

    #[test]
    fn test_drain_idle_spans() {
        let mut inner = arena(0x1000, 0x1000, 4);
        refill(&mut inner);
        inner.add_span(0x10_0000, 0x1000, TagKind::Span).unwrap();
        refill(&mut inner);
        inner.add_span(0x20_0000, 0x1000, TagKind::Span).unwrap();
        // the newest free tag heads its list, and fills its span exactly
        let busy = place(&mut inner, 0x1000, FitStrategy::InstantFit).unwrap();
        assert_eq!(busy, 0x20_0000);

        let drained = inner.drain_idle_spans();
        assert_eq!(
            drained,
            [Export {
                addr: 0x10_0000,
                size: 0x1000
            }]
        );
        inner.check().unwrap();
        assert_eq!(inner.totals().total, 0x2000);
    }

    #[test]
    fn test_add_span_rejects_overlap() {
        let mut inner = arena(0x1000, 0x1000, 4);
        refill(&mut inner);
        let err = inner
            .add_span(0x1800, 0x1000, TagKind::StaticSpan)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        inner.check().unwrap();

        inner.add_span(0x2000, 0x1000, TagKind::StaticSpan).unwrap();
        inner.check().unwrap();
        // adjacent spans stay distinct
        assert_eq!(kinds(&inner).len(), 4);
    }

    #[test]
    fn test_hash_grows_under_many_busy_tags() {
        let mut inner = arena(0, 0x10000, 4);
        for _ in 0..256 {
            place(&mut inner, 0x10, FitStrategy::InstantFit).unwrap();
        }
        assert!(inner.rehashes() > 0);
        inner.check().unwrap();
    }
}
