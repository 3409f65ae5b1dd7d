use crate::{Addr, Size};

/// State of one boundary tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum TagKind {
    /// Marker for a span imported from a parent source. Returned to the
    /// source once the whole span is free again.
    #[display("span")]
    Span,
    /// Marker for a span added by the consumer. Never returned anywhere.
    #[display("static-span")]
    StaticSpan,
    /// A free run, linked into one of the size-class free lists.
    #[display("free")]
    Free,
    /// An allocated run, linked into the busy hash table.
    #[display("busy")]
    Busy,
}

impl TagKind {
    #[must_use]
    pub fn is_any_span(self) -> bool {
        matches!(self, Self::Span | Self::StaticSpan)
    }
}

/// Index of a boundary tag inside its arena's [`TagSlab`].
///
/// [`TagSlab`]: crate::bootstrap::TagSlab
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TagId(u32);

impl TagId {
    pub(crate) fn new(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or_else(|_| panic!("tag index overflow: {index}")))
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Doubly linked list pointers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) prev: Option<TagId>,
    pub(crate) next: Option<TagId>,
}

impl Link {
    pub(crate) const UNLINKED: Self = Self {
        prev: None,
        next: None,
    };
}

/// Describes one contiguous run of an arena's space.
///
/// Every tag sits in the segment list through `seg`. Free tags additionally
/// sit in exactly one free list, and busy tags in exactly one hash chain,
/// both through `list`. Span markers use `list` for nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoundaryTag {
    pub(crate) start: Addr,
    pub(crate) size: Size,
    pub(crate) kind: TagKind,
    pub(crate) seg: Link,
    pub(crate) list: Link,
}

impl BoundaryTag {
    pub(crate) fn new(start: Addr, size: Size, kind: TagKind) -> Self {
        assert!(size > 0, "boundary tag must not be empty");
        assert!(
            start.checked_add(size).is_some(),
            "boundary tag wraps the address space: {start:#x}+{size:#x}"
        );
        Self {
            start,
            size,
            kind,
            seg: Link::UNLINKED,
            list: Link::UNLINKED,
        }
    }

    /// One past the last address covered by this tag.
    pub(crate) fn end(&self) -> Addr {
        self.start + self.size
    }

    /// Last address covered by this tag.
    pub(crate) fn last(&self) -> Addr {
        self.start + (self.size - 1)
    }
}
