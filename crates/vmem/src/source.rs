//! Parents that arenas import spans from.

use core::fmt;

use snafu::OptionExt as _;

use crate::{
    Addr, AllocFlags, Arena, Size,
    error::{InvalidArgumentSnafu, Result},
};

/// Supplier of spans for an [`Arena`] that runs out of space.
///
/// An arena calls into its source only with its own lock released, so a
/// source may block, or be another arena.
pub trait Source: Send + Sync {
    /// Hands out an extent of at least `size`.
    ///
    /// Returns the start and the actual length of the extent, which may be
    /// larger than requested. `flags` carries the blocking mode of the
    /// allocation that triggered the import.
    fn import(&self, size: Size, flags: AllocFlags) -> Result<(Addr, Size)>;

    /// Takes back an extent returned by [`import`](Self::import), with the
    /// exact start and length it was handed out with.
    fn export(&self, addr: Addr, size: Size);
}

/// A [`Source`] made of a pair of closures.
///
/// ```rust
/// use std::sync::{
///     Arc,
///     atomic::{AtomicUsize, Ordering},
/// };
///
/// use vmem::{AllocFlags, Arena, ArenaConfig, FnSource};
///
/// let next = AtomicUsize::new(0x1000_0000);
/// let pages = FnSource::new(
///     move |size, _flags| Ok((next.fetch_add(size, Ordering::Relaxed), size)),
///     |_addr, _size| {},
/// );
/// let arena = Arena::create(
///     ArenaConfig::new("va", 0x1000).source(Arc::new(pages)),
///     AllocFlags::SLEEP,
/// )
/// .unwrap();
/// assert_eq!(arena.alloc(0x4000, AllocFlags::SLEEP).unwrap(), 0x1000_0000);
/// ```
pub struct FnSource<I, E> {
    import: I,
    export: E,
}

impl<I, E> FnSource<I, E>
where
    I: Fn(Size, AllocFlags) -> Result<(Addr, Size)> + Send + Sync,
    E: Fn(Addr, Size) + Send + Sync,
{
    pub const fn new(import: I, export: E) -> Self {
        Self { import, export }
    }
}

impl<I, E> fmt::Debug for FnSource<I, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSource").finish_non_exhaustive()
    }
}

impl<I, E> Source for FnSource<I, E>
where
    I: Fn(Size, AllocFlags) -> Result<(Addr, Size)> + Send + Sync,
    E: Fn(Addr, Size) + Send + Sync,
{
    fn import(&self, size: Size, flags: AllocFlags) -> Result<(Addr, Size)> {
        (self.import)(size, flags)
    }

    fn export(&self, addr: Addr, size: Size) {
        (self.export)(addr, size);
    }
}

/// Lets arenas nest: a child arena imports spans allocated from its parent.
impl Source for Arena {
    fn import(&self, size: Size, flags: AllocFlags) -> Result<(Addr, Size)> {
        let granted = self.roundup_size(size).context(InvalidArgumentSnafu {
            reason: "size overflows the address space",
        })?;
        let addr = self.alloc(granted, flags)?;
        Ok((addr, granted))
    }

    fn export(&self, addr: Addr, size: Size) {
        if let Err(err) = self.free(addr, size) {
            log::error!("{}: cannot take back {addr:#x}+{size:#x}: {err}", self.name());
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{ArenaConfig, ErrorKind, SizeQuery};

    #[test]
    fn test_arena_as_source_reports_rounded_size() {
        let parent = Arena::create(
            ArenaConfig::new("parent", 0x1000).span(0x10_0000, 0x10_0000),
            AllocFlags::SLEEP,
        )
        .unwrap();
        let (addr, size) = parent.import(0x10, AllocFlags::SLEEP).unwrap();
        assert_eq!(size, 0x1000);
        assert_eq!(parent.size(SizeQuery::Allocated), 0x1000);
        parent.export(addr, size);
        assert_eq!(parent.size(SizeQuery::Allocated), 0);
    }

    #[test]
    fn test_fn_source_calls_closures() {
        let imports = Arc::new(AtomicUsize::new(0));
        let exports = Arc::new(AtomicUsize::new(0));
        let source = FnSource::new(
            {
                let imports = Arc::clone(&imports);
                move |size: Size, flags: AllocFlags| {
                    flags.blocking().map(|_| {
                        imports.fetch_add(1, Ordering::Relaxed);
                        (0x1000, size)
                    })
                }
            },
            {
                let exports = Arc::clone(&exports);
                move |_: Addr, _: Size| {
                    exports.fetch_add(1, Ordering::Relaxed);
                }
            },
        );
        assert_eq!(
            source.import(0x20, AllocFlags::NOSLEEP).unwrap(),
            (0x1000, 0x20)
        );
        assert_eq!(
            source.import(0x20, AllocFlags::empty()).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        source.export(0x1000, 0x20);
        assert_eq!(imports.load(Ordering::Relaxed), 1);
        assert_eq!(exports.load(Ordering::Relaxed), 1);
    }
}
