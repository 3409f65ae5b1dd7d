use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use snafu::ensure;
use spin::{Mutex, MutexGuard};

pub use self::{config::ArenaConfig, placement::Placement};
use self::{
    inner::{ArenaInner, Export},
    placement::Constraints,
};
use crate::{
    Addr, ErrorKind, Size, Source,
    bootstrap::{SlotStorage, TagBudget},
    error::{InUseSnafu, InvalidArgumentSnafu, OutOfSpaceSnafu, ProtocolViolationSnafu, Result},
    flags::{AllocFlags, Blocking, FitStrategy},
    qcache::QuantumCache,
    tag::TagKind,
};

mod config;
mod inner;
mod placement;

/// One boundary tag of an arena, as reported by [`Arena::segments`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: Addr,
    pub size: Size,
    pub kind: TagKind,
}

/// Selects what [`Arena::size`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeQuery {
    /// Sum of all busy ranges. Quantum-cache pages count as busy.
    Allocated,
    /// Sum of all free ranges.
    Free,
    /// Sum of all spans.
    Total,
}

/// Operation counters of an arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Ranges placed by the general allocator, including quantum-cache
    /// pages.
    pub placements: usize,
    /// Ranges released to the general allocator.
    pub frees: usize,
    pub imports: usize,
    pub exports: usize,
    /// Objects served by the quantum cache.
    pub qcache_hits: usize,
    /// Pages the quantum cache took from the arena.
    pub qcache_refills: usize,
    /// Times the busy hash table was grown.
    pub rehashes: usize,
}

#[derive(Debug, Default)]
struct Counters {
    placements: AtomicUsize,
    frees: AtomicUsize,
    imports: AtomicUsize,
    exports: AtomicUsize,
}

/// A resource arena.
///
/// An arena hands out quantum-aligned ranges of an abstract address space.
/// The space is made of spans that are either added explicitly with
/// [`add`](Self::add) or imported on demand from a parent [`Source`].
pub struct Arena {
    name: &'static str,
    quantum: Size,
    source: Option<Arc<dyn Source>>,
    degraded_fit: bool,
    inner: Mutex<ArenaInner>,
    qcache: Option<QuantumCache>,
    counters: Counters,
    torn_down: AtomicBool,
}

impl Arena {
    /// Creates an arena.
    ///
    /// Fails with [`InvalidArgument`](crate::ErrorKind::InvalidArgument) if
    /// the quantum is not a power of two or the initial span is malformed.
    #[track_caller]
    pub fn create(config: ArenaConfig, flags: AllocFlags) -> Result<Self> {
        let blocking = flags.blocking()?;
        let ArenaConfig {
            name,
            quantum,
            span,
            source,
            qcache_max,
            tags,
            degraded_fit,
        } = config;
        ensure!(
            quantum.is_power_of_two(),
            InvalidArgumentSnafu {
                reason: "quantum is not a power of two",
            }
        );
        let quantum_shift = quantum.trailing_zeros();

        let arena = Self {
            name,
            quantum,
            source,
            degraded_fit,
            inner: Mutex::new(ArenaInner::new(name, quantum_shift, tags)),
            qcache: QuantumCache::new(name, quantum, qcache_max),
            counters: Counters::default(),
            torn_down: AtomicBool::new(false),
        };
        if let Some((base, size)) = span
            && size > 0
        {
            arena.add_span(base, size, TagKind::StaticSpan, blocking)?;
        }
        log::debug!(
            "{name}: created, quantum {quantum:#x}, qcache up to {:#x}",
            arena.qcache.as_ref().map_or(0, QuantumCache::max)
        );
        Ok(arena)
    }

    /// Releases every idle span and tears the arena down.
    ///
    /// Fails with [`InUse`](crate::ErrorKind::InUse) if allocations are still
    /// outstanding. Imported spans that are still partially in use are then
    /// kept by the parent source; fully idle ones are returned regardless.
    #[track_caller]
    pub fn destroy(self) -> Result<()> {
        self.teardown()
    }

    #[track_caller]
    fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(qcache) = &self.qcache {
            qcache.reap(self);
        }
        self.export_idle_spans();
        let busy = self.inner.lock().busy_count();
        if busy > 0 {
            log::warn!("{}: destroyed with {busy} outstanding allocations", self.name);
            return InUseSnafu {
                arena: self.name,
                busy,
            }
            .fail();
        }
        log::debug!("{}: destroyed", self.name);
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn quantum(&self) -> Size {
        self.quantum
    }

    /// Rounds `size` up to a multiple of the quantum.
    ///
    /// Returns `None` if the result does not fit in a [`Size`].
    #[must_use]
    pub fn roundup_size(&self, size: Size) -> Option<Size> {
        size.checked_next_multiple_of(self.quantum)
    }

    #[track_caller]
    fn checked_roundup(&self, size: Size) -> Result<Size> {
        ensure!(
            size > 0,
            InvalidArgumentSnafu {
                reason: "size is zero",
            }
        );
        size.checked_next_multiple_of(self.quantum).ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: "size overflows the address space",
            }
            .build()
        })
    }

    /// Locks the arena with at least the reserve of boundary tags available
    /// and room to store them.
    ///
    /// Tags and their storage are obtained with the lock released, so a
    /// blocking wait never holds up other users of this arena.
    fn lock_refilled(&self, blocking: Blocking) -> Result<MutexGuard<'_, ArenaInner>> {
        loop {
            let inner = self.inner.lock();
            let deficit = inner.slab.deficit();
            if deficit > 0 {
                let allocator = inner.slab.allocator();
                drop(inner);
                let budget = TagBudget::take(allocator, deficit, blocking, self.name)?;
                self.inner.lock().slab.deposit(budget);
                continue;
            }
            let Some(capacity) = inner.slab.capacity_needed() else {
                return Ok(inner);
            };
            drop(inner);

            let storage = SlotStorage::allocate(capacity, blocking, self.name)?;
            let unused = self.inner.lock().slab.install(storage);
            drop(unused);
        }
    }

    /// Adds the span `[addr, addr + size)` to the arena.
    ///
    /// Spans added this way are never returned to a source.
    #[track_caller]
    pub fn add(&self, addr: Addr, size: Size, flags: AllocFlags) -> Result<Addr> {
        let blocking = flags.blocking()?;
        self.add_span(addr, size, TagKind::StaticSpan, blocking)?;
        Ok(addr)
    }

    #[track_caller]
    fn add_span(&self, addr: Addr, size: Size, kind: TagKind, blocking: Blocking) -> Result<()> {
        ensure!(
            size > 0,
            InvalidArgumentSnafu {
                reason: "span is empty",
            }
        );
        ensure!(
            addr % self.quantum == 0 && size % self.quantum == 0,
            InvalidArgumentSnafu {
                reason: "span is not aligned to the quantum",
            }
        );
        ensure!(
            addr.checked_add(size).is_some(),
            InvalidArgumentSnafu {
                reason: "span wraps the address space",
            }
        );
        let mut inner = self.lock_refilled(blocking)?;
        inner.add_span(addr, size, kind)
    }

    /// Allocates `size` (rounded up to the quantum) anywhere in the arena.
    ///
    /// Sizes up to the quantum-cache limit are served by the quantum cache.
    /// Ranges from `alloc` must be released with [`free`](Self::free).
    #[track_caller]
    pub fn alloc(&self, size: Size, flags: AllocFlags) -> Result<Addr> {
        let (blocking, strategy) = flags.parse()?;
        let size = self.checked_roundup(size)?;
        if let Some(qcache) = &self.qcache
            && size <= qcache.max()
        {
            return qcache.alloc(self, size, blocking);
        }
        self.place(
            size,
            &Constraints::unbounded(self.quantum),
            blocking,
            strategy,
            true,
        )
    }

    /// Allocates `size` (rounded up to the quantum) under the constraints of
    /// `placement`.
    ///
    /// A span is imported from the source only if `placement` sets neither
    /// `min` nor `max`. Ranges from `xalloc` must be released with
    /// [`xfree`](Self::xfree).
    #[track_caller]
    pub fn xalloc(&self, size: Size, placement: &Placement, flags: AllocFlags) -> Result<Addr> {
        let (blocking, strategy) = flags.parse()?;
        let size = self.checked_roundup(size)?;
        let constraints = placement.validate(size, self.quantum)?;
        self.place(
            size,
            &constraints,
            blocking,
            strategy,
            placement.is_unbounded(),
        )
    }

    /// Allocates exactly `[addr, addr + size)`. Never imports.
    ///
    /// Release the range with [`xfree`](Self::xfree).
    #[track_caller]
    pub fn xalloc_addr(&self, addr: Addr, size: Size, flags: AllocFlags) -> Result<Addr> {
        let blocking = flags.blocking()?;
        let size = self.checked_roundup(size)?;
        ensure!(
            addr % self.quantum == 0,
            InvalidArgumentSnafu {
                reason: "address is not aligned to the quantum",
            }
        );
        let end = addr.checked_add(size).ok_or_else(|| {
            InvalidArgumentSnafu {
                reason: "range wraps the address space",
            }
            .build()
        })?;
        let constraints = Placement::new()
            .min(addr)
            .max(end)
            .validate(size, self.quantum)?;
        // the free tag holding the range may sit below the instant-fit order
        self.place(size, &constraints, blocking, FitStrategy::BestFit, false)
    }

    #[track_caller]
    fn place(
        &self,
        size: Size,
        constraints: &Constraints,
        blocking: Blocking,
        strategy: FitStrategy,
        may_import: bool,
    ) -> Result<Addr> {
        let degrade = self.degraded_fit;
        if let Some(addr) = self.try_place(size, constraints, blocking, strategy, degrade)? {
            return Ok(addr);
        }
        if may_import
            && let Some(source) = &self.source
            && self.import_span(source.as_ref(), size, constraints, blocking)?
        {
            // the imported span may sit below the instant-fit order of `size`
            if let Some(addr) = self.try_place(size, constraints, blocking, strategy, true)? {
                return Ok(addr);
            }
            // a concurrent caller took the span; return whatever went idle
            self.export_idle_spans();
        }
        OutOfSpaceSnafu {
            arena: self.name,
            size,
        }
        .fail()
    }

    fn try_place(
        &self,
        size: Size,
        constraints: &Constraints,
        blocking: Blocking,
        strategy: FitStrategy,
        degrade: bool,
    ) -> Result<Option<Addr>> {
        let mut inner = self.lock_refilled(blocking)?;
        let mut found = inner.find(size, constraints, strategy);
        if found.is_none() && strategy.is_instant_fit() && degrade {
            found = inner.find(size, constraints, FitStrategy::BestFit);
        }
        let Some((id, addr)) = found else {
            return Ok(None);
        };
        inner.claim(id, addr, size);
        inner.slab.trim();
        drop(inner);

        self.counters.placements.fetch_add(1, Ordering::Relaxed);
        Ok(Some(addr))
    }

    /// Imports a span large enough for `size` under `constraints`.
    ///
    /// Returns whether a span was added. Failures of the source are not
    /// errors of this arena; the caller reports them as lack of space.
    #[track_caller]
    fn import_span(
        &self,
        source: &dyn Source,
        size: Size,
        constraints: &Constraints,
        blocking: Blocking,
    ) -> Result<bool> {
        let Some(request) = constraints.import_size(size, self.quantum) else {
            return Ok(false);
        };
        let (addr, granted) = match source.import(request, AllocFlags::for_import(blocking)) {
            Ok(extent) => extent,
            Err(err) => {
                log::trace!("{}: import of {request:#x} failed: {err}", self.name);
                return Ok(false);
            }
        };

        let usable = granted >= request
            && addr % self.quantum == 0
            && granted % self.quantum == 0
            && addr.checked_add(granted).is_some();
        if !usable {
            log::warn!(
                "{}: source returned unusable extent {addr:#x}+{granted:#x} for {request:#x}",
                self.name
            );
            source.export(addr, granted);
            return Ok(false);
        }
        if let Err(err) = self.add_span(addr, granted, TagKind::Span, blocking) {
            log::warn!(
                "{}: cannot register imported {addr:#x}+{granted:#x}: {err}",
                self.name
            );
            source.export(addr, granted);
            // an extent overlapping our own spans is the source's fault
            if err.kind() == ErrorKind::InvalidArgument {
                return Ok(false);
            }
            return Err(err);
        }

        self.counters.imports.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: imported {addr:#x}+{granted:#x}", self.name);
        Ok(true)
    }

    fn export_idle_spans(&self) {
        let exports = self.inner.lock().drain_idle_spans();
        for export in exports {
            self.export_span(export);
        }
    }

    fn export_span(&self, export: Export) {
        let Export { addr, size } = export;
        let Some(source) = &self.source else {
            unreachable!("imported span without a source");
        };
        source.export(addr, size);
        self.counters.exports.fetch_add(1, Ordering::Relaxed);
        log::trace!("{}: exported {addr:#x}+{size:#x}", self.name);
    }

    /// Releases a range obtained from [`alloc`](Self::alloc).
    ///
    /// `size` is the size passed to `alloc`.
    #[track_caller]
    pub fn free(&self, addr: Addr, size: Size) -> Result<()> {
        let size = self.release_size(addr, size)?;
        if let Some(qcache) = &self.qcache
            && size <= qcache.max()
        {
            return qcache.free(self, addr, size);
        }
        self.release(addr, size)
    }

    /// Releases a range obtained from [`xalloc`](Self::xalloc) or
    /// [`xalloc_addr`](Self::xalloc_addr).
    ///
    /// Fails with [`ProtocolViolation`](crate::ErrorKind::ProtocolViolation),
    /// leaving the arena untouched, if `addr` and `size` do not name an
    /// outstanding allocation.
    #[track_caller]
    pub fn xfree(&self, addr: Addr, size: Size) -> Result<()> {
        let size = self.release_size(addr, size)?;
        self.release(addr, size)
    }

    #[track_caller]
    fn release_size(&self, addr: Addr, size: Size) -> Result<Size> {
        size.checked_next_multiple_of(self.quantum)
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                ProtocolViolationSnafu {
                    addr,
                    size,
                    reason: "size is not a valid allocation size",
                }
                .build()
            })
    }

    #[track_caller]
    fn release(&self, addr: Addr, size: Size) -> Result<()> {
        let export = {
            let mut inner = self.inner.lock();
            let export = inner.release(addr, size)?;
            inner.slab.trim();
            export
        };
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        if let Some(export) = export {
            self.export_span(export);
        }
        Ok(())
    }

    /// Takes a quantum-cache page through the general allocator.
    pub(crate) fn alloc_page(&self, size: Size, blocking: Blocking) -> Result<Addr> {
        self.place(
            size,
            &Constraints::unbounded(self.quantum),
            blocking,
            FitStrategy::InstantFit,
            true,
        )
    }

    #[track_caller]
    pub(crate) fn free_page(&self, addr: Addr, size: Size) -> Result<()> {
        self.release(addr, size)
    }

    /// Returns idle quantum-cache pages to the arena.
    ///
    /// Returns whether anything was released.
    pub fn reap(&self) -> bool {
        self.qcache.as_ref().is_some_and(|qcache| qcache.reap(self))
    }

    #[must_use]
    pub fn size(&self, query: SizeQuery) -> Size {
        let totals = self.inner.lock().totals();
        match query {
            SizeQuery::Allocated => totals.allocated,
            SizeQuery::Free => totals.free,
            SizeQuery::Total => totals.total,
        }
    }

    #[must_use]
    pub fn stats(&self) -> ArenaStats {
        let rehashes = self.inner.lock().rehashes();
        let (qcache_hits, qcache_refills) = self
            .qcache
            .as_ref()
            .map_or((0, 0), |qcache| (qcache.hits(), qcache.refills()));
        ArenaStats {
            placements: self.counters.placements.load(Ordering::Relaxed),
            frees: self.counters.frees.load(Ordering::Relaxed),
            imports: self.counters.imports.load(Ordering::Relaxed),
            exports: self.counters.exports.load(Ordering::Relaxed),
            qcache_hits,
            qcache_refills,
            rehashes,
        }
    }

    /// Verifies the internal consistency of the arena.
    ///
    /// Checks that tags are ordered and cover every span exactly, that no
    /// two free tags are adjacent, that every tag is indexed where it
    /// belongs and that the size counters are exact. Reports the first
    /// problem found as a [`ProtocolViolation`](crate::ErrorKind::ProtocolViolation).
    pub fn check(&self) -> Result<()> {
        self.inner.lock().check()
    }

    /// Snapshot of every boundary tag in address order.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        self.inner.lock().segments()
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let totals = inner.totals();
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("quantum", &format_args!("{:#x}", self.quantum))
            .field("allocated", &format_args!("{:#x}", totals.allocated))
            .field("free", &format_args!("{:#x}", totals.free))
            .field("total", &format_args!("{:#x}", totals.total))
            .field("segments", &inner.segments())
            .finish_non_exhaustive()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // outstanding allocations have been reported by `teardown` already
        let _ = self.teardown();
    }
}
