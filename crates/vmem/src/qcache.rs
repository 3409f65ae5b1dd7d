//! Quantum cache.
//!
//! Requests of up to a few quanta are served from per-size object caches
//! instead of the boundary-tag allocator. Each cache carves pages taken from
//! the owning arena into fixed-size objects; from the arena's point of view
//! a page is a single busy range.

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec,
    vec::Vec,
};
use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use snafu::ensure;
use spin::Mutex;

use crate::{
    Addr, Arena, Size,
    error::{ProtocolViolationSnafu, Result},
    flags::Blocking,
};

/// Largest number of size classes, in quanta.
pub(crate) const QCACHE_MAX_CLASSES: usize = 64;

/// Every page holds at least this many objects of the largest class.
const QCACHE_OBJS_PER_PAGE_MIN: usize = 3;

/// Idle pages a class keeps before returning further ones to the arena.
const IDLE_PAGES_MAX: usize = 1;

pub(crate) struct QuantumCache {
    name: &'static str,
    quantum_shift: u32,
    max: Size,
    page_size: Size,
    classes: ArrayVec<Mutex<SizeClass>, QCACHE_MAX_CLASSES>,
    hits: AtomicUsize,
    refills: AtomicUsize,
}

impl QuantumCache {
    /// Builds caches for every quantum multiple up to `qcache_max`.
    ///
    /// Returns `None` if `qcache_max` is below one quantum.
    pub(crate) fn new(name: &'static str, quantum: Size, qcache_max: Size) -> Option<Self> {
        let count = (qcache_max / quantum).min(QCACHE_MAX_CLASSES);
        if count == 0 {
            return None;
        }
        let max = count * quantum;
        let page_size = max
            .checked_mul(QCACHE_OBJS_PER_PAGE_MIN)?
            .checked_next_power_of_two()?;
        let classes = (1..=count)
            .map(|n| Mutex::new(SizeClass::new(n * quantum, page_size)))
            .collect();
        Some(Self {
            name,
            quantum_shift: quantum.trailing_zeros(),
            max,
            page_size,
            classes,
            hits: AtomicUsize::new(0),
            refills: AtomicUsize::new(0),
        })
    }

    pub(crate) fn max(&self) -> Size {
        self.max
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn refills(&self) -> usize {
        self.refills.load(Ordering::Relaxed)
    }

    fn class(&self, size: Size) -> &Mutex<SizeClass> {
        &self.classes[(size >> self.quantum_shift) - 1]
    }

    /// Takes an object of `size`, which must be a quantum multiple no larger
    /// than [`max`](Self::max).
    pub(crate) fn alloc(&self, arena: &Arena, size: Size, blocking: Blocking) -> Result<Addr> {
        let class = self.class(size);
        loop {
            if let Some(addr) = class.lock().take() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(addr);
            }

            let start = arena.alloc_page(self.page_size, blocking)?;
            let page = Page::new(self.page_size / size);
            class.lock().add_page(start, page);
            self.refills.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "{}: qcache {size:#x} took page {start:#x}+{:#x}",
                self.name,
                self.page_size
            );
        }
    }

    #[track_caller]
    pub(crate) fn free(&self, arena: &Arena, addr: Addr, size: Size) -> Result<()> {
        let surplus = self.class(size).lock().put(addr, size)?;
        if let Some(start) = surplus {
            log::trace!(
                "{}: qcache {size:#x} released page {start:#x}+{:#x}",
                self.name,
                self.page_size
            );
            arena.free_page(start, self.page_size)?;
        }
        Ok(())
    }

    /// Returns every idle page to the arena.
    pub(crate) fn reap(&self, arena: &Arena) -> bool {
        let mut reaped = false;
        for class in &self.classes {
            let idle = class.lock().drain_idle();
            for start in idle {
                reaped = true;
                if let Err(err) = arena.free_page(start, self.page_size) {
                    log::error!("{}: cannot release qcache page {start:#x}: {err}", self.name);
                }
            }
        }
        reaped
    }
}

/// Objects of one page. A set bit marks a free object.
#[derive(Debug)]
struct Page {
    free: Vec<u64>,
    in_use: usize,
}

impl Page {
    fn new(objects: usize) -> Self {
        let mut free = vec![u64::MAX; objects.div_ceil(64)];
        if objects % 64 != 0
            && let Some(last) = free.last_mut()
        {
            *last = (1 << (objects % 64)) - 1;
        }
        Self { free, in_use: 0 }
    }

    fn take(&mut self) -> Option<usize> {
        let (word, bits) = self
            .free
            .iter_mut()
            .enumerate()
            .find(|(_, bits)| **bits != 0)?;
        let bit = bits.trailing_zeros() as usize;
        *bits &= !(1 << bit);
        self.in_use += 1;
        Some(word * 64 + bit)
    }

    /// Marks object `index` free. Returns `false` if it already was.
    fn put(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        if self.free[word] & (1 << bit) != 0 {
            return false;
        }
        self.free[word] |= 1 << bit;
        self.in_use -= 1;
        true
    }

    fn is_full(&self) -> bool {
        self.free.iter().all(|&bits| bits == 0)
    }
}

#[derive(Debug)]
struct SizeClass {
    object_size: Size,
    page_size: Size,
    pages: BTreeMap<Addr, Page>,
    /// Pages with at least one free object.
    partial: BTreeSet<Addr>,
    idle: usize,
}

impl SizeClass {
    fn new(object_size: Size, page_size: Size) -> Self {
        Self {
            object_size,
            page_size,
            pages: BTreeMap::new(),
            partial: BTreeSet::new(),
            idle: 0,
        }
    }

    fn objects_per_page(&self) -> usize {
        self.page_size / self.object_size
    }

    fn take(&mut self) -> Option<Addr> {
        let &start = self.partial.first()?;
        let Some(page) = self.pages.get_mut(&start) else {
            unreachable!("partial page {start:#x} is not owned");
        };
        if page.in_use == 0 {
            self.idle -= 1;
        }
        let index = page.take()?;
        if page.is_full() {
            self.partial.remove(&start);
        }
        Some(start + index * self.object_size)
    }

    fn add_page(&mut self, start: Addr, page: Page) {
        self.pages.insert(start, page);
        self.partial.insert(start);
        self.idle += 1;
    }

    /// Takes an object back. Returns a page to hand back to the arena if the
    /// class now has too many idle pages.
    #[track_caller]
    fn put(&mut self, addr: Addr, size: Size) -> Result<Option<Addr>> {
        let objects_per_page = self.objects_per_page();
        let Some((&start, page)) = self.pages.range_mut(..=addr).next_back() else {
            return ProtocolViolationSnafu {
                addr,
                size,
                reason: "address is not allocated",
            }
            .fail();
        };
        let offset = addr - start;
        ensure!(
            offset % self.object_size == 0 && offset / self.object_size < objects_per_page,
            ProtocolViolationSnafu {
                addr,
                size,
                reason: "address is not allocated",
            }
        );
        ensure!(
            page.put(offset / self.object_size),
            ProtocolViolationSnafu {
                addr,
                size,
                reason: "object is already free",
            }
        );
        let idle = page.in_use == 0;
        self.partial.insert(start);

        if idle {
            self.idle += 1;
            if self.idle > IDLE_PAGES_MAX {
                self.pages.remove(&start);
                self.partial.remove(&start);
                self.idle -= 1;
                return Ok(Some(start));
            }
        }
        Ok(None)
    }

    fn drain_idle(&mut self) -> Vec<Addr> {
        let idle = self
            .pages
            .iter()
            .filter(|(_, page)| page.in_use == 0)
            .map(|(&start, _)| start)
            .collect::<Vec<_>>();
        for start in &idle {
            self.pages.remove(start);
            self.partial.remove(start);
        }
        self.idle = 0;
        idle
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocFlags, ArenaConfig, ErrorKind, SizeQuery};

    fn arena() -> Arena {
        Arena::create(
            ArenaConfig::new("test", 8)
                .span(0x1_0000, 0x1_0000)
                .qcache_max(64),
            AllocFlags::SLEEP,
        )
        .unwrap()
    }

    #[test]
    fn test_geometry() {
        let qcache = QuantumCache::new("test", 8, 64).unwrap();
        assert_eq!(qcache.max(), 64);
        assert_eq!(qcache.page_size, 256);
        assert_eq!(qcache.classes.len(), 8);

        let qcache = QuantumCache::new("test", 1, 1000).unwrap();
        assert_eq!(qcache.max(), QCACHE_MAX_CLASSES);

        assert!(QuantumCache::new("test", 16, 8).is_none());
    }

    #[test]
    fn test_page_bitmap() {
        let mut page = Page::new(70);
        let taken = (0..70).map(|_| page.take().unwrap()).collect::<Vec<_>>();
        assert_eq!(taken, (0..70).collect::<Vec<_>>());
        assert!(page.is_full());
        assert_eq!(page.take(), None);
        assert!(page.put(65));
        assert!(!page.put(65));
        assert_eq!(page.take(), Some(65));
        assert_eq!(page.in_use, 70);
    }

    #[test]
    fn test_objects_share_a_page() {
        let arena = arena();
        let objects = (0..8)
            .map(|_| arena.alloc(32, AllocFlags::SLEEP).unwrap())
            .collect::<Vec<_>>();
        let page = objects[0];
        for (i, addr) in objects.iter().enumerate() {
            assert_eq!(*addr, page + i * 32);
        }
        let stats = arena.stats();
        assert_eq!(stats.qcache_refills, 1);
        assert_eq!(stats.qcache_hits, 8);
        assert_eq!(stats.placements, 1);
        assert_eq!(arena.size(SizeQuery::Allocated), 256);

        for addr in objects {
            arena.free(addr, 32).unwrap();
        }
        // the only idle page is kept
        assert_eq!(arena.size(SizeQuery::Allocated), 256);
        assert!(arena.reap());
        assert_eq!(arena.size(SizeQuery::Allocated), 0);
        assert!(!arena.reap());
        arena.check().unwrap();
    }

    #[test]
    fn test_idle_pages_are_capped() {
        let arena = arena();
        let objects = (0..24)
            .map(|_| arena.alloc(32, AllocFlags::SLEEP).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(arena.size(SizeQuery::Allocated), 3 * 256);
        for addr in objects {
            arena.free(addr, 32).unwrap();
        }
        assert_eq!(arena.size(SizeQuery::Allocated), 256);
        arena.check().unwrap();
    }

    #[test]
    fn test_bad_frees_are_rejected() {
        let arena = arena();
        let a = arena.alloc(24, AllocFlags::SLEEP).unwrap();

        let err = arena.free(a + 8, 24).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        let err = arena.free(0x10, 24).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        // another class never saw this address
        let err = arena.free(a, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);

        arena.free(a, 24).unwrap();
        let err = arena.free(a, 24).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_large_sizes_bypass_the_cache() {
        let arena = arena();
        let a = arena.alloc(72, AllocFlags::SLEEP).unwrap();
        assert_eq!(arena.stats().qcache_refills, 0);
        assert_eq!(arena.size(SizeQuery::Allocated), 72);
        arena.free(a, 72).unwrap();
    }
}
