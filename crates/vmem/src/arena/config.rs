use alloc::sync::Arc;

use crate::{Addr, Size, Source, TagAllocator, bootstrap::DEFAULT_TAG_POOL};

/// Parameters of a new [`Arena`](crate::Arena).
///
/// ```rust
/// use vmem::{AllocFlags, Arena, ArenaConfig};
///
/// let config = ArenaConfig::new("pids", 1).span(1, 32767).qcache_max(4);
/// let arena = Arena::create(config, AllocFlags::SLEEP).unwrap();
/// let pid = arena.alloc(1, AllocFlags::SLEEP).unwrap();
/// assert!((1..32768).contains(&pid));
/// arena.free(pid, 1).unwrap();
/// ```
#[derive(Clone, derive_more::Debug)]
pub struct ArenaConfig {
    pub(crate) name: &'static str,
    pub(crate) quantum: Size,
    pub(crate) span: Option<(Addr, Size)>,
    #[debug(skip)]
    pub(crate) source: Option<Arc<dyn Source>>,
    pub(crate) qcache_max: Size,
    #[debug(skip)]
    pub(crate) tags: &'static dyn TagAllocator,
    pub(crate) degraded_fit: bool,
}

impl ArenaConfig {
    /// Starts a configuration for an arena without any span, source or
    /// quantum cache.
    ///
    /// `quantum` must be a power of two; every address and size handled by
    /// the arena is a multiple of it.
    #[must_use]
    pub const fn new(name: &'static str, quantum: Size) -> Self {
        Self {
            name,
            quantum,
            span: None,
            source: None,
            qcache_max: 0,
            tags: &DEFAULT_TAG_POOL,
            degraded_fit: true,
        }
    }

    /// Initial static span `[base, base + size)`. A zero `size` adds nothing.
    #[must_use]
    pub const fn span(mut self, base: Addr, size: Size) -> Self {
        self.span = Some((base, size));
        self
    }

    /// Parent to import spans from when the arena runs out of space.
    #[must_use]
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.source = Some(source);
        self
    }

    /// Largest size served by the quantum cache. Zero disables the cache.
    ///
    /// The value is rounded down to a quantum multiple and capped at 64
    /// quanta.
    #[must_use]
    pub const fn qcache_max(mut self, qcache_max: Size) -> Self {
        self.qcache_max = qcache_max;
        self
    }

    /// Supplier of boundary-tag records. Defaults to [`DEFAULT_TAG_POOL`].
    #[must_use]
    pub const fn tag_allocator(mut self, tags: &'static dyn TagAllocator) -> Self {
        self.tags = tags;
        self
    }

    /// Whether an instant-fit search that finds nothing is retried as a
    /// best-fit search before importing or failing. Enabled by default.
    #[must_use]
    pub const fn degraded_fit(mut self, enabled: bool) -> Self {
        self.degraded_fit = enabled;
        self
    }
}
