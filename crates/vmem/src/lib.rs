//! General-purpose resource arena allocator.
//!
//! This crate manages allocation and release of contiguous ranges inside an
//! abstract, linear address space. The space does not have to be memory: the
//! same allocator hands out kernel virtual address ranges, device minor
//! numbers, process identifiers or any other integer resource that can be
//! described by a base and a length.
//!
//! The algorithm is the classic vmem design (Bonwick and Adams, "Magazines
//! and Vmem"):
//!
//! - Every contiguous run of the space is described by an external
//!   [boundary tag](TagKind), kept in an address-ordered segment list.
//! - Free runs are indexed by power-of-two size class, giving O(1)
//!   [`InstantFit`](AllocFlags::INSTANTFIT) placement and a tighter
//!   [`BestFit`](AllocFlags::BESTFIT) mode.
//! - Busy runs are found again on release through a resizable hash table
//!   keyed by start address.
//! - An arena may import spans from a parent [`Source`] on demand and
//!   returns them as soon as they become entirely idle.
//! - Small allocations can be served by an optional quantum cache that
//!   carves fixed-size objects out of larger pages taken from the arena.
//!
//! # Usage Examples
//!
//! ```rust
//! use vmem::{AllocFlags, Arena, ArenaConfig, Placement};
//!
//! let config = ArenaConfig::new("minor-numbers", 1).span(1000, 2000);
//! let arena = Arena::create(config, AllocFlags::SLEEP).unwrap();
//!
//! let addr = arena.alloc(500, AllocFlags::SLEEP).unwrap();
//! assert_eq!(addr, 1000);
//!
//! let aligned = arena
//!     .xalloc(10, &Placement::new().align(16), AllocFlags::SLEEP)
//!     .unwrap();
//! assert_eq!(aligned % 16, 0);
//!
//! arena.free(aligned, 10).unwrap();
//! arena.free(addr, 500).unwrap();
//! arena.destroy().unwrap();
//! ```
//!
//! ## Nested arenas
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use vmem::{AllocFlags, Arena, ArenaConfig};
//!
//! let parent = Arc::new(
//!     Arena::create(
//!         ArenaConfig::new("parent", 4096).span(0x10_0000, 0x10_0000),
//!         AllocFlags::SLEEP,
//!     )
//!     .unwrap(),
//! );
//! let child = Arena::create(
//!     ArenaConfig::new("child", 16).source(Arc::<Arena>::clone(&parent)),
//!     AllocFlags::SLEEP,
//! )
//! .unwrap();
//!
//! let addr = child.alloc(64, AllocFlags::SLEEP).unwrap();
//! assert!((0x10_0000..0x20_0000).contains(&addr));
//! child.free(addr, 64).unwrap();
//! ```
//!
//! # Thread Safety
//!
//! [`Arena`] is `Send + Sync`. Each arena serializes its mutating operations
//! with a single lock; calls into a parent source are always made with that
//! lock released.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::{
    arena::{Arena, ArenaConfig, ArenaStats, Placement, Segment, SizeQuery},
    bootstrap::{DEFAULT_TAG_POOL, TagAllocator, TagPool},
    error::{Error, ErrorKind, Location, Result},
    flags::{AllocFlags, Blocking, FitStrategy},
    source::{FnSource, Source},
    tag::TagKind,
};

mod arena;
mod bootstrap;
mod error;
mod flags;
mod freelist;
mod hash;
mod qcache;
mod seglist;
mod source;
mod tag;

/// An address (or index) inside an arena's resource space.
pub type Addr = usize;

/// A length inside an arena's resource space.
pub type Size = usize;
