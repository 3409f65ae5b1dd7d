#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::sync::Arc;

use vmem::{AllocFlags, Arena, ArenaConfig, ErrorKind, Placement, SizeQuery, TagKind};

const SLEEP: AllocFlags = AllocFlags::SLEEP;
const PAGE: usize = 0x1000;

fn parent() -> Arc<Arena> {
    Arc::new(
        Arena::create(
            ArenaConfig::new("kva", PAGE).span(0x8000_0000, 0x100 * PAGE),
            SLEEP,
        )
        .unwrap(),
    )
}

fn child(parent: &Arc<Arena>, qcache_max: usize) -> Arena {
    Arena::create(
        ArenaConfig::new("kmem", 0x10)
            .source(Arc::<Arena>::clone(parent))
            .qcache_max(qcache_max),
        SLEEP,
    )
    .unwrap()
}

#[test]
fn child_imports_whole_parent_quanta() {
    let parent = parent();
    let child = child(&parent, 0);

    let a = child.alloc(0x40, SLEEP).unwrap();
    assert!((0x8000_0000..0x8010_0000).contains(&a));
    assert_eq!(parent.size(SizeQuery::Allocated), PAGE);
    assert_eq!(child.size(SizeQuery::Total), PAGE);

    // the rest of the imported page serves later requests
    let b = child.alloc(0x40, SLEEP).unwrap();
    assert_eq!(b, a + 0x40);
    assert_eq!(child.stats().imports, 1);

    child.free(a, 0x40).unwrap();
    child.free(b, 0x40).unwrap();
    assert_eq!(child.stats().exports, 1);
    assert_eq!(parent.size(SizeQuery::Allocated), 0);
    child.check().unwrap();
    parent.check().unwrap();
}

#[test]
fn constrained_import_is_large_enough() {
    let parent = parent();
    let child = child(&parent, 0);

    let placement = Placement::new().align(4 * PAGE).phase(0x20);
    let a = child.xalloc(0x100, &placement, SLEEP).unwrap();
    assert_eq!((a - 0x20) % (4 * PAGE), 0);
    child.check().unwrap();
    child.xfree(a, 0x100).unwrap();
    assert_eq!(parent.size(SizeQuery::Allocated), 0);
}

#[test]
fn bounded_xalloc_never_imports() {
    let parent = parent();
    let child = child(&parent, 0);

    let placement = Placement::new().min(0x8000_0000).max(0x8010_0000);
    let err = child.xalloc(0x40, &placement, SLEEP).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSpace);
    let err = child.xalloc_addr(0x8000_0000, 0x40, SLEEP).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSpace);
    assert_eq!(child.stats().imports, 0);
}

#[test]
fn exhausted_parent_surfaces_as_out_of_space() {
    let parent = parent();
    let child = child(&parent, 0);

    let all = parent.alloc(0x100 * PAGE, SLEEP).unwrap();
    let err = child.alloc(0x10, SLEEP).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfSpace);
    assert_eq!(child.size(SizeQuery::Total), 0);

    parent.free(all, 0x100 * PAGE).unwrap();
    child.alloc(0x10, SLEEP).unwrap();
}

#[test]
fn static_spans_are_used_before_importing() {
    let parent = parent();
    let child = child(&parent, 0);
    child.add(0x10_0000, 0x100, SLEEP).unwrap();

    let a = child.alloc(0x100, SLEEP).unwrap();
    assert_eq!(a, 0x10_0000);
    assert_eq!(child.stats().imports, 0);

    child.free(a, 0x100).unwrap();
    assert_eq!(child.stats().exports, 0);
    assert_eq!(
        child.segments().first().map(|s| s.kind),
        Some(TagKind::StaticSpan)
    );
}

#[test]
fn destroy_returns_quantum_cache_pages_to_parent() {
    let parent = parent();
    let child = child(&parent, 0x40);

    let objects = (0..10)
        .map(|_| child.alloc(0x30, SLEEP).unwrap())
        .collect::<Vec<_>>();
    assert!(parent.size(SizeQuery::Allocated) > 0);
    for addr in objects {
        child.free(addr, 0x30).unwrap();
    }
    // one idle page stays cached, keeping its span imported
    assert!(parent.size(SizeQuery::Allocated) > 0);

    child.destroy().unwrap();
    assert_eq!(parent.size(SizeQuery::Allocated), 0);
    parent.check().unwrap();
}

#[test]
fn destroy_with_outstanding_allocations() {
    let parent = parent();
    let child = child(&parent, 0);

    let _a = child.alloc(0x40, SLEEP).unwrap();
    let b = child.alloc(2 * PAGE, SLEEP).unwrap();
    child.free(b, 2 * PAGE).unwrap();

    let err = child.destroy().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);
    // the span holding `_a` stays with the child, the idle one went back
    assert_eq!(parent.size(SizeQuery::Allocated), PAGE);
    parent.check().unwrap();
}

#[test]
fn dropping_idle_child_returns_everything() {
    let parent = parent();
    {
        let child = child(&parent, 0);
        let a = child.alloc(0x40, SLEEP).unwrap();
        child.free(a, 0x40).unwrap();
    }
    assert_eq!(parent.size(SizeQuery::Allocated), 0);
    assert_eq!(Arc::strong_count(&parent), 1);
}
