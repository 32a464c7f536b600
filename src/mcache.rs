//! Per-P span cache. Small allocations are served from the cached span of their class without
//! taking any lock; only refills go through the central lists.
use crate::{
    heap::Heap,
    span::{SpanClass, SpanPtr},
    Address,
};

pub struct MCache {
    alloc: Vec<Option<SpanPtr>>,
}

impl MCache {
    pub(crate) fn new(nclasses: usize) -> Self {
        Self {
            alloc: vec![None; nclasses * 2],
        }
    }
}

impl Heap {
    /// Takes the next free slot of class `spc` from `c`, refilling the cache when the cached span
    /// is exhausted. Returns `None` only when the arena has no room for a fresh span.
    pub(crate) fn mcache_next_free(&self, c: &mut MCache, spc: SpanClass) -> Option<Address> {
        if let Some(s) = c.alloc[spc.index()] {
            if let Some(addr) = s.next_free() {
                return Some(addr);
            }
            self.mheap.central[spc.index()].uncache_span(s);
            c.alloc[spc.index()] = None;
        }
        let s = self.cache_span(spc)?;
        debug_assert_eq!(s.sweepgen(), self.mheap.sweepgen());
        c.alloc[spc.index()] = Some(s);
        s.next_free()
    }

    /// Returns every cached span to its central list.
    pub(crate) fn release_all(&self, c: &mut MCache) {
        for (i, slot) in c.alloc.iter_mut().enumerate() {
            if let Some(s) = slot.take() {
                self.mheap.central[i].uncache_span(s);
            }
        }
    }
}
