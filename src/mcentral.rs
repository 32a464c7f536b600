//! Central free lists, one per span class.
//!
//! `nonempty` holds spans with at least one free slot (or unswept spans that may get some),
//! `empty` holds full spans. A span handed to a per-P cache sits on neither list.
use crate::{
    heap::Heap,
    span::{SpanClass, SpanList, SpanPtr},
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::Ordering;

pub(crate) struct CentralLists {
    nonempty: Vec<SpanPtr>,
    empty: Vec<SpanPtr>,
}

impl CentralLists {
    pub(crate) fn remove(&mut self, s: SpanPtr) {
        let list = match s.list() {
            SpanList::NonEmpty => &mut self.nonempty,
            SpanList::Empty => &mut self.empty,
            SpanList::None => return,
        };
        if let Some(i) = list.iter().position(|&x| x == s) {
            list.swap_remove(i);
        }
        s.set_list(SpanList::None);
    }

    pub(crate) fn insert(&mut self, s: SpanPtr, list: SpanList) {
        debug_assert_eq!(s.list(), SpanList::None);
        match list {
            SpanList::NonEmpty => self.nonempty.push(s),
            SpanList::Empty => self.empty.push(s),
            SpanList::None => return,
        }
        s.set_list(list);
    }
}

pub(crate) struct MCentral {
    pub(crate) spanclass: SpanClass,
    lists: Mutex<CentralLists>,
}

impl MCentral {
    pub(crate) fn new(spanclass: SpanClass) -> Self {
        Self {
            spanclass,
            lists: Mutex::new(CentralLists {
                nonempty: Vec::new(),
                empty: Vec::new(),
            }),
        }
    }

    pub(crate) fn lists(&self) -> MutexGuard<'_, CentralLists> {
        self.lists.lock()
    }

    /// Returns a span released by a per-P cache.
    pub(crate) fn uncache_span(&self, s: SpanPtr) {
        let mut lists = self.lists.lock();
        s.reset_freeindex();
        let list = if s.has_free() {
            SpanList::NonEmpty
        } else {
            SpanList::Empty
        };
        lists.insert(s, list);
    }
}

impl Heap {
    /// Finds a span with a free slot for a per-P cache, sweeping unswept spans of the class first
    /// and growing the heap as a last resort.
    pub(crate) fn cache_span(&self, spc: SpanClass) -> Option<SpanPtr> {
        let class = spc.sizeclass();
        let npages = self.mheap.classes.class_npages(class);
        self.deduct_sweep_credit(npages * crate::arena::PAGE_SIZE, 0);

        let central = &self.mheap.central[spc.index()];
        debug_assert_eq!(central.spanclass, spc);
        let sg = self.mheap.sweepgen();
        'retry: loop {
            let mut lists = central.lists();
            let mut i = 0;
            while i < lists.nonempty.len() {
                let s = lists.nonempty[i];
                let sgs = s.sweepgen();
                if sgs == sg.wrapping_sub(2) && self.claim_sweep(s, sg) {
                    lists.remove(s);
                    drop(lists);
                    self.sweep_span(s, true);
                    if s.has_free() {
                        return Some(s);
                    }
                    central.lists().insert(s, SpanList::Empty);
                    continue 'retry;
                }
                if sgs == sg.wrapping_sub(1) {
                    // being swept by the background sweeper
                    i += 1;
                    continue;
                }
                lists.remove(s);
                if s.has_free() {
                    return Some(s);
                }
                lists.insert(s, SpanList::Empty);
            }

            let mut i = 0;
            while i < lists.empty.len() {
                let s = lists.empty[i];
                if s.sweepgen() == sg.wrapping_sub(2) && self.claim_sweep(s, sg) {
                    lists.remove(s);
                    drop(lists);
                    self.sweep_span(s, true);
                    if s.has_free() {
                        return Some(s);
                    }
                    central.lists().insert(s, SpanList::Empty);
                    continue 'retry;
                }
                i += 1;
            }
            break;
        }

        self.mheap
            .alloc_span(npages, spc, self.mheap.classes.class_size(class))
    }

    /// Moves a span from `sg - 2` to `sg - 1`; the caller that wins sweeps it.
    #[inline]
    pub(crate) fn claim_sweep(&self, s: SpanPtr, sg: u32) -> bool {
        s.sweepgen
            .compare_exchange(
                sg.wrapping_sub(2),
                sg.wrapping_sub(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}
