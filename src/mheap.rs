//! Page heap: hands out page runs as spans and maps every page back to its span.
use crate::{
    arena::{Arena, PAGE_SHIFT},
    bitmap::HeapBitmap,
    mcentral::MCentral,
    sizeclass::SizeClasses,
    span::{Span, SpanClass, SpanPtr, SpanState},
    Address,
};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

struct HeapPages {
    /// Free page runs keyed by first page index.
    free: BTreeMap<usize, usize>,
    /// Pages below this index have been handed out at least once.
    used_pages: usize,
    allspans: Vec<Box<Span>>,
    /// Freed span descriptors. They may still be referenced by the current span snapshot and
    /// are dropped when the next snapshot is taken.
    retired: Vec<Box<Span>>,
}

pub struct MHeap {
    pub arena: Arena,
    pub bitmap: HeapBitmap,
    pub classes: SizeClasses,
    pub(crate) central: Box<[MCentral]>,
    pub(crate) sweepgen: AtomicU32,
    lock: Mutex<HeapPages>,
    spans: Box<[AtomicPtr<Span>]>,
    arena_used: AtomicUsize,
    pages_in_use: AtomicUsize,
    gcspans: RwLock<Vec<SpanPtr>>,
}

impl MHeap {
    pub fn new(arena_size: usize, dump_size_classes: bool) -> std::io::Result<Self> {
        let arena = Arena::new(arena_size)?;
        let bitmap = HeapBitmap::new(arena.start(), arena.size())?;
        let classes = SizeClasses::new(dump_size_classes);
        let central = (0..classes.count() * 2)
            .map(|i| MCentral::new(SpanClass::new(i >> 1, i & 1 != 0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let spans = (0..arena.npages())
            .map(|_| AtomicPtr::new(null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let arena_used = AtomicUsize::new(arena.start());
        Ok(Self {
            arena,
            bitmap,
            classes,
            central,
            sweepgen: AtomicU32::new(0),
            lock: Mutex::new(HeapPages {
                free: BTreeMap::new(),
                used_pages: 0,
                allspans: Vec::new(),
                retired: Vec::new(),
            }),
            spans,
            arena_used,
            pages_in_use: AtomicUsize::new(0),
            gcspans: RwLock::new(Vec::new()),
        })
    }

    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    /// True if `addr` lies in the part of the arena handed out so far.
    #[inline]
    pub fn in_heap(&self, addr: Address) -> bool {
        addr >= self.arena.start() && addr < self.arena_used.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn span_of(&self, addr: Address) -> Option<SpanPtr> {
        if !self.arena.contains(addr) {
            return None;
        }
        let s = self.spans[self.arena.page_index(addr)].load(Ordering::Acquire);
        if s.is_null() {
            None
        } else {
            Some(SpanPtr::new(unsafe { &*s }))
        }
    }

    /// Allocates a span of `npages` pages for objects of `elemsize` bytes. Returns `None` when the
    /// arena is exhausted.
    pub(crate) fn alloc_span(
        &self,
        npages: usize,
        spanclass: SpanClass,
        elemsize: usize,
    ) -> Option<SpanPtr> {
        let mut guard = self.lock.lock();
        let pages = &mut *guard;
        let first = Self::take_free_run(&mut pages.free, npages).or_else(|| {
            if pages.used_pages + npages > self.arena.npages() {
                return None;
            }
            let first = pages.used_pages;
            pages.used_pages += npages;
            let used = self.arena.page_address(pages.used_pages);
            self.arena_used.fetch_max(used, Ordering::AcqRel);
            Some(first)
        })?;

        let span = Box::new(Span::new(
            self.arena.page_address(first),
            npages,
            spanclass,
            elemsize,
            self.sweepgen(),
        ));
        span.index.store(pages.allspans.len(), Ordering::Relaxed);
        let ptr = &*span as *const Span as *mut Span;
        for page in first..first + npages {
            self.spans[page].store(ptr, Ordering::Release);
        }
        pages.allspans.push(span);
        self.pages_in_use.fetch_add(npages, Ordering::Relaxed);
        Some(SpanPtr::new(unsafe { &*ptr }))
    }

    fn take_free_run(free: &mut BTreeMap<usize, usize>, npages: usize) -> Option<usize> {
        let (&first, &len) = free.iter().find(|&(_, &len)| len >= npages)?;
        free.remove(&first);
        if len > npages {
            free.insert(first + npages, len - npages);
        }
        Some(first)
    }

    /// Returns the span's pages to the free runs, coalescing with neighbours.
    pub(crate) fn free_span(&self, s: SpanPtr) {
        let mut guard = self.lock.lock();
        let pages = &mut *guard;
        if s.state() != SpanState::InUse {
            throw!(
                "free_span: span {:#x} in state {:?}",
                s.start,
                s.state()
            );
        }
        s.state.store(SpanState::Dead, Ordering::Release);
        let mut first = self.arena.page_index(s.start);
        let mut len = s.npages;
        for page in first..first + len {
            self.spans[page].store(null_mut(), Ordering::Release);
        }

        let index = s.index.load(Ordering::Relaxed);
        let span = pages.allspans.swap_remove(index);
        debug_assert_eq!(&*span as *const Span, &*s as *const Span);
        if let Some(moved) = pages.allspans.get(index) {
            moved.index.store(index, Ordering::Relaxed);
        }
        pages.retired.push(span);

        let prev = pages.free.range(..first).next_back().map(|(&p, &l)| (p, l));
        if let Some((prev, prev_len)) = prev {
            if prev + prev_len == first {
                pages.free.remove(&prev);
                first = prev;
                len += prev_len;
            }
        }
        if let Some(next_len) = pages.free.remove(&(first + len)) {
            len += next_len;
        }
        pages.free.insert(first, len);
        self.pages_in_use.fetch_sub(s.npages, Ordering::Relaxed);
    }

    /// Snapshots the in-use spans for marking and sweeping and drops descriptors retired before
    /// the previous snapshot. Only called with the world stopped, sweeping finished and the
    /// background sweeper parked.
    pub(crate) fn copy_spans(&self) {
        let mut pages = self.lock.lock();
        let mut gcspans = self.gcspans.write();
        gcspans.clear();
        gcspans.extend(pages.allspans.iter().map(|s| SpanPtr::new(s)));
        pages.retired.clear();
    }

    pub(crate) fn gc_spans(&self) -> RwLockReadGuard<'_, Vec<SpanPtr>> {
        self.gcspans.read()
    }

    pub fn heap_sys(&self) -> usize {
        self.arena_used.load(Ordering::Relaxed) - self.arena.start()
    }

    pub fn heap_inuse(&self) -> usize {
        self.pages_in_use.load(Ordering::Relaxed) << PAGE_SHIFT
    }

    pub fn span_count(&self) -> usize {
        self.lock.lock().allspans.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::PAGE_SIZE;

    fn heap() -> MHeap {
        MHeap::new(64 * PAGE_SIZE, false).unwrap()
    }

    #[test]
    fn spans_map_back_from_pages() {
        let h = heap();
        let s = h.alloc_span(3, SpanClass::new(0, false), 3 * PAGE_SIZE).unwrap();
        assert!(h.in_heap(s.start));
        assert_eq!(h.span_of(s.start + 2 * PAGE_SIZE + 5), Some(s));
        assert_eq!(h.span_of(s.start + 3 * PAGE_SIZE), None);
        assert_eq!(h.heap_inuse(), 3 * PAGE_SIZE);
    }

    #[test]
    fn freed_pages_coalesce_and_are_reused() {
        let h = heap();
        let a = h.alloc_span(2, SpanClass::new(0, false), 2 * PAGE_SIZE).unwrap();
        let b = h.alloc_span(2, SpanClass::new(0, false), 2 * PAGE_SIZE).unwrap();
        let c = h.alloc_span(2, SpanClass::new(0, false), 2 * PAGE_SIZE).unwrap();
        let (a_start, c_start) = (a.start, c.start);
        h.free_span(a);
        h.free_span(b);
        assert_eq!(h.span_of(a_start), None);
        assert_eq!(h.span_count(), 1);
        let d = h.alloc_span(4, SpanClass::new(0, false), 4 * PAGE_SIZE).unwrap();
        assert_eq!(d.start, a_start);
        assert_eq!(h.span_of(c_start), Some(c));
        assert_eq!(h.heap_sys(), 6 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_returns_none() {
        let h = heap();
        assert!(h.alloc_span(64, SpanClass::new(0, true), 64 * PAGE_SIZE).is_some());
        assert!(h.alloc_span(1, SpanClass::new(0, true), PAGE_SIZE).is_none());
    }

    #[test]
    fn snapshot_lists_live_spans() {
        let h = heap();
        let a = h.alloc_span(1, SpanClass::new(0, false), PAGE_SIZE).unwrap();
        let b = h.alloc_span(1, SpanClass::new(0, false), PAGE_SIZE).unwrap();
        h.free_span(a);
        h.copy_spans();
        assert_eq!(&*h.gc_spans(), &vec![b]);
    }
}
