use crate::{arena::PAGE_SIZE, finalizer::Finalizer, Address};
use atomic::Atomic;
use parking_lot::Mutex;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SpanState {
    Free,
    InUse,
    Stack,
    Dead,
}

/// Size class together with the "holds no pointers" flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanClass(u8);

impl SpanClass {
    pub fn new(sizeclass: usize, noscan: bool) -> Self {
        Self(((sizeclass as u8) << 1) | noscan as u8)
    }

    #[inline]
    pub fn sizeclass(self) -> usize {
        (self.0 >> 1) as usize
    }

    #[inline]
    pub fn noscan(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which central list a span currently sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SpanList {
    None = 0,
    NonEmpty = 1,
    Empty = 2,
}

/// Per-object record attached to a span. Only finalizers are recorded.
pub(crate) struct Special {
    /// Byte offset of the finalized address from the span start.
    pub(crate) offset: usize,
    pub(crate) fin: Finalizer,
}

/// Run of pages holding objects of one size class.
///
/// `sweepgen` relative to the heap's sweepgen `sg`:
/// - `sg - 2`: needs sweeping
/// - `sg - 1`: being swept
/// - `sg`: swept and ready to use
pub struct Span {
    pub start: Address,
    pub npages: usize,
    pub elemsize: usize,
    pub nelems: usize,
    pub spanclass: SpanClass,
    pub(crate) state: Atomic<SpanState>,
    pub(crate) sweepgen: AtomicU32,
    alloc_bits: Box<[AtomicU64]>,
    allocated: AtomicUsize,
    freeindex: AtomicUsize,
    list: AtomicU8,
    pub(crate) specials: Mutex<Vec<Special>>,
    /// Position in the heap's span registry.
    pub(crate) index: AtomicUsize,
}

impl Span {
    pub(crate) fn new(
        start: Address,
        npages: usize,
        spanclass: SpanClass,
        elemsize: usize,
        sweepgen: u32,
    ) -> Self {
        let nelems = (npages * PAGE_SIZE) / elemsize;
        let words = (nelems + 63) / 64;
        Self {
            start,
            npages,
            elemsize,
            nelems,
            spanclass,
            state: Atomic::new(SpanState::InUse),
            sweepgen: AtomicU32::new(sweepgen),
            alloc_bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            allocated: AtomicUsize::new(0),
            freeindex: AtomicUsize::new(0),
            list: AtomicU8::new(SpanList::None as u8),
            specials: Mutex::new(Vec::new()),
            index: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn state(&self) -> SpanState {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    /// End of the last object slot.
    #[inline]
    pub fn limit(&self) -> Address {
        self.start + self.nelems * self.elemsize
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.spanclass.sizeclass() == 0
    }

    #[inline]
    pub fn object_index(&self, addr: Address) -> usize {
        (addr - self.start) / self.elemsize
    }

    #[inline]
    pub fn object_base(&self, addr: Address) -> Address {
        self.start + self.object_index(addr) * self.elemsize
    }

    #[inline]
    pub fn object_address(&self, index: usize) -> Address {
        self.start + index * self.elemsize
    }

    #[inline]
    pub fn is_allocated(&self, index: usize) -> bool {
        self.alloc_bits[index / 64].load(Ordering::Acquire) & (1 << (index % 64)) != 0
    }

    #[inline]
    pub(crate) fn set_allocated(&self, index: usize) {
        self.alloc_bits[index / 64].fetch_or(1 << (index % 64), Ordering::AcqRel);
        self.allocated.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn clear_allocated(&self, index: usize) {
        self.alloc_bits[index / 64].fetch_and(!(1 << (index % 64)), Ordering::AcqRel);
        self.allocated.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    #[inline]
    pub fn has_free(&self) -> bool {
        self.allocated() < self.nelems
    }

    /// Claims the next free slot. Only the span's current owner calls this.
    pub(crate) fn next_free(&self) -> Option<Address> {
        let mut i = self.freeindex.load(Ordering::Relaxed);
        while i < self.nelems {
            let word = self.alloc_bits[i / 64].load(Ordering::Acquire);
            if word == u64::MAX {
                i = (i / 64 + 1) * 64;
                continue;
            }
            if word & (1 << (i % 64)) == 0 {
                self.set_allocated(i);
                self.freeindex.store(i + 1, Ordering::Relaxed);
                return Some(self.object_address(i));
            }
            i += 1;
        }
        self.freeindex.store(self.nelems, Ordering::Relaxed);
        None
    }

    pub(crate) fn reset_freeindex(&self) {
        self.freeindex.store(0, Ordering::Relaxed);
    }

    pub(crate) fn list(&self) -> SpanList {
        match self.list.load(Ordering::Relaxed) {
            1 => SpanList::NonEmpty,
            2 => SpanList::Empty,
            _ => SpanList::None,
        }
    }

    pub(crate) fn set_list(&self, list: SpanList) {
        self.list.store(list as u8, Ordering::Relaxed);
    }
}

/// Shared reference to a span owned by the heap's span registry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SpanPtr(NonNull<Span>);

unsafe impl Send for SpanPtr {}
unsafe impl Sync for SpanPtr {}

impl SpanPtr {
    pub(crate) fn new(span: &Span) -> Self {
        Self(NonNull::from(span))
    }
}

impl Deref for SpanPtr {
    type Target = Span;

    fn deref(&self) -> &Span {
        unsafe { self.0.as_ref() }
    }
}
