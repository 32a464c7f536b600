//! Object greying, scanning and the drain loops.
use crate::{
    gcwork::GcWork,
    heap::Heap,
    span::{SpanPtr, SpanState},
    util::PTR_SIZE,
    Address,
};
use bit_vec::BitVec;
use std::sync::atomic::{AtomicUsize, Ordering};

impl Heap {
    /// Maps a possibly interior pointer to the start of its object. Returns `None` for values
    /// that do not point into an allocated span.
    ///
    /// A value inside the used part of the arena that hits free pages, a span that is not in
    /// use or the tail past a span's last object is a corrupt pointer. `refbase` and `refoff`
    /// name the slot the value was loaded from and are only used for diagnostics.
    #[inline]
    pub(crate) fn heap_bits_for_object(
        &self,
        p: Address,
        refbase: Address,
        refoff: usize,
    ) -> Option<(Address, SpanPtr)> {
        if !self.mheap.in_heap(p) {
            return None;
        }
        match self.mheap.span_of(p) {
            Some(s) if s.state() == SpanState::InUse && p < s.limit() => Some((s.object_base(p), s)),
            Some(s) if s.state() == SpanState::Stack => None,
            s => {
                self.bad_pointer(s, p, refbase, refoff);
                None
            }
        }
    }

    #[cold]
    fn bad_pointer(&self, s: Option<SpanPtr>, p: Address, refbase: Address, refoff: usize) {
        let msg = match s {
            Some(s) => format!(
                "pointer {:#x} to span {:#x} (state {:?}, limit {:#x}) found at *({:#x}+{:#x})",
                p,
                s.start,
                s.state(),
                s.limit(),
                refbase,
                refoff
            ),
            None => format!(
                "pointer {:#x} to unallocated pages found at *({:#x}+{:#x})",
                p, refbase, refoff
            ),
        };
        if self.debug.invalidptr != 0 {
            if refbase != 0 {
                if let Some(rs) = self.mheap.span_of(refbase) {
                    self.dump_object("object", rs, rs.object_base(refbase));
                }
            }
            throw!("found bad pointer in heap: {}", msg);
        }
        log::warn!("ignoring bad pointer: {}", msg);
    }

    /// Shades `obj` and queues it for scanning unless its span holds no pointers, in which case
    /// it is blackened in place.
    #[inline]
    pub(crate) fn greyobject(
        &self,
        obj: Address,
        refbase: Address,
        refoff: usize,
        s: SpanPtr,
        gcw: &mut GcWork,
    ) {
        if obj & (PTR_SIZE - 1) != 0 {
            throw!("greyobject: misaligned object {:#x}", obj);
        }
        let bitmap = &self.mheap.bitmap;
        if self.use_checkmark.load(Ordering::Relaxed) {
            if !bitmap.is_marked(obj) {
                eprintln!(
                    "greyobject: checkmark finds unexpected unmarked object {:#x} (found at *({:#x}+{:#x}))",
                    obj, refbase, refoff
                );
                if refbase != 0 {
                    if let Some(rs) = self.mheap.span_of(refbase) {
                        self.dump_object("base", rs, refbase);
                    }
                }
                self.dump_object("obj", s, obj);
                throw!("checkmark found unmarked object");
            }
            if !bitmap.try_checkmark(obj) {
                return;
            }
        } else {
            if !bitmap.try_mark(obj) {
                return;
            }
            if s.spanclass.noscan() {
                gcw.bytes_marked += s.elemsize as u64;
                return;
            }
        }
        gcw.put(&self.work, obj);
    }

    /// Shades the object `b` points into, if any. Idempotent.
    pub(crate) fn shade(&self, b: Address, gcw: &mut GcWork) {
        if let Some((obj, s)) = self.heap_bits_for_object(b, 0, 0) {
            self.greyobject(obj, 0, 0, s, gcw);
        }
    }

    /// Blackens the object at `b`: greys everything its pointer words refer to.
    pub(crate) fn scanobject(&self, b: Address, gcw: &mut GcWork) {
        let s = match self.mheap.span_of(b) {
            Some(s) => s,
            None => throw!("scanobject: {:#x} is not in a span", b),
        };
        let n = s.elemsize;
        if n == 0 {
            throw!("scanobject n == 0");
        }
        if !s.spanclass.noscan() {
            let bitmap = &self.mheap.bitmap;
            let words = self.mheap.arena.words(b, n / PTR_SIZE);
            for (i, word) in words.iter().enumerate() {
                let addr = b + i * PTR_SIZE;
                if !bitmap.is_pointer(addr) {
                    continue;
                }
                let obj = word.load(Ordering::Acquire);
                if obj == 0 {
                    continue;
                }
                if let Some((base, span)) = self.heap_bits_for_object(obj, b, i * PTR_SIZE) {
                    self.greyobject(base, b, i * PTR_SIZE, span, gcw);
                }
            }
        }
        gcw.bytes_marked += n as u64;
        gcw.scan_work += n as i64;
    }

    /// Greys every heap object referenced by a slot of `block` whose bit is set in `ptrmask`.
    /// Root regions are not heap objects, so no marking credit is recorded.
    pub(crate) fn scanblock(
        &self,
        block: &[AtomicUsize],
        base: Address,
        ptrmask: &BitVec,
        gcw: &mut GcWork,
    ) {
        let mut i = 0;
        for bits in ptrmask.blocks() {
            let mut bits = bits;
            let mut j = i;
            while bits != 0 && j < block.len() {
                if bits & 1 != 0 {
                    let obj = block[j].load(Ordering::Acquire);
                    if obj != 0 {
                        if let Some((base_obj, s)) =
                            self.heap_bits_for_object(obj, base, j * PTR_SIZE)
                        {
                            self.greyobject(base_obj, base, j * PTR_SIZE, s, gcw);
                        }
                    }
                }
                bits >>= 1;
                j += 1;
            }
            i += 32;
            if i >= block.len() {
                break;
            }
        }
    }

    /// Scans grey objects until there is no more work anywhere. With `flush_credit` set, scan
    /// work is handed to the assist credit pool every `flush_credit` units.
    pub(crate) fn drain(&self, gcw: &mut GcWork, flush_credit: Option<i64>) {
        if !self.phase.write_barrier_enabled() {
            throw!("drain: phase {:?} does not allow marking", self.phase.phase());
        }
        let mut last_flush = gcw.scan_work;
        let mut next_flush = match flush_credit {
            Some(credit) => last_flush + credit,
            None => i64::MAX,
        };
        loop {
            if self.work.nwait.load(Ordering::Relaxed) > 0 {
                gcw.balance(&self.work);
            }
            let b = match gcw.get(&self.work) {
                Some(b) => b,
                None => break,
            };
            self.scanobject(b, gcw);
            if let Some(credit) = flush_credit {
                if gcw.scan_work >= next_flush {
                    self.pacer
                        .bg_scan_credit
                        .fetch_add(gcw.scan_work - last_flush, Ordering::SeqCst);
                    last_flush = gcw.scan_work;
                    next_flush = last_flush + credit;
                }
            }
        }
        if flush_credit.is_some() {
            self.pacer
                .bg_scan_credit
                .fetch_add(gcw.scan_work - last_flush, Ordering::SeqCst);
        }
    }

    /// Like `drain`, but never waits for work and returns as soon as `preempt` says so.
    pub(crate) fn drain_until_preempt(
        &self,
        gcw: &mut GcWork,
        flush_credit: i64,
        preempt: &dyn Fn() -> bool,
    ) {
        if !self.phase.write_barrier_enabled() {
            throw!(
                "drain_until_preempt: phase {:?} does not allow marking",
                self.phase.phase()
            );
        }
        let mut last_flush = gcw.scan_work;
        let mut next_flush = last_flush + flush_credit;
        while !preempt() {
            if self.work.is_empty() {
                gcw.balance(&self.work);
            }
            let b = match gcw.try_get(&self.work) {
                Some(b) => b,
                None => break,
            };
            self.scanobject(b, gcw);
            if gcw.scan_work >= next_flush {
                self.pacer
                    .bg_scan_credit
                    .fetch_add(gcw.scan_work - last_flush, Ordering::SeqCst);
                last_flush = gcw.scan_work;
                next_flush = last_flush + flush_credit;
            }
        }
        self.pacer
            .bg_scan_credit
            .fetch_add(gcw.scan_work - last_flush, Ordering::SeqCst);
    }

    /// Scans until at least `scan_work` more units are done or no work is available.
    pub(crate) fn drain_n(&self, gcw: &mut GcWork, scan_work: i64) {
        let target = gcw.scan_work + scan_work;
        while gcw.scan_work < target {
            let b = match gcw.try_get(&self.work) {
                Some(b) => b,
                None => return,
            };
            self.scanobject(b, gcw);
        }
    }

    /// Prepares a verification mark: clears every checkmark bit and routes greying through them.
    pub(crate) fn init_checkmarks(&self) {
        self.use_checkmark.store(true, Ordering::SeqCst);
        self.clear_checkmark_bits();
    }

    pub(crate) fn clear_checkmarks(&self) {
        self.use_checkmark.store(false, Ordering::SeqCst);
        self.clear_checkmark_bits();
    }

    fn clear_checkmark_bits(&self) {
        for s in self.mheap.gc_spans().iter() {
            if s.state() == SpanState::InUse {
                self.mheap
                    .bitmap
                    .clear_checkmarks(s.start, s.npages << crate::arena::PAGE_SHIFT);
            }
        }
    }

    /// Prints the span of `obj` and the words of the object with their pointer bits.
    pub(crate) fn dump_object(&self, label: &str, s: SpanPtr, obj: Address) {
        eprintln!(
            "{}={:#x} span.start={:#x} span.limit={:#x} span.class={} span.elemsize={} span.state={:?}",
            label,
            obj,
            s.start,
            s.limit(),
            s.spanclass.sizeclass(),
            s.elemsize,
            s.state()
        );
        if obj < s.start || obj >= s.limit() {
            return;
        }
        let base = s.object_base(obj);
        let nwords = (s.elemsize / PTR_SIZE).min(128);
        for (i, word) in self.mheap.arena.words(base, nwords).iter().enumerate() {
            let addr = base + i * PTR_SIZE;
            eprintln!(
                " *({}+{}) = {:#x}{}{}",
                label,
                i * PTR_SIZE,
                word.load(Ordering::Relaxed),
                if self.mheap.bitmap.is_pointer(addr) {
                    " (ptr)"
                } else {
                    ""
                },
                if addr == obj { " <==" } else { "" }
            );
        }
    }
}
