//! Dijkstra insertion barrier.
//!
//! Every pointer store into the heap or into a global goes through one of these entry points.
//! The store always happens; while marking, the stored pointer is shaded as well, regardless of
//! the colour of the object being written to.
use crate::{
    arena::PAGE_SIZE, gcwork::GcWork, heap::Heap, phase::GcPhase, types::TypeInfo,
    util::PTR_SIZE, Address,
};
use std::sync::atomic::{AtomicUsize, Ordering};

impl Heap {
    /// `*slot = src` followed by the barrier.
    #[inline]
    pub(crate) fn write_barrier(&self, gcw: &mut GcWork, slot: &AtomicUsize, src: Address) {
        slot.store(src, Ordering::Release);
        if !self.phase.write_barrier_enabled() {
            return;
        }
        if src != 0 && src < PAGE_SIZE {
            throw!(
                "bad pointer in write barrier: {:p} <- {:#x}",
                slot as *const AtomicUsize,
                src
            );
        }
        self.write_barrier_nostore(gcw, src);
    }

    /// The barrier without the store, for stores already performed by a bulk copy.
    #[inline]
    pub(crate) fn write_barrier_nostore(&self, gcw: &mut GcWork, src: Address) {
        match self.phase.phase() {
            GcPhase::Mark | GcPhase::MarkTermination => {
                if src != 0 && self.mheap.in_heap(src) {
                    self.shade(src, gcw);
                    if self.phase.phase() == GcPhase::MarkTermination {
                        gcw.dispose(&self.work, &self.pacer.scan_work);
                    }
                }
            }
            GcPhase::Off | GcPhase::Scan | GcPhase::Sweep => {}
        }
    }

    /// Multi-word store: `slots[i] = srcs[i]`, each through the single pointer barrier.
    pub(crate) fn write_pointers(&self, gcw: &mut GcWork, slots: &[AtomicUsize], srcs: &[Address]) {
        if slots.len() != srcs.len() {
            throw!(
                "write_pointers: {} slots for {} values",
                slots.len(),
                srcs.len()
            );
        }
        for (slot, &src) in slots.iter().zip(srcs) {
            self.write_barrier(gcw, slot, src);
        }
    }

    /// Copies a value of type `ty` from `src` to `dst` (both heap addresses) and runs the
    /// bulk barrier over the destination.
    pub(crate) fn typed_memmove(&self, gcw: &mut GcWork, ty: &TypeInfo, dst: Address, src: Address) {
        if dst == src {
            return;
        }
        let n = ty.words();
        let arena = &self.mheap.arena;
        let from = arena.words(src, n);
        let to = arena.words(dst, n);
        if dst < src {
            for i in 0..n {
                to[i].store(from[i].load(Ordering::Acquire), Ordering::Release);
            }
        } else {
            for i in (0..n).rev() {
                to[i].store(from[i].load(Ordering::Acquire), Ordering::Release);
            }
        }
        if !ty.has_pointers() {
            return;
        }
        self.bulk_barrier(gcw, dst, ty.size());
    }

    /// Runs the barrier on every pointer word of `[p, p + size)` according to the heap bitmap.
    pub(crate) fn bulk_barrier(&self, gcw: &mut GcWork, p: Address, size: usize) {
        if p & (PTR_SIZE - 1) != 0 || size & (PTR_SIZE - 1) != 0 {
            throw!("bulk_barrier: misaligned range {:#x}+{}", p, size);
        }
        if !self.phase.write_barrier_enabled() || !self.mheap.in_heap(p) {
            return;
        }
        let bitmap = &self.mheap.bitmap;
        for (i, word) in self.mheap.arena.words(p, size / PTR_SIZE).iter().enumerate() {
            if bitmap.is_pointer(p + i * PTR_SIZE) {
                self.write_barrier_nostore(gcw, word.load(Ordering::Acquire));
            }
        }
    }
}
