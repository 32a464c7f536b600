//! Root enumeration.
//!
//! The root index space is `[0, ROOT_COUNT + number of Gs)`: fixed roots first, then one root per
//! goroutine stack. Passes split it across threads with [`ParFor`](crate::parfor::ParFor).
use crate::{
    arena::PAGE_SHIFT,
    gcwork::GcWork,
    heap::Heap,
    phase::GcPhase,
    sched::{Suspender, G},
    span::SpanState,
    Address,
};
use bit_vec::BitVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const ROOT_DATA: u32 = 0;
pub const ROOT_BSS: u32 = 1;
pub const ROOT_FINALIZERS: u32 = 2;
pub const ROOT_SPANS: u32 = 3;
pub const ROOT_FLUSH_CACHES: u32 = 4;
pub const ROOT_COUNT: u32 = 5;

/// Block of global words with a pointer mask.
pub struct Segment {
    words: Box<[AtomicUsize]>,
    ptrmask: BitVec,
}

impl Segment {
    pub fn new(nwords: usize, pointer_words: &[usize]) -> Self {
        let mut ptrmask = BitVec::from_elem(nwords, false);
        for &w in pointer_words {
            assert!(w < nwords, "pointer word {} out of range", w);
            ptrmask.set(w, true);
        }
        Self {
            words: (0..nwords).map(|_| AtomicUsize::new(0)).collect(),
            ptrmask,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, &[])
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn is_pointer(&self, i: usize) -> bool {
        self.ptrmask.get(i).unwrap_or(false)
    }

    pub fn get(&self, i: usize) -> Address {
        self.words[i].load(Ordering::Acquire)
    }

    pub(crate) fn slot(&self, i: usize) -> &AtomicUsize {
        &self.words[i]
    }

    fn base(&self) -> Address {
        self.words.as_ptr() as Address
    }
}

/// Globals of one linked unit: initialized `data` and zeroed `bss`.
pub struct Module {
    name: String,
    pub data: Segment,
    pub bss: Segment,
}

impl Module {
    pub fn new(name: &str, data: Segment, bss: Segment) -> Self {
        Self {
            name: name.to_string(),
            data,
            bss,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Heap {
    pub fn add_module(&self, module: Module) -> Arc<Module> {
        let module = Arc::new(module);
        self.modules.write().push(module.clone());
        module
    }

    /// Processes root `i`. `gs` is the stack snapshot the root indices were computed from.
    pub(crate) fn markroot(&self, i: u32, gs: &[Arc<G>], gcw: &mut GcWork) {
        match i {
            ROOT_DATA => {
                for m in self.modules.read().iter() {
                    self.scanblock(&m.data.words, m.data.base(), &m.data.ptrmask, gcw);
                }
            }
            ROOT_BSS => {
                for m in self.modules.read().iter() {
                    self.scanblock(&m.bss.words, m.bss.base(), &m.bss.ptrmask, gcw);
                }
            }
            ROOT_FINALIZERS => self.scan_finalizer_blocks(gcw),
            ROOT_SPANS => self.markroot_spans(gcw),
            ROOT_FLUSH_CACHES => {
                if self.phase.phase() != GcPhase::Scan {
                    for g in gs {
                        let mut proc = g.proc.lock();
                        self.release_all(&mut proc.mcache);
                    }
                }
            }
            _ => {
                let g = match gs.get((i - ROOT_COUNT) as usize) {
                    Some(g) => g,
                    None => throw!("markroot: bad index {}", i),
                };
                if self.sched.stop(g) {
                    self.scanstack(g, gcw);
                    self.sched.resume(g);
                }
                g.gcworkdone.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Objects with finalizers are not marked through their specials, but everything they point
    /// to is retained.
    fn markroot_spans(&self, gcw: &mut GcWork) {
        let sg = self.mheap.sweepgen();
        let checkmark = self.use_checkmark.load(Ordering::Relaxed);
        let scanning = self.phase.phase() == GcPhase::Scan;
        for &s in self.mheap.gc_spans().iter() {
            if s.state() != SpanState::InUse {
                continue;
            }
            if !checkmark && s.sweepgen() != sg {
                throw!(
                    "gc: unswept span {:#x} (sweepgen {}, heap {})",
                    s.start,
                    s.sweepgen(),
                    sg
                );
            }
            let specials = s.specials.lock();
            for sp in specials.iter() {
                let p = s.object_base(s.start + sp.offset);
                debug_assert!(p < s.start + (s.npages << PAGE_SHIFT));
                if !scanning {
                    self.scanobject(p, gcw);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_masks() {
        let seg = Segment::new(4, &[1, 3]);
        assert_eq!(seg.len(), 4);
        assert!(seg.is_pointer(1));
        assert!(!seg.is_pointer(2));
        assert!(!seg.is_pointer(9));
        seg.slot(1).store(0x1000, Ordering::Relaxed);
        assert_eq!(seg.get(1), 0x1000);
        assert!(Segment::empty().is_empty());
    }
}
