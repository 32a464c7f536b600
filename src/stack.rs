//! Mutator stacks: frames described by per-pc stack maps, deferred calls and stack scanning.
use crate::{
    heap::Heap,
    mutator::Mutator,
    phase::GcPhase,
    sched::{GStatus, G},
    Address,
};
use bit_vec::BitVec;
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Liveness of the pointer slots of a frame at some pc range.
#[derive(Clone, Debug)]
pub struct StackMap {
    pub(crate) locals: BitVec,
    pub(crate) args: BitVec,
}

/// Compiler output for one function: frame shape and the pc to stack map table.
#[derive(Debug)]
pub struct FuncInfo {
    name: String,
    nlocals: usize,
    nargs: usize,
    npc: usize,
    /// Start pc to (end pc, map).
    maps: BTreeMap<usize, (usize, StackMap)>,
}

impl FuncInfo {
    /// A function with `nlocals` local and `nargs` argument slots whose code spans pcs
    /// `0..npc`. Stack maps are added with [`FuncInfo::stackmap`].
    pub fn new(name: &str, nlocals: usize, nargs: usize, npc: usize) -> Self {
        Self {
            name: name.to_string(),
            nlocals,
            nargs,
            npc,
            maps: BTreeMap::new(),
        }
    }

    /// Adds the map for `pcs`: the listed local and argument slots hold live pointers there.
    pub fn stackmap(mut self, pcs: Range<usize>, locals: &[usize], args: &[usize]) -> Self {
        let mut map = StackMap {
            locals: BitVec::from_elem(self.nlocals, false),
            args: BitVec::from_elem(self.nargs, false),
        };
        for &l in locals {
            assert!(l < self.nlocals, "{}: local {} out of range", self.name, l);
            map.locals.set(l, true);
        }
        for &a in args {
            assert!(a < self.nargs, "{}: argument {} out of range", self.name, a);
            map.args.set(a, true);
        }
        self.maps.insert(pcs.start, (pcs.end, map));
        self
    }

    /// Single pc function where the given slots always hold pointers.
    pub fn simple(name: &str, nlocals: usize, nargs: usize, locals: &[usize], args: &[usize]) -> Arc<Self> {
        Arc::new(Self::new(name, nlocals, nargs, 1).stackmap(0..1, locals, args))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nlocals(&self) -> usize {
        self.nlocals
    }

    pub fn npc(&self) -> usize {
        self.npc
    }

    pub fn nargs(&self) -> usize {
        self.nargs
    }

    pub(crate) fn map_at(&self, pc: usize) -> Result<&StackMap, String> {
        if pc >= self.npc {
            return Err(format!(
                "scanframe: bad symbol table: pc {} outside of {} (npc {})",
                pc, self.name, self.npc
            ));
        }
        match self.maps.range(..=pc).next_back() {
            Some((_, (end, map))) if pc < *end => Ok(map),
            _ => Err(format!("missing stackmap: {} at pc {}", self.name, pc)),
        }
    }
}

pub(crate) type DeferFn = Box<dyn FnOnce(&mut Mutator, Address) + Send>;

/// Deferred call. `arg` is a root for as long as the record is on the frame.
pub(crate) struct Defer {
    pub(crate) arg: AtomicUsize,
    pub(crate) f: Option<DeferFn>,
}

pub(crate) struct Frame {
    pub(crate) func: Arc<FuncInfo>,
    pub(crate) pc: usize,
    pub(crate) locals: Box<[AtomicUsize]>,
    pub(crate) args: Box<[AtomicUsize]>,
    pub(crate) defers: Vec<Defer>,
}

impl Frame {
    pub(crate) fn new(func: Arc<FuncInfo>, args: &[Address]) -> Self {
        if args.len() != func.nargs {
            throw!(
                "push_frame: {} takes {} arguments, got {}",
                func.name,
                func.nargs,
                args.len()
            );
        }
        Self {
            locals: (0..func.nlocals).map(|_| AtomicUsize::new(0)).collect(),
            args: args.iter().map(|&a| AtomicUsize::new(a)).collect(),
            func,
            pc: 0,
            defers: Vec::new(),
        }
    }
}

const MIN_FRAMES: usize = 16;

pub(crate) struct Stack {
    pub(crate) frames: Vec<Frame>,
}

impl Stack {
    pub(crate) fn new() -> Self {
        Self {
            frames: Vec::with_capacity(MIN_FRAMES),
        }
    }

    /// Halves the frame storage when less than a quarter of it is used.
    pub(crate) fn shrink(&mut self) {
        let cap = self.frames.capacity();
        if cap / 2 < MIN_FRAMES || self.frames.len() >= cap / 4 {
            return;
        }
        self.frames.shrink_to(cap / 2);
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.frames.capacity()
    }
}

impl Heap {
    /// Greys everything referenced from the stack of `g`, which must not be running.
    pub(crate) fn scanstack(&self, g: &G, gcw: &mut crate::gcwork::GcWork) {
        if g.gcscanvalid.load(Ordering::SeqCst) {
            return;
        }
        match g.status() {
            GStatus::Running => throw!("scanstack: goroutine {} not stopped", g.id),
            GStatus::Dead => return,
            GStatus::Blocked | GStatus::Stopped => {}
        }
        let mut stack = g.stack.lock();
        if self.phase.phase() == GcPhase::MarkTermination {
            stack.shrink();
        }
        let one = BitVec::from_elem(1, true);
        for frame in stack.frames.iter().rev() {
            let map = match frame.func.map_at(frame.pc) {
                Ok(map) => map,
                Err(msg) => throw!("{}", msg),
            };
            self.scanblock(
                &frame.locals,
                frame.locals.as_ptr() as Address,
                &map.locals,
                gcw,
            );
            self.scanblock(&frame.args, frame.args.as_ptr() as Address, &map.args, gcw);
            for d in frame.defers.iter() {
                self.scanblock(
                    std::slice::from_ref(&d.arg),
                    &d.arg as *const AtomicUsize as Address,
                    &one,
                    gcw,
                );
            }
        }
        g.gcscanvalid.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stackmap_lookup() {
        let f = FuncInfo::new("f", 3, 1, 10)
            .stackmap(0..4, &[0], &[])
            .stackmap(6..10, &[0, 2], &[0]);
        assert!(f.map_at(2).unwrap().locals[0]);
        assert!(f.map_at(7).unwrap().locals[2]);
        assert!(f.map_at(7).unwrap().args[0]);
        assert!(f.map_at(5).unwrap_err().starts_with("missing stackmap"));
        assert!(f.map_at(10).unwrap_err().starts_with("scanframe: bad symbol table"));
    }

    #[test]
    fn shrink_only_when_mostly_unused() {
        let func = FuncInfo::simple("g", 1, 0, &[0], &[]);
        let mut stack = Stack::new();
        for _ in 0..128 {
            stack.frames.push(Frame::new(func.clone(), &[]));
        }
        let cap = stack.capacity();
        stack.shrink();
        assert_eq!(stack.capacity(), cap);
        stack.frames.truncate(4);
        stack.shrink();
        assert!(stack.capacity() < cap);
        assert!(stack.capacity() >= cap / 2);
    }
}
