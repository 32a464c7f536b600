//! Mutator handle.
//!
//! A [`Mutator`] is one attached thread of execution. Everything it does to the heap goes
//! through here: allocation, barriered pointer stores and the frames the stack scanner reads.
//!
//! Heap addresses held only in Rust variables are invisible to the collector. An address returned
//! by an allocation stays valid until the next safepoint of the same mutator (the next
//! allocation, `push_frame` or `safepoint`), so it must be stored into a frame slot, a global or
//! a reachable object before then.
use crate::{
    collector::GcMode,
    finalizer::{Finalizer, FinalizerError},
    heap::Heap,
    roots::Segment,
    sched::G,
    stack::{Defer, Frame, FuncInfo},
    types::TypeInfo,
    util::PTR_SIZE,
    Address,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct Mutator {
    heap: Arc<Heap>,
    g: Arc<G>,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<Heap>, g: Arc<G>) -> Self {
        Self { heap, g }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// Allocates one zeroed value of type `ty`.
    pub fn alloc(&mut self, ty: &TypeInfo) -> Address {
        self.heap.mallocgc(&self.g, ty, 1)
    }

    /// Allocates `n` consecutive zeroed values of type `ty`.
    pub fn alloc_array(&mut self, ty: &TypeInfo, n: usize) -> Address {
        self.heap.mallocgc(&self.g, ty, n)
    }

    fn slot(&self, obj: Address, word: usize) -> &AtomicUsize {
        let addr = obj + word * PTR_SIZE;
        if !self.heap.mheap.in_heap(addr) {
            throw!("access to {:#x} (word {} of {:#x}) outside the heap", addr, word, obj);
        }
        self.heap.mheap.arena.word(addr)
    }

    /// Reads word `word` of the object at `obj`.
    pub fn load(&self, obj: Address, word: usize) -> Address {
        self.slot(obj, word).load(Ordering::Acquire)
    }

    /// Stores a non-pointer word. No barrier.
    pub fn store_scalar(&mut self, obj: Address, word: usize, val: usize) {
        self.slot(obj, word).store(val, Ordering::Release);
    }

    /// Stores pointer `val` into word `word` of `obj` through the write barrier.
    pub fn store_ptr(&mut self, obj: Address, word: usize, val: Address) {
        let slot = self.slot(obj, word);
        let mut proc = self.g.proc.lock();
        self.heap.write_barrier(&mut proc.gcw, slot, val);
    }

    /// Stores `vals` into consecutive words of `obj` starting at `first`.
    pub fn store_ptrs(&mut self, obj: Address, first: usize, vals: &[Address]) {
        if vals.is_empty() {
            return;
        }
        // bounds check both ends
        self.slot(obj, first + vals.len() - 1);
        let slots = self.heap.mheap.arena.words(obj + first * PTR_SIZE, vals.len());
        let mut proc = self.g.proc.lock();
        self.heap.write_pointers(&mut proc.gcw, slots, vals);
    }

    /// Copies one `ty` value from `src` to `dst`, shading every pointer copied while marking.
    pub fn typed_memmove(&mut self, ty: &TypeInfo, dst: Address, src: Address) {
        self.slot(dst, ty.words().max(1) - 1);
        self.slot(src, ty.words().max(1) - 1);
        let mut proc = self.g.proc.lock();
        self.heap.typed_memmove(&mut proc.gcw, ty, dst, src);
    }

    /// Runs the barrier for `val` without storing it, for pointers written by other means.
    pub fn write_barrier_nostore(&mut self, val: Address) {
        let mut proc = self.g.proc.lock();
        self.heap.write_barrier_nostore(&mut proc.gcw, val);
    }

    /// Stores `val` into word `i` of a global segment, through the barrier if the word holds a
    /// pointer.
    pub fn store_global(&mut self, seg: &Segment, i: usize, val: Address) {
        let slot = seg.slot(i);
        if !seg.is_pointer(i) {
            slot.store(val, Ordering::Release);
            return;
        }
        let mut proc = self.g.proc.lock();
        self.heap.write_barrier(&mut proc.gcw, slot, val);
    }

    /// Installs `fin` on `obj`, or removes the current finalizer when `fin` is `None`.
    pub fn set_finalizer(
        &mut self,
        obj: Address,
        ty: &TypeInfo,
        fin: Option<Finalizer>,
    ) -> Result<(), FinalizerError> {
        self.heap.set_finalizer(obj, ty, fin)
    }

    /// Calls into a function described by `func`.
    pub fn push_frame(&mut self, func: &Arc<FuncInfo>, args: &[Address]) {
        self.heap.sched.poll(&self.g);
        let frame = Frame::new(func.clone(), args);
        self.g.stack.lock().frames.push(frame);
    }

    /// Returns from the innermost frame, running its deferred calls last-in first-out first.
    pub fn pop_frame(&mut self) {
        loop {
            // The record and its argument stay on the frame, and thus rooted, while it runs.
            let next = {
                let mut stack = self.g.stack.lock();
                let frame = match stack.frames.last_mut() {
                    Some(frame) => frame,
                    None => throw!("pop_frame: stack of goroutine {} is empty", self.g.id),
                };
                match frame.defers.last_mut() {
                    Some(d) => d.f.take().map(|f| (f, d.arg.load(Ordering::Acquire))),
                    None => break,
                }
            };
            if let Some((f, arg)) = next {
                f(self, arg);
            }
            let mut stack = self.g.stack.lock();
            if let Some(frame) = stack.frames.last_mut() {
                frame.defers.pop();
            }
        }
        self.g.stack.lock().frames.pop();
    }

    /// Depth of the frame stack.
    pub fn depth(&self) -> usize {
        self.g.stack.lock().frames.len()
    }

    fn with_frame<R>(&self, what: &str, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut stack = self.g.stack.lock();
        match stack.frames.last_mut() {
            Some(frame) => f(frame),
            None => throw!("{}: no frame on goroutine {}", what, self.g.id),
        }
    }

    /// Moves the innermost frame to `pc`, which selects the stack map it is scanned with.
    pub fn set_pc(&mut self, pc: usize) {
        self.with_frame("set_pc", |frame| {
            if pc >= frame.func.npc() {
                throw!("set_pc: pc {} out of range for {}", pc, frame.func.name());
            }
            frame.pc = pc;
        });
    }

    pub fn set_local(&mut self, i: usize, val: Address) {
        self.with_frame("set_local", |frame| match frame.locals.get(i) {
            Some(slot) => slot.store(val, Ordering::Release),
            None => throw!("set_local: {} has no local {}", frame.func.name(), i),
        });
    }

    pub fn local(&self, i: usize) -> Address {
        self.with_frame("local", |frame| match frame.locals.get(i) {
            Some(slot) => slot.load(Ordering::Acquire),
            None => throw!("local: {} has no local {}", frame.func.name(), i),
        })
    }

    pub fn set_arg(&mut self, i: usize, val: Address) {
        self.with_frame("set_arg", |frame| match frame.args.get(i) {
            Some(slot) => slot.store(val, Ordering::Release),
            None => throw!("set_arg: {} has no argument {}", frame.func.name(), i),
        });
    }

    pub fn arg(&self, i: usize) -> Address {
        self.with_frame("arg", |frame| match frame.args.get(i) {
            Some(slot) => slot.load(Ordering::Acquire),
            None => throw!("arg: {} has no argument {}", frame.func.name(), i),
        })
    }

    /// Registers `f(arg)` to run when the innermost frame is popped. `arg` is a root until then.
    pub fn defer_call(
        &mut self,
        arg: Address,
        f: impl FnOnce(&mut Mutator, Address) + Send + 'static,
    ) {
        self.with_frame("defer_call", |frame| {
            frame.defers.push(Defer {
                arg: AtomicUsize::new(arg),
                f: Some(Box::new(f)),
            })
        });
    }

    /// Gives the collector a chance to stop or scan this mutator.
    pub fn safepoint(&mut self) {
        self.heap.sched.poll(&self.g);
    }

    /// Runs `f` with this mutator blocked, so that cycles can proceed without it. `f` must not
    /// touch the heap.
    pub fn blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.heap.sched.enter_blocked(&self.g);
        let r = f();
        self.heap.sched.exit_blocked(&self.g);
        r
    }

    /// Runs a full cycle in `mode` and waits for it.
    pub fn gc(&mut self, mode: GcMode) {
        let heap = self.heap.clone();
        self.blocking(move || heap.collect(mode));
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let heap = &self.heap;
        heap.sched.detach(&self.g, |proc| {
            heap.release_all(&mut proc.mcache);
            proc.gcw.dispose(&heap.work, &heap.pacer.scan_work);
            heap.flush_assist_time(proc);
        });
    }
}
