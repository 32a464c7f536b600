//! Sweeper.
//!
//! After mark termination the heap's `sweepgen` is bumped by two, which turns every in-use span
//! unswept. Spans are then swept lazily by allocation, proportionally to span allocation and by
//! the background sweeper, each span exactly once.
use crate::{
    arena::PAGE_SIZE,
    collector::GcMode,
    heap::Heap,
    phase::GcPhase,
    span::{SpanList, SpanPtr, SpanState},
    Address,
};
use atomic::Atomic;
use crossbeam_utils::Backoff;
use flume::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;

pub(crate) enum SweepRequest {
    Sweep,
    Shutdown,
}

pub(crate) struct SweepState {
    /// Next index into the span snapshot for `sweepone`.
    spanidx: AtomicUsize,
    pub(crate) sweepdone: AtomicBool,
    /// Spans swept during stop-the-world pauses.
    pub(crate) npausesweep: AtomicU64,
    /// Spans swept by the background sweeper.
    pub(crate) nbgsweep: AtomicU64,
    pages_swept: AtomicU64,
    span_bytes_alloc: AtomicU64,
    /// Proportional sweep ratio. Zero when proportional sweep is done or disabled.
    pages_per_byte: Atomic<f64>,
    /// The background sweeper holds this while it sweeps a span. The collector holds it from
    /// sweep termination until the next sweep has started, so no snapshot span outlives its
    /// descriptor in the sweeper's hands.
    gate: Mutex<()>,
    tx: Sender<SweepRequest>,
    rx: Receiver<SweepRequest>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SweepState {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            spanidx: AtomicUsize::new(0),
            sweepdone: AtomicBool::new(true),
            npausesweep: AtomicU64::new(0),
            nbgsweep: AtomicU64::new(0),
            pages_swept: AtomicU64::new(0),
            span_bytes_alloc: AtomicU64::new(0),
            pages_per_byte: Atomic::new(0.0),
            gate: Mutex::new(()),
            tx,
            rx,
            thread: Mutex::new(None),
        }
    }
}

impl Heap {
    /// Sweeps `s`, which the caller moved to `sweepgen - 1`. Returns true if the span was
    /// returned to the page heap.
    ///
    /// With `preserve` the caller keeps ownership of the span: it is neither moved between
    /// central lists nor freed.
    pub(crate) fn sweep_span(&self, s: SpanPtr, preserve: bool) -> bool {
        let sg = self.mheap.sweepgen();
        if s.state() != SpanState::InUse || s.sweepgen() != sg.wrapping_sub(1) {
            throw!(
                "sweep_span: bad span state {:?} sweepgen {} (heap {})",
                s.state(),
                s.sweepgen(),
                sg
            );
        }
        self.sweep
            .pages_swept
            .fetch_add(s.npages as u64, Ordering::SeqCst);

        let bitmap = &self.mheap.bitmap;
        let class = s.spanclass.sizeclass();
        let size = s.elemsize;

        // Unlink specials of objects about to be freed; finalized objects survive one more cycle.
        {
            let mut specials = s.specials.lock();
            let mut i = 0;
            while i < specials.len() {
                let p = s.start + specials[i].offset;
                let base = s.object_base(p);
                if bitmap.is_marked(base) || !s.is_allocated(s.object_index(p)) {
                    i += 1;
                    continue;
                }
                let sp = specials.remove(i);
                self.queue_finalizer(sp.fin, p);
                bitmap.set_marked(base);
            }
        }

        let mut nfree = 0;
        for i in 0..s.nelems {
            let p = s.object_address(i);
            let marked = bitmap.is_marked(p);
            if marked {
                bitmap.clear_marked(p);
            }
            if marked || !s.is_allocated(i) {
                continue;
            }
            if self.debug.allocfreetrace != 0 {
                self.tracefree(p, size);
            }
            s.clear_allocated(i);
            self.stats.record_free(class, size);
            nfree += 1;
        }

        if s.is_large() {
            if nfree > 0 {
                if preserve {
                    throw!("sweep_span: can't preserve large span {:#x}", s.start);
                }
                self.publish_swept(s, sg);
                self.mheap.free_span(s);
                return true;
            }
            self.publish_swept(s, sg);
            return false;
        }

        if nfree > 0 {
            s.reset_freeindex();
        }
        if preserve {
            self.publish_swept(s, sg);
            return false;
        }

        let central = &self.mheap.central[s.spanclass.index()];
        let mut lists = central.lists();
        if s.allocated() == 0 {
            lists.remove(s);
            self.publish_swept(s, sg);
            drop(lists);
            self.mheap.free_span(s);
            return true;
        }
        if nfree > 0 && s.list() == SpanList::Empty {
            lists.remove(s);
            lists.insert(s, SpanList::NonEmpty);
        }
        // Publishing under the central lock is what makes the span available to caches.
        self.publish_swept(s, sg);
        false
    }

    fn publish_swept(&self, s: SpanPtr, sg: u32) {
        if s.state() != SpanState::InUse || s.sweepgen() != sg.wrapping_sub(1) {
            throw!(
                "sweep_span: bad span state after sweep {:?} sweepgen {} (heap {})",
                s.state(),
                s.sweepgen(),
                sg
            );
        }
        s.sweepgen.store(sg, Ordering::Release);
    }

    /// Sweeps one span. Returns the number of pages freed to the heap, or `None` once every span
    /// of the snapshot has been claimed.
    pub(crate) fn sweepone(&self) -> Option<usize> {
        let sg = self.mheap.sweepgen();
        loop {
            let idx = self.sweep.spanidx.fetch_add(1, Ordering::SeqCst);
            let s = {
                let spans = self.mheap.gc_spans();
                match spans.get(idx) {
                    Some(&s) => s,
                    None => {
                        drop(spans);
                        if !self.sweep.sweepdone.swap(true, Ordering::SeqCst) {
                            self.wake_fing();
                        }
                        return None;
                    }
                }
            };
            if s.state() != SpanState::InUse {
                s.sweepgen.store(sg, Ordering::Release);
                continue;
            }
            if s.sweepgen() != sg.wrapping_sub(2) || !self.claim_sweep(s, sg) {
                continue;
            }
            let npages = s.npages;
            return Some(if self.sweep_span(s, false) { npages } else { 0 });
        }
    }

    /// Makes sure `s` is swept, sweeping it here or waiting for whoever claimed it.
    pub(crate) fn ensure_swept(&self, s: SpanPtr) {
        let sg = self.mheap.sweepgen();
        if s.sweepgen() == sg {
            return;
        }
        if self.claim_sweep(s, sg) {
            self.sweep_span(s, false);
            return;
        }
        let backoff = Backoff::new();
        while s.sweepgen() != sg && s.state() == SpanState::InUse {
            backoff.snooze();
        }
    }

    /// Charges `span_bytes` of span allocation against the proportional sweep ratio and sweeps
    /// until the debt, less `caller_sweep_pages` the caller is about to sweep itself, is paid.
    pub(crate) fn deduct_sweep_credit(&self, span_bytes: usize, caller_sweep_pages: usize) {
        let ratio = self.sweep.pages_per_byte.load(Ordering::Relaxed);
        if ratio == 0.0 {
            return;
        }
        let alloc = self
            .sweep
            .span_bytes_alloc
            .fetch_add(span_bytes as u64, Ordering::SeqCst)
            + span_bytes as u64;
        let pages_owed = (ratio * alloc as f64) as i64;
        while pages_owed - self.sweep.pages_swept.load(Ordering::SeqCst) as i64
            > caller_sweep_pages as i64
        {
            if self.sweepone().is_none() {
                self.sweep.pages_per_byte.store(0.0, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Starts sweeping for the cycle that just finished marking. The world is stopped.
    pub(crate) fn gc_sweep(&self, mode: GcMode) {
        if self.phase.phase() != GcPhase::Off {
            throw!("gc_sweep: phase is {:?}, not off", self.phase.phase());
        }
        self.mheap.sweepgen.fetch_add(2, Ordering::SeqCst);
        self.sweep.sweepdone.store(false, Ordering::SeqCst);
        self.sweep.spanidx.store(0, Ordering::SeqCst);

        if mode == GcMode::ForceBlock || self.debug.gcstoptheworld >= 2 {
            self.sweep.pages_per_byte.store(0.0, Ordering::Relaxed);
            self.sweep.pages_swept.store(0, Ordering::SeqCst);
            while self.sweepone().is_some() {
                self.sweep.npausesweep.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        let pages_to_sweep = self
            .mheap
            .gc_spans()
            .iter()
            .filter(|s| s.state() == SpanState::InUse)
            .map(|s| s.npages)
            .sum::<usize>();
        let heap_distance = (self.stats.next_gc() as i64 - self.stats.heap_live() as i64
            - 1024 * 1024)
            .max(PAGE_SIZE as i64);
        self.sweep.pages_per_byte.store(
            pages_to_sweep as f64 / heap_distance as f64,
            Ordering::Relaxed,
        );
        self.sweep.pages_swept.store(0, Ordering::SeqCst);
        self.sweep.span_bytes_alloc.store(0, Ordering::SeqCst);

        self.phase.set_phase(GcPhase::Sweep);
        self.start_bgsweep();
        let _ = self.sweep.tx.send(SweepRequest::Sweep);
    }

    /// Keeps the background sweeper out of `sweepone` until the guard is dropped. Waits for the
    /// span it is sweeping, if any.
    pub(crate) fn park_bgsweep(&self) -> MutexGuard<'_, ()> {
        self.sweep.gate.lock()
    }

    /// Finishes the previous cycle's sweep. The world is stopped and the background sweeper is
    /// parked.
    pub(crate) fn finishsweep_m(&self) {
        while self.sweepone().is_some() {
            self.sweep.npausesweep.fetch_add(1, Ordering::Relaxed);
        }
        let sg = self.mheap.sweepgen();
        let unfinished = self
            .mheap
            .gc_spans()
            .iter()
            .copied()
            .filter(|s| s.state() == SpanState::InUse && s.sweepgen() != sg)
            .collect::<Vec<_>>();
        for s in unfinished {
            self.ensure_swept(s);
        }
        self.sweep.pages_per_byte.store(0.0, Ordering::Relaxed);
        self.phase.finish_sweep();
    }

    fn start_bgsweep(&self) {
        let mut thread = self.sweep.thread.lock();
        if thread.is_some() {
            return;
        }
        let rx = self.sweep.rx.clone();
        let heap = self.self_ref();
        let handle = std::thread::Builder::new()
            .name("bgsweep".to_string())
            .spawn(move || {
                while let Ok(SweepRequest::Sweep) = rx.recv() {
                    let heap = match heap.upgrade() {
                        Some(heap) => heap,
                        None => return,
                    };
                    loop {
                        let swept = {
                            let _gate = heap.sweep.gate.lock();
                            heap.sweepone()
                        };
                        if swept.is_none() {
                            break;
                        }
                        heap.sweep.nbgsweep.fetch_add(1, Ordering::Relaxed);
                        std::thread::yield_now();
                    }
                    if heap.phase.finish_sweep() {
                        log::debug!("background sweep finished");
                    }
                }
            });
        match handle {
            Ok(h) => *thread = Some(h),
            Err(e) => throw!("failed to start background sweeper: {}", e),
        }
    }

    pub(crate) fn shutdown_bgsweep(&self) {
        let _ = self.sweep.tx.send(SweepRequest::Shutdown);
        if let Some(h) = self.sweep.thread.lock().take() {
            let _ = h.join();
        }
    }

    pub(crate) fn tracefree(&self, p: Address, size: usize) {
        eprintln!("tracefree({:#x}, {:#x})", p, size);
        crate::fatal::print_backtrace();
    }
}
