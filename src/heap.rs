use crate::{
    arena::{PAGE_SHIFT, PAGE_SIZE},
    collector::{BgGc, GcMode},
    debug::GcDebug,
    finalizer::FinState,
    gcwork::GcWork,
    mcache::MCache,
    mheap::MHeap,
    mutator::Mutator,
    pacer::GcController,
    phase::{GcPhase, PhaseController},
    roots::Module,
    sched::{Proc, Sched, G},
    sizeclass::MAX_SMALL_SIZE,
    span::SpanClass,
    stack::Stack,
    stats::{HeapStats, MemStats},
    sweep::SweepState,
    types::TypeInfo,
    util::{formatted_size, round_up, PTR_SIZE},
    workbuf::WorkQueues,
    worker::MarkWorkers,
    Address, Config,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// The garbage collected heap together with its collector.
///
/// Everything the collector needs lives here; several heaps can coexist in one process. Mutator
/// threads work with the heap through [`Mutator`]s obtained from [`Heap::attach`].
pub struct Heap {
    pub(crate) config: Config,
    pub(crate) debug: GcDebug,
    pub(crate) mheap: MHeap,
    pub(crate) phase: PhaseController,
    pub(crate) work: WorkQueues,
    pub(crate) pacer: GcController,
    pub(crate) sched: Sched,
    pub(crate) sweep: SweepState,
    pub(crate) fin: FinState,
    pub(crate) modules: RwLock<Vec<Arc<Module>>>,
    pub(crate) stats: HeapStats,
    pub(crate) workers: MarkWorkers,
    pub(crate) bggc: BgGc,
    pub(crate) gcpercent: AtomicI32,
    pub(crate) heapminimum: AtomicU64,
    /// Greying goes through the checkmark bits during the verification mark.
    pub(crate) use_checkmark: AtomicBool,
    /// Serializes cycles.
    pub(crate) worldsema: Mutex<()>,
    /// Helper threads of the stop-the-world mark.
    pub(crate) helpers: Mutex<scoped_threadpool::Pool>,
    /// Time base of the pacer's timestamps.
    pub(crate) epoch: Instant,
    /// Accumulated collector CPU time for the gctrace utilization figure.
    pub(crate) gc_cpu_ns: AtomicU64,
    me: Weak<Heap>,
}

impl Heap {
    pub fn new(config: Config) -> Arc<Self> {
        let mheap = match MHeap::new(config.arena_size, config.verbose) {
            Ok(mheap) => mheap,
            Err(e) => throw!(
                "failed to reserve a {} heap arena: {}",
                formatted_size(config.arena_size),
                e
            ),
        };
        let gcpercent = config.gc_percent.max(-1);
        let heapminimum = heap_minimum(config.heap_minimum, gcpercent);
        let procs = config.procs.max(1);
        let nclasses = mheap.classes.count();
        logln_if!(
            config.verbose,
            "[gc] heap: arena {}, {} size classes, {} procs, GOGC={}",
            formatted_size(config.arena_size),
            nclasses,
            procs,
            gcpercent
        );
        Arc::new_cyclic(|me| Self {
            debug: config.debug,
            mheap,
            phase: PhaseController::new(),
            work: WorkQueues::new(),
            pacer: GcController::new(config.count_idle_mark_time),
            sched: Sched::new(),
            sweep: SweepState::new(),
            fin: FinState::new(),
            modules: RwLock::new(Vec::new()),
            stats: HeapStats::new(nclasses, heapminimum),
            workers: MarkWorkers::new(),
            bggc: BgGc::new(),
            gcpercent: AtomicI32::new(gcpercent),
            heapminimum: AtomicU64::new(heapminimum),
            use_checkmark: AtomicBool::new(false),
            worldsema: Mutex::new(()),
            helpers: Mutex::new(scoped_threadpool::Pool::new(procs as u32)),
            epoch: Instant::now(),
            gc_cpu_ns: AtomicU64::new(0),
            me: me.clone(),
            config,
        })
    }

    pub(crate) fn self_ref(&self) -> Weak<Heap> {
        self.me.clone()
    }

    /// Attaches the calling thread as a new mutator.
    pub fn attach(self: &Arc<Self>) -> Mutator {
        let proc = Proc {
            gcw: GcWork::new(),
            mcache: MCache::new(self.mheap.classes.count()),
            gc_assist_time: 0,
        };
        let g = self.sched.register(Stack::new(), proc);
        self.sched.exit_blocked(&g);
        Mutator::new(self.clone(), g)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> GcPhase {
        self.phase.phase()
    }

    /// Number of completed cycles.
    pub fn num_gc(&self) -> u32 {
        self.stats.num_gc.load(Ordering::Relaxed)
    }

    /// Allocates `count` consecutive values of type `ty` for `g`. The memory is zeroed.
    pub(crate) fn mallocgc(&self, g: &G, ty: &TypeInfo, count: usize) -> Address {
        self.sched.poll(g);
        let size = match ty.size().checked_mul(count) {
            Some(size) => size.max(PTR_SIZE),
            None => throw!("mallocgc: {} x {} overflows", ty.name(), count),
        };
        let noscan = !ty.has_pointers();

        let mut retried = false;
        let (p, class, elemsize) = loop {
            let slot = {
                let mut proc = g.proc.lock();
                self.alloc_slot(&mut proc.mcache, size, noscan)
            };
            match slot {
                Some(slot) => break slot,
                None if !retried => {
                    log::debug!("heap exhausted allocating {}, forcing a cycle", formatted_size(size));
                    retried = true;
                    self.sched.enter_blocked(g);
                    self.collect(GcMode::ForceBlock);
                    self.sched.exit_blocked(g);
                }
                None => throw!("out of memory allocating {}", formatted_size(size)),
            }
        };

        let mut proc = g.proc.lock();
        self.mheap.arena.zero(p, elemsize);
        self.mheap
            .bitmap
            .init_object(p, elemsize / PTR_SIZE, ty.ptrmask(), count);
        if self.phase.phase() == GcPhase::MarkTermination {
            // allocate black
            self.mheap.bitmap.set_marked(p);
            proc.gcw.bytes_marked += elemsize as u64;
        }
        self.stats.record_malloc(class, elemsize);
        if self.debug.allocfreetrace != 0 {
            self.tracealloc(p, size, ty);
        }
        if self.phase.blacken_enabled() {
            self.assist_alloc(g, &mut proc, elemsize);
        }
        drop(proc);

        if self.should_trigger() {
            self.start(GcMode::Background);
        }
        p
    }

    /// Returns `(address, size class, slot size)` of a fresh slot, or `None` when the arena is
    /// full.
    fn alloc_slot(&self, c: &mut MCache, size: usize, noscan: bool) -> Option<(Address, usize, usize)> {
        if size <= MAX_SMALL_SIZE {
            let class = self.mheap.classes.size_to_class(size);
            let p = self.mcache_next_free(c, SpanClass::new(class, noscan))?;
            return Some((p, class, self.mheap.classes.class_size(class)));
        }
        let npages = round_up(size, PAGE_SIZE) >> PAGE_SHIFT;
        self.deduct_sweep_credit(npages * PAGE_SIZE, npages);
        let s = self
            .mheap
            .alloc_span(npages, SpanClass::new(0, noscan), npages << PAGE_SHIFT)?;
        s.set_allocated(0);
        Some((s.start, 0, npages << PAGE_SHIFT))
    }

    /// True when the heap has grown to the trigger and no cycle is running.
    pub fn should_trigger(&self) -> bool {
        self.gcpercent.load(Ordering::Relaxed) >= 0
            && self.phase.phase() == GcPhase::Off
            && self.stats.heap_live() >= self.stats.next_gc()
            && !self.bggc.is_working()
    }

    /// Sets the growth percent and returns the previous one. A negative value disables
    /// triggered cycles.
    pub fn set_gc_percent(&self, percent: i32) -> i32 {
        let percent = percent.max(-1);
        let old = self.gcpercent.swap(percent, Ordering::SeqCst);
        let minimum = heap_minimum(self.config.heap_minimum, percent);
        self.heapminimum.store(minimum, Ordering::SeqCst);
        if self.stats.next_gc() < minimum {
            self.stats.next_gc.store(minimum, Ordering::Relaxed);
        }
        old
    }

    pub fn gc_percent(&self) -> i32 {
        self.gcpercent.load(Ordering::Relaxed)
    }

    pub fn read_mem_stats(&self, m: &mut MemStats) {
        let classes = &self.mheap.classes;
        m.fill(&self.stats, |c| classes.class_size(c));
        m.heap_sys = self.mheap.heap_sys() as u64;
        m.heap_inuse = self.mheap.heap_inuse() as u64;
        m.heap_idle = m.heap_sys.saturating_sub(m.heap_inuse);
        m.gc_percent = self.gc_percent();
    }

    /// Stops every collector thread. Mutators must have been dropped.
    pub fn shutdown(&self) {
        self.bggc.shutdown();
        drop(self.worldsema.lock());
        self.workers.shutdown();
        self.shutdown_bgsweep();
        self.shutdown_fing();
        logln_if!(self.config.verbose, "[gc] heap shut down after {} cycles", self.num_gc());
    }

    pub(crate) fn tracealloc(&self, p: Address, size: usize, ty: &TypeInfo) {
        eprintln!("tracealloc({:#x}, {:#x}, {})", p, size, ty.name());
        crate::fatal::print_backtrace();
    }

    pub(crate) fn tracegc(&self) {
        eprintln!("tracegc()");
        crate::fatal::print_backtrace();
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.workers.signal_shutdown();
    }
}

fn heap_minimum(minimum: usize, gcpercent: i32) -> u64 {
    minimum as u64 * gcpercent.max(0) as u64 / 100
}
