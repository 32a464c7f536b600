//! Cycle coordinator.
//!
//! `gc` drives one cycle through sweep termination, the concurrent scan and mark phases, mark
//! termination and the hand off to the sweeper. Cycles are serialized by `worldsema`.
use crate::{
    gcwork::GcWork,
    heap::Heap,
    parfor::ParFor,
    phase::GcPhase,
    roots::ROOT_COUNT,
    sched::{GStatus, G},
    util::{fmt_ns_as_ms, nanos_since},
};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcMode {
    /// Concurrent mark and concurrent sweep.
    Background,
    /// Stop-the-world mark, concurrent sweep.
    Force,
    /// Stop-the-world mark and sweep.
    ForceBlock,
}

enum GcRequest {
    Cycle,
    Shutdown,
}

/// The background collector thread that runs triggered cycles.
pub(crate) struct BgGc {
    working: AtomicBool,
    tx: Sender<GcRequest>,
    rx: Receiver<GcRequest>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BgGc {
    pub(crate) fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            working: AtomicBool::new(false),
            tx,
            rx,
            thread: Mutex::new(None),
        }
    }

    /// A background cycle was requested and has not finished yet.
    pub(crate) fn is_working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(GcRequest::Shutdown);
        if let Some(h) = self.thread.lock().take() {
            let _ = h.join();
        }
    }
}

/// Timestamps of the phase boundaries of one cycle, in nanoseconds since heap creation.
#[derive(Default)]
struct CycleTimes {
    sweep_term: i64,
    scan: i64,
    install_wb: i64,
    mark: i64,
    mark_term: i64,
    end: i64,
}

impl Heap {
    /// Begins a cycle. A background cycle is handed to the background collector thread unless
    /// one is already pending; the other modes run to completion in the caller.
    ///
    /// Forced modes stop the world, so they must not be called from a thread with a running
    /// mutator. Use [`Mutator::gc`](crate::Mutator::gc) there.
    pub fn start(&self, mode: GcMode) {
        if mode != GcMode::Background {
            self.gc(mode);
            return;
        }
        if self.bggc.working.swap(true, Ordering::SeqCst) {
            return;
        }
        self.start_bggc();
        if self.bggc.tx.send(GcRequest::Cycle).is_err() {
            self.bggc.working.store(false, Ordering::SeqCst);
        }
    }

    /// Runs a complete cycle in `mode` on the calling thread, which must not be a running mutator.
    pub fn collect(&self, mode: GcMode) {
        self.gc(mode);
    }

    fn start_bggc(&self) {
        let mut thread = self.bggc.thread.lock();
        if thread.is_some() {
            return;
        }
        let rx = self.bggc.rx.clone();
        let heap = self.self_ref();
        let handle = std::thread::Builder::new()
            .name("bggc".to_string())
            .spawn(move || {
                while let Ok(GcRequest::Cycle) = rx.recv() {
                    let heap = match heap.upgrade() {
                        Some(heap) => heap,
                        None => return,
                    };
                    heap.gc(GcMode::Background);
                    heap.bggc.working.store(false, Ordering::SeqCst);
                }
            });
        match handle {
            Ok(h) => *thread = Some(h),
            Err(e) => throw!("failed to start background collector: {}", e),
        }
    }

    pub(crate) fn gc(&self, mode: GcMode) {
        let world = self.worldsema.lock();
        let mode = match (mode, self.debug.gcstoptheworld) {
            (GcMode::Background, 1) => GcMode::Force,
            (GcMode::Background, n) if n >= 2 => GcMode::ForceBlock,
            _ => mode,
        };
        if self.debug.allocfreetrace != 0 {
            self.tracegc();
        }
        let procs = self.config.procs.max(1);
        let gcpercent = self.gcpercent.load(Ordering::SeqCst);
        let pacertrace = self.debug.gcpacertrace > 0;
        let mut t = CycleTimes {
            sweep_term: nanos_since(self.epoch),
            ..Default::default()
        };
        let heap0 = self.stats.heap_live();
        logln_if!(
            self.config.verbose,
            "[gc] cycle {} ({:?}) at {}",
            self.num_gc() + 1,
            mode,
            crate::util::formatted_size(heap0 as usize)
        );

        // Sweep termination.
        let bgsweep = self.park_bgsweep();
        self.sched.stop_the_world();
        let mut pause_start = nanos_since(self.epoch);
        let mut pause_ns = 0;
        self.finishsweep_m();
        self.mheap.copy_spans();
        self.reset_g_state();
        self.reset_mark_state();

        let heap_goal;
        if mode == GcMode::Background {
            self.pacer.start_cycle(
                &self.stats,
                gcpercent,
                self.heapminimum.load(Ordering::SeqCst),
                procs,
                self.work.initial_heap_live.load(Ordering::SeqCst),
                pacertrace,
            );
            heap_goal = self.pacer.heap_goal.load(Ordering::Relaxed);

            self.phase.set_phase(GcPhase::Scan);
            log::debug!("gc: scan phase");
            self.work.bg_mark_prepare();
            t.scan = nanos_since(self.epoch);
            pause_ns += t.scan - pause_start;
            self.sched.start_the_world();
            self.gcscan_m();

            t.install_wb = nanos_since(self.epoch);
            self.phase.set_phase(GcPhase::Mark);
            log::debug!("gc: mark phase");
            // every G sees the barrier before anything is blackened
            self.sched.for_each_p(Arc::new(|_: &G| {}));

            t.mark = nanos_since(self.epoch);
            self.pacer.bg_mark_start_time.store(t.mark, Ordering::SeqCst);
            self.phase.set_blacken_enabled(true);
            self.wake_mark_workers();
            if let Some(hook) = &self.config.mark_hook {
                hook();
            }
            while !self.work.wait_mark_done(Duration::from_millis(10)) {
                self.pacer.revise(&self.stats);
            }

            // Mark termination.
            t.mark_term = nanos_since(self.epoch);
            self.sched.stop_the_world();
            pause_start = nanos_since(self.epoch);
            self.phase.set_blacken_enabled(false);
            self.quiesce_mark_workers();
            self.flush_gc_work();
            self.pacer.end_cycle(
                &self.stats,
                gcpercent,
                procs,
                t.mark_term - t.mark,
                pacertrace,
            );
        } else {
            let now = nanos_since(self.epoch);
            t.scan = now;
            t.install_wb = now;
            t.mark = now;
            t.mark_term = now;
            heap_goal = heap0;
        }

        self.phase.set_blacken_enabled(false);
        self.phase.set_phase(GcPhase::MarkTermination);
        log::debug!("gc: mark termination");
        let heap1 = self.stats.heap_live();
        self.gc_mark();
        let heap2 = self.work.bytes_marked.load(Ordering::SeqCst);

        if self.debug.gccheckmark > 0 {
            self.reset_g_state();
            self.init_checkmarks();
            self.gc_mark_pass();
            self.clear_checkmarks();
        }

        self.phase.set_phase(GcPhase::Off);
        self.gc_sweep(mode);

        if self.debug.gctrace > 1 {
            // Repeat the cycle with the world stopped: every stack is rescanned and every object
            // traced again.
            self.reset_g_state();
            self.reset_mark_state();
            self.finishsweep_m();
            self.mheap.copy_spans();
            self.phase.set_phase(GcPhase::MarkTermination);
            self.gc_mark();
            self.phase.set_phase(GcPhase::Off);
            self.gc_sweep(mode);
        }
        drop(bgsweep);

        if self.phase.phase() == GcPhase::MarkTermination {
            throw!("gc done but phase is {:?}", self.phase.phase());
        }
        t.end = nanos_since(self.epoch);
        pause_ns += t.end - pause_start;
        let num_gc = self.stats.num_gc.fetch_add(1, Ordering::SeqCst) + 1;
        if mode != GcMode::Background {
            self.stats.num_forced_gc.fetch_add(1, Ordering::SeqCst);
        }
        let unix_now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.stats.record_pause(num_gc, pause_ns as u64, unix_now);

        let cpu = self.cycle_cpu(&t, procs);
        self.gc_cpu_ns
            .fetch_add(cpu.iter().sum::<i64>().max(0) as u64, Ordering::Relaxed);

        self.sched.start_the_world();
        drop(world);
        logln_if!(
            self.config.verbose,
            "[gc] cycle {} done: {} marked, pause {}ms",
            num_gc,
            crate::util::formatted_size(heap2 as usize),
            fmt_ns_as_ms(pause_ns)
        );

        if self.debug.gctrace > 0 {
            self.print_gctrace(num_gc, mode, &t, &cpu, procs, [heap0, heap1, heap2, heap_goal]);
        }
    }

    /// Root pass of the scan phase. The world is running; stacks are scanned by suspending each G
    /// in turn.
    fn gcscan_m(&self) {
        let gs = self.sched.allgs();
        let mut gcw = GcWork::new();
        for i in 0..ROOT_COUNT + gs.len() as u32 {
            self.markroot(i, &gs, &mut gcw);
        }
        gcw.dispose(&self.work, &self.pacer.scan_work);
        for g in &gs {
            if !g.gcworkdone.load(Ordering::SeqCst) && g.status() != GStatus::Dead {
                throw!("gcscan_m: scan missed goroutine {}", g.id);
            }
        }
    }

    /// Stop-the-world mark followed by the heap size update for the next cycle.
    fn gc_mark(&self) {
        self.gc_mark_pass();

        let marked = self.work.bytes_marked.load(Ordering::SeqCst);
        let live = self.stats.heap_live();
        let initial = self.work.initial_heap_live.load(Ordering::SeqCst);
        let reachable = marked.saturating_sub(live.saturating_sub(initial));
        self.stats
            .heap_reachable
            .store(reachable, Ordering::Relaxed);
        let next_gc = ((reachable as f64 * (1.0 + self.pacer.trigger_ratio())) as u64)
            .max(self.heapminimum.load(Ordering::SeqCst));
        self.stats.next_gc.store(next_gc, Ordering::Relaxed);
        self.stats.heap_live.store(marked, Ordering::Relaxed);
        self.stats.heap_marked.store(marked, Ordering::Relaxed);
        self.stats.heap_scan.store(
            self.pacer.scan_work.load(Ordering::SeqCst).max(0) as u64,
            Ordering::Relaxed,
        );
    }

    /// Marks everything from all roots with every helper thread. Must find no work left over.
    pub(crate) fn gc_mark_pass(&self) {
        self.mheap.copy_spans();
        let gs = self.sched.allgs();
        let nproc = self.config.procs.max(1) as u32;
        self.work.stw_mark_prepare(nproc);
        let pf = ParFor::new(nproc, ROOT_COUNT + gs.len() as u32);
        {
            let mut pool = self.helpers.lock();
            pool.scoped(|scope| {
                for tid in 0..nproc {
                    let pf = &pf;
                    let gs = &gs;
                    scope.execute(move || self.gchelper(tid, pf, gs));
                }
            });
        }
        if !self.work.is_empty() {
            throw!("gc_mark: work left at end of mark termination");
        }
        for g in &gs {
            if !g.gcworkdone.load(Ordering::SeqCst) && g.status() != GStatus::Dead {
                throw!("gc_mark: missed goroutine {}", g.id);
            }
        }
        logln_if!(
            self.config.verbose && pf.steals() > 0,
            "[gc] mark termination: {} roots, {} steals",
            pf.len(),
            pf.steals()
        );
    }

    fn gchelper(&self, tid: u32, pf: &ParFor, gs: &[Arc<G>]) {
        let mut gcw = GcWork::new();
        pf.run(tid, &mut |i| self.markroot(i, gs, &mut gcw));
        self.drain(&mut gcw, None);
        gcw.dispose(&self.work, &self.pacer.scan_work);
    }

    /// Publishes every G's cached grey objects and counters. The world is stopped.
    fn flush_gc_work(&self) {
        let heap = self.self_ref();
        self.sched.for_each_p(Arc::new(move |g: &G| {
            if let Some(heap) = heap.upgrade() {
                let mut proc = g.proc.lock();
                proc.gcw.dispose(&heap.work, &heap.pacer.scan_work);
                heap.flush_assist_time(&mut proc);
            }
        }));
    }

    fn reset_g_state(&self) {
        for g in self.sched.allgs() {
            g.gcscanvalid.store(false, Ordering::SeqCst);
            g.gcworkdone.store(false, Ordering::SeqCst);
            g.gcalloc.store(0, Ordering::Relaxed);
            g.gcscanwork.store(0, Ordering::Relaxed);
        }
    }

    fn reset_mark_state(&self) {
        self.work.bytes_marked.store(0, Ordering::SeqCst);
        self.work
            .initial_heap_live
            .store(self.stats.heap_live(), Ordering::SeqCst);
        self.pacer.scan_work.store(0, Ordering::SeqCst);
    }

    /// CPU nanoseconds of sweep termination, scan, barrier install, concurrent mark and mark
    /// termination.
    fn cycle_cpu(&self, t: &CycleTimes, procs: usize) -> [i64; 5] {
        let procs = procs as i64;
        let load = |a: &std::sync::atomic::AtomicI64| a.load(Ordering::SeqCst);
        let mark = if t.mark_term > t.mark {
            load(&self.pacer.assist_time)
                + load(&self.pacer.dedicated_mark_time)
                + load(&self.pacer.fractional_mark_time)
                + load(&self.pacer.idle_mark_time)
        } else {
            0
        };
        [
            (t.scan - t.sweep_term) * procs,
            t.install_wb - t.scan,
            (t.mark - t.install_wb) * procs,
            mark,
            (t.end - t.mark_term) * procs,
        ]
    }

    fn print_gctrace(
        &self,
        num_gc: u32,
        mode: GcMode,
        t: &CycleTimes,
        cpu: &[i64; 5],
        procs: usize,
        [heap0, heap1, heap2, heap_goal]: [u64; 4],
    ) {
        let elapsed = nanos_since(self.epoch).max(1);
        let util = self.gc_cpu_ns.load(Ordering::Relaxed) as f64 * 100.0
            / (elapsed as f64 * procs as f64);
        let (assist, background, idle) = if mode == GcMode::Background {
            (
                self.pacer.assist_time.load(Ordering::SeqCst),
                self.pacer.dedicated_mark_time.load(Ordering::SeqCst)
                    + self.pacer.fractional_mark_time.load(Ordering::SeqCst),
                self.pacer.idle_mark_time.load(Ordering::SeqCst),
            )
        } else {
            (0, 0, 0)
        };
        eprintln!(
            "gc #{} @{:.3}s {}%: {}+{}+{}+{}+{} ms clock, {}+{}+{}+{}/{}/{}+{} ms cpu, {}->{}->{} MB, {} MB goal, {} P{}",
            num_gc,
            t.sweep_term as f64 / 1e9,
            util as u64,
            fmt_ns_as_ms(t.scan - t.sweep_term),
            fmt_ns_as_ms(t.install_wb - t.scan),
            fmt_ns_as_ms(t.mark - t.install_wb),
            fmt_ns_as_ms(t.mark_term - t.mark),
            fmt_ns_as_ms(t.end - t.mark_term),
            fmt_ns_as_ms(cpu[0]),
            fmt_ns_as_ms(cpu[1]),
            fmt_ns_as_ms(cpu[2]),
            fmt_ns_as_ms(assist),
            fmt_ns_as_ms(background),
            fmt_ns_as_ms(idle),
            fmt_ns_as_ms(cpu[4]),
            heap0 >> 20,
            heap1 >> 20,
            heap2 >> 20,
            heap_goal >> 20,
            procs,
            if mode != GcMode::Background {
                " (forced)"
            } else {
                ""
            }
        );
    }
}
