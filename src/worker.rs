//! Background mark workers.
//!
//! One thread per processor, started with the first concurrent cycle and parked between cycles.
//! Whenever a worker looks for something to do it asks [`Heap::find_runnable_gc_worker`] for a
//! mode: the pacer's dedicated and fractional tokens are handed out first and idle marking fills
//! processors no mutator is using.
use crate::{
    gcwork::GcWork,
    heap::Heap,
    pacer::{GcController, MarkWorkerMode, GC_BG_CREDIT_SLACK},
    util::nanos_since,
};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Preemption slice of fractional and idle workers.
const WORKER_SLICE: Duration = Duration::from_millis(10);
/// How long a worker without a mode waits before asking again.
const IDLE_POLL: Duration = Duration::from_micros(500);

struct WorkerState {
    epoch: u64,
    shutdown: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    cv: Condvar,
    /// Workers past their blacken check. The coordinator waits for zero after disabling
    /// blackening.
    running: AtomicU32,
    /// Workers currently marking in some mode.
    active: AtomicUsize,
}

pub(crate) struct MarkWorkers {
    shared: Arc<WorkerShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl MarkWorkers {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    epoch: 0,
                    shutdown: false,
                }),
                cv: Condvar::new(),
                running: AtomicU32::new(0),
                active: AtomicUsize::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn signal_shutdown(&self) {
        let mut st = self.shared.state.lock();
        st.shutdown = true;
        self.shared.cv.notify_all();
    }

    pub(crate) fn shutdown(&self) {
        self.signal_shutdown();
        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            let _ = t.join();
        }
    }
}

impl Heap {
    /// Starts missing worker threads and wakes all of them for the mark phase that was just
    /// enabled.
    pub(crate) fn wake_mark_workers(&self) {
        {
            let mut threads = self.workers.threads.lock();
            while threads.len() < self.config.procs.max(1) {
                let id = threads.len();
                let heap = self.self_ref();
                let shared = self.workers.shared.clone();
                let handle = std::thread::Builder::new()
                    .name(format!("gc-worker-{}", id))
                    .spawn(move || mark_worker(heap, shared));
                match handle {
                    Ok(h) => threads.push(h),
                    Err(e) => throw!("failed to start mark worker {}: {}", id, e),
                }
            }
        }
        let mut st = self.workers.shared.state.lock();
        st.epoch += 1;
        self.workers.shared.cv.notify_all();
    }

    /// Waits until every worker has seen that blackening is off and disposed its work.
    pub(crate) fn quiesce_mark_workers(&self) {
        if self.phase.blacken_enabled() {
            throw!("quiesce_mark_workers: blackening is still enabled");
        }
        let backoff = Backoff::new();
        while self.workers.shared.running.load(Ordering::SeqCst) != 0 {
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Picks the mode the calling worker should mark in, or `None` if it should not mark right
    /// now.
    pub(crate) fn find_runnable_gc_worker(&self) -> Option<MarkWorkerMode> {
        if self.work.bg_mark_is_done() {
            return None;
        }
        if self.work.is_empty() {
            // Nothing to do. If nobody else is marking either this is a completion point that
            // no worker is around to signal.
            if self.work.nwait.load(Ordering::SeqCst) == self.work.nproc.load(Ordering::SeqCst) {
                log::trace!("mark worker found completion point");
                self.work.bg_mark_done();
            }
            return None;
        }
        if GcController::dec_if_positive(&self.pacer.dedicated_mark_workers_needed) {
            return Some(MarkWorkerMode::Dedicated);
        }
        if GcController::dec_if_positive(&self.pacer.fractional_mark_workers_needed) {
            let elapsed =
                nanos_since(self.epoch) - self.pacer.bg_mark_start_time.load(Ordering::SeqCst);
            if self.pacer.fractional_under_goal(elapsed) {
                return Some(MarkWorkerMode::Fractional);
            }
            self.pacer
                .fractional_mark_workers_needed
                .fetch_add(1, Ordering::SeqCst);
        }
        let busy = self.sched.running_gs() + self.workers.shared.active.load(Ordering::SeqCst);
        if busy < self.config.procs {
            return Some(MarkWorkerMode::Idle);
        }
        None
    }

    fn run_mark_worker(&self, gcw: &mut GcWork) {
        let shared = &self.workers.shared;
        loop {
            shared.running.fetch_add(1, Ordering::SeqCst);
            if !self.phase.blacken_enabled() {
                shared.running.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            let mode = self.find_runnable_gc_worker();
            if let Some(mode) = mode {
                self.mark_worker_step(gcw, mode);
            }
            shared.running.fetch_sub(1, Ordering::SeqCst);
            if mode.is_none() {
                std::thread::sleep(IDLE_POLL);
            }
        }
    }

    fn mark_worker_step(&self, gcw: &mut GcWork, mode: MarkWorkerMode) {
        let shared = &self.workers.shared;
        shared.active.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        log::trace!("mark worker running in {:?} mode", mode);

        self.work.dec_nwait("mark worker");
        let done = match mode {
            MarkWorkerMode::Dedicated => {
                // Returns only at a completion point, with this worker already counted as
                // waiting again.
                self.drain(gcw, Some(GC_BG_CREDIT_SLACK));
                true
            }
            MarkWorkerMode::Fractional | MarkWorkerMode::Idle => {
                let preempt =
                    || !self.phase.blacken_enabled() || start.elapsed() >= WORKER_SLICE;
                self.drain_until_preempt(gcw, GC_BG_CREDIT_SLACK, &preempt);
                gcw.dispose(&self.work, &self.pacer.scan_work);
                let nwait = self.work.inc_nwait("mark worker");
                self.work.at_completion_point(nwait)
            }
        };
        gcw.dispose(&self.work, &self.pacer.scan_work);
        if done {
            self.work.bg_mark_done();
        }

        self.pacer
            .account_worker_time(mode, start.elapsed().as_nanos() as i64);
        match mode {
            MarkWorkerMode::Dedicated => {
                self.pacer
                    .dedicated_mark_workers_needed
                    .fetch_add(1, Ordering::SeqCst);
            }
            MarkWorkerMode::Fractional => {
                self.pacer
                    .fractional_mark_workers_needed
                    .fetch_add(1, Ordering::SeqCst);
            }
            MarkWorkerMode::Idle => {}
        }
        shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn mark_worker(heap: Weak<Heap>, shared: Arc<WorkerShared>) {
    let mut gcw = GcWork::new();
    let mut seen = 0;
    loop {
        {
            let mut st = shared.state.lock();
            while !st.shutdown && st.epoch == seen {
                shared.cv.wait(&mut st);
            }
            if st.shutdown {
                return;
            }
            seen = st.epoch;
        }
        let heap = match heap.upgrade() {
            Some(heap) => heap,
            None => return,
        };
        heap.run_mark_worker(&mut gcw);
    }
}
