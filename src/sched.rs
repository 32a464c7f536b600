//! Cooperative scheduler model.
//!
//! Every attached mutator is a `G`. A G only changes state at safepoints: `poll` when running,
//! `enter_blocked`/`exit_blocked` around code that does not touch the heap. The collector uses
//! this to stop the world, to run a function on behalf of every G (`for_each_p`) and to suspend a
//! single G while its stack is scanned.
//!
//! Lock order: the scheduler lock is taken before a G's `proc` or `stack` lock. A G never polls
//! while holding either of those.
use crate::{gcwork::GcWork, mcache::MCache, stack::Stack};
use atomic::Atomic;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GStatus {
    /// Executing mutator code. Not at a safepoint.
    Running,
    /// Outside of heap code, treated as permanently at a safepoint.
    Blocked,
    /// Parked at a safepoint for stop-the-world or suspension.
    Stopped,
    Dead,
}

/// Processor local state a G allocates and marks with.
pub(crate) struct Proc {
    pub(crate) gcw: GcWork,
    pub(crate) mcache: MCache,
    /// Assist nanoseconds not yet flushed to the pacer.
    pub(crate) gc_assist_time: i64,
}

pub struct G {
    pub(crate) id: u64,
    status: Atomic<GStatus>,
    pub(crate) stack: Mutex<Stack>,
    pub(crate) proc: Mutex<Proc>,
    /// The stack was scanned and the G has not run since.
    pub(crate) gcscanvalid: AtomicBool,
    /// The stack root was processed in the current pass.
    pub(crate) gcworkdone: AtomicBool,
    /// Bytes allocated in the current cycle.
    pub(crate) gcalloc: AtomicU64,
    /// Scan work performed or stolen by assists in the current cycle.
    pub(crate) gcscanwork: AtomicI64,
    ack_claim: AtomicU64,
    acked: AtomicU64,
    suspended: AtomicBool,
}

impl G {
    #[inline]
    pub fn status(&self) -> GStatus {
        self.status.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: GStatus) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Claims the right to run the `for_each_p` function of generation `gen` for this G.
    fn claim(&self, gen: u64) -> bool {
        let cur = self.ack_claim.load(Ordering::SeqCst);
        cur < gen
            && self
                .ack_claim
                .compare_exchange(cur, gen, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    fn resumed(&self) {
        self.set_status(GStatus::Running);
        self.gcscanvalid.store(false, Ordering::SeqCst);
    }
}

type ForEachFn = Arc<dyn Fn(&G) + Send + Sync>;

struct SchedState {
    allgs: Vec<Arc<G>>,
    stw: bool,
    for_each: Option<(u64, ForEachFn)>,
    gen: u64,
    next_id: u64,
    suspend_requests: usize,
}

pub(crate) struct Sched {
    state: Mutex<SchedState>,
    cv: Condvar,
    /// Set while any G may have to leave its fast path at the next safepoint.
    pending: AtomicBool,
}

/// Stops a single G at a safepoint so that its stack can be read.
pub(crate) trait Suspender {
    /// Returns false if the G is dead and has nothing to scan.
    fn stop(&self, g: &G) -> bool;
    fn resume(&self, g: &G);
}

impl Sched {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SchedState {
                allgs: Vec::new(),
                stw: false,
                for_each: None,
                gen: 0,
                next_id: 1,
                suspend_requests: 0,
            }),
            cv: Condvar::new(),
            pending: AtomicBool::new(false),
        }
    }

    fn update_pending(&self, st: &SchedState) {
        self.pending.store(
            st.stw || st.for_each.is_some() || st.suspend_requests > 0,
            Ordering::SeqCst,
        );
    }

    /// Registers a new G. It starts out blocked; the caller enters it with `exit_blocked`.
    pub(crate) fn register(&self, stack: Stack, proc: Proc) -> Arc<G> {
        let mut st = self.state.lock();
        let id = st.next_id;
        st.next_id += 1;
        let g = Arc::new(G {
            id,
            status: Atomic::new(GStatus::Blocked),
            stack: Mutex::new(stack),
            proc: Mutex::new(proc),
            gcscanvalid: AtomicBool::new(false),
            gcworkdone: AtomicBool::new(false),
            gcalloc: AtomicU64::new(0),
            gcscanwork: AtomicI64::new(0),
            ack_claim: AtomicU64::new(st.gen),
            acked: AtomicU64::new(st.gen),
            suspended: AtomicBool::new(false),
        });
        st.allgs.push(g.clone());
        g
    }

    /// Safepoint poll.
    #[inline]
    pub(crate) fn poll(&self, g: &G) {
        if self.pending.load(Ordering::SeqCst) {
            self.poll_slow(g);
        }
    }

    #[cold]
    fn poll_slow(&self, g: &G) {
        let mut st = self.state.lock();
        let mut stopped = false;
        loop {
            if self.run_pending(g, &mut st) {
                continue;
            }
            if st.stw || g.suspended.load(Ordering::SeqCst) {
                if !stopped {
                    g.set_status(GStatus::Stopped);
                    stopped = true;
                    self.cv.notify_all();
                }
                self.cv.wait(&mut st);
                continue;
            }
            break;
        }
        if stopped {
            g.resumed();
        }
    }

    /// Runs or waits for the pending `for_each_p` function for `g`. Returns true if the lock was
    /// released in between and the state has to be re-examined.
    fn run_pending(&self, g: &G, st: &mut MutexGuard<'_, SchedState>) -> bool {
        let (gen, f) = match &st.for_each {
            Some((gen, f)) if g.acked.load(Ordering::SeqCst) < *gen => (*gen, f.clone()),
            _ => return false,
        };
        if g.claim(gen) {
            MutexGuard::unlocked(st, || f(g));
            g.acked.store(gen, Ordering::SeqCst);
            self.cv.notify_all();
        } else {
            // someone else is running it for us
            self.cv.wait(st);
        }
        true
    }

    pub(crate) fn enter_blocked(&self, g: &G) {
        let _st = self.state.lock();
        g.set_status(GStatus::Blocked);
        self.cv.notify_all();
    }

    pub(crate) fn exit_blocked(&self, g: &G) {
        let mut st = self.state.lock();
        loop {
            if self.run_pending(g, &mut st) {
                continue;
            }
            if st.stw || g.suspended.load(Ordering::SeqCst) {
                self.cv.wait(&mut st);
                continue;
            }
            break;
        }
        g.resumed();
    }

    /// Waits until no G is running mutator code and keeps them parked until `start_the_world`.
    pub(crate) fn stop_the_world(&self) {
        let mut st = self.state.lock();
        while st.stw {
            self.cv.wait(&mut st);
        }
        st.stw = true;
        self.update_pending(&st);
        while st.allgs.iter().any(|g| g.status() == GStatus::Running) {
            self.cv.wait(&mut st);
        }
    }

    pub(crate) fn start_the_world(&self) {
        let mut st = self.state.lock();
        if !st.stw {
            throw!("start_the_world: world is not stopped");
        }
        st.stw = false;
        self.update_pending(&st);
        self.cv.notify_all();
    }

    /// Runs `f` once for every G at a safepoint of that G and waits until all of them have
    /// acknowledged. Gs that are not running are handled by the caller directly.
    pub(crate) fn for_each_p(&self, f: ForEachFn) {
        let mut st = self.state.lock();
        while st.for_each.is_some() {
            self.cv.wait(&mut st);
        }
        st.gen += 1;
        let gen = st.gen;
        st.for_each = Some((gen, f.clone()));
        self.update_pending(&st);

        for g in st.allgs.clone() {
            if g.status() != GStatus::Running && g.claim(gen) {
                f(&g);
                g.acked.store(gen, Ordering::SeqCst);
            }
        }
        self.cv.notify_all();
        while st
            .allgs
            .iter()
            .any(|g| g.acked.load(Ordering::SeqCst) < gen)
        {
            self.cv.wait(&mut st);
        }
        st.for_each = None;
        self.update_pending(&st);
        self.cv.notify_all();
    }

    /// Removes `g` for good. `flush` releases its processor state; it runs under the scheduler
    /// lock while no stop-the-world is in progress.
    pub(crate) fn detach(&self, g: &G, flush: impl FnOnce(&mut Proc)) {
        let mut st = self.state.lock();
        g.set_status(GStatus::Blocked);
        self.cv.notify_all();
        while st.stw || g.suspended.load(Ordering::SeqCst) {
            self.cv.wait(&mut st);
        }
        flush(&mut g.proc.lock());
        g.set_status(GStatus::Dead);
        st.allgs.retain(|x| !std::ptr::eq(&**x, g));
        self.cv.notify_all();
    }

    /// Snapshot of the attached Gs.
    pub(crate) fn allgs(&self) -> Vec<Arc<G>> {
        self.state.lock().allgs.clone()
    }

    pub(crate) fn running_gs(&self) -> usize {
        self.state
            .lock()
            .allgs
            .iter()
            .filter(|g| g.status() == GStatus::Running)
            .count()
    }
}

impl Suspender for Sched {
    fn stop(&self, g: &G) -> bool {
        let mut st = self.state.lock();
        if g.status() == GStatus::Dead {
            return false;
        }
        if g.suspended.swap(true, Ordering::SeqCst) {
            throw!("stop: goroutine {} is already suspended", g.id);
        }
        st.suspend_requests += 1;
        self.update_pending(&st);
        while g.status() == GStatus::Running {
            self.cv.wait(&mut st);
        }
        if g.status() == GStatus::Dead {
            g.suspended.store(false, Ordering::SeqCst);
            st.suspend_requests -= 1;
            self.update_pending(&st);
            return false;
        }
        true
    }

    fn resume(&self, g: &G) {
        let mut st = self.state.lock();
        if !g.suspended.swap(false, Ordering::SeqCst) {
            throw!("resume: goroutine {} is not suspended", g.id);
        }
        st.suspend_requests -= 1;
        self.update_pending(&st);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn proc() -> Proc {
        Proc {
            gcw: GcWork::new(),
            mcache: MCache::new(1),
            gc_assist_time: 0,
        }
    }

    fn spawn_spinner(sched: &Arc<Sched>, g: &Arc<G>, stop: &Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
        let (sched, g, stop) = (sched.clone(), g.clone(), stop.clone());
        std::thread::spawn(move || {
            sched.exit_blocked(&g);
            while !stop.load(Ordering::SeqCst) {
                sched.poll(&g);
                std::thread::yield_now();
            }
            sched.detach(&g, |_| {});
        })
    }

    #[test]
    fn stop_the_world_parks_running_gs() {
        let sched = Arc::new(Sched::new());
        let stop = Arc::new(AtomicBool::new(false));
        let gs = (0..3)
            .map(|_| sched.register(Stack::new(), proc()))
            .collect::<Vec<_>>();
        let threads = gs
            .iter()
            .map(|g| spawn_spinner(&sched, g, &stop))
            .collect::<Vec<_>>();

        sched.stop_the_world();
        assert!(gs.iter().all(|g| g.status() != GStatus::Running));
        sched.start_the_world();

        stop.store(true, Ordering::SeqCst);
        for t in threads {
            t.join().unwrap();
        }
        assert!(sched.allgs().is_empty());
    }

    #[test]
    fn for_each_p_reaches_every_g_once() {
        let sched = Arc::new(Sched::new());
        let stop = Arc::new(AtomicBool::new(false));
        let running = sched.register(Stack::new(), proc());
        let blocked = sched.register(Stack::new(), proc());
        let t = spawn_spinner(&sched, &running, &stop);
        while running.status() != GStatus::Running {
            std::thread::sleep(Duration::from_millis(1));
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        sched.for_each_p(Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        stop.store(true, Ordering::SeqCst);
        t.join().unwrap();
        sched.detach(&blocked, |_| {});
    }

    #[test]
    fn suspended_g_stays_parked() {
        let sched = Arc::new(Sched::new());
        let stop = Arc::new(AtomicBool::new(false));
        let g = sched.register(Stack::new(), proc());
        let t = spawn_spinner(&sched, &g, &stop);

        assert!(sched.stop(&g));
        assert_ne!(g.status(), GStatus::Running);
        g.gcscanvalid.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        assert_ne!(g.status(), GStatus::Running);
        sched.resume(&g);

        stop.store(true, Ordering::SeqCst);
        t.join().unwrap();
        assert!(!sched.stop(&g));
    }
}
