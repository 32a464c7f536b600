//! Mutator assists: allocation during concurrent mark is paid for with scan work.
use crate::{
    heap::Heap,
    pacer::GC_ASSIST_TIME_SLACK,
    sched::{Proc, G},
};
use std::sync::atomic::Ordering;
use std::time::Instant;

impl Heap {
    /// Charges `size` freshly allocated bytes to `g`. If that puts the G in debt, steals
    /// background credit first and then drains grey objects until the debt is paid or no work is
    /// left. Called with `g`'s processor locked and never at a safepoint, so the world cannot stop
    /// while the assist is registered as a mark worker.
    pub(crate) fn assist_alloc(&self, g: &G, proc: &mut Proc, size: usize) {
        let alloc = g.gcalloc.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
        let ratio = self.pacer.assist_ratio();
        let mut debt = (ratio * alloc as f64) as i64 - g.gcscanwork.load(Ordering::Relaxed);
        if debt <= 0 {
            return;
        }

        let credit = self.pacer.bg_scan_credit.load(Ordering::SeqCst);
        if credit > 0 {
            let stolen = credit.min(debt);
            self.pacer
                .bg_scan_credit
                .fetch_sub(stolen, Ordering::SeqCst);
            g.gcscanwork.fetch_add(stolen, Ordering::Relaxed);
            debt -= stolen;
            if debt == 0 {
                return;
            }
        }

        if !self.phase.blacken_enabled() {
            return;
        }
        let start = Instant::now();
        self.work.dec_nwait("assist_alloc");
        let before = proc.gcw.scan_work;
        self.drain_n(&mut proc.gcw, debt);
        g.gcscanwork
            .fetch_add(proc.gcw.scan_work - before, Ordering::Relaxed);
        proc.gcw.dispose(&self.work, &self.pacer.scan_work);
        let nwait = self.work.inc_nwait("assist_alloc");
        if self.work.at_completion_point(nwait) {
            self.work.bg_mark_done();
        }

        proc.gc_assist_time += start.elapsed().as_nanos() as i64;
        if proc.gc_assist_time > GC_ASSIST_TIME_SLACK {
            self.flush_assist_time(proc);
        }
    }

    pub(crate) fn flush_assist_time(&self, proc: &mut Proc) {
        if proc.gc_assist_time != 0 {
            self.pacer
                .assist_time
                .fetch_add(proc.gc_assist_time, Ordering::SeqCst);
            proc.gc_assist_time = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{gcwork::GcWork, Address, Config, Heap, TypeInfo};
    use std::sync::atomic::Ordering;

    #[test]
    fn assist_steals_background_credit_first() {
        let heap = Heap::new(Config {
            gc_percent: -1,
            procs: 1,
            arena_size: 16 * 1024 * 1024,
            ..Config::default()
        });
        let m = heap.attach();
        let g = heap.sched.allgs()[0].clone();
        heap.pacer.set_assist_ratio(0.5);
        heap.pacer.bg_scan_credit.store(1000, Ordering::SeqCst);

        heap.assist_alloc(&g, &mut g.proc.lock(), 400);
        assert_eq!(g.gcscanwork.load(Ordering::Relaxed), 200);
        assert_eq!(heap.pacer.bg_scan_credit.load(Ordering::SeqCst), 800);

        // 2200 owed, 200 paid: the remaining credit covers part of it and blackening is off
        heap.assist_alloc(&g, &mut g.proc.lock(), 4000);
        assert_eq!(g.gcalloc.load(Ordering::Relaxed), 4400);
        assert_eq!(g.gcscanwork.load(Ordering::Relaxed), 1000);
        assert_eq!(heap.pacer.bg_scan_credit.load(Ordering::SeqCst), 0);
        drop(m);
        heap.shutdown();
    }

    #[test]
    fn assist_drains_grey_objects_while_blackening() {
        let heap = Heap::new(Config {
            gc_percent: -1,
            procs: 1,
            arena_size: 16 * 1024 * 1024,
            ..Config::default()
        });
        let mut m = heap.attach();
        let g = heap.sched.allgs()[0].clone();
        let ty = TypeInfo::new("node", 2, &[0]);
        let objs = (0..64).map(|_| m.alloc(&ty)).collect::<Vec<Address>>();
        let elemsize = heap.mheap.span_of(objs[0]).unwrap().elemsize as i64;

        let mut gcw = GcWork::new();
        for &p in &objs {
            heap.shade(p, &mut gcw);
        }
        gcw.dispose(&heap.work, &heap.pacer.scan_work);
        assert!(!heap.work.is_empty());

        heap.work.bg_mark_prepare();
        heap.phase.set_blacken_enabled(true);
        heap.pacer.set_assist_ratio(1.0);
        heap.pacer.bg_scan_credit.store(8 * elemsize, Ordering::SeqCst);

        // 40 objects owed: 8 covered by credit, 32 scanned here
        heap.assist_alloc(&g, &mut g.proc.lock(), 40 * elemsize as usize);
        assert_eq!(heap.pacer.bg_scan_credit.load(Ordering::SeqCst), 0);
        assert_eq!(g.gcscanwork.load(Ordering::Relaxed), 40 * elemsize);
        assert_eq!(heap.pacer.scan_work.load(Ordering::SeqCst), 32 * elemsize);
        assert_eq!(heap.work.nwait.load(Ordering::SeqCst), u32::MAX);
        assert!(!heap.work.is_empty());
        assert!(!heap.work.bg_mark_is_done());

        // more debt than grey objects: the assist empties the queues and signals completion
        heap.assist_alloc(&g, &mut g.proc.lock(), 100 * elemsize as usize);
        assert_eq!(g.gcscanwork.load(Ordering::Relaxed), 72 * elemsize);
        assert_eq!(heap.pacer.scan_work.load(Ordering::SeqCst), 64 * elemsize);
        assert_eq!(heap.work.nwait.load(Ordering::SeqCst), u32::MAX);
        assert!(heap.work.is_empty());
        assert!(heap.work.bg_mark_is_done());
        assert!(heap.work.wait_mark_done(std::time::Duration::from_millis(0)));

        heap.phase.set_blacken_enabled(false);
        drop(m);
        heap.shutdown();
    }
}
