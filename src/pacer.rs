//! Pacing controller.
//!
//! Decides when a cycle starts (the trigger ratio), how much CPU background marking gets
//! (dedicated and fractional workers) and how much scan work mutators owe per allocated byte
//! (the assist ratio). After every cycle the trigger ratio is corrected by a proportional
//! controller so that marking finishes when the heap reaches its goal.
use crate::stats::HeapStats;
use atomic::Atomic;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Fraction of total CPU background marking aims for.
pub const GC_GOAL_UTILIZATION: f64 = 0.25;
/// Scan work a background worker accumulates before flushing it to the assist credit pool.
pub const GC_BG_CREDIT_SLACK: i64 = 2000;
/// Assist nanoseconds a P accumulates before flushing them to the controller.
pub const GC_ASSIST_TIME_SLACK: i64 = 5000;
/// Trigger ratio of the first cycle.
pub const INITIAL_TRIGGER_RATIO: f64 = 7.0 / 8.0;
const TRIGGER_GAIN: f64 = 0.5;
/// Smallest heap distance used for the assist ratio.
const MIN_HEAP_DISTANCE: i64 = 1024 * 1024;

/// How far off the trigger was, given the heap growth and CPU utilization actually achieved.
pub fn trigger_error(
    goal_growth: f64,
    trigger: f64,
    actual_growth: f64,
    utilization: f64,
    goal_utilization: f64,
) -> f64 {
    goal_growth - trigger - utilization / goal_utilization * (actual_growth - trigger)
}

/// Applies the damped correction and keeps the trigger within `[0, 0.95 * goal_growth]`.
pub fn next_trigger_ratio(trigger: f64, error: f64, goal_growth: f64) -> f64 {
    (trigger + TRIGGER_GAIN * error)
        .min(goal_growth * 0.95)
        .max(0.0)
}

/// Worker modes a mark worker can be scheduled in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkWorkerMode {
    /// Marks without preemption until concurrent mark is done.
    Dedicated,
    /// Marks until preempted to make up the fractional part of the utilization goal.
    Fractional,
    /// Marks while the processor would otherwise be idle.
    Idle,
}

pub struct GcController {
    /// Scan work done in the current cycle.
    pub(crate) scan_work: AtomicI64,
    /// Scan work done by background workers and not yet stolen by assists.
    pub(crate) bg_scan_credit: AtomicI64,
    pub(crate) assist_time: AtomicI64,
    pub(crate) dedicated_mark_time: AtomicI64,
    pub(crate) fractional_mark_time: AtomicI64,
    pub(crate) idle_mark_time: AtomicI64,
    /// Nanoseconds since heap creation at which background marking started.
    pub(crate) bg_mark_start_time: AtomicI64,
    pub(crate) dedicated_mark_workers_needed: AtomicI64,
    pub(crate) fractional_mark_workers_needed: AtomicI64,
    pub(crate) heap_goal: AtomicU64,
    assist_ratio: Atomic<f64>,
    fractional_utilization_goal: Atomic<f64>,
    trigger_ratio: Atomic<f64>,
    count_idle_mark_time: bool,
}

impl GcController {
    pub fn new(count_idle_mark_time: bool) -> Self {
        Self {
            scan_work: AtomicI64::new(0),
            bg_scan_credit: AtomicI64::new(0),
            assist_time: AtomicI64::new(0),
            dedicated_mark_time: AtomicI64::new(0),
            fractional_mark_time: AtomicI64::new(0),
            idle_mark_time: AtomicI64::new(0),
            bg_mark_start_time: AtomicI64::new(0),
            dedicated_mark_workers_needed: AtomicI64::new(0),
            fractional_mark_workers_needed: AtomicI64::new(0),
            heap_goal: AtomicU64::new(0),
            assist_ratio: Atomic::new(0.0),
            fractional_utilization_goal: Atomic::new(0.0),
            trigger_ratio: Atomic::new(INITIAL_TRIGGER_RATIO),
            count_idle_mark_time,
        }
    }

    #[inline]
    pub fn assist_ratio(&self) -> f64 {
        self.assist_ratio.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn trigger_ratio(&self) -> f64 {
        self.trigger_ratio.load(Ordering::Relaxed)
    }

    pub fn fractional_utilization_goal(&self) -> f64 {
        self.fractional_utilization_goal.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_assist_ratio(&self, ratio: f64) {
        self.assist_ratio.store(ratio, Ordering::Relaxed);
    }

    /// Resets per-cycle state and computes the heap goal, the worker split and the initial
    /// assist ratio.
    pub(crate) fn start_cycle(
        &self,
        stats: &HeapStats,
        gcpercent: i32,
        heapminimum: u64,
        procs: usize,
        initial_heap_live: u64,
        pacertrace: bool,
    ) {
        self.scan_work.store(0, Ordering::SeqCst);
        self.bg_scan_credit.store(0, Ordering::SeqCst);
        self.assist_time.store(0, Ordering::SeqCst);
        self.dedicated_mark_time.store(0, Ordering::SeqCst);
        self.fractional_mark_time.store(0, Ordering::SeqCst);
        self.idle_mark_time.store(0, Ordering::SeqCst);

        // On the first cycle, or on a heap so small that the minimum decides the trigger,
        // pretend the last cycle marked exactly enough for next_gc to be the right growth.
        let next_gc = stats.next_gc();
        if next_gc <= heapminimum {
            let marked = (next_gc as f64 / (1.0 + self.trigger_ratio())) as u64;
            stats.heap_marked.store(marked, Ordering::Relaxed);
            stats.heap_reachable.store(marked, Ordering::Relaxed);
        }

        let reachable = stats.heap_reachable.load(Ordering::Relaxed);
        let goal = reachable + reachable * gcpercent.max(0) as u64 / 100;
        self.heap_goal.store(goal, Ordering::Relaxed);

        let total_utilization_goal = procs as f64 * GC_GOAL_UTILIZATION;
        let dedicated = total_utilization_goal as i64;
        let fractional_goal = total_utilization_goal - dedicated as f64;
        self.dedicated_mark_workers_needed
            .store(dedicated, Ordering::SeqCst);
        self.fractional_utilization_goal
            .store(fractional_goal, Ordering::Relaxed);
        self.fractional_mark_workers_needed
            .store(if fractional_goal > 0.0 { 1 } else { 0 }, Ordering::SeqCst);

        self.revise(stats);

        logln_if!(
            pacertrace,
            "pacer: assist ratio={} (scan {} MB in {}->{} MB) workers={}+{}",
            self.assist_ratio(),
            stats.heap_scan.load(Ordering::Relaxed) >> 20,
            initial_heap_live >> 20,
            goal >> 20,
            dedicated,
            self.fractional_mark_workers_needed.load(Ordering::Relaxed)
        );
    }

    /// Recomputes the assist ratio from the remaining distance to the heap goal.
    pub(crate) fn revise(&self, stats: &HeapStats) {
        let scan_work_expected = stats.heap_scan.load(Ordering::Relaxed) as f64;
        let heap_distance = (self.heap_goal.load(Ordering::Relaxed) as i64
            - stats.heap_live() as i64)
            .max(MIN_HEAP_DISTANCE);
        self.assist_ratio
            .store(scan_work_expected / heap_distance as f64, Ordering::Relaxed);
    }

    /// Corrects the trigger ratio for the next cycle. Runs before this cycle's marked bytes
    /// replace `heap_marked`.
    pub(crate) fn end_cycle(
        &self,
        stats: &HeapStats,
        gcpercent: i32,
        procs: usize,
        mark_duration_ns: i64,
        pacertrace: bool,
    ) {
        let h_t = self.trigger_ratio();
        let goal_growth = gcpercent as f64 / 100.0;
        let heap_marked = stats.heap_marked.load(Ordering::Relaxed).max(1);
        let heap_live = stats.heap_live();
        let actual_growth = heap_live as f64 / heap_marked as f64 - 1.0;

        let mut mark_time = self.assist_time.load(Ordering::SeqCst)
            + self.dedicated_mark_time.load(Ordering::SeqCst)
            + self.fractional_mark_time.load(Ordering::SeqCst);
        if self.count_idle_mark_time {
            mark_time += self.idle_mark_time.load(Ordering::SeqCst);
        }
        let utilization = if mark_duration_ns > 0 {
            mark_time as f64 / (mark_duration_ns as f64 * procs as f64)
        } else {
            GC_GOAL_UTILIZATION
        };

        let error = trigger_error(
            goal_growth,
            h_t,
            actual_growth,
            utilization,
            GC_GOAL_UTILIZATION,
        );
        let next = next_trigger_ratio(h_t, error, goal_growth);
        self.trigger_ratio.store(next, Ordering::Relaxed);

        if pacertrace {
            let h_g_bytes = (heap_marked as f64 * (1.0 + goal_growth)) as i64;
            eprintln!(
                "pacer: H_m_prev={} h_t={} H_T={} h_a={} H_a={} h_g={} H_g={} u_a={} u_g={} W_a={} goalΔ={} actualΔ={} u_a/u_g={}",
                heap_marked,
                h_t,
                stats.next_gc(),
                actual_growth,
                heap_live,
                goal_growth,
                h_g_bytes,
                utilization,
                GC_GOAL_UTILIZATION,
                self.scan_work.load(Ordering::SeqCst),
                goal_growth - h_t,
                actual_growth - h_t,
                utilization / GC_GOAL_UTILIZATION
            );
        }
    }

    /// Takes one unit from `counter` if it is positive.
    pub(crate) fn dec_if_positive(counter: &AtomicI64) -> bool {
        if counter.load(Ordering::SeqCst) > 0 {
            if counter.fetch_sub(1, Ordering::SeqCst) > 0 {
                return true;
            }
            counter.fetch_add(1, Ordering::SeqCst);
        }
        false
    }

    /// Whether the fractional worker is at or below its share of the elapsed mark time.
    pub(crate) fn fractional_under_goal(&self, elapsed_ns: i64) -> bool {
        if elapsed_ns <= 0 {
            return true;
        }
        let used = self.fractional_mark_time.load(Ordering::SeqCst) as f64;
        used / elapsed_ns as f64 <= self.fractional_utilization_goal()
    }

    pub(crate) fn account_worker_time(&self, mode: MarkWorkerMode, ns: i64) {
        let counter = match mode {
            MarkWorkerMode::Dedicated => &self.dedicated_mark_time,
            MarkWorkerMode::Fractional => &self.fractional_mark_time,
            MarkWorkerMode::Idle => &self.idle_mark_time,
        };
        counter.fetch_add(ns, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_is_clamped() {
        assert_eq!(next_trigger_ratio(0.5, 10.0, 1.0), 0.95);
        assert_eq!(next_trigger_ratio(0.1, -10.0, 1.0), 0.0);
        assert_eq!(next_trigger_ratio(0.5, 0.2, -0.01), 0.0);
        let t = next_trigger_ratio(0.5, 0.2, 1.0);
        assert!((t - 0.6).abs() < 1e-12);
    }

    #[test]
    fn on_target_cycle_has_no_error() {
        // Heap grew exactly to the goal at exactly the goal utilization.
        let e = trigger_error(1.0, 0.7, 1.0, GC_GOAL_UTILIZATION, GC_GOAL_UTILIZATION);
        assert!(e.abs() < 1e-12);
    }

    #[test]
    fn slow_marking_lowers_trigger_until_stable() {
        // Model: marking takes a fixed amount of allocation, so a cycle triggered at ratio t
        // ends with growth t + 0.6, at twice the goal utilization.
        let goal = 1.0;
        let mut trigger = INITIAL_TRIGGER_RATIO;
        let mut history = vec![trigger];
        for _ in 0..40 {
            let actual = trigger + 0.6;
            let e = trigger_error(goal, trigger, actual, 0.5, GC_GOAL_UTILIZATION);
            trigger = next_trigger_ratio(trigger, e, goal);
            history.push(trigger);
        }
        for w in history.windows(2) {
            assert!(w[1] <= w[0] + 1e-12);
        }
        // Fixed point: goal - t - 2 * 0.6 = 0 has no non-negative solution, so the trigger
        // bottoms out at zero and stays there.
        assert_eq!(*history.last().unwrap(), 0.0);

        // A milder overshoot converges to the interior fixed point 1 - 2 * 0.2 = 0.6.
        let mut trigger = INITIAL_TRIGGER_RATIO;
        for _ in 0..60 {
            let e = trigger_error(goal, trigger, trigger + 0.2, 0.5, GC_GOAL_UTILIZATION);
            trigger = next_trigger_ratio(trigger, e, goal);
        }
        assert!((trigger - 0.6).abs() < 1e-6);
    }

    #[test]
    fn start_cycle_splits_workers() {
        let stats = HeapStats::new(1, 4 << 20);
        let pacer = GcController::new(false);
        pacer.start_cycle(&stats, 100, 4 << 20, 6, 0, false);
        assert_eq!(
            pacer.dedicated_mark_workers_needed.load(Ordering::SeqCst),
            1
        );
        assert!((pacer.fractional_utilization_goal() - 0.5).abs() < 1e-12);
        assert_eq!(
            pacer.fractional_mark_workers_needed.load(Ordering::SeqCst),
            1
        );
        // first cycle fakes heap_marked from next_gc
        let marked = stats.heap_marked.load(Ordering::Relaxed);
        assert_eq!(marked, ((4u64 << 20) as f64 / (1.0 + INITIAL_TRIGGER_RATIO)) as u64);
        assert_eq!(pacer.heap_goal.load(Ordering::Relaxed), marked * 2);

        pacer.start_cycle(&stats, 100, 4 << 20, 4, 0, false);
        assert_eq!(
            pacer.fractional_mark_workers_needed.load(Ordering::SeqCst),
            0
        );
    }

    #[test]
    fn assist_ratio_uses_distance_floor() {
        let stats = HeapStats::new(1, 0);
        let pacer = GcController::new(false);
        stats.heap_scan.store(4 << 20, Ordering::Relaxed);
        pacer.heap_goal.store(10 << 20, Ordering::Relaxed);
        stats.heap_live.store(8 << 20, Ordering::Relaxed);
        pacer.revise(&stats);
        assert!((pacer.assist_ratio() - 2.0).abs() < 1e-12);
        stats.heap_live.store(20 << 20, Ordering::Relaxed);
        pacer.revise(&stats);
        assert!((pacer.assist_ratio() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn dec_if_positive_never_goes_negative() {
        let c = AtomicI64::new(1);
        assert!(GcController::dec_if_positive(&c));
        assert!(!GcController::dec_if_positive(&c));
        assert_eq!(c.load(Ordering::SeqCst), 0);
    }
}
