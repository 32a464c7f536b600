use crate::util::formatted_size;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Length of the circular pause history.
pub const PAUSE_HISTORY: usize = 256;

/// Live heap counters. Updated with atomic adds from allocation, sweeping and the collector.
pub struct HeapStats {
    /// Bytes in spans' allocated slots, swept or not. Reset to the marked bytes at the end of
    /// every cycle.
    pub(crate) heap_live: AtomicU64,
    /// Bytes marked by the previous cycle.
    pub(crate) heap_marked: AtomicU64,
    /// Estimate of the reachable heap at the end of the previous cycle.
    pub(crate) heap_reachable: AtomicU64,
    /// Scan work done by the previous cycle, the expected scan work of the next one.
    pub(crate) heap_scan: AtomicU64,
    /// Heap size at which the next cycle is triggered.
    pub(crate) next_gc: AtomicU64,
    pub(crate) heap_alloc: AtomicU64,
    pub(crate) total_alloc: AtomicU64,
    pub(crate) mallocs: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) by_size: Box<[SizeClassStats]>,
    pub(crate) num_gc: AtomicU32,
    pub(crate) num_forced_gc: AtomicU32,
    pub(crate) last_gc: AtomicU64,
    pub(crate) pause_total_ns: AtomicU64,
    pause_ns: Box<[AtomicU64]>,
    pause_end: Box<[AtomicU64]>,
}

#[derive(Default)]
pub(crate) struct SizeClassStats {
    pub(crate) mallocs: AtomicU64,
    pub(crate) frees: AtomicU64,
}

impl HeapStats {
    pub(crate) fn new(nclasses: usize, next_gc: u64) -> Self {
        Self {
            heap_live: AtomicU64::new(0),
            heap_marked: AtomicU64::new(0),
            heap_reachable: AtomicU64::new(0),
            heap_scan: AtomicU64::new(0),
            next_gc: AtomicU64::new(next_gc),
            heap_alloc: AtomicU64::new(0),
            total_alloc: AtomicU64::new(0),
            mallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            by_size: (0..nclasses).map(|_| SizeClassStats::default()).collect(),
            num_gc: AtomicU32::new(0),
            num_forced_gc: AtomicU32::new(0),
            last_gc: AtomicU64::new(0),
            pause_total_ns: AtomicU64::new(0),
            pause_ns: (0..PAUSE_HISTORY).map(|_| AtomicU64::new(0)).collect(),
            pause_end: (0..PAUSE_HISTORY).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub(crate) fn heap_live(&self) -> u64 {
        self.heap_live.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn next_gc(&self) -> u64 {
        self.next_gc.load(Ordering::Relaxed)
    }

    pub(crate) fn record_malloc(&self, sizeclass: usize, size: usize) {
        self.mallocs.fetch_add(1, Ordering::Relaxed);
        self.total_alloc.fetch_add(size as u64, Ordering::Relaxed);
        self.heap_alloc.fetch_add(size as u64, Ordering::Relaxed);
        self.heap_live.fetch_add(size as u64, Ordering::Relaxed);
        self.by_size[sizeclass].mallocs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, sizeclass: usize, size: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.heap_alloc.fetch_sub(size as u64, Ordering::Relaxed);
        self.by_size[sizeclass].frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the total stop-the-world time of cycle `num_gc` (counted from 1).
    pub(crate) fn record_pause(&self, num_gc: u32, pause_ns: u64, end_unix_ns: u64) {
        let slot = (num_gc as usize + PAUSE_HISTORY - 1) % PAUSE_HISTORY;
        self.pause_ns[slot].store(pause_ns, Ordering::Relaxed);
        self.pause_end[slot].store(end_unix_ns, Ordering::Relaxed);
        self.pause_total_ns.fetch_add(pause_ns, Ordering::Relaxed);
        self.last_gc.store(end_unix_ns, Ordering::Relaxed);
    }
}

/// Snapshot of the heap counters.
#[derive(Clone, Debug)]
pub struct MemStats {
    /// Bytes of allocated objects not yet freed.
    pub heap_alloc: u64,
    /// Bytes of address space handed out to spans so far.
    pub heap_sys: u64,
    pub heap_idle: u64,
    pub heap_inuse: u64,
    pub heap_objects: u64,
    pub total_alloc: u64,
    pub mallocs: u64,
    pub frees: u64,
    /// Bytes marked by the last cycle.
    pub heap_marked: u64,
    pub heap_live: u64,
    /// Heap size that triggers the next cycle.
    pub next_gc: u64,
    /// Unix time of the end of the last cycle in nanoseconds.
    pub last_gc: u64,
    pub pause_total_ns: u64,
    /// Circular buffer of recent pause times. The most recent is at `(num_gc + 255) % 256`.
    pub pause_ns: Vec<u64>,
    pub pause_end: Vec<u64>,
    pub num_gc: u32,
    pub num_forced_gc: u32,
    /// Per size class `(object size, mallocs, frees)`. Entry 0 collects large objects.
    pub by_size: Vec<(usize, u64, u64)>,
    pub gc_percent: i32,
}

impl Default for MemStats {
    fn default() -> Self {
        Self {
            heap_alloc: 0,
            heap_sys: 0,
            heap_idle: 0,
            heap_inuse: 0,
            heap_objects: 0,
            total_alloc: 0,
            mallocs: 0,
            frees: 0,
            heap_marked: 0,
            heap_live: 0,
            next_gc: 0,
            last_gc: 0,
            pause_total_ns: 0,
            pause_ns: vec![0; PAUSE_HISTORY],
            pause_end: vec![0; PAUSE_HISTORY],
            num_gc: 0,
            num_forced_gc: 0,
            by_size: Vec::new(),
            gc_percent: 0,
        }
    }
}

impl MemStats {
    pub(crate) fn fill(&mut self, stats: &HeapStats, class_size: impl Fn(usize) -> usize) {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        self.heap_alloc = load(&stats.heap_alloc);
        self.total_alloc = load(&stats.total_alloc);
        self.mallocs = load(&stats.mallocs);
        self.frees = load(&stats.frees);
        self.heap_objects = self.mallocs.saturating_sub(self.frees);
        self.heap_marked = load(&stats.heap_marked);
        self.heap_live = load(&stats.heap_live);
        self.next_gc = load(&stats.next_gc);
        self.last_gc = load(&stats.last_gc);
        self.pause_total_ns = load(&stats.pause_total_ns);
        self.pause_ns = stats.pause_ns.iter().map(load).collect();
        self.pause_end = stats.pause_end.iter().map(load).collect();
        self.num_gc = stats.num_gc.load(Ordering::Relaxed);
        self.num_forced_gc = stats.num_forced_gc.load(Ordering::Relaxed);
        self.by_size = stats
            .by_size
            .iter()
            .enumerate()
            .map(|(c, s)| (class_size(c), load(&s.mallocs), load(&s.frees)))
            .collect();
    }
}

impl std::fmt::Display for MemStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Heap in use: {} of {} reserved ({} idle)",
            formatted_size(self.heap_inuse as usize),
            formatted_size(self.heap_sys as usize),
            formatted_size(self.heap_idle as usize)
        )?;
        writeln!(
            f,
            "  Allocated objects: {} ({})",
            self.heap_objects,
            formatted_size(self.heap_alloc as usize)
        )?;
        writeln!(
            f,
            "  Total allocated: {} in {} allocations, {} frees",
            formatted_size(self.total_alloc as usize),
            self.mallocs,
            self.frees
        )?;
        writeln!(
            f,
            "  Marked by last cycle: {}",
            formatted_size(self.heap_marked as usize)
        )?;
        writeln!(f, "  Next cycle at: {}", formatted_size(self.next_gc as usize))?;
        writeln!(
            f,
            "  Cycles: {} ({} forced), total pause {:.3}ms",
            self.num_gc,
            self.num_forced_gc,
            self.pause_total_ns as f64 / 1e6
        )?;
        Ok(())
    }
}
