//! Parallel for over `[0, n)` with work stealing.
//!
//! Every thread owns a contiguous range packed as `begin | end << 32` in one atomic word. The
//! owner takes iterations with a fetch-add on `begin`; a thief that runs dry splits a random
//! victim's range in half with a compare-and-swap and moves the upper half into its own slot.
use crossbeam_utils::{Backoff, CachePadded};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct ParFor {
    n: u32,
    nthr: u32,
    ranges: Box<[CachePadded<AtomicU64>]>,
    /// Threads that found nothing to steal.
    done: AtomicU32,
    nsteal: AtomicU64,
}

#[inline]
fn pack(begin: u32, end: u32) -> u64 {
    begin as u64 | (end as u64) << 32
}

impl ParFor {
    pub fn new(nthr: u32, n: u32) -> Self {
        if nthr == 0 {
            throw!("parfor: nthr == 0");
        }
        let ranges = (0..nthr)
            .map(|i| {
                let begin = (n as u64 * i as u64 / nthr as u64) as u32;
                let end = (n as u64 * (i as u64 + 1) / nthr as u64) as u32;
                CachePadded::new(AtomicU64::new(pack(begin, end)))
            })
            .collect();
        Self {
            n,
            nthr,
            ranges,
            done: AtomicU32::new(0),
            nsteal: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> u32 {
        self.n
    }

    pub fn steals(&self) -> u64 {
        self.nsteal.load(Ordering::Relaxed)
    }

    /// Runs `body` for iterations of the loop until all of them have been taken. Must be called
    /// once by every thread id in `0..nthr`.
    pub fn run(&self, tid: u32, body: &mut dyn FnMut(u32)) {
        if tid >= self.nthr {
            throw!("parfor: invalid tid {} (nthr {})", tid, self.nthr);
        }
        let mine = &self.ranges[tid as usize];
        let mut rng = thread_rng();
        let victims = Uniform::from(0..self.nthr);
        loop {
            loop {
                let pos = mine.fetch_add(1, Ordering::AcqRel);
                let begin = pos as u32;
                let end = (pos >> 32) as u32;
                if begin >= end {
                    break;
                }
                body(begin);
            }

            if self.nthr == 1 {
                return;
            }
            let mut idle = false;
            let backoff = Backoff::new();
            let stolen = loop {
                let mut found = None;
                for _ in 0..2 * self.nthr {
                    let victim = victims.sample(&mut rng);
                    if victim == tid {
                        continue;
                    }
                    if let Some(range) = self.steal_from(&self.ranges[victim as usize]) {
                        found = Some(range);
                        break;
                    }
                }
                if let Some(range) = found {
                    if idle {
                        self.done.fetch_sub(1, Ordering::SeqCst);
                    }
                    break Some(range);
                }
                if !idle {
                    self.done.fetch_add(1, Ordering::SeqCst);
                    idle = true;
                }
                if self.done.load(Ordering::SeqCst) == self.nthr {
                    break None;
                }
                backoff.snooze();
            };
            match stolen {
                Some((begin, end)) => {
                    self.nsteal.fetch_add(1, Ordering::Relaxed);
                    mine.store(pack(begin, end), Ordering::Release);
                }
                None => return,
            }
        }
    }

    /// Takes the upper half of the victim's remaining iterations.
    fn steal_from(&self, victim: &AtomicU64) -> Option<(u32, u32)> {
        loop {
            let pos = victim.load(Ordering::Acquire);
            let begin = pos as u32;
            let end = (pos >> 32) as u32;
            if begin.saturating_add(1) >= end {
                return None;
            }
            let mid = begin + (end - begin) / 2;
            if victim
                .compare_exchange(pos, pack(begin, mid), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some((mid, end));
            }
        }
    }
}
