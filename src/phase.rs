//! Collector phase and the derived write barrier flag.
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    Off = 0,
    Scan = 1,
    Mark = 2,
    MarkTermination = 3,
    Sweep = 4,
}

impl GcPhase {
    fn from_bits(bits: u8) -> Self {
        match bits & PHASE_MASK {
            0 => Self::Off,
            1 => Self::Scan,
            2 => Self::Mark,
            3 => Self::MarkTermination,
            4 => Self::Sweep,
            _ => throw!("bad gc phase bits {:#x}", bits),
        }
    }

    pub fn needs_write_barrier(self) -> bool {
        matches!(self, Self::Mark | Self::MarkTermination)
    }
}

const PHASE_MASK: u8 = 0x7;
const WRITE_BARRIER: u8 = 0x80;

/// Phase and write barrier flag packed in one byte so they are always published together.
pub struct PhaseController {
    state: AtomicU8,
    blacken: AtomicBool,
}

impl PhaseController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(GcPhase::Off as u8),
            blacken: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_bits(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn write_barrier_enabled(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITE_BARRIER != 0
    }

    /// Publishes `next`. Callers fence the change with `for_each_p` before relying on it.
    pub(crate) fn set_phase(&self, next: GcPhase) {
        let wb = if next.needs_write_barrier() {
            WRITE_BARRIER
        } else {
            0
        };
        self.state.store(next as u8 | wb, Ordering::SeqCst);
        self.check_invariant();
    }

    /// Moves `Sweep` to `Off`. Both the background sweeper and a cycle that finds sweeping
    /// unfinished race to do this; returns true for the winner.
    pub(crate) fn finish_sweep(&self) -> bool {
        self.state
            .compare_exchange(
                GcPhase::Sweep as u8,
                GcPhase::Off as u8,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn check_invariant(&self) {
        let bits = self.state.load(Ordering::Acquire);
        let phase = GcPhase::from_bits(bits);
        if phase.needs_write_barrier() != (bits & WRITE_BARRIER != 0) {
            throw!(
                "phase {:?} disagrees with write barrier flag ({:#x})",
                phase,
                bits
            );
        }
    }

    /// Whether mark workers and assists may blacken objects.
    #[inline]
    pub fn blacken_enabled(&self) -> bool {
        self.blacken.load(Ordering::SeqCst)
    }

    pub(crate) fn set_blacken_enabled(&self, enabled: bool) {
        self.blacken.store(enabled, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_follows_phase() {
        let pc = PhaseController::new();
        assert!(!pc.write_barrier_enabled());
        for (phase, wb) in [
            (GcPhase::Scan, false),
            (GcPhase::Mark, true),
            (GcPhase::MarkTermination, true),
            (GcPhase::Off, false),
            (GcPhase::Sweep, false),
        ]
        .iter()
        {
            pc.set_phase(*phase);
            assert_eq!(pc.phase(), *phase);
            assert_eq!(pc.write_barrier_enabled(), *wb);
        }
    }

    #[test]
    fn sweep_finishes_once() {
        let pc = PhaseController::new();
        pc.set_phase(GcPhase::Sweep);
        assert!(pc.finish_sweep());
        assert!(!pc.finish_sweep());
        assert_eq!(pc.phase(), GcPhase::Off);
    }
}
