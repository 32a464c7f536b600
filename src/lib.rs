//! # tricolor
//!
//! Concurrent, non-moving, non-generational tri-color mark-sweep collector.
//!
//! The heap is a single reserved arena carved into 8 KiB pages. Pages are grouped into spans of
//! uniformly sized objects; each heap word has a nibble in the heap bitmap recording whether it
//! holds a pointer and whether the object starting there is marked.
//!
//! A collection cycle moves through `off -> scan -> mark -> marktermination -> sweep -> off`:
//!
//! - **scan**: the world is restarted after a short pause and roots (globals, finalizer blocks,
//!   span specials and mutator stacks) are greyed into the global work lists.
//! - **mark**: write barriers are on. Background workers drain grey objects and mutators that
//!   allocate pay for their allocation with proportional assist work.
//! - **marktermination**: the world is stopped again, every cached work buffer is flushed and a
//!   final parallel mark pass drains whatever is left.
//! - **sweep**: spans are swept lazily by allocation, proportionally to allocation, and by a
//!   background sweeper thread. Unreachable objects with finalizers are resurrected and their
//!   finalizers are run by a dedicated finalizer mutator.
//!
//! Mutators interact with the heap through [`Mutator`]: every pointer store goes through
//! [`Mutator::store_ptr`] (or one of its multi-word variants) so that the barrier can shade the
//! stored pointer, and every stack slot lives in a [`FuncInfo`] described frame so that stacks
//! can be scanned precisely.
#![allow(clippy::new_without_default)]

use std::sync::Arc;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            println!($($t)*);
        }
    };
}

/// Aborts the process with a formatted message and a backtrace.
macro_rules! throw {
    ($($t:tt)*) => {
        $crate::fatal::fatal(&format!($($t)*))
    };
}

pub mod arena;
pub mod assist;
pub mod barrier;
pub mod bitmap;
pub mod collector;
pub mod debug;
pub mod fatal;
pub mod finalizer;
pub mod gcwork;
pub mod heap;
pub mod lfstack;
pub mod mark;
pub mod mcache;
pub mod mcentral;
pub mod mheap;
pub mod mutator;
pub mod pacer;
pub mod parfor;
pub mod phase;
pub mod roots;
pub mod sched;
pub mod sizeclass;
pub mod span;
pub mod stack;
pub mod stats;
pub mod sweep;
pub mod types;
pub mod util;
pub mod workbuf;
pub mod worker;

#[cfg(test)]
mod tests;

pub use collector::GcMode;
pub use debug::GcDebug;
pub use finalizer::{Finalizer, FinalizerError};
pub use heap::Heap;
pub use mutator::Mutator;
pub use phase::GcPhase;
pub use roots::{Module, Segment};
pub use stack::FuncInfo;
pub use stats::MemStats;
pub use types::TypeInfo;

/// Address of a heap word or object.
pub type Address = usize;

/// Configuration for heap constructor.
#[derive(Clone)]
pub struct Config {
    /// Heap growth percent. Negative value disables automatically triggered cycles.
    pub gc_percent: i32,
    /// Number of logical processors marking utilization and helper counts are computed for.
    pub procs: usize,
    /// Bytes reserved for the heap arena.
    pub arena_size: usize,
    /// Heap size below which no cycle is triggered, scaled by `gc_percent / 100`.
    pub heap_minimum: usize,
    /// Include idle mark worker time in the pacer's utilization term.
    pub count_idle_mark_time: bool,
    /// Enables verbose printing
    pub verbose: bool,
    /// Debug knobs, see [`GcDebug`].
    pub debug: GcDebug,
    /// Invoked by the coordinator once concurrent marking is underway, with the world running
    /// and write barriers enabled. Used for instrumentation.
    pub mark_hook: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Config {
    /// Default configuration updated from `GOGC` and `GODEBUG`.
    pub fn from_env() -> Self {
        let gogc = std::env::var("GOGC").ok();
        Self {
            gc_percent: debug::parse_gogc(gogc.as_deref()),
            debug: GcDebug::from_env(),
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gc_percent: 100,
            procs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            arena_size: 256 * 1024 * 1024,
            heap_minimum: 4 * 1024 * 1024,
            count_idle_mark_time: false,
            verbose: false,
            debug: GcDebug::default(),
            mark_hook: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("gc_percent", &self.gc_percent)
            .field("procs", &self.procs)
            .field("arena_size", &self.arena_size)
            .field("heap_minimum", &self.heap_minimum)
            .field("count_idle_mark_time", &self.count_idle_mark_time)
            .field("verbose", &self.verbose)
            .field("debug", &self.debug)
            .field("mark_hook", &self.mark_hook.is_some())
            .finish()
    }
}
