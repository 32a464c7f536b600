//! Grey object buffers and the global work lists.
//!
//! A buffer lives on exactly one of `empty`, `partial` or `full`, or is owned by one `GcWork`.
//! Buffers are allocated on demand and only released when the heap goes away.
use crate::{
    lfstack::{LfNode, LfStack},
    Address,
};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

pub const WORKBUF_SIZE: usize = 4096;
pub const WORKBUF_OBJS: usize =
    (WORKBUF_SIZE - std::mem::size_of::<LfNode>() - std::mem::size_of::<usize>())
        / std::mem::size_of::<Address>();

#[repr(C)]
pub struct Workbuf {
    node: LfNode,
    nobj: usize,
    obj: [Address; WORKBUF_OBJS],
}

/// Exclusive handle to a buffer taken off a work list.
#[derive(Debug, PartialEq, Eq)]
pub struct WbufPtr(NonNull<Workbuf>);

unsafe impl Send for WbufPtr {}

impl WbufPtr {
    fn from_node(node: *mut LfNode) -> Self {
        Self(unsafe { NonNull::new_unchecked(node.cast::<Workbuf>()) })
    }

    fn node(&self) -> *mut LfNode {
        self.0.as_ptr().cast::<LfNode>()
    }

    #[inline]
    fn buf(&self) -> &Workbuf {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn buf_mut(&mut self) -> &mut Workbuf {
        unsafe { self.0.as_mut() }
    }

    #[inline]
    pub fn nobj(&self) -> usize {
        self.buf().nobj
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nobj() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.nobj() == WORKBUF_OBJS
    }

    #[inline]
    pub fn push(&mut self, obj: Address) {
        let b = self.buf_mut();
        debug_assert!(b.nobj < WORKBUF_OBJS);
        b.obj[b.nobj] = obj;
        b.nobj += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Address> {
        let b = self.buf_mut();
        if b.nobj == 0 {
            return None;
        }
        b.nobj -= 1;
        Some(b.obj[b.nobj])
    }

    fn check_empty(&self, op: &str) {
        if self.nobj() != 0 {
            throw!("{}: workbuf is not empty ({} objects)", op, self.nobj());
        }
    }

    fn check_nonempty(&self, op: &str) {
        if self.nobj() == 0 {
            throw!("{}: workbuf is empty", op);
        }
    }
}

pub struct WorkQueues {
    full: LfStack,
    partial: LfStack,
    empty: LfStack,
    /// Number of workers that may take part in marking.
    pub(crate) nproc: AtomicU32,
    /// Number of those workers currently idle. Marking is complete when `nwait == nproc` and
    /// both `full` and `partial` are empty.
    pub(crate) nwait: AtomicU32,
    pub(crate) bytes_marked: AtomicU64,
    pub(crate) initial_heap_live: AtomicU64,
    bg_mark_done: AtomicU32,
    done: Mutex<bool>,
    done_cv: Condvar,
    allocated: Mutex<Vec<WbufPtr>>,
}

impl WorkQueues {
    pub fn new() -> Self {
        Self {
            full: LfStack::new(),
            partial: LfStack::new(),
            empty: LfStack::new(),
            nproc: AtomicU32::new(0),
            nwait: AtomicU32::new(0),
            bytes_marked: AtomicU64::new(0),
            initial_heap_live: AtomicU64::new(0),
            bg_mark_done: AtomicU32::new(0),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            allocated: Mutex::new(Vec::new()),
        }
    }

    /// True when neither `full` nor `partial` holds grey objects.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.full.is_empty() && self.partial.is_empty()
    }

    fn new_buf(&self) -> WbufPtr {
        let raw = Box::into_raw(Box::new(Workbuf {
            node: LfNode::new(),
            nobj: 0,
            obj: [0; WORKBUF_OBJS],
        }));
        let b = WbufPtr(unsafe { NonNull::new_unchecked(raw) });
        self.allocated.lock().push(WbufPtr(b.0));
        b
    }

    pub fn getempty(&self) -> WbufPtr {
        let b = match self.empty.pop() {
            Some(node) => WbufPtr::from_node(node),
            None => self.new_buf(),
        };
        b.check_empty("getempty");
        b
    }

    pub fn putempty(&self, b: WbufPtr) {
        b.check_empty("putempty");
        self.empty.push(b.node());
    }

    /// Publishes a buffer with grey objects on `full`. It does not have to be completely full.
    pub fn putfull(&self, b: WbufPtr) {
        b.check_nonempty("putfull");
        self.full.push(b.node());
    }

    /// Puts `b` on the list matching its fill level.
    pub fn putpartial(&self, b: WbufPtr) {
        if b.is_empty() {
            self.empty.push(b.node());
        } else if b.is_full() {
            self.full.push(b.node());
        } else {
            self.partial.push(b.node());
        }
    }

    pub fn getpartialorempty(&self) -> WbufPtr {
        match self.partial.pop() {
            Some(node) => WbufPtr::from_node(node),
            None => self.getempty(),
        }
    }

    /// Takes a buffer with grey objects without waiting.
    pub fn trygetfull(&self) -> Option<WbufPtr> {
        self.full
            .pop()
            .or_else(|| self.partial.pop())
            .map(WbufPtr::from_node)
    }

    /// Takes a buffer with grey objects, waiting for other workers to produce some. Returns `None`
    /// once every worker is idle, which is a completion point.
    pub fn getfull(&self) -> Option<WbufPtr> {
        if let Some(b) = self.trygetfull() {
            return Some(b);
        }
        if self.nproc.load(Ordering::SeqCst) == 1 {
            return None;
        }

        self.inc_nwait("getfull");
        let backoff = Backoff::new();
        loop {
            if !self.is_empty() {
                self.dec_nwait("getfull");
                if let Some(b) = self.trygetfull() {
                    return Some(b);
                }
                self.inc_nwait("getfull");
            }
            if self.nwait.load(Ordering::SeqCst) == self.nproc.load(Ordering::SeqCst) {
                return None;
            }
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_micros(100));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Splits `b`: the older half is published on `full` for other workers, the newer half is
    /// returned.
    pub fn handoff(&self, mut b: WbufPtr) -> WbufPtr {
        let mut b1 = self.getempty();
        let n = b.nobj() / 2;
        let keep = b.nobj() - n;
        {
            let src = b.buf_mut();
            let dst = b1.buf_mut();
            dst.obj[..n].copy_from_slice(&src.obj[keep..keep + n]);
            dst.nobj = n;
            src.nobj = keep;
        }
        self.putfull(b);
        b1
    }

    /// Leaves the idle set. Returns the new `nwait`.
    pub(crate) fn dec_nwait(&self, who: &str) -> u32 {
        let prev = self.nwait.fetch_sub(1, Ordering::SeqCst);
        if prev == self.nproc.load(Ordering::SeqCst).wrapping_add(1) {
            throw!("{}: nwait {} > nproc", who, prev);
        }
        prev.wrapping_sub(1)
    }

    /// Joins the idle set. Returns the new `nwait`.
    pub(crate) fn inc_nwait(&self, who: &str) -> u32 {
        let nproc = self.nproc.load(Ordering::SeqCst);
        let next = self.nwait.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if next.wrapping_sub(nproc) as i32 > 0 {
            throw!("{}: nwait {} > nproc {}", who, next, nproc);
        }
        next
    }

    /// True for the worker whose return to the idle set found no work left anywhere.
    pub(crate) fn at_completion_point(&self, nwait: u32) -> bool {
        nwait == self.nproc.load(Ordering::SeqCst) && self.is_empty()
    }

    /// Sets up counters for concurrent mark. Participation is open ended: every worker and
    /// assist decrements `nwait` on entry and increments it on exit, so both start at the same
    /// wrapped value.
    pub(crate) fn bg_mark_prepare(&self) {
        self.nproc.store(u32::MAX, Ordering::SeqCst);
        self.nwait.store(u32::MAX, Ordering::SeqCst);
        self.bg_mark_done.store(0, Ordering::SeqCst);
        *self.done.lock() = false;
    }

    /// Signals that concurrent mark reached a completion point. Only the first call per cycle
    /// has an effect.
    pub(crate) fn bg_mark_done(&self) {
        if self
            .bg_mark_done
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            let mut done = self.done.lock();
            *done = true;
            self.done_cv.notify_all();
        }
    }

    pub(crate) fn bg_mark_is_done(&self) -> bool {
        self.bg_mark_done.load(Ordering::SeqCst) != 0
    }

    /// Waits up to `timeout` for the completion signal.
    pub(crate) fn wait_mark_done(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if !*done {
            self.done_cv.wait_for(&mut done, timeout);
        }
        *done
    }

    /// Sets up counters for the stop-the-world mark with `nproc` helpers.
    pub(crate) fn stw_mark_prepare(&self, nproc: u32) {
        self.nproc.store(nproc, Ordering::SeqCst);
        self.nwait.store(0, Ordering::SeqCst);
    }
}

impl Drop for WorkQueues {
    fn drop(&mut self) {
        for b in self.allocated.get_mut().drain(..) {
            unsafe { drop(Box::from_raw(b.0.as_ptr())) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_fits_page() {
        assert_eq!(std::mem::size_of::<Workbuf>(), WORKBUF_SIZE);
    }

    #[test]
    fn lists_follow_fill_level() {
        let work = WorkQueues::new();
        let mut b = work.getempty();
        b.push(0x1000);
        work.putpartial(b);
        assert!(!work.is_empty());

        let mut b = work.trygetfull().unwrap();
        assert_eq!(b.pop(), Some(0x1000));
        assert!(work.is_empty());
        work.putpartial(b);
        assert!(work.is_empty());
        assert!(work.trygetfull().is_none());
        let b = work.getempty();
        assert!(b.is_empty());
        work.putempty(b);
    }

    #[test]
    fn handoff_splits_in_half() {
        let work = WorkQueues::new();
        let mut b = work.getempty();
        for i in 1..=10 {
            b.push(i * 8);
        }
        let mut mine = work.handoff(b);
        assert_eq!(mine.nobj(), 5);
        assert_eq!(mine.pop(), Some(80));
        let published = work.trygetfull().unwrap();
        assert_eq!(published.nobj(), 5);
    }

    #[test]
    fn getfull_returns_at_completion_point() {
        let work = WorkQueues::new();
        work.stw_mark_prepare(2);
        work.nwait.store(1, Ordering::SeqCst);
        assert!(work.getfull().is_none());
        assert_eq!(work.nwait.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn completion_latch_fires_once() {
        let work = WorkQueues::new();
        work.bg_mark_prepare();
        assert!(!work.wait_mark_done(Duration::from_millis(1)));
        work.bg_mark_done();
        work.bg_mark_done();
        assert!(work.wait_mark_done(Duration::from_millis(1)));
        assert_eq!(work.dec_nwait("test"), u32::MAX - 1);
        assert_eq!(work.inc_nwait("test"), u32::MAX);
        assert!(work.at_completion_point(u32::MAX));
    }
}
