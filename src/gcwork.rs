use crate::{
    workbuf::{WbufPtr, WorkQueues},
    Address,
};
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-worker grey object cache.
///
/// Holds at most one buffer so that most puts and gets touch no shared state. Must be disposed
/// before its owner parks or the world restarts after mark termination, otherwise the grey
/// objects it holds are invisible to everyone else.
#[derive(Default)]
pub struct GcWork {
    wbuf: Option<WbufPtr>,
    /// Bytes of heap blackened through this cache and not yet flushed.
    pub bytes_marked: u64,
    /// Scan work performed through this cache and not yet flushed.
    pub scan_work: i64,
}

impl GcWork {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn put(&mut self, work: &WorkQueues, obj: Address) {
        let wbuf = self.wbuf.get_or_insert_with(|| work.getpartialorempty());
        wbuf.push(obj);
        if wbuf.is_full() {
            if let Some(full) = self.wbuf.take() {
                work.putfull(full);
            }
        }
    }

    /// Returns a grey object or `None` when none is available right now. Never waits.
    #[inline]
    pub fn try_get(&mut self, work: &WorkQueues) -> Option<Address> {
        if self.wbuf.is_none() {
            self.wbuf = Some(work.trygetfull()?);
        }
        self.take_from_wbuf(work)
    }

    /// Like `try_get`, but waits for other workers until marking reaches a completion point.
    pub fn get(&mut self, work: &WorkQueues) -> Option<Address> {
        if self.wbuf.is_none() {
            self.wbuf = Some(work.getfull()?);
        }
        self.take_from_wbuf(work)
    }

    #[inline]
    fn take_from_wbuf(&mut self, work: &WorkQueues) -> Option<Address> {
        let wbuf = self.wbuf.as_mut()?;
        let obj = wbuf.pop();
        if wbuf.is_empty() {
            if let Some(b) = self.wbuf.take() {
                work.putempty(b);
            }
        }
        obj
    }

    /// Publishes the cached buffer and flushes the counters.
    pub fn dispose(&mut self, work: &WorkQueues, scan_work: &AtomicI64) {
        if let Some(b) = self.wbuf.take() {
            work.putpartial(b);
        }
        if self.bytes_marked != 0 {
            work.bytes_marked
                .fetch_add(self.bytes_marked, Ordering::SeqCst);
            self.bytes_marked = 0;
        }
        if self.scan_work != 0 {
            scan_work.fetch_add(self.scan_work, Ordering::SeqCst);
            self.scan_work = 0;
        }
    }

    /// Gives half of a well filled buffer to other workers.
    pub fn balance(&mut self, work: &WorkQueues) {
        if self.wbuf.as_ref().map_or(false, |b| b.nobj() > 4) {
            if let Some(b) = self.wbuf.take() {
                self.wbuf = Some(work.handoff(b));
            }
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wbuf.as_ref().map_or(true, WbufPtr::is_empty)
    }
}

impl Drop for GcWork {
    fn drop(&mut self) {
        if let Some(b) = &self.wbuf {
            if !b.is_empty() {
                throw!("gcWork dropped while holding {} grey objects", b.nobj());
            }
        }
    }
}
