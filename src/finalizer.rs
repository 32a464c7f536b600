//! Finalizers.
//!
//! An installed finalizer is a special record on the object's span. When the sweeper finds the
//! object unmarked it removes the record, marks the object again so it survives this cycle and
//! queues the finalizer in a finalizer block. Blocks are roots, so the queued argument stays alive
//! until the finalizer goroutine has run it.
use crate::{
    heap::Heap,
    mutator::Mutator,
    span::{SpanState, Special},
    types::TypeInfo,
    Address,
};
use bit_vec::BitVec;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Finalizer records per block: a 4 KiB block of five word records.
pub const FIN_BLOCK_ENTRIES: usize = 101;
/// Pointer free objects below this size may carry a finalizer on an interior byte.
const MAX_TINY_SIZE: usize = 16;

pub type FinalizerFn = Arc<dyn Fn(&mut Mutator, Address) + Send + Sync>;

/// Callback run once the object it is attached to becomes unreachable.
#[derive(Clone)]
pub struct Finalizer {
    arg: Option<TypeInfo>,
    func: FinalizerFn,
}

impl Finalizer {
    /// Finalizer accepting an object of any type.
    pub fn new(f: impl Fn(&mut Mutator, Address) + Send + Sync + 'static) -> Self {
        Self {
            arg: None,
            func: Arc::new(f),
        }
    }

    /// Finalizer that may only be installed on objects of type `ty`.
    pub fn typed(ty: TypeInfo, f: impl Fn(&mut Mutator, Address) + Send + Sync + 'static) -> Self {
        Self {
            arg: Some(ty),
            func: Arc::new(f),
        }
    }
}

impl fmt::Debug for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Finalizer")
            .field("arg", &self.arg.as_ref().map(TypeInfo::name))
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizerError {
    /// The address is not inside an allocated heap object.
    NotHeapObject(Address),
    /// The address is inside an object but not at its start.
    NotObjectStart(Address),
    /// The finalizer expects a different type than the object has.
    TypeMismatch { expected: String, found: String },
    AlreadySet(Address),
}

impl fmt::Display for FinalizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotHeapObject(p) => write!(f, "set_finalizer: pointer {:#x} not in allocated block", p),
            Self::NotObjectStart(p) => write!(
                f,
                "set_finalizer: pointer {:#x} not at beginning of allocated block",
                p
            ),
            Self::TypeMismatch { expected, found } => write!(
                f,
                "set_finalizer: cannot pass {} to finalizer expecting {}",
                found, expected
            ),
            Self::AlreadySet(p) => write!(f, "set_finalizer: finalizer already set for {:#x}", p),
        }
    }
}

impl std::error::Error for FinalizerError {}

struct FinBlock {
    args: Box<[AtomicUsize]>,
    fns: Vec<Option<Finalizer>>,
    cnt: usize,
}

struct FinQueue {
    /// Every block ever allocated.
    allfin: Vec<FinBlock>,
    /// Blocks with queued finalizers, last one is being filled.
    finq: Vec<usize>,
    /// Empty blocks.
    finc: Vec<usize>,
    /// The finalizer goroutine is waiting for work.
    fingwait: bool,
    /// Finalizers were queued since the last wakeup.
    fingwake: bool,
    shutdown: bool,
}

pub(crate) struct FinState {
    queue: Mutex<FinQueue>,
    cv: Condvar,
    ptrmask: BitVec,
    started: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    /// Finalizers run so far.
    pub(crate) nrun: AtomicUsize,
}

impl FinState {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(FinQueue {
                allfin: Vec::new(),
                finq: Vec::new(),
                finc: Vec::new(),
                fingwait: false,
                fingwake: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
            ptrmask: BitVec::from_elem(FIN_BLOCK_ENTRIES, true),
            started: AtomicBool::new(false),
            thread: Mutex::new(None),
            nrun: AtomicUsize::new(0),
        }
    }
}

impl Heap {
    /// Installs (or with `None`, removes) the finalizer of the object at `obj` of type `ty`.
    pub(crate) fn set_finalizer(
        self: &Arc<Self>,
        obj: Address,
        ty: &TypeInfo,
        fin: Option<Finalizer>,
    ) -> Result<(), FinalizerError> {
        let s = match self.mheap.span_of(obj) {
            Some(s) if s.state() == SpanState::InUse && obj < s.limit() => s,
            _ => return Err(FinalizerError::NotHeapObject(obj)),
        };
        self.ensure_swept(s);
        if !s.is_allocated(s.object_index(obj)) {
            return Err(FinalizerError::NotHeapObject(obj));
        }
        let base = s.object_base(obj);
        if base != obj && (ty.has_pointers() || ty.size() >= MAX_TINY_SIZE) {
            return Err(FinalizerError::NotObjectStart(obj));
        }
        if ty.size() > s.elemsize - (obj - base) {
            return Err(FinalizerError::TypeMismatch {
                expected: ty.name().to_string(),
                found: format!("{} byte object", s.elemsize),
            });
        }

        let offset = obj - s.start;
        let fin = match fin {
            Some(fin) => fin,
            None => {
                s.specials.lock().retain(|sp| sp.offset != offset);
                return Ok(());
            }
        };
        if let Some(expected) = &fin.arg {
            if expected != ty {
                return Err(FinalizerError::TypeMismatch {
                    expected: expected.name().to_string(),
                    found: ty.name().to_string(),
                });
            }
        }

        {
            let mut specials = s.specials.lock();
            if specials.iter().any(|sp| sp.offset == offset) {
                return Err(FinalizerError::AlreadySet(obj));
            }
            let at = specials
                .iter()
                .position(|sp| sp.offset > offset)
                .unwrap_or(specials.len());
            specials.insert(
                at,
                Special {
                    offset,
                    fin,
                },
            );
        }
        self.create_fing();
        Ok(())
    }

    /// Queues `fin` to run with argument `p`. Called by the sweeper.
    pub(crate) fn queue_finalizer(&self, fin: Finalizer, p: Address) {
        let mut q = self.fin.queue.lock();
        let q = &mut *q;
        let need_block = match q.finq.last() {
            Some(&b) => q.allfin[b].cnt == FIN_BLOCK_ENTRIES,
            None => true,
        };
        if need_block {
            let b = match q.finc.pop() {
                Some(b) => b,
                None => {
                    q.allfin.push(FinBlock {
                        args: (0..FIN_BLOCK_ENTRIES).map(|_| AtomicUsize::new(0)).collect(),
                        fns: (0..FIN_BLOCK_ENTRIES).map(|_| None).collect(),
                        cnt: 0,
                    });
                    q.allfin.len() - 1
                }
            };
            q.finq.push(b);
        }
        let b = match q.finq.last() {
            Some(&b) => b,
            None => throw!("queue_finalizer: no block"),
        };
        let block = &mut q.allfin[b];
        if block.fns[block.cnt].is_some() {
            throw!("queue_finalizer: finalizer block entry {} is not free", block.cnt);
        }
        block.args[block.cnt].store(p, Ordering::Release);
        block.fns[block.cnt] = Some(fin);
        block.cnt += 1;
        q.fingwake = true;
    }

    /// Root 2: the arguments of queued finalizers.
    pub(crate) fn scan_finalizer_blocks(&self, gcw: &mut crate::gcwork::GcWork) {
        let q = self.fin.queue.lock();
        for block in q.allfin.iter() {
            let live = &block.args[..block.cnt];
            self.scanblock(live, live.as_ptr() as Address, &self.fin.ptrmask, gcw);
        }
    }

    /// Wakes the finalizer goroutine if it waits and finalizers were queued.
    pub(crate) fn wake_fing(&self) {
        let mut q = self.fin.queue.lock();
        if q.fingwait && q.fingwake {
            q.fingwait = false;
            q.fingwake = false;
            self.fin.cv.notify_all();
        }
    }

    fn create_fing(self: &Arc<Self>) {
        if self.fin.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let heap = self.clone();
        let handle = std::thread::Builder::new()
            .name("fing".to_string())
            .spawn(move || heap.run_finalizers());
        match handle {
            Ok(h) => *self.fin.thread.lock() = Some(h),
            Err(e) => throw!("failed to start finalizer goroutine: {}", e),
        }
    }

    fn run_finalizers(self: Arc<Self>) {
        let mut m = self.attach();
        loop {
            let heap = self.clone();
            let batch = m.blocking(move || {
                let mut q = heap.fin.queue.lock();
                loop {
                    if q.shutdown {
                        return None;
                    }
                    if !q.finq.is_empty() && !q.fingwait {
                        return Some(std::mem::take(&mut q.finq));
                    }
                    q.fingwait = true;
                    heap.fin.cv.wait(&mut q);
                }
            });
            let batch = match batch {
                Some(batch) => batch,
                None => break,
            };
            for &b in batch.iter().rev() {
                loop {
                    let (arg, spec) = {
                        let q = self.fin.queue.lock();
                        let block = &q.allfin[b];
                        if block.cnt == 0 {
                            break;
                        }
                        let i = block.cnt - 1;
                        let spec = match &block.fns[i] {
                            Some(fin) => fin.func.clone(),
                            None => throw!("run_finalizers: empty entry {} in queued block", i),
                        };
                        (block.args[i].load(Ordering::Acquire), spec)
                    };
                    spec(&mut m, arg);
                    self.fin.nrun.fetch_add(1, Ordering::SeqCst);
                    {
                        let mut q = self.fin.queue.lock();
                        let block = &mut q.allfin[b];
                        let i = block.cnt - 1;
                        block.fns[i] = None;
                        block.args[i].store(0, Ordering::Release);
                        block.cnt = i;
                    }
                    m.safepoint();
                }
                self.fin.queue.lock().finc.push(b);
            }
        }
        drop(m);
    }

    pub(crate) fn shutdown_fing(&self) {
        {
            let mut q = self.fin.queue.lock();
            q.shutdown = true;
            self.fin.cv.notify_all();
        }
        if let Some(h) = self.fin.thread.lock().take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_display() {
        let e = FinalizerError::TypeMismatch {
            expected: "node".into(),
            found: "leaf".into(),
        };
        assert_eq!(
            e.to_string(),
            "set_finalizer: cannot pass leaf to finalizer expecting node"
        );
        assert!(FinalizerError::AlreadySet(0x10).to_string().contains("0x10"));
    }

    #[test]
    fn finalizer_debug_names_type() {
        let f = Finalizer::typed(TypeInfo::scalar("blob", 16), |_, _| {});
        assert_eq!(format!("{:?}", f), "Finalizer { arg: Some(\"blob\") }");
    }
}
