use crate::{
    span::SpanState, Address, Config, Finalizer, FinalizerError, FuncInfo, GcDebug, GcMode,
    GcPhase, Heap, MemStats, Module, Mutator, Segment, TypeInfo,
};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const ARENA: usize = 64 * 1024 * 1024;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(procs: usize) -> Config {
    Config {
        gc_percent: -1,
        procs,
        arena_size: ARENA,
        ..Config::default()
    }
}

/// `{next, value}`
fn node() -> TypeInfo {
    TypeInfo::new("node", 2, &[0])
}

fn main_fn(nlocals: usize) -> Arc<FuncInfo> {
    let locals = (0..nlocals).collect::<Vec<_>>();
    FuncInfo::simple("main", nlocals, 0, &locals, &[])
}

fn is_live(heap: &Heap, p: Address) -> bool {
    match heap.mheap.span_of(p) {
        Some(s) => {
            s.state() == SpanState::InUse && p < s.limit() && s.is_allocated(s.object_index(p))
        }
        None => false,
    }
}

fn wait_sweep_done(heap: &Heap) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.phase() != GcPhase::Off {
        assert!(Instant::now() < deadline, "background sweep did not finish");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Pushes `n` nodes onto the list rooted in local `root`. Returns the nodes, head first.
fn build_list(m: &mut Mutator, root: usize, n: usize) -> Vec<Address> {
    let ty = node();
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let p = m.alloc(&ty);
        let head = m.local(root);
        m.store_ptr(p, 0, head);
        m.store_scalar(p, 1, i);
        m.set_local(root, p);
        nodes.push(p);
    }
    nodes.reverse();
    nodes
}

fn list_len(m: &Mutator, mut p: Address) -> usize {
    let mut n = 0;
    while p != 0 {
        n += 1;
        p = m.load(p, 0);
    }
    n
}

#[test]
fn unreachable_objects_are_freed() {
    init_logger();
    let heap = Heap::new(config(2));
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let ty = node();
    let kept = m.alloc(&ty);
    m.set_local(0, kept);
    let dropped = m.alloc(&ty);

    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, kept));
    assert!(!is_live(&heap, dropped));

    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.num_gc, 1);
    assert_eq!(stats.num_forced_gc, 1);
    assert!(stats.frees >= 1);
    drop(m);
    heap.shutdown();
}

#[test]
fn linked_list_survives_until_cut() {
    init_logger();
    let heap = Heap::new(config(4));
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let nodes = build_list(&mut m, 0, 1000);

    m.gc(GcMode::ForceBlock);
    assert!(nodes.iter().all(|&p| is_live(&heap, p)));
    assert_eq!(list_len(&m, m.local(0)), 1000);
    for (i, &p) in nodes.iter().enumerate() {
        assert_eq!(m.load(p, 1), 999 - i);
    }

    m.store_ptr(nodes[499], 0, 0);
    m.gc(GcMode::ForceBlock);
    assert!(nodes[..500].iter().all(|&p| is_live(&heap, p)));
    assert!(nodes[500..].iter().all(|&p| !is_live(&heap, p)));
    assert_eq!(list_len(&m, m.local(0)), 500);
    drop(m);
    heap.shutdown();
}

#[test]
fn background_cycle_keeps_reachable_objects() {
    init_logger();
    let heap = Heap::new(config(2));
    let mut m = heap.attach();
    m.push_frame(&main_fn(2), &[]);
    let nodes = build_list(&mut m, 0, 5000);
    let garbage = build_list(&mut m, 1, 5000);
    m.set_local(1, 0);

    let h = heap.clone();
    m.blocking(move || {
        h.collect(GcMode::Background);
        wait_sweep_done(&h);
    });
    assert!(nodes.iter().all(|&p| is_live(&heap, p)));
    assert!(garbage.iter().all(|&p| !is_live(&heap, p)));
    assert_eq!(heap.num_gc(), 1);
    drop(m);
    heap.shutdown();
}

#[test]
fn write_barrier_shades_moved_pointer() {
    init_logger();
    let (go_tx, go_rx) = flume::unbounded::<()>();
    let (done_tx, done_rx) = flume::unbounded::<()>();
    let mut cfg = config(2);
    cfg.mark_hook = Some(Arc::new(move || {
        go_tx.send(()).unwrap();
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }));
    let heap = Heap::new(cfg);
    let module = heap.add_module(Module::new("main", Segment::new(2, &[0, 1]), Segment::empty()));

    let (ready_tx, ready_rx) = flume::unbounded();
    let (finish_tx, finish_rx) = flume::unbounded::<()>();
    let mutator = {
        let heap = heap.clone();
        let module = module.clone();
        std::thread::spawn(move || {
            let mut m = heap.attach();
            let ty = TypeInfo::pointers("pair", 2);
            let holder = m.alloc(&ty);
            m.store_global(&module.data, 0, holder);
            let target = m.alloc(&ty);
            m.store_ptr(holder, 0, target);
            let other = m.alloc(&ty);
            m.store_global(&module.data, 1, other);
            let old = m.alloc(&ty);
            m.store_ptr(holder, 1, old);
            ready_tx.send((holder, target, other, old)).unwrap();

            m.blocking(|| go_rx.recv().unwrap());
            // Hide `target` from the marker: only `other` references it from now on.
            m.store_ptr(other, 0, target);
            m.store_ptr(holder, 0, 0);
            m.store_ptr(holder, 1, 0);
            done_tx.send(()).unwrap();
            m.blocking(|| finish_rx.recv().unwrap());
        })
    };

    let (holder, target, other, old) = ready_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    heap.collect(GcMode::Background);
    wait_sweep_done(&heap);
    assert!(is_live(&heap, holder));
    assert!(is_live(&heap, other));
    assert!(is_live(&heap, target));
    assert_eq!(heap.mheap.arena.word(other).load(Ordering::Acquire), target);
    // `old` may have been marked before it was unlinked; the next cycle reclaims it
    heap.collect(GcMode::ForceBlock);
    assert!(!is_live(&heap, old));
    assert!(is_live(&heap, target));

    finish_tx.send(()).unwrap();
    mutator.join().unwrap();
    heap.shutdown();
}

#[test]
fn finalizer_runs_once() {
    init_logger();
    let heap = Heap::new(config(2));
    let mut m = heap.attach();
    let ty = node();
    let (tx, rx) = flume::unbounded();
    let obj = m.alloc(&ty);
    m.set_finalizer(
        obj,
        &ty,
        Some(Finalizer::new(move |_, p| {
            tx.send(p).unwrap();
        })),
    )
    .unwrap();

    m.gc(GcMode::ForceBlock);
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), obj);

    m.gc(GcMode::ForceBlock);
    m.gc(GcMode::ForceBlock);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert_eq!(heap.fin.nrun.load(Ordering::SeqCst), 1);
    assert!(!is_live(&heap, obj));
    drop(m);
    heap.shutdown();
}

#[test]
fn finalizer_keeps_referents_alive() {
    init_logger();
    let heap = Heap::new(config(1));
    let mut m = heap.attach();
    let ty = node();
    let (tx, rx) = flume::unbounded();
    let obj = m.alloc(&ty);
    let referent = m.alloc(&ty);
    m.store_ptr(obj, 0, referent);
    m.store_scalar(referent, 1, 42);
    m.set_finalizer(
        obj,
        &ty,
        Some(Finalizer::new(move |m, p| {
            let r = m.load(p, 0);
            tx.send(m.load(r, 1)).unwrap();
        })),
    )
    .unwrap();

    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, referent));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 42);
    drop(m);
    heap.shutdown();
}

#[test]
fn set_finalizer_rejects_bad_arguments() {
    init_logger();
    let heap = Heap::new(config(1));
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let ty = node();
    let obj = m.alloc(&ty);
    m.set_local(0, obj);

    let noop = || Finalizer::new(|_, _| {});
    assert!(matches!(
        m.set_finalizer(0x10, &ty, Some(noop())),
        Err(FinalizerError::NotHeapObject(0x10))
    ));
    assert!(matches!(
        m.set_finalizer(obj + 8, &ty, Some(noop())),
        Err(FinalizerError::NotObjectStart(_))
    ));
    let other = TypeInfo::scalar("blob", 16);
    assert!(matches!(
        m.set_finalizer(obj, &ty, Some(Finalizer::typed(other, |_, _| {}))),
        Err(FinalizerError::TypeMismatch { .. })
    ));
    m.set_finalizer(obj, &ty, Some(noop())).unwrap();
    assert!(matches!(
        m.set_finalizer(obj, &ty, Some(noop())),
        Err(FinalizerError::AlreadySet(_))
    ));
    m.set_finalizer(obj, &ty, None).unwrap();
    m.set_finalizer(obj, &ty, Some(noop())).unwrap();
    drop(m);
    heap.shutdown();
}

#[test]
fn deferred_args_are_roots() {
    init_logger();
    let heap = Heap::new(config(1));
    let mut m = heap.attach();
    let order = Arc::new(Mutex::new(Vec::new()));
    let ty = node();
    m.push_frame(&main_fn(0), &[]);

    let first = m.alloc(&ty);
    m.store_scalar(first, 1, 1);
    let o = order.clone();
    m.defer_call(first, move |m, p| o.lock().push(m.load(p, 1)));
    let second = m.alloc(&ty);
    m.store_scalar(second, 1, 2);
    let o = order.clone();
    m.defer_call(second, move |m, p| o.lock().push(m.load(p, 1)));

    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, first));
    assert!(is_live(&heap, second));

    m.pop_frame();
    assert_eq!(*order.lock(), vec![2, 1]);
    assert_eq!(m.depth(), 0);
    m.gc(GcMode::ForceBlock);
    assert!(!is_live(&heap, first));
    assert!(!is_live(&heap, second));
    drop(m);
    heap.shutdown();
}

#[test]
fn stack_maps_follow_pc() {
    init_logger();
    let heap = Heap::new(config(1));
    let mut m = heap.attach();
    // local 0 holds a pointer only from pc 1 on
    let f = Arc::new(
        FuncInfo::new("f", 1, 1, 2)
            .stackmap(0..1, &[], &[0])
            .stackmap(1..2, &[0], &[0]),
    );
    let ty = node();
    let arg = m.alloc(&ty);
    m.push_frame(&f, &[arg]);
    let local = m.alloc(&ty);
    m.set_local(0, local);

    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, arg));
    assert!(!is_live(&heap, local));

    let local = m.alloc(&ty);
    m.set_local(0, local);
    m.set_pc(1);
    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, local));
    assert_eq!(m.arg(0), arg);
    drop(m);
    heap.shutdown();
}

#[test]
fn globals_are_roots() {
    init_logger();
    let heap = Heap::new(config(1));
    let module = heap.add_module(Module::new(
        "globals",
        Segment::new(2, &[0]),
        Segment::new(1, &[0]),
    ));
    let mut m = heap.attach();
    let ty = node();
    let data = m.alloc(&ty);
    m.store_global(&module.data, 0, data);
    let bss = m.alloc(&ty);
    m.store_global(&module.bss, 0, bss);
    // not a pointer word, so not a root
    let scalar = m.alloc(&ty);
    m.store_global(&module.data, 1, scalar);

    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, data));
    assert!(is_live(&heap, bss));
    assert!(!is_live(&heap, scalar));
    assert_eq!(module.data.get(1), scalar);
    drop(m);
    heap.shutdown();
}

#[test]
fn typed_memmove_copies_pointers() {
    init_logger();
    let heap = Heap::new(config(1));
    let mut m = heap.attach();
    m.push_frame(&main_fn(2), &[]);
    let ty = node();
    let target = m.alloc(&ty);
    let src = m.alloc(&ty);
    m.set_local(0, src);
    m.store_ptr(src, 0, target);
    m.store_scalar(src, 1, 7);
    let dst = m.alloc(&ty);
    m.set_local(1, dst);

    m.typed_memmove(&ty, dst, src);
    m.store_ptr(src, 0, 0);
    m.gc(GcMode::ForceBlock);
    assert!(is_live(&heap, target));
    assert_eq!(m.load(dst, 0), target);
    assert_eq!(m.load(dst, 1), 7);
    drop(m);
    heap.shutdown();
}

#[test]
fn large_objects_are_freed_to_the_page_heap() {
    init_logger();
    let heap = Heap::new(config(2));
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let bytes = TypeInfo::scalar("bytes", 1);
    let kept = m.alloc_array(&bytes, 100_000);
    m.set_local(0, kept);
    let dropped = m.alloc_array(&bytes, 300_000);

    let mut before = MemStats::default();
    heap.read_mem_stats(&mut before);
    m.gc(GcMode::ForceBlock);
    let mut after = MemStats::default();
    heap.read_mem_stats(&mut after);
    assert!(is_live(&heap, kept));
    assert!(!is_live(&heap, dropped));
    assert!(after.heap_inuse + 300_000 <= before.heap_inuse);
    drop(m);
    heap.shutdown();
}

#[test]
fn allocation_beyond_arena_collects() {
    init_logger();
    let heap = Heap::new(Config {
        gc_percent: 100,
        heap_minimum: 1024 * 1024,
        arena_size: 16 * 1024 * 1024,
        ..config(2)
    });
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let kept = build_list(&mut m, 0, 100);
    let ty = TypeInfo::pointers("garbage", 32);
    // 64 MiB of garbage through a 16 MiB arena
    for _ in 0..(64 * 1024 * 1024 / 256) {
        let p = m.alloc(&ty);
        m.store_ptr(p, 0, m.local(0));
    }
    let h = heap.clone();
    m.blocking(move || {
        // let a running background cycle finish
        drop(h.worldsema.lock());
    });
    assert!(heap.num_gc() >= 1);
    assert!(kept.iter().all(|&p| is_live(&heap, p)));
    assert_eq!(list_len(&m, m.local(0)), 100);
    drop(m);
    heap.shutdown();
}

#[test]
fn concurrent_mutators_keep_their_lists() {
    init_logger();
    let heap = Heap::new(Config {
        gc_percent: 50,
        heap_minimum: 512 * 1024,
        ..config(4)
    });
    let threads = (0..4)
        .map(|t| {
            let heap = heap.clone();
            std::thread::spawn(move || {
                let mut m = heap.attach();
                m.push_frame(&main_fn(2), &[]);
                for round in 0..5 {
                    let nodes = build_list(&mut m, 0, 2000);
                    // garbage in between
                    build_list(&mut m, 1, 2000);
                    m.set_local(1, 0);
                    m.safepoint();
                    let mut p = m.local(0);
                    let mut i = 0;
                    while p != 0 {
                        assert_eq!(p, nodes[i], "thread {} round {}", t, round);
                        assert_eq!(m.load(p, 1), 1999 - i);
                        p = m.load(p, 0);
                        i += 1;
                    }
                    assert_eq!(i, 2000);
                    m.set_local(0, 0);
                }
            })
        })
        .collect::<Vec<_>>();
    for t in threads {
        t.join().unwrap();
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while heap.num_gc() == 0 {
        assert!(Instant::now() < deadline, "no cycle was triggered");
        std::thread::sleep(Duration::from_millis(1));
    }
    heap.shutdown();
}

#[test]
fn checkmark_verifies_concurrent_mark() {
    init_logger();
    let heap = Heap::new(Config {
        debug: GcDebug {
            gccheckmark: 1,
            ..GcDebug::default()
        },
        ..config(2)
    });
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let nodes = build_list(&mut m, 0, 3000);
    let h = heap.clone();
    m.blocking(move || {
        h.collect(GcMode::Background);
        h.collect(GcMode::Force);
        h.collect(GcMode::ForceBlock);
    });
    assert!(nodes.iter().all(|&p| is_live(&heap, p)));
    assert!(!heap.use_checkmark.load(Ordering::SeqCst));
    drop(m);
    heap.shutdown();
}

#[test]
fn gcstoptheworld_forces_cycles() {
    init_logger();
    let heap = Heap::new(Config {
        debug: GcDebug {
            gcstoptheworld: 2,
            ..GcDebug::default()
        },
        ..config(1)
    });
    heap.collect(GcMode::Background);
    assert_eq!(heap.phase(), GcPhase::Off);
    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.num_forced_gc, 1);
    assert!(stats.to_string().contains("1 forced"));
    heap.shutdown();
}

#[test]
fn gc_percent_controls_triggering() {
    init_logger();
    let heap = Heap::new(Config {
        gc_percent: 100,
        heap_minimum: 4 * 1024 * 1024,
        ..config(1)
    });
    assert_eq!(heap.set_gc_percent(-5), 100);
    assert_eq!(heap.gc_percent(), -1);
    assert!(!heap.should_trigger());

    let mut m = heap.attach();
    let ty = TypeInfo::scalar("blob", 1024);
    for _ in 0..8 * 1024 {
        m.alloc(&ty);
    }
    assert_eq!(heap.num_gc(), 0);

    assert_eq!(heap.set_gc_percent(200), -1);
    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.next_gc, 8 * 1024 * 1024);
    assert_eq!(stats.gc_percent, 200);
    drop(m);
    heap.shutdown();
}

#[test]
fn next_gc_follows_marked_heap() {
    init_logger();
    let heap = Heap::new(Config {
        gc_percent: 100,
        heap_minimum: 64 * 1024,
        ..config(1)
    });
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    build_list(&mut m, 0, 20_000);
    m.gc(GcMode::ForceBlock);

    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.heap_live, stats.heap_marked);
    assert_eq!(stats.heap_marked, 20_000 * 16);
    assert!(stats.next_gc >= stats.heap_marked);
    assert!(stats.next_gc <= 2 * stats.heap_marked + 64 * 1024);
    assert!(stats.pause_total_ns > 0);
    drop(m);
    heap.shutdown();
}

#[test]
fn marked_bytes_count_reachable_slots() {
    init_logger();
    let heap = Heap::new(config(2));
    let mut m = heap.attach();
    m.push_frame(&main_fn(2), &[]);
    let triple = TypeInfo::pointers("triple", 3);
    let kept = build_list(&mut m, 0, 3000);
    build_list(&mut m, 1, 2000);
    // drops the 2000 node list
    let big = m.alloc_array(&triple, 4096);
    m.set_local(1, big);
    let small = m.alloc(&triple);
    m.store_ptr(big, 0, small);

    m.gc(GcMode::ForceBlock);
    let node_size = heap.mheap.span_of(kept[0]).unwrap().elemsize as u64;
    let big_size = heap.mheap.span_of(big).unwrap().elemsize as u64;
    let triple_size = heap.mheap.span_of(small).unwrap().elemsize as u64;
    assert!(triple_size > 24);

    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.heap_marked, 3000 * node_size + big_size + triple_size);
    assert_eq!(stats.heap_objects, 3002);
    drop(m);
    heap.shutdown();
}

#[test]
fn concurrent_sweepers_sweep_each_span_once() {
    init_logger();
    let heap = Heap::new(config(1));
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let ty = node();
    let kept = build_list(&mut m, 0, 1000);
    for _ in 0..30_000 {
        m.alloc(&ty);
    }
    // Sweeping is left to the background sweeper and the threads below.
    m.gc(GcMode::Force);

    let spans = heap.mheap.gc_spans().clone();
    let mut pool = scoped_threadpool::Pool::new(4);
    pool.scoped(|scope| {
        for tid in 0..4 {
            let heap = &heap;
            let spans = &spans;
            scope.execute(move || {
                for (i, &s) in spans.iter().enumerate() {
                    if (i + tid) % 2 == 0 {
                        heap.ensure_swept(s);
                    } else {
                        heap.sweepone();
                    }
                }
                while heap.sweepone().is_some() {}
            });
        }
    });

    let sg = heap.mheap.sweepgen();
    assert!(spans
        .iter()
        .all(|s| s.state() != SpanState::InUse || s.sweepgen() == sg));
    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.mallocs, 31_000);
    assert_eq!(stats.frees, 30_000);
    assert!(kept.iter().all(|&p| is_live(&heap, p)));
    assert_eq!(list_len(&m, m.local(0)), 1000);
    wait_sweep_done(&heap);
    drop(m);
    heap.shutdown();
}

#[test]
fn back_to_back_cycles_with_pending_background_sweep() {
    init_logger();
    let heap = Heap::new(config(2));
    let mut m = heap.attach();
    m.push_frame(&main_fn(1), &[]);
    let ty = node();
    let kept = build_list(&mut m, 0, 500);
    let mut garbage = 0;
    for _ in 0..20 {
        for _ in 0..5000 {
            m.alloc(&ty);
        }
        garbage += 5000;
        // returns with the background sweeper still running; the next cycle starts right away
        m.gc(GcMode::Force);
    }
    m.gc(GcMode::ForceBlock);

    let mut stats = MemStats::default();
    heap.read_mem_stats(&mut stats);
    assert_eq!(stats.frees, garbage);
    assert_eq!(stats.heap_objects, 500);
    assert_eq!(stats.num_gc, 21);
    assert!(kept.iter().all(|&p| is_live(&heap, p)));
    assert_eq!(list_len(&m, m.local(0)), 500);
    drop(m);
    heap.shutdown();
}
