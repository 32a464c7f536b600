use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tricolor::{Address, Config, FuncInfo, Heap, Mutator, TypeInfo};

pub fn bench_gcs(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);
    let n = 12;

    for i in n..17 {
        let min_depth = 4;
        let mut max_depth = min_depth + 2;
        if max_depth < i {
            max_depth = i;
        }
        for &procs in &[1usize, 4] {
            group.bench_function(BenchmarkId::new(format!("tricolor/{}P", procs), i), |b| {
                b.iter_batched_ref(
                    || {
                        Heap::new(Config {
                            procs,
                            ..Config::default()
                        })
                    },
                    |heap| {
                        let mut m = heap.attach();
                        let tree = Tree::new();
                        let mut depth = min_depth;
                        while depth < max_depth {
                            let iterations = 1 << (max_depth - depth + min_depth);
                            for _ in 0..iterations {
                                let t = tree.bottom_up(&mut m, depth);
                                tree.item_check(&m, t);
                            }
                            depth += 2;
                        }
                        drop(m);
                        heap.shutdown();
                    },
                    criterion::BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_gcs);
criterion_main!(benches);

struct Tree {
    node: TypeInfo,
    frame: Arc<FuncInfo>,
}

impl Tree {
    fn new() -> Self {
        Self {
            // left, right
            node: TypeInfo::pointers("tree", 2),
            frame: FuncInfo::simple("bottom_up", 1, 0, &[0], &[]),
        }
    }

    fn bottom_up(&self, m: &mut Mutator, depth: usize) -> Address {
        m.push_frame(&self.frame, &[]);
        let node = m.alloc(&self.node);
        m.set_local(0, node);
        if depth > 0 {
            let left = self.bottom_up(m, depth - 1);
            m.store_ptr(m.local(0), 0, left);
            let right = self.bottom_up(m, depth - 1);
            m.store_ptr(m.local(0), 1, right);
        }
        let node = m.local(0);
        m.pop_frame();
        node
    }

    fn item_check(&self, m: &Mutator, node: Address) -> usize {
        let left = m.load(node, 0);
        if left == 0 {
            return 1;
        }
        1 + self.item_check(m, left) + self.item_check(m, m.load(node, 1))
    }
}
