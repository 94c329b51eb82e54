//! Copy-on-write overhead: deriving a tree and mutating it should cost
//! proportional to the touched path, not to the base's full size.
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use cow_btree::Tree;

const BASE_SIZES: [u64; 3] = [1 << 10, 1 << 14, 1 << 18];

fn new_tree() -> Tree<u64, u64> {
    Tree::new(|e: &u64| *e)
}

/// `derive` itself should be O(1): it only snapshots a root pointer and
/// bumps two ids, regardless of how large the base tree already is.
pub fn derive_cost(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_cost");
    group.throughput(Throughput::Elements(1));
    for size in BASE_SIZES {
        group.bench_with_input(BenchmarkId::new("derive", size), &size, |b, &size| {
            let mut base = new_tree();
            for i in 0..size {
                base.insert(i).unwrap();
            }
            let base = Rc::new(RefCell::new(base));
            b.iter(|| {
                std::hint::black_box(Tree::derive(&base));
            })
        });
    }
    group.finish();
}

/// A handful of mutations against a freshly derived tree should only clone
/// the nodes on the touched root-to-leaf paths, not the whole base.
pub fn mutations_per_derive(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutations_per_derive");
    let base_size = 1 << 14;
    let mutation_counts = [1, 10, 50, 200];

    for mutation_count in mutation_counts {
        group.bench_with_input(
            BenchmarkId::new("insert_after_derive", mutation_count),
            &mutation_count,
            |b, &mutation_count| {
                let mut base = new_tree();
                for i in 0..base_size {
                    base.insert(i).unwrap();
                }
                let base = Rc::new(RefCell::new(base));

                b.iter_custom(|iters| {
                    let start = Instant::now();
                    for _ in 0..iters {
                        let mut derived = Tree::derive(&base);
                        for j in 0..mutation_count {
                            derived.insert(base_size + j).unwrap();
                        }
                        std::hint::black_box(derived);
                    }
                    start.elapsed()
                })
            },
        );
    }
    group.finish();
}

/// Many independent derivations from the same base, each lightly mutated,
/// exercise the structural-sharing path rather than per-snapshot copying.
pub fn fanout_derive_and_mutate(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_derive_and_mutate");
    let base_size = 1 << 12;
    let fanouts = [5usize, 20, 50];
    let mutations_per_branch: u64 = 5;

    for fanout in fanouts {
        group.bench_with_input(BenchmarkId::new("fanout", fanout), &fanout, |b, &fanout| {
            let mut base = new_tree();
            for i in 0..base_size {
                base.insert(i).unwrap();
            }
            let base = Rc::new(RefCell::new(base));

            b.iter_custom(|iters| {
                let start = Instant::now();
                for _ in 0..iters {
                    let mut branches = Vec::with_capacity(fanout);
                    for n in 0..fanout {
                        let mut derived = Tree::derive(&base);
                        for m in 0..mutations_per_branch {
                            derived
                                .insert(base_size + (n as u64) * mutations_per_branch + m)
                                .unwrap();
                        }
                        branches.push(derived);
                    }
                    std::hint::black_box(branches);
                }
                start.elapsed()
            })
        });
    }
    group.finish();
}

criterion_group!(
    cow_benches,
    derive_cost,
    mutations_per_derive,
    fanout_derive_and_mutate
);
criterion_main!(cow_benches);
