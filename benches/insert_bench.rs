//! Sequential and random insert/get/delete throughput, no COW involved.
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::SliceRandom;
use rand::{thread_rng, Rng};

use cow_btree::Tree;

const TREE_SIZES: [u64; 4] = [1 << 8, 1 << 12, 1 << 16, 1 << 18];

fn new_tree() -> Tree<u64, u64> {
    Tree::new(|e: &u64| *e)
}

pub fn seq_insert(c: &mut Criterion) {
    c.bench_function("seq_insert", |b| {
        let mut tree = new_tree();
        let mut key = 0u64;
        b.iter(|| {
            tree.insert(key).unwrap();
            key += 1;
        })
    });
}

pub fn rand_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("rand_insert");
    group.throughput(Throughput::Elements(1));
    let mut keys: Vec<u64> = (0..1 << 16).collect();
    keys.shuffle(&mut thread_rng());

    group.bench_function("shuffled_keys", |b| {
        let mut tree = new_tree();
        let mut idx = 0usize;
        b.iter(|| {
            tree.insert(keys[idx % keys.len()]).unwrap();
            idx += 1;
        })
    });
    group.finish();
}

pub fn rand_get(c: &mut Criterion) {
    for size in TREE_SIZES {
        c.bench_with_input(BenchmarkId::new("rand_get", size), &size, |b, size| {
            let mut tree = new_tree();
            for i in 0..*size {
                tree.insert(i).unwrap();
            }
            let mut rng = thread_rng();
            b.iter(|| {
                let key = rng.gen_range(0..*size);
                std::hint::black_box(tree.get(&key).unwrap());
            })
        });
    }
}

pub fn seq_get(c: &mut Criterion) {
    for size in TREE_SIZES {
        c.bench_with_input(BenchmarkId::new("seq_get", size), &size, |b, size| {
            let mut tree = new_tree();
            for i in 0..*size {
                tree.insert(i).unwrap();
            }
            b.iter_custom(|iters| {
                let mut k = 0;
                let start = Instant::now();
                for _ in 0..iters {
                    if k == *size {
                        k = 0;
                    }
                    tree.get(&k).unwrap();
                    k += 1;
                }
                start.elapsed()
            })
        });
    }
}

pub fn seq_delete(c: &mut Criterion) {
    for size in TREE_SIZES {
        c.bench_with_input(BenchmarkId::new("seq_delete", size), &size, |b, size| {
            b.iter_custom(|iters| {
                let mut total = std::time::Duration::new(0, 0);
                for _ in 0..iters {
                    let mut tree = new_tree();
                    for i in 0..*size {
                        tree.insert(i).unwrap();
                    }
                    let start = Instant::now();
                    for i in 0..*size {
                        let mut p = tree.find(&i).unwrap();
                        tree.delete_at(&mut p).unwrap();
                    }
                    total += start.elapsed();
                }
                total
            })
        });
    }
}

criterion_group!(insert_benches, seq_insert, rand_insert, rand_get, seq_get, seq_delete);
criterion_main!(insert_benches);
