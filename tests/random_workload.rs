//! Scenario F: a random workload against a derived tree, checked against a
//! shadow `BTreeMap` at checkpoints and at termination. The base tree's own
//! in-order sequence must also stay untouched by the derived tree's churn.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cow_btree::Tree;

fn new_tree() -> Tree<i64, (i64, u64)> {
    Tree::new(|e: &(i64, u64)| e.0)
}

fn in_order(tree: &Tree<i64, (i64, u64)>) -> Vec<(i64, u64)> {
    let mut out = Vec::new();
    let mut p = tree.first();
    while p.on {
        out.push(tree.at(&p).unwrap().unwrap());
        tree.move_next(&mut p).unwrap();
    }
    out
}

#[test]
fn random_workload_matches_shadow_map_and_preserves_base() {
    let mut rng = StdRng::seed_from_u64(0xF00D_F00D);

    let mut base = new_tree();
    let mut shadow: BTreeMap<i64, u64> = BTreeMap::new();
    for _ in 0..50 {
        let k = rng.gen_range(0..1000);
        if shadow.contains_key(&k) {
            continue;
        }
        let v = rng.gen::<u64>();
        base.insert((k, v)).unwrap();
        shadow.insert(k, v);
    }
    let base_snapshot: Vec<(i64, u64)> = shadow.iter().map(|(&k, &v)| (k, v)).collect();

    let base = Rc::new(RefCell::new(base));
    let mut derived = Tree::derive(&base);
    let mut tag_counter = 0u64;

    const OPS: usize = 2000;
    for op_index in 0..OPS {
        let key = rng.gen_range(0..1000i64);
        match rng.gen_range(0..3) {
            0 => {
                // insert
                if !shadow.contains_key(&key) {
                    tag_counter += 1;
                    derived.insert((key, tag_counter)).unwrap();
                    shadow.insert(key, tag_counter);
                }
            }
            1 => {
                // delete
                if shadow.contains_key(&key) {
                    let mut p = derived.find(&key).unwrap();
                    assert!(derived.delete_at(&mut p).unwrap());
                    shadow.remove(&key);
                }
            }
            _ => {
                // update (upsert semantics: overwrite or insert)
                tag_counter += 1;
                derived.upsert((key, tag_counter)).unwrap();
                shadow.insert(key, tag_counter);
            }
        }

        if (op_index + 1) % (OPS / 10) == 0 {
            let expected: Vec<(i64, u64)> = shadow.iter().map(|(&k, &v)| (k, v)).collect();
            assert_eq!(in_order(&derived), expected, "checkpoint at op {}", op_index + 1);
            assert_eq!(in_order(&base.borrow()), base_snapshot, "base drifted at op {}", op_index + 1);
        }
    }

    let expected: Vec<(i64, u64)> = shadow.iter().map(|(&k, &v)| (k, v)).collect();
    assert_eq!(in_order(&derived), expected);
    assert_eq!(in_order(&base.borrow()), base_snapshot);
}
