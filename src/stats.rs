//! Introspection: node/leaf counts and height, for diagnosing fill ratios
//! and verifying rebalancing invariants against a live tree.

use crate::node::NodeRef;
use crate::tree::Tree;

/// A structural snapshot of a tree at the moment `stats()` was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeStats {
    pub num_leaves: usize,
    pub num_branches: usize,
    pub num_entries: usize,
    /// Number of branch levels above the leaves; 0 for a tree whose root is
    /// a leaf (including an empty tree).
    pub height: usize,
}

fn walk<K, E>(node: &NodeRef<K, E>, stats: &mut TreeStats, depth: usize) {
    match node {
        NodeRef::Leaf(l) => {
            stats.num_leaves += 1;
            stats.num_entries += l.borrow().entries.len();
            stats.height = stats.height.max(depth);
        }
        NodeRef::Branch(b) => {
            stats.num_branches += 1;
            for child in &b.borrow().children {
                walk(child, stats, depth + 1);
            }
        }
    }
}

impl<K: Clone, E: Clone> Tree<K, E> {
    /// Walk the tree once, counting leaves, branches, entries, and height.
    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        if let Some(root) = self.effective_root() {
            walk(&root, &mut stats, 0);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::CAPACITY;

    #[derive(Clone, Debug, PartialEq)]
    struct Rec(i64);

    #[test]
    fn empty_tree_has_no_nodes_and_zero_height() {
        let t: Tree<i64, Rec> = Tree::new(|e| e.0);
        let s = t.stats();
        assert_eq!(s.num_entries, 0);
        assert_eq!(s.num_leaves, 0);
        assert_eq!(s.num_branches, 0);
        assert_eq!(s.height, 0);
    }

    #[test]
    fn large_tree_reports_consistent_entry_count() {
        let mut t: Tree<i64, Rec> = Tree::new(|e| e.0);
        let n = 2 * CAPACITY + 1;
        for k in 0..n as i64 {
            t.insert(Rec(k)).unwrap();
        }
        let s = t.stats();
        assert_eq!(s.num_entries, n);
        assert!(s.num_branches >= 1);
        assert!(s.num_leaves >= 2);
        assert!(s.height >= 1);
    }
}
