//! Path (cursor): a root-to-leaf navigational value.
//!
//! A path is the universal currency between the public API and the mutation
//! engine: every lookup produces one, every mutation consumes and/or produces
//! one. A path may point at an actual entry (`on = true`) or at a crack
//! between two entries (`on = false`). It is stamped with the tree's version
//! at the moment it was issued; [`crate::tree::Tree`] rejects any path whose
//! stamp doesn't match its current version.

use std::rc::Rc;

use crate::node::{BranchRef, LeafRef, NodeRef};

/// One step down from a branch: which branch, and which child index the path
/// descended through.
pub(crate) struct BranchStep<K, E> {
    pub(crate) branch: BranchRef<K, E>,
    pub(crate) child_index: usize,
}

impl<K, E> Clone for BranchStep<K, E> {
    fn clone(&self) -> Self {
        Self {
            branch: Rc::clone(&self.branch),
            child_index: self.child_index,
        }
    }
}

/// A root-to-leaf cursor. See the module docs for the `on` / version
/// contract.
pub struct Path<K, E> {
    pub(crate) branches: Vec<BranchStep<K, E>>,
    pub(crate) leaf: Option<LeafRef<E>>,
    pub(crate) leaf_index: usize,
    /// `true` iff this path currently points at an actual entry; `false` iff
    /// it lies in a crack (before the first entry, after the last, between
    /// two entries, or the tree is empty).
    pub on: bool,
    pub(crate) version: u64,
}

impl<K, E> Clone for Path<K, E> {
    /// Deep-copies the branch-segment list, shares node references (an `Rc`
    /// bump, not a structural clone), producing an independent cursor at the
    /// same position and version.
    fn clone(&self) -> Self {
        Self {
            branches: self.branches.clone(),
            leaf: self.leaf.clone(),
            leaf_index: self.leaf_index,
            on: self.on,
            version: self.version,
        }
    }
}

impl<K, E> Path<K, E> {
    pub(crate) fn empty(version: u64) -> Self {
        Self {
            branches: Vec::new(),
            leaf: None,
            leaf_index: 0,
            on: false,
            version,
        }
    }

    /// Two paths are equal iff they reference the same leaf, the same index
    /// within it, the same `on` flag, and the same version. Paths from
    /// different tree versions at what looks like "the same position" are
    /// therefore unequal by design - the version stamp is part of identity,
    /// not just a validity check.
    pub fn is_equal(&self, other: &Path<K, E>) -> bool {
        if self.version != other.version
            || self.on != other.on
            || self.leaf_index != other.leaf_index
        {
            return false;
        }
        match (&self.leaf, &other.leaf) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Rewrite every branch and the leaf through `map: old -> new`, leaving
    /// entries with no mapping unchanged. Used after a COW clone walk to keep
    /// an outstanding path pointing at the freshly-cloned chain.
    pub(crate) fn remap(&mut self, map: &[(NodeRef<K, E>, NodeRef<K, E>)]) {
        for step in &mut self.branches {
            let as_ref = NodeRef::Branch(Rc::clone(&step.branch));
            if let Some((_, new)) = map.iter().find(|(old, _)| old.ptr_eq(&as_ref)) {
                if let Some(b) = new.as_branch() {
                    step.branch = Rc::clone(b);
                }
            }
        }
        if let Some(leaf) = &self.leaf {
            let as_ref = NodeRef::Leaf(Rc::clone(leaf));
            if let Some((_, new)) = map.iter().find(|(old, _)| old.ptr_eq(&as_ref)) {
                if let Some(l) = new.as_leaf() {
                    self.leaf = Some(Rc::clone(l));
                }
            }
        }
    }
}
