//! Node model for the copy-on-write B+-tree.
//!
//! Two node variants exist: [`LeafNode`] holds entries directly, [`BranchNode`]
//! holds partition keys and child links. Every node carries an `owner` tag
//! identifying the tree generation that is allowed to mutate it in place; any
//! other tree must clone before writing. See [`crate::cow`] for the engine
//! that acts on this tag.
//!
//! Nodes are `Rc<RefCell<_>>`: sharing is a pointer bump, and a node this
//! tree owns can be mutated through the `RefCell` without a fresh
//! allocation. This is a single-threaded alternative to an `Arc`-plus-
//! refcount exclusivity test - correct here because `Tree` is never shared
//! across threads (see the crate-level concurrency notes).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Node fan-out. Branches hold between `HALF_CAPACITY` and `CAPACITY` children
/// except transiently during rebalance and except at the root.
pub const CAPACITY: usize = 64;
/// Minimum fill for a non-root node: `CAPACITY / 2`.
pub const HALF_CAPACITY: usize = CAPACITY / 2;

/// Identifies the tree generation that owns a node. Minted fresh whenever a
/// tree is derived or re-based, so "is this node mine" stays an O(1) tag
/// comparison rather than a reference-count check.
pub type TreeId = u64;

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a fresh, process-unique tree generation id.
pub(crate) fn next_tree_id() -> TreeId {
    NEXT_TREE_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// A leaf node: an ordered sequence of entries, sorted strictly ascending by
/// key under the tree's comparator. Length may be zero only when this leaf is
/// the tree's root.
pub(crate) struct LeafNode<E> {
    pub(crate) owner: TreeId,
    pub(crate) entries: Vec<E>,
}

impl<E> LeafNode<E> {
    pub(crate) fn new(owner: TreeId) -> Self {
        Self {
            owner,
            entries: Vec::new(),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() > CAPACITY
    }
}

impl<E: Clone> LeafNode<E> {
    pub(crate) fn clone_with_owner(&self, owner: TreeId) -> Self {
        Self {
            owner,
            entries: self.entries.clone(),
        }
    }
}

/// A branch node: `keys.len() + 1 == children.len()`. Every key reachable
/// through `children[i]` is less than `keys[i]`; every key reachable through
/// `children[i + 1]` is greater than or equal to `keys[i]`.
pub(crate) struct BranchNode<K, E> {
    pub(crate) owner: TreeId,
    pub(crate) keys: Vec<K>,
    pub(crate) children: Vec<NodeRef<K, E>>,
}

impl<K: Clone, E> BranchNode<K, E> {
    pub(crate) fn clone_with_owner(&self, owner: TreeId) -> Self {
        Self {
            owner,
            keys: self.keys.clone(),
            children: self.children.clone(),
        }
    }
}

pub(crate) type LeafRef<E> = Rc<RefCell<LeafNode<E>>>;
pub(crate) type BranchRef<K, E> = Rc<RefCell<BranchNode<K, E>>>;

/// A reference to either node variant. Cloning a `NodeRef` is an `Rc` bump,
/// never a deep copy - deep copies only happen through [`crate::cow`].
pub(crate) enum NodeRef<K, E> {
    Leaf(LeafRef<E>),
    Branch(BranchRef<K, E>),
}

impl<K, E> Clone for NodeRef<K, E> {
    fn clone(&self) -> Self {
        match self {
            NodeRef::Leaf(l) => NodeRef::Leaf(Rc::clone(l)),
            NodeRef::Branch(b) => NodeRef::Branch(Rc::clone(b)),
        }
    }
}

impl<K, E> NodeRef<K, E> {
    pub(crate) fn owner(&self) -> TreeId {
        match self {
            NodeRef::Leaf(l) => l.borrow().owner,
            NodeRef::Branch(b) => b.borrow().owner,
        }
    }

    pub(crate) fn as_leaf(&self) -> Option<&LeafRef<E>> {
        match self {
            NodeRef::Leaf(l) => Some(l),
            NodeRef::Branch(_) => None,
        }
    }

    pub(crate) fn as_branch(&self) -> Option<&BranchRef<K, E>> {
        match self {
            NodeRef::Branch(b) => Some(b),
            NodeRef::Leaf(_) => None,
        }
    }

    /// Pointer identity, used when remapping an outstanding path through an
    /// old-node -> new-node map built during a COW clone walk.
    pub(crate) fn ptr_eq(&self, other: &NodeRef<K, E>) -> bool {
        match (self, other) {
            (NodeRef::Leaf(a), NodeRef::Leaf(b)) => Rc::ptr_eq(a, b),
            (NodeRef::Branch(a), NodeRef::Branch(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}
