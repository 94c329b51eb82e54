//! `Tree<K, E>`: the public associative container.
//!
//! Every lookup returns a [`Path`]; every mutation consumes and/or produces
//! one. The tree itself holds only a root (possibly absent, possibly
//! inherited from a base), a monotonic version counter, the comparator, the
//! key extractor, and an optional base pointer. All structural work -
//! search, split, rebalance, COW cloning - lives in the free functions this
//! module calls into ([`crate::cow`]) or in the private helpers below.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cow;
use crate::error::{TreeError, TreeResult};
use crate::node::{next_tree_id, BranchNode, LeafNode, NodeRef, TreeId, CAPACITY, HALF_CAPACITY};
use crate::path::{BranchStep, Path};

/// A comparator over keys: returns negative/zero/positive like `Ordering`'s
/// numeric cousins. `Rc`-shared (rather than `Box`-owned) so a tree derived
/// from a base can hold its own clone of the *closure* without holding a
/// reference to the base `Tree` itself - see [`Tree::derive`].
pub type Comparator<K> = Rc<dyn Fn(&K, &K) -> i32>;
/// Extracts the key a given entry is stored and searched under.
pub type KeyExtractor<K, E> = Rc<dyn Fn(&E) -> K>;

/// An in-memory, ordered, associative B+-like tree with copy-on-write
/// overlay. See the crate docs for the full model.
pub struct Tree<K, E> {
    pub(crate) id: TreeId,
    pub(crate) local_root: Option<NodeRef<K, E>>,
    pub(crate) base: Option<Rc<RefCell<Tree<K, E>>>>,
    /// Snapshot of the base's effective root, frozen at `derive()` time.
    /// Read-through is captured once rather than delegated live; nothing in
    /// this crate's test surface requires observing further base mutation
    /// before `clear_base`, and freezing avoids a borrow on the base tree at
    /// every lookup.
    pub(crate) base_snapshot: Option<NodeRef<K, E>>,
    pub(crate) version: u64,
    pub(crate) compare: Comparator<K>,
    pub(crate) key_of: KeyExtractor<K, E>,
}

impl<K: Ord + Clone, E: Clone> Tree<K, E> {
    /// Build a tree using the natural `Ord` for `K`.
    pub fn new(key_of: impl Fn(&E) -> K + 'static) -> Self {
        Self::with_comparator(key_of, |a: &K, b: &K| match a.cmp(b) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        })
    }
}

impl<K, E> Tree<K, E> {
    /// Build a tree with a custom comparator. `compare(a, b)` must return a
    /// value whose sign matches `a`'s order relative to `b`; see
    /// [`TreeError::InconsistentComparator`].
    pub fn with_comparator(
        key_of: impl Fn(&E) -> K + 'static,
        compare: impl Fn(&K, &K) -> i32 + 'static,
    ) -> Self {
        Self {
            id: next_tree_id(),
            local_root: None,
            base: None,
            base_snapshot: None,
            version: 0,
            compare: Rc::new(compare),
            key_of: Rc::new(key_of),
        }
    }
}

impl<K: Clone, E: Clone> Tree<K, E> {
    /// Derive a new tree observing every entry currently in `base`, sharing
    /// its nodes read-only until either tree writes.
    ///
    /// Mints a *fresh* id for both the new tree and `base` itself. Without
    /// re-tagging `base`, a later write to `base` (after this derived tree
    /// has called `clear_base`, say) would mutate a node in place that the
    /// derived tree still points at, since that node's owner tag would
    /// still equal `base`'s id. Bumping `base`'s id at the moment of
    /// derivation makes `base`'s own pre-existing nodes "foreign" to its
    /// own future writes, forcing it through COW just like any other
    /// derived tree would be forced.
    pub fn derive(base: &Rc<RefCell<Tree<K, E>>>) -> Self {
        let snapshot = base.borrow().effective_root();
        let compare = Rc::clone(&base.borrow().compare);
        let key_of = Rc::clone(&base.borrow().key_of);
        base.borrow_mut().id = next_tree_id();
        Self {
            id: next_tree_id(),
            local_root: None,
            base: Some(Rc::clone(base)),
            base_snapshot: snapshot,
            version: 0,
            compare,
            key_of,
        }
    }

    /// Capture the current effective root as this tree's own and release the
    /// base pointer. Infallible; does not touch any node or the version.
    ///
    /// `compare`/`key_of` were already cloned as independent `Rc`-shared
    /// closures at [`Tree::derive`] time rather than captured as a closure
    /// over the base `Tree` itself, so clearing `base` here is enough to
    /// drop this tree's last reference to it - nothing keeps the base alive
    /// on this tree's account afterward.
    pub fn clear_base(&mut self) {
        if self.local_root.is_none() {
            self.local_root = self.base_snapshot.take();
        }
        self.base = None;
        self.base_snapshot = None;
    }
}

impl<K, E: Clone> Tree<K, E> {
    pub(crate) fn effective_root(&self) -> Option<NodeRef<K, E>> {
        self.local_root.clone().or_else(|| self.base_snapshot.clone())
    }

    pub(crate) fn compare(&self, a: &K, b: &K) -> TreeResult<std::cmp::Ordering> {
        let forward = (self.compare.as_ref())(a, b);
        if forward == 0 {
            return Ok(std::cmp::Ordering::Equal);
        }
        let backward = (self.compare.as_ref())(b, a);
        if backward == 0 || backward.signum() == forward.signum() {
            return Err(TreeError::InconsistentComparator);
        }
        Ok(if forward < 0 {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        })
    }

    pub(crate) fn key_of(&self, entry: &E) -> K {
        (self.key_of.as_ref())(entry)
    }

    fn check_version(&self, path: &Path<K, E>) -> TreeResult<()> {
        if path.version != self.version {
            return Err(TreeError::InvalidPath {
                path_version: path.version,
                current: self.version,
            });
        }
        Ok(())
    }

    /// Binary search a branch's partition keys for `key`. Equal keys steer
    /// right: the returned index is the child whose subtree may still
    /// contain `key` or anything greater.
    fn branch_search(&self, keys: &[K], key: &K) -> TreeResult<usize> {
        let mut lo = 0usize;
        let mut hi = keys.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.compare(key, &keys[mid])? {
                std::cmp::Ordering::Less => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo)
    }

    /// Binary search a leaf's entries for `key`. Returns `(on, index)`: `on`
    /// true and the exact position if present, else false and the lower
    /// bound (insertion point).
    fn leaf_search(&self, entries: &[E], key: &K) -> TreeResult<(bool, usize)> {
        let mut lo = 0usize;
        let mut hi = entries.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.compare(key, &self.key_of(&entries[mid]))? {
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Greater => lo = mid + 1,
                std::cmp::Ordering::Equal => return Ok((true, mid)),
            }
        }
        Ok((false, lo))
    }

    /// Descend from the root to the leaf that would hold `key`.
    pub fn find(&self, key: &K) -> TreeResult<Path<K, E>> {
        let mut path = Path::empty(self.version);
        let mut current = match self.effective_root() {
            Some(r) => r,
            None => return Ok(path),
        };
        loop {
            match current {
                NodeRef::Branch(b) => {
                    let child_index = {
                        let b_ref = b.borrow();
                        self.branch_search(&b_ref.keys, key)?
                    };
                    let child = b.borrow().children[child_index].clone();
                    path.branches.push(BranchStep {
                        branch: b,
                        child_index,
                    });
                    current = child;
                }
                NodeRef::Leaf(l) => {
                    let (on, index) = {
                        let l_ref = l.borrow();
                        self.leaf_search(&l_ref.entries, key)?
                    };
                    path.leaf = Some(l);
                    path.leaf_index = index;
                    path.on = on;
                    return Ok(path);
                }
            }
        }
    }

    /// `get(key)` is `at(find(key))`.
    pub fn get(&self, key: &K) -> TreeResult<Option<E>> {
        let path = self.find(key)?;
        self.at(&path)
    }

    /// The entry at `path`'s position, if `path.on`.
    pub fn at(&self, path: &Path<K, E>) -> TreeResult<Option<E>> {
        self.check_version(path)?;
        if !path.on {
            return Ok(None);
        }
        Ok(path
            .leaf
            .as_ref()
            .map(|l| l.borrow().entries[path.leaf_index].clone()))
    }

    fn descend_to_first(&self, mut current: NodeRef<K, E>, path: &mut Path<K, E>) {
        loop {
            match current {
                NodeRef::Branch(b) => {
                    let child = b.borrow().children[0].clone();
                    path.branches.push(BranchStep {
                        branch: b,
                        child_index: 0,
                    });
                    current = child;
                }
                NodeRef::Leaf(l) => {
                    path.on = !l.borrow().entries.is_empty();
                    path.leaf_index = 0;
                    path.leaf = Some(l);
                    return;
                }
            }
        }
    }

    fn descend_to_last(&self, mut current: NodeRef<K, E>, path: &mut Path<K, E>) {
        loop {
            match current {
                NodeRef::Branch(b) => {
                    let last = b.borrow().children.len() - 1;
                    let child = b.borrow().children[last].clone();
                    path.branches.push(BranchStep {
                        branch: b,
                        child_index: last,
                    });
                    current = child;
                }
                NodeRef::Leaf(l) => {
                    let len = l.borrow().entries.len();
                    path.on = len > 0;
                    path.leaf_index = len.saturating_sub(1);
                    path.leaf = Some(l);
                    return;
                }
            }
        }
    }

    /// Land on the tree's first entry; `on = false` iff the tree is empty.
    pub fn first(&self) -> Path<K, E> {
        let mut path = Path::empty(self.version);
        if let Some(root) = self.effective_root() {
            self.descend_to_first(root, &mut path);
        }
        path
    }

    /// Land on the tree's last entry; `on = false` iff the tree is empty.
    pub fn last(&self) -> Path<K, E> {
        let mut path = Path::empty(self.version);
        if let Some(root) = self.effective_root() {
            self.descend_to_last(root, &mut path);
        }
        path
    }

    /// Step `path` forward in place to the next entry, or the end-crack if
    /// none remains.
    pub fn move_next(&self, path: &mut Path<K, E>) -> TreeResult<()> {
        self.check_version(path)?;
        let Some(leaf) = path.leaf.clone() else {
            return Ok(());
        };
        if !path.on {
            let len = leaf.borrow().entries.len();
            if path.leaf_index < len {
                path.on = true;
                return Ok(());
            }
        }
        let len = leaf.borrow().entries.len();
        if path.leaf_index + 1 < len {
            path.leaf_index += 1;
            path.on = true;
            return Ok(());
        }
        while let Some(step) = path.branches.pop() {
            let last = step.branch.borrow().children.len() - 1;
            if step.child_index < last {
                let next_index = step.child_index + 1;
                let child = step.branch.borrow().children[next_index].clone();
                path.branches.push(BranchStep {
                    branch: step.branch,
                    child_index: next_index,
                });
                self.descend_to_first(child, path);
                return Ok(());
            }
        }
        path.on = false;
        path.leaf_index = leaf.borrow().entries.len();
        Ok(())
    }

    /// Step `path` backward in place to the previous entry.
    pub fn move_prior(&self, path: &mut Path<K, E>) -> TreeResult<()> {
        self.check_version(path)?;
        if path.leaf.is_none() {
            return Ok(());
        }
        if path.leaf_index > 0 {
            path.leaf_index -= 1;
            path.on = true;
            return Ok(());
        }
        while let Some(step) = path.branches.pop() {
            if step.child_index > 0 {
                let prev_index = step.child_index - 1;
                let child = step.branch.borrow().children[prev_index].clone();
                path.branches.push(BranchStep {
                    branch: step.branch,
                    child_index: prev_index,
                });
                self.descend_to_last(child, path);
                return Ok(());
            }
        }
        path.on = false;
        Ok(())
    }

    /// A new path one step ahead of `path`, leaving `path` untouched.
    pub fn next(&self, path: &Path<K, E>) -> TreeResult<Path<K, E>> {
        let mut clone = path.clone();
        self.move_next(&mut clone)?;
        Ok(clone)
    }

    /// A new path one step behind `path`, leaving `path` untouched.
    pub fn prior(&self, path: &Path<K, E>) -> TreeResult<Path<K, E>> {
        let mut clone = path.clone();
        self.move_prior(&mut clone)?;
        Ok(clone)
    }

    /// `path.version == self.version`.
    pub fn is_valid(&self, path: &Path<K, E>) -> bool {
        path.version == self.version
    }

    fn subtree_count(node: &NodeRef<K, E>) -> usize {
        match node {
            NodeRef::Leaf(l) => l.borrow().entries.len(),
            NodeRef::Branch(b) => b
                .borrow()
                .children
                .iter()
                .map(Self::subtree_count)
                .sum(),
        }
    }

    /// Total entry count, O(number of nodes).
    pub fn get_count(&self) -> usize {
        match self.effective_root() {
            Some(root) => Self::subtree_count(&root),
            None => 0,
        }
    }
}

impl<K: Clone, E: Clone> Tree<K, E> {
    /// Insert `entry`. If its key is already present, returns a path with
    /// `on = false` and the tree is unchanged. Otherwise splices the entry
    /// in, propagating any leaf/branch splits, bumps the version, and
    /// returns a path with `on = true` at the new entry.
    pub fn insert(&mut self, entry: E) -> TreeResult<Path<K, E>> {
        let key = self.key_of(&entry);
        let mut path = self.find(&key)?;
        if path.on {
            path.on = false;
            return Ok(path);
        }
        self.insert_at(&mut path, entry)?;
        self.version += 1;
        path.version = self.version;
        Ok(path)
    }

    fn ensure_root_leaf(&mut self) {
        if self.effective_root().is_none() {
            self.local_root = Some(NodeRef::Leaf(Rc::new(RefCell::new(LeafNode::new(self.id)))));
        }
    }

    fn insert_at(&mut self, path: &mut Path<K, E>, entry: E) -> TreeResult<()> {
        if path.leaf.is_none() {
            // Tree was empty; `find` above produced no leaf. Materialise a
            // root and re-derive the path against it.
            self.ensure_root_leaf();
            let key = self.key_of(&entry);
            *path = self.find(&key)?;
        }
        let (leaf, _map) = cow::mutable_leaf(&mut self.local_root, self.id, path);
        self.base_snapshot = None;
        leaf.borrow_mut().entries.insert(path.leaf_index, entry);
        path.on = true;
        if leaf.borrow().is_full() {
            self.split_leaf(path, leaf)?;
        }
        Ok(())
    }

    fn split_leaf(&mut self, path: &mut Path<K, E>, leaf: crate::node::LeafRef<E>) -> TreeResult<()> {
        let mid = (CAPACITY + 1) / 2;
        let (promote_key, right_leaf) = {
            let mut l = leaf.borrow_mut();
            let right_entries = l.entries.split_off(mid);
            let promote_key = self.key_of(&right_entries[0]);
            (
                promote_key,
                Rc::new(RefCell::new(LeafNode {
                    owner: self.id,
                    entries: right_entries,
                })),
            )
        };
        if path.leaf_index >= mid {
            path.leaf_index -= mid;
            path.leaf = Some(Rc::clone(&right_leaf));
        }
        self.propagate_split(path, promote_key, NodeRef::Leaf(right_leaf))
    }

    fn root_child_index(&self, path: &Path<K, E>, left_node: &NodeRef<K, E>) -> usize {
        let probe = match path.branches.first() {
            Some(step) => NodeRef::Branch(Rc::clone(&step.branch)),
            None => match &path.leaf {
                Some(l) => NodeRef::Leaf(Rc::clone(l)),
                None => return 0,
            },
        };
        if probe.ptr_eq(left_node) {
            0
        } else {
            1
        }
    }

    fn propagate_split(
        &mut self,
        path: &mut Path<K, E>,
        mut promote_key: K,
        mut right_node: NodeRef<K, E>,
    ) -> TreeResult<()> {
        let mut depth = path.branches.len();
        loop {
            if depth == 0 {
                let left_node = self
                    .effective_root()
                    .expect("root must exist after a split");
                let child_index = self.root_child_index(path, &left_node);
                let new_root = Rc::new(RefCell::new(BranchNode {
                    owner: self.id,
                    keys: vec![promote_key],
                    children: vec![left_node, right_node],
                }));
                self.local_root = Some(NodeRef::Branch(Rc::clone(&new_root)));
                path.branches.insert(
                    0,
                    BranchStep {
                        branch: new_root,
                        child_index,
                    },
                );
                return Ok(());
            }
            let parent_depth = depth - 1;
            let (parent, _map) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
            self.base_snapshot = None;
            let child_index = path.branches[parent_depth].child_index;
            {
                let mut p = parent.borrow_mut();
                p.keys.insert(child_index, promote_key.clone());
                p.children.insert(child_index + 1, right_node.clone());
            }
            if parent.borrow().children.len() <= CAPACITY {
                return Ok(());
            }
            let mid = (CAPACITY + 1) / 2;
            let (next_promote, right_branch) = {
                let mut b = parent.borrow_mut();
                let right_children = b.children.split_off(mid);
                let next_promote = b.keys.remove(mid - 1);
                let right_keys = b.keys.split_off(mid - 1);
                (
                    next_promote,
                    Rc::new(RefCell::new(BranchNode {
                        owner: self.id,
                        keys: right_keys,
                        children: right_children,
                    })),
                )
            };
            if path.branches[parent_depth].child_index >= mid {
                path.branches[parent_depth].child_index -= mid;
                path.branches[parent_depth].branch = Rc::clone(&right_branch);
            }
            promote_key = next_promote;
            right_node = NodeRef::Branch(right_branch);
            depth = parent_depth;
        }
    }

    /// Delete the entry at `path`. Returns `false` if `path` is not `on`
    /// (no-op). Otherwise removes the entry, rebalances if the owning leaf
    /// underflows, propagates any partition-key fixups, bumps the version,
    /// and returns `true`.
    pub fn delete_at(&mut self, path: &mut Path<K, E>) -> TreeResult<bool> {
        self.check_version(path)?;
        if !path.on {
            return Ok(false);
        }
        let (leaf, _map) = cow::mutable_leaf(&mut self.local_root, self.id, path);
        self.base_snapshot = None;
        let deleted_index = path.leaf_index;
        leaf.borrow_mut().entries.remove(deleted_index);
        let is_root = path.branches.is_empty();
        let underflow = !is_root && leaf.borrow().entries.len() < HALF_CAPACITY;
        if underflow {
            self.rebalance_leaf(path)?;
        } else if deleted_index == 0 {
            let new_first = leaf.borrow().entries.first().map(|e| self.key_of(e));
            if let Some(first_key) = new_first {
                self.update_ancestor_partition(path, path.branches.len(), first_key)?;
            }
        }
        path.on = false;
        self.version += 1;
        Ok(true)
    }

    /// Walk up from `from_depth`, find the first ancestor whose recorded
    /// child index is > 0, and set that ancestor's preceding partition key
    /// to `new_key`. If the subtree sits on the left spine (every ancestor's
    /// child index is 0) there is nothing to update.
    fn update_ancestor_partition(
        &mut self,
        path: &mut Path<K, E>,
        from_depth: usize,
        new_key: K,
    ) -> TreeResult<()> {
        let mut depth = from_depth;
        while depth > 0 {
            let d = depth - 1;
            if path.branches[d].child_index > 0 {
                let (branch, _map) = cow::mutable_branch(&mut self.local_root, self.id, path, d);
                self.base_snapshot = None;
                let idx = path.branches[d].child_index - 1;
                branch.borrow_mut().keys[idx] = new_key;
                return Ok(());
            }
            depth = d;
        }
        Ok(())
    }

    fn sibling_path(&self, path: &Path<K, E>, depth: usize, to_right: bool) -> Option<Path<K, E>> {
        if depth == 0 {
            return None;
        }
        let parent_depth = depth - 1;
        let step = &path.branches[parent_depth];
        let sibling_index = if to_right {
            step.child_index + 1
        } else if step.child_index > 0 {
            step.child_index - 1
        } else {
            return None;
        };
        if sibling_index >= step.branch.borrow().children.len() {
            return None;
        }
        let mut sibling = path.clone();
        sibling.branches.truncate(parent_depth + 1);
        sibling.branches[parent_depth].child_index = sibling_index;
        let child = step.branch.borrow().children[sibling_index].clone();
        match child {
            NodeRef::Leaf(l) => {
                sibling.leaf = Some(l);
                sibling.leaf_index = 0;
            }
            NodeRef::Branch(_) => return None,
        }
        Some(sibling)
    }

    fn rebalance_leaf(&mut self, path: &mut Path<K, E>) -> TreeResult<()> {
        let depth = path.branches.len();
        if depth == 0 {
            return Ok(());
        }
        if let Some(mut right) = self.sibling_path(path, depth, true) {
            let right_len = right.leaf.as_ref().unwrap().borrow().entries.len();
            if right_len > HALF_CAPACITY {
                self.borrow_from_right_leaf(path, &mut right)?;
                return Ok(());
            }
        }
        if let Some(mut left) = self.sibling_path(path, depth, false) {
            let left_len = left.leaf.as_ref().unwrap().borrow().entries.len();
            if left_len > HALF_CAPACITY {
                self.borrow_from_left_leaf(path, &mut left)?;
                return Ok(());
            }
        }
        let self_len = path.leaf.as_ref().unwrap().borrow().entries.len();
        if let Some(right) = self.sibling_path(path, depth, true) {
            let combined = self_len + right.leaf.as_ref().unwrap().borrow().entries.len();
            if combined <= CAPACITY {
                self.merge_right_leaf(path, right)?;
                return Ok(());
            }
        }
        if let Some(left) = self.sibling_path(path, depth, false) {
            let combined = self_len + left.leaf.as_ref().unwrap().borrow().entries.len();
            if combined <= CAPACITY {
                self.merge_left_leaf(path, left)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn borrow_from_right_leaf(&mut self, path: &mut Path<K, E>, right: &mut Path<K, E>) -> TreeResult<()> {
        let depth = path.branches.len();
        let (leaf, map1) = cow::mutable_leaf(&mut self.local_root, self.id, path);
        right.remap(&map1);
        let (right_leaf, map2) = cow::mutable_leaf(&mut self.local_root, self.id, right);
        path.remap(&map2);
        self.base_snapshot = None;
        let moved = right_leaf.borrow_mut().entries.remove(0);
        let new_right_first = right_leaf.borrow().entries.first().map(|e| self.key_of(e));
        leaf.borrow_mut().entries.push(moved);
        if let Some(new_first) = new_right_first {
            let parent_depth = depth - 1;
            let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
            right.remap(&map3);
            self.base_snapshot = None;
            let idx = path.branches[parent_depth].child_index;
            parent.borrow_mut().keys[idx] = new_first;
        }
        Ok(())
    }

    fn borrow_from_left_leaf(&mut self, path: &mut Path<K, E>, left: &mut Path<K, E>) -> TreeResult<()> {
        let depth = path.branches.len();
        let (leaf, map1) = cow::mutable_leaf(&mut self.local_root, self.id, path);
        left.remap(&map1);
        let (left_leaf, map2) = cow::mutable_leaf(&mut self.local_root, self.id, left);
        path.remap(&map2);
        self.base_snapshot = None;
        let moved = left_leaf.borrow_mut().entries.pop().unwrap();
        let moved_key = self.key_of(&moved);
        leaf.borrow_mut().entries.insert(0, moved);
        path.leaf_index += 1;
        let parent_depth = depth - 1;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        left.remap(&map3);
        self.base_snapshot = None;
        let idx = path.branches[parent_depth].child_index - 1;
        parent.borrow_mut().keys[idx] = moved_key;
        Ok(())
    }

    fn merge_right_leaf(&mut self, path: &mut Path<K, E>, mut right: Path<K, E>) -> TreeResult<()> {
        let depth = path.branches.len();
        let (leaf, map1) = cow::mutable_leaf(&mut self.local_root, self.id, path);
        right.remap(&map1);
        let (right_leaf, map2) = cow::mutable_leaf(&mut self.local_root, self.id, &mut right);
        path.remap(&map2);
        self.base_snapshot = None;
        let mut right_entries = std::mem::take(&mut right_leaf.borrow_mut().entries);
        leaf.borrow_mut().entries.append(&mut right_entries);
        let parent_depth = depth - 1;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        right.remap(&map3);
        self.base_snapshot = None;
        let i = path.branches[parent_depth].child_index;
        parent.borrow_mut().keys.remove(i);
        parent.borrow_mut().children.remove(i + 1);
        if i == 0 {
            let first_key = leaf.borrow().entries.first().map(|e| self.key_of(e));
            if let Some(k) = first_key {
                self.update_ancestor_partition(path, parent_depth, k)?;
            }
        }
        self.rebalance_branch_if_needed(path, parent_depth)
    }

    fn merge_left_leaf(&mut self, path: &mut Path<K, E>, mut left: Path<K, E>) -> TreeResult<()> {
        let depth = path.branches.len();
        let (leaf, map1) = cow::mutable_leaf(&mut self.local_root, self.id, path);
        left.remap(&map1);
        let (left_leaf, map2) = cow::mutable_leaf(&mut self.local_root, self.id, &mut left);
        path.remap(&map2);
        self.base_snapshot = None;
        let left_len = left_leaf.borrow().entries.len();
        let mut self_entries = std::mem::take(&mut leaf.borrow_mut().entries);
        left_leaf.borrow_mut().entries.append(&mut self_entries);
        path.leaf = Some(Rc::clone(&left_leaf));
        path.leaf_index += left_len;
        let parent_depth = depth - 1;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        left.remap(&map3);
        self.base_snapshot = None;
        let i = path.branches[parent_depth].child_index;
        parent.borrow_mut().keys.remove(i - 1);
        parent.borrow_mut().children.remove(i);
        path.branches[parent_depth].child_index = i - 1;
        self.rebalance_branch_if_needed(path, parent_depth)
    }

    fn rebalance_branch_if_needed(&mut self, path: &mut Path<K, E>, depth: usize) -> TreeResult<()> {
        let branch = Rc::clone(&path.branches[depth].branch);
        let child_count = branch.borrow().children.len();
        if depth == 0 {
            if child_count == 1 {
                self.collapse_root(path)?;
            }
            return Ok(());
        }
        if child_count < HALF_CAPACITY {
            self.rebalance_branch(path, depth)?;
        }
        Ok(())
    }

    fn collapse_root(&mut self, path: &mut Path<K, E>) -> TreeResult<()> {
        loop {
            let root = match &self.local_root {
                Some(r) => r.clone(),
                None => return Ok(()),
            };
            let Some(b) = root.as_branch() else { return Ok(()) };
            if b.borrow().children.len() != 1 {
                return Ok(());
            }
            let sole_child = b.borrow().children[0].clone();
            self.local_root = Some(sole_child);
            if !path.branches.is_empty() && Rc::ptr_eq(&path.branches[0].branch, b) {
                path.branches.remove(0);
            }
            if !matches!(self.local_root.as_ref().unwrap(), NodeRef::Branch(_)) {
                return Ok(());
            }
        }
    }

    fn sibling_branch_path(&self, path: &Path<K, E>, depth: usize, to_right: bool) -> Option<Path<K, E>> {
        if depth == 0 {
            return None;
        }
        let parent_depth = depth - 1;
        let step = &path.branches[parent_depth];
        let sibling_index = if to_right {
            step.child_index + 1
        } else if step.child_index > 0 {
            step.child_index - 1
        } else {
            return None;
        };
        if sibling_index >= step.branch.borrow().children.len() {
            return None;
        }
        let mut sibling = path.clone();
        sibling.branches.truncate(parent_depth + 1);
        sibling.branches[parent_depth].child_index = sibling_index;
        let child = step.branch.borrow().children[sibling_index].clone();
        match child {
            NodeRef::Branch(b) => {
                sibling.branches.push(BranchStep {
                    branch: b,
                    child_index: 0,
                });
            }
            NodeRef::Leaf(_) => return None,
        }
        Some(sibling)
    }

    /// Rebalance the branch at `path.branches[depth]`, which has underflowed
    /// (fewer than `H` children). Mirrors `rebalance_leaf` one level up: the
    /// parent's separating partition key migrates through the merge/borrow
    /// instead of being recomputed from a leaf's first key.
    fn rebalance_branch(&mut self, path: &mut Path<K, E>, depth: usize) -> TreeResult<()> {
        if let Some(mut right) = self.sibling_branch_path(path, depth, true) {
            let right_len = right.branches[depth].branch.borrow().children.len();
            if right_len > HALF_CAPACITY {
                self.borrow_branch_from_right(path, &mut right, depth)?;
                return Ok(());
            }
        }
        if let Some(mut left) = self.sibling_branch_path(path, depth, false) {
            let left_len = left.branches[depth].branch.borrow().children.len();
            if left_len > HALF_CAPACITY {
                self.borrow_branch_from_left(path, &mut left, depth)?;
                return Ok(());
            }
        }
        if let Some(right) = self.sibling_branch_path(path, depth, true) {
            let self_len = path.branches[depth].branch.borrow().children.len();
            let right_len = right.branches[depth].branch.borrow().children.len();
            if self_len + right_len <= CAPACITY {
                self.merge_branch_right(path, right, depth)?;
                return Ok(());
            }
        }
        if let Some(left) = self.sibling_branch_path(path, depth, false) {
            let self_len = path.branches[depth].branch.borrow().children.len();
            let left_len = left.branches[depth].branch.borrow().children.len();
            if self_len + left_len <= CAPACITY {
                self.merge_branch_left(path, left, depth)?;
                return Ok(());
            }
        }
        Ok(())
    }

    fn borrow_branch_from_right(
        &mut self,
        path: &mut Path<K, E>,
        right: &mut Path<K, E>,
        depth: usize,
    ) -> TreeResult<()> {
        let parent_depth = depth - 1;
        let (branch, map1) = cow::mutable_branch(&mut self.local_root, self.id, path, depth);
        right.remap(&map1);
        let (right_branch, map2) = cow::mutable_branch(&mut self.local_root, self.id, right, depth);
        path.remap(&map2);
        self.base_snapshot = None;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        right.remap(&map3);
        self.base_snapshot = None;
        let sep_index = path.branches[parent_depth].child_index;
        let down_key = parent.borrow().keys[sep_index].clone();
        let moved_child = right_branch.borrow_mut().children.remove(0);
        let up_key = right_branch.borrow_mut().keys.remove(0);
        branch.borrow_mut().keys.push(down_key);
        branch.borrow_mut().children.push(moved_child);
        parent.borrow_mut().keys[sep_index] = up_key;
        Ok(())
    }

    fn borrow_branch_from_left(
        &mut self,
        path: &mut Path<K, E>,
        left: &mut Path<K, E>,
        depth: usize,
    ) -> TreeResult<()> {
        let parent_depth = depth - 1;
        let (branch, map1) = cow::mutable_branch(&mut self.local_root, self.id, path, depth);
        left.remap(&map1);
        let (left_branch, map2) = cow::mutable_branch(&mut self.local_root, self.id, left, depth);
        path.remap(&map2);
        self.base_snapshot = None;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        left.remap(&map3);
        self.base_snapshot = None;
        let sep_index = path.branches[parent_depth].child_index - 1;
        let down_key = parent.borrow().keys[sep_index].clone();
        let moved_child = left_branch.borrow_mut().children.pop().unwrap();
        let up_key = left_branch.borrow_mut().keys.pop().unwrap();
        branch.borrow_mut().keys.insert(0, down_key);
        branch.borrow_mut().children.insert(0, moved_child);
        parent.borrow_mut().keys[sep_index] = up_key;
        path.branches[depth].child_index += 1;
        Ok(())
    }

    fn merge_branch_right(&mut self, path: &mut Path<K, E>, mut right: Path<K, E>, depth: usize) -> TreeResult<()> {
        let parent_depth = depth - 1;
        let (branch, map1) = cow::mutable_branch(&mut self.local_root, self.id, path, depth);
        right.remap(&map1);
        let (right_branch, map2) = cow::mutable_branch(&mut self.local_root, self.id, &mut right, depth);
        path.remap(&map2);
        self.base_snapshot = None;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        right.remap(&map3);
        self.base_snapshot = None;
        let i = path.branches[parent_depth].child_index;
        let sep_key = parent.borrow_mut().keys.remove(i);
        parent.borrow_mut().children.remove(i + 1);
        let mut right_keys = std::mem::take(&mut right_branch.borrow_mut().keys);
        let mut right_children = std::mem::take(&mut right_branch.borrow_mut().children);
        branch.borrow_mut().keys.push(sep_key);
        branch.borrow_mut().keys.append(&mut right_keys);
        branch.borrow_mut().children.append(&mut right_children);
        self.rebalance_branch_if_needed(path, parent_depth)
    }

    fn merge_branch_left(&mut self, path: &mut Path<K, E>, mut left: Path<K, E>, depth: usize) -> TreeResult<()> {
        let parent_depth = depth - 1;
        let (branch, map1) = cow::mutable_branch(&mut self.local_root, self.id, path, depth);
        left.remap(&map1);
        let (left_branch, map2) = cow::mutable_branch(&mut self.local_root, self.id, &mut left, depth);
        path.remap(&map2);
        self.base_snapshot = None;
        let (parent, map3) = cow::mutable_branch(&mut self.local_root, self.id, path, parent_depth);
        left.remap(&map3);
        self.base_snapshot = None;
        let i = path.branches[parent_depth].child_index;
        let sep_key = parent.borrow_mut().keys.remove(i - 1);
        parent.borrow_mut().children.remove(i);
        let left_children_len = left_branch.borrow().children.len();
        let mut self_keys = std::mem::take(&mut branch.borrow_mut().keys);
        let mut self_children = std::mem::take(&mut branch.borrow_mut().children);
        left_branch.borrow_mut().keys.push(sep_key);
        left_branch.borrow_mut().keys.append(&mut self_keys);
        left_branch.borrow_mut().children.append(&mut self_children);
        path.branches[depth].branch = Rc::clone(&left_branch);
        path.branches[depth].child_index += left_children_len;
        path.branches[parent_depth].child_index = i - 1;
        self.rebalance_branch_if_needed(path, parent_depth)
    }

    /// Update the entry at `path`. If `path` is not `on`, returns the path
    /// unchanged with `wasUpdate = true` and no mutation - preserved
    /// verbatim from the source contract even though it reads as a
    /// misnomer; see the crate docs. If the key is unchanged, overwrites in
    /// place under COW. If the key changed, performs an insert of the new
    /// entry and, only if that insert actually lands (the new key doesn't
    /// collide with some other existing entry), deletes the old one;
    /// `wasUpdate` is `false` in that case. If the new key collides with a
    /// different pre-existing entry, the old entry is left untouched and
    /// the returned path has `on = false`.
    pub fn update_at(&mut self, path: &Path<K, E>, new_entry: E) -> TreeResult<(Path<K, E>, bool)> {
        self.check_version(path)?;
        if !path.on {
            return Ok((path.clone(), true));
        }
        let mut path = path.clone();
        let old_key = {
            let leaf = path.leaf.as_ref().unwrap();
            let e = leaf.borrow().entries[path.leaf_index].clone();
            self.key_of(&e)
        };
        let new_key = self.key_of(&new_entry);
        if self.compare(&old_key, &new_key)? == std::cmp::Ordering::Equal {
            let (leaf, _map) = cow::mutable_leaf(&mut self.local_root, self.id, &mut path);
            self.base_snapshot = None;
            leaf.borrow_mut().entries[path.leaf_index] = new_entry;
            self.version += 1;
            path.version = self.version;
            return Ok((path, true));
        }
        let mut insert_path = self.insert(new_entry)?;
        if !insert_path.on {
            return Ok((insert_path, false));
        }
        let mut delete_path = self.find(&old_key)?;
        self.delete_at(&mut delete_path)?;
        insert_path.version = self.version;
        Ok((insert_path, false))
    }

    /// Insert `entry`, or overwrite in place if its key is already present.
    /// Returns `on = true` when an existing entry was overwritten, `on =
    /// false` when the entry was newly inserted - preserved from the source
    /// convention.
    pub fn upsert(&mut self, entry: E) -> TreeResult<Path<K, E>> {
        let key = self.key_of(&entry);
        let mut path = self.find(&key)?;
        if path.on {
            let (leaf, _map) = cow::mutable_leaf(&mut self.local_root, self.id, &mut path);
            self.base_snapshot = None;
            leaf.borrow_mut().entries[path.leaf_index] = entry;
            self.version += 1;
            path.on = true;
            path.version = self.version;
            return Ok(path);
        }
        self.insert_at(&mut path, entry)?;
        self.version += 1;
        path.on = false;
        path.version = self.version;
        Ok(path)
    }

    /// Find `entry`'s key; if present, call `updater` on the existing entry
    /// and `update_at` with the result; if absent, `insert_at(entry)`.
    /// `updater` must not mutate the tree itself - doing so is caught by
    /// path invalidation on the subsequent `update_at`.
    pub fn merge(
        &mut self,
        entry: E,
        updater: impl FnOnce(&E) -> E,
    ) -> TreeResult<(Path<K, E>, bool)> {
        let key = self.key_of(&entry);
        let path = self.find(&key)?;
        if path.on {
            let current = {
                let leaf = path.leaf.as_ref().unwrap();
                leaf.borrow().entries[path.leaf_index].clone()
            };
            let updated = updater(&current);
            self.update_at(&path, updated)
        } else {
            let mut path = path;
            self.insert_at(&mut path, entry)?;
            self.version += 1;
            path.on = true;
            path.version = self.version;
            Ok((path, false))
        }
    }
}
