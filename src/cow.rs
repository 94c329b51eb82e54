//! The copy-on-write engine: `mutable_leaf` and `mutable_branch`.
//!
//! This is the only place a node's identity can change. Both entry points
//! produce a node privately owned by the requesting tree - either returning
//! one already owned, or cloning one and threading the clone up through the
//! path's branches to the root, remapping the path as they go. Rebalancing
//! may need two mutable views at once (a leaf and its sibling, say); callers
//! collect the remap lists returned here and apply them to whichever other
//! paths must stay in sync.

use std::cell::RefCell;
use std::rc::Rc;

use crate::node::{BranchRef, LeafRef, NodeRef, TreeId};
use crate::path::{BranchStep, Path};

/// Old-node -> new-node pairs produced by a single COW clone walk.
pub(crate) type RemapList<K, E> = Vec<(NodeRef<K, E>, NodeRef<K, E>)>;

/// Clone every foreign branch in `branches` (walked bottom-up), patching each
/// clone's child pointer to `new_child` at the recorded index, and stopping
/// at the first branch already owned by `id` (everything above it is already
/// private). If the walk runs off the top of `branches` entirely, installs
/// `new_child` as the new root.
fn climb_and_clone<K: Clone, E>(
    root: &mut Option<NodeRef<K, E>>,
    id: TreeId,
    branches: &mut [BranchStep<K, E>],
    mut new_child: NodeRef<K, E>,
) -> RemapList<K, E> {
    let mut map = Vec::new();
    let mut reached_top = true;
    for step in branches.iter_mut().rev() {
        if step.branch.borrow().owner == id {
            step.branch.borrow_mut().children[step.child_index] = new_child;
            reached_top = false;
            break;
        }
        let mut cloned = step.branch.borrow().clone_with_owner(id);
        cloned.children[step.child_index] = new_child.clone();
        let cloned_ref: BranchRef<K, E> = Rc::new(RefCell::new(cloned));
        map.push((
            NodeRef::Branch(Rc::clone(&step.branch)),
            NodeRef::Branch(Rc::clone(&cloned_ref)),
        ));
        new_child = NodeRef::Branch(Rc::clone(&cloned_ref));
        step.branch = cloned_ref;
    }
    if reached_top {
        *root = Some(new_child);
    }
    map
}

/// Ensure `path.leaf` is privately owned by `id`, cloning it (and every
/// foreign ancestor branch up to the root) if necessary. Returns the private
/// leaf and the remap list produced, if any cloning occurred.
pub(crate) fn mutable_leaf<K: Clone, E: Clone>(
    root: &mut Option<NodeRef<K, E>>,
    id: TreeId,
    path: &mut Path<K, E>,
) -> (LeafRef<E>, RemapList<K, E>) {
    let current = path.leaf.clone().expect("mutable_leaf requires a leaf");
    if current.borrow().owner == id {
        return (current, Vec::new());
    }
    let private: LeafRef<E> = Rc::new(RefCell::new(current.borrow().clone_with_owner(id)));
    let mut map = vec![(
        NodeRef::Leaf(Rc::clone(&current)),
        NodeRef::Leaf(Rc::clone(&private)),
    )];
    let branch_map = climb_and_clone(root, id, &mut path.branches, NodeRef::Leaf(Rc::clone(&private)));
    map.extend(branch_map);
    path.leaf = Some(Rc::clone(&private));
    (private, map)
}

/// Ensure `path.branches[depth]` is privately owned by `id`, cloning it (and
/// every foreign ancestor above it) if necessary. Returns the private branch
/// and the remap list produced, if any cloning occurred.
pub(crate) fn mutable_branch<K: Clone, E>(
    root: &mut Option<NodeRef<K, E>>,
    id: TreeId,
    path: &mut Path<K, E>,
    depth: usize,
) -> (BranchRef<K, E>, RemapList<K, E>) {
    let current = Rc::clone(&path.branches[depth].branch);
    if current.borrow().owner == id {
        return (current, Vec::new());
    }
    let cloned: BranchRef<K, E> = Rc::new(RefCell::new(current.borrow().clone_with_owner(id)));
    let mut map = vec![(
        NodeRef::Branch(Rc::clone(&current)),
        NodeRef::Branch(Rc::clone(&cloned)),
    )];
    path.branches[depth].branch = Rc::clone(&cloned);
    let ancestors = &mut path.branches[..depth];
    let branch_map = climb_and_clone(root, id, ancestors, NodeRef::Branch(Rc::clone(&cloned)));
    map.extend(branch_map);
    (cloned, map)
}
