//! An in-memory, ordered associative container: a B+-like tree with a
//! copy-on-write overlay between a base tree and any number of trees
//! derived from it.
//!
//! A derived tree observes every entry in its base at the moment of
//! [`Tree::derive`] and shares the base's nodes read-only; writing to
//! either tree clones only the nodes the write actually touches, up to a
//! new root, leaving the other tree's view untouched. Every lookup and
//! mutation is expressed in terms of a [`Path`]: a root-to-leaf cursor
//! stamped with the tree's version at the moment it was issued. A mutation
//! bumps the version, which invalidates every outstanding path - the next
//! operation against a stale path fails with [`TreeError::InvalidPath`]
//! rather than silently reading a half-updated tree.
//!
//! ```
//! use cow_btree::Tree;
//!
//! let mut base: Tree<i64, (i64, char)> = Tree::new(|e| e.0);
//! base.insert((10, 't')).unwrap();
//! base.insert((20, 'w')).unwrap();
//!
//! let base = std::rc::Rc::new(std::cell::RefCell::new(base));
//! let mut derived = Tree::derive(&base);
//! derived.insert((15, 'x')).unwrap();
//!
//! assert_eq!(derived.get(&15).unwrap(), Some((15, 'x')));
//! assert_eq!(base.borrow().get(&15).unwrap(), None);
//! ```
//!
//! This is a single-threaded, synchronous, in-process library: no
//! persistence, no cross-thread concurrency control, no serialization. See
//! the `cow` and `node` module sources for how ownership tagging makes the
//! copy-on-write discipline an O(1) check rather than a refcount
//! inspection.

mod cow;
mod error;
mod iter;
mod node;
mod path;
mod range;
mod stats;
mod tree;

pub use error::{TreeError, TreeResult};
pub use iter::{Ascending, Descending};
pub use path::Path;
pub use range::{Direction, Range, RangeEndpoint, RangeSpec};
pub use stats::TreeStats;
pub use tree::{Comparator, KeyExtractor, Tree};
