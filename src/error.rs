//! Failure kinds raised by path-consuming and comparing operations.

use thiserror::Error;

/// Failures the tree can raise. Detection always precedes mutation: an
/// operation that returns `Err` has not changed the tree's structure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The supplied path's version stamp no longer matches the tree's
    /// current version. Any mutation committed since the path was issued
    /// invalidates it by design; the caller must re-derive the path.
    #[error(
        "path is stale: captured at version {path_version}, tree is now at version {current}"
    )]
    InvalidPath { path_version: u64, current: u64 },

    /// The comparator returned non-zero values of the same sign for
    /// `compare(a, b)` and `compare(b, a)`. This is fatal because the tree's
    /// ordering invariants can no longer be trusted.
    #[error("comparator is inconsistent: compare(a, b) and compare(b, a) disagree")]
    InconsistentComparator,
}

/// Convenience alias used throughout the crate.
pub type TreeResult<T> = Result<T, TreeError>;
