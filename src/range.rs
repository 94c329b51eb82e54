//! Key-range iteration, bounded by inclusive/exclusive endpoints in either
//! direction.
//!
//! The setup algorithm (see [`Tree::range`]) mirrors `first`/`last`: compute
//! a start path, then step once if the endpoint itself is excluded; the
//! walk then advances with the directional step and stops when the current
//! key crosses the end endpoint or the cursor falls off the tree.

use crate::error::TreeResult;
use crate::path::Path;
use crate::tree::Tree;

/// Which way a range walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// One bound of a range: a key and whether that key itself is included.
#[derive(Clone)]
pub struct RangeEndpoint<K> {
    pub key: K,
    pub inclusive: bool,
}

impl<K> RangeEndpoint<K> {
    pub fn new(key: K, inclusive: bool) -> Self {
        Self { key, inclusive }
    }
}

/// A key range plus a walk direction. Either endpoint may be absent, meaning
/// "unbounded in that direction".
pub struct RangeSpec<K> {
    pub start: Option<RangeEndpoint<K>>,
    pub end: Option<RangeEndpoint<K>>,
    pub direction: Direction,
}

impl<K> RangeSpec<K> {
    pub fn new(direction: Direction) -> Self {
        Self {
            start: None,
            end: None,
            direction,
        }
    }

    pub fn with_start(mut self, start: RangeEndpoint<K>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: RangeEndpoint<K>) -> Self {
        self.end = Some(end);
        self
    }
}

/// A bounded, directional cursor walk produced by [`Tree::range`].
pub struct Range<'a, K, E> {
    tree: &'a Tree<K, E>,
    path: Path<K, E>,
    end: Option<RangeEndpoint<K>>,
    direction: Direction,
    started: bool,
}

impl<'a, K: Clone, E: Clone> Range<'a, K, E> {
    fn past_end(&self, key: &K) -> TreeResult<bool> {
        let Some(end) = &self.end else {
            return Ok(false);
        };
        let ord = self.tree.compare(key, &end.key)?;
        Ok(match self.direction {
            Direction::Ascending => {
                ord == std::cmp::Ordering::Greater
                    || (ord == std::cmp::Ordering::Equal && !end.inclusive)
            }
            Direction::Descending => {
                ord == std::cmp::Ordering::Less
                    || (ord == std::cmp::Ordering::Equal && !end.inclusive)
            }
        })
    }
}

impl<'a, K: Clone, E: Clone> Iterator for Range<'a, K, E> {
    type Item = TreeResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.started {
            let step_result = match self.direction {
                Direction::Ascending => self.tree.move_next(&mut self.path),
                Direction::Descending => self.tree.move_prior(&mut self.path),
            };
            if let Err(e) = step_result {
                self.path.on = false;
                return Some(Err(e));
            }
        }
        self.started = true;
        if !self.path.on {
            return None;
        }
        let entry = match self.tree.at(&self.path) {
            Ok(Some(e)) => e,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        let key = self.tree.key_of(&entry);
        match self.past_end(&key) {
            Ok(true) => {
                self.path.on = false;
                None
            }
            Ok(false) => Some(Ok(entry)),
            Err(e) => Some(Err(e)),
        }
    }
}

impl<K: Clone, E: Clone> Tree<K, E> {
    /// Iterate the keys in `spec.start..=spec.end` (per each endpoint's
    /// inclusive flag) in `spec.direction`.
    pub fn range(&self, spec: RangeSpec<K>) -> TreeResult<Range<'_, K, E>> {
        let mut path = match &spec.start {
            Some(start) => {
                let p = self.find(&start.key)?;
                p
            }
            None => match spec.direction {
                Direction::Ascending => self.first(),
                Direction::Descending => self.last(),
            },
        };
        if let Some(start) = &spec.start {
            let keep_as_is = start.inclusive && path.on;
            if !keep_as_is {
                match spec.direction {
                    Direction::Ascending => self.move_next(&mut path)?,
                    Direction::Descending => self.move_prior(&mut path)?,
                }
            }
        }
        Ok(Range {
            tree: self,
            path,
            end: spec.end,
            direction: spec.direction,
            started: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Tree;

    #[derive(Clone, Debug, PartialEq)]
    struct Rec(i64);

    fn tree_with(keys: &[i64]) -> Tree<i64, Rec> {
        let mut t: Tree<i64, Rec> = Tree::new(|e| e.0);
        for &k in keys {
            t.insert(Rec(k)).unwrap();
        }
        t
    }

    #[test]
    fn ascending_inclusive_bounds() {
        let t = tree_with(&[1, 2, 3, 4, 5, 6]);
        let spec = RangeSpec::new(Direction::Ascending)
            .with_start(RangeEndpoint::new(2, true))
            .with_end(RangeEndpoint::new(5, true));
        let got: Vec<i64> = t.range(spec).unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(got, vec![2, 3, 4, 5]);
    }

    #[test]
    fn ascending_exclusive_bounds() {
        let t = tree_with(&[1, 2, 3, 4, 5, 6]);
        let spec = RangeSpec::new(Direction::Ascending)
            .with_start(RangeEndpoint::new(2, false))
            .with_end(RangeEndpoint::new(5, false));
        let got: Vec<i64> = t.range(spec).unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(got, vec![3, 4]);
    }

    #[test]
    fn descending_range() {
        let t = tree_with(&[1, 2, 3, 4, 5, 6]);
        let spec = RangeSpec::new(Direction::Descending)
            .with_start(RangeEndpoint::new(5, true))
            .with_end(RangeEndpoint::new(2, true));
        let got: Vec<i64> = t.range(spec).unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(got, vec![5, 4, 3, 2]);
    }

    #[test]
    fn unbounded_start_and_end() {
        let t = tree_with(&[1, 2, 3]);
        let spec: RangeSpec<i64> = RangeSpec::new(Direction::Ascending);
        let got: Vec<i64> = t.range(spec).unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn start_key_absent_falls_to_next_entry() {
        let t = tree_with(&[1, 2, 4, 5]);
        let spec = RangeSpec::new(Direction::Ascending)
            .with_start(RangeEndpoint::new(3, true))
            .with_end(RangeEndpoint::new(5, true));
        let got: Vec<i64> = t.range(spec).unwrap().map(|r| r.unwrap().0).collect();
        assert_eq!(got, vec![4, 5]);
    }
}
