//! Nested containers of leaves.
//!
//! Model parameters, input signatures and function outputs are all nested
//! structures of sequences and string-keyed maps. [`Tree`] models them once
//! and provides the flatten/map/unflatten traversals every other module
//! builds on.
//!
//! Flattening order is deterministic: sequences in index order, maps in
//! sorted key order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// A nested structure of leaves.
///
/// # Example
///
/// ```
/// use ml_export::Tree;
///
/// let tree = Tree::map([
///     ("b", Tree::leaf(2)),
///     ("a", Tree::seq([Tree::leaf(0), Tree::leaf(1)])),
/// ]);
///
/// assert_eq!(tree.leaf_count(), 3);
/// assert_eq!(tree.leaves(), vec![&0, &1, &2]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tree<T> {
    /// A single value.
    Leaf(T),
    /// An ordered sequence of subtrees.
    Seq(Vec<Tree<T>>),
    /// Subtrees keyed by name.
    Map(BTreeMap<String, Tree<T>>),
}

impl<T> Tree<T> {
    /// Creates a leaf.
    #[must_use]
    pub const fn leaf(value: T) -> Self {
        Self::Leaf(value)
    }

    /// Creates a sequence node.
    #[must_use]
    pub fn seq(items: impl IntoIterator<Item = Self>) -> Self {
        Self::Seq(items.into_iter().collect())
    }

    /// Creates a map node.
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Self)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns `true` if this tree is a single leaf.
    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    /// Returns the leaf value if this tree is a single leaf.
    #[must_use]
    pub const fn as_leaf(&self) -> Option<&T> {
        match self {
            Self::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Seq(items) => items.iter().map(Self::leaf_count).sum(),
            Self::Map(entries) => entries.values().map(Self::leaf_count).sum(),
        }
    }

    /// Returns references to all leaves in flattening order.
    #[must_use]
    pub fn leaves(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.leaf_count());
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::Seq(items) => items.iter().for_each(|item| item.collect_refs(out)),
            Self::Map(entries) => entries.values().for_each(|item| item.collect_refs(out)),
        }
    }

    /// Consumes the tree and returns its leaves in flattening order.
    #[must_use]
    pub fn into_leaves(self) -> Vec<T> {
        let mut out = Vec::new();
        self.collect_owned(&mut out);
        out
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Self::Leaf(value) => out.push(value),
            Self::Seq(items) => items.into_iter().for_each(|item| item.collect_owned(out)),
            Self::Map(entries) => entries
                .into_values()
                .for_each(|item| item.collect_owned(out)),
        }
    }

    /// Applies `f` to every leaf, preserving structure.
    #[must_use]
    pub fn map_leaves<U>(&self, mut f: impl FnMut(&T) -> U) -> Tree<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U, F: FnMut(&T) -> U>(&self, f: &mut F) -> Tree<U> {
        match self {
            Self::Leaf(value) => Tree::Leaf(f(value)),
            Self::Seq(items) => Tree::Seq(items.iter().map(|item| item.map_inner(f)).collect()),
            Self::Map(entries) => Tree::Map(
                entries
                    .iter()
                    .map(|(k, item)| (k.clone(), item.map_inner(f)))
                    .collect(),
            ),
        }
    }

    /// Applies a fallible `f` to every leaf, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map_leaves<U, E>(
        &self,
        mut f: impl FnMut(&T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Tree<U>, E> {
        self.try_map_with_path(|_, value| f(value))
    }

    /// Applies a fallible `f` to every leaf together with its `/`-joined path.
    ///
    /// Sequence entries contribute their index, map entries their key. The
    /// root leaf has an empty path.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `f`.
    pub fn try_map_with_path<U, E>(
        &self,
        mut f: impl FnMut(&str, &T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Tree<U>, E> {
        let mut path = Vec::new();
        self.try_map_path_inner(&mut path, &mut f)
    }

    fn try_map_path_inner<U, E, F>(
        &self,
        path: &mut Vec<String>,
        f: &mut F,
    ) -> std::result::Result<Tree<U>, E>
    where
        F: FnMut(&str, &T) -> std::result::Result<U, E>,
    {
        match self {
            Self::Leaf(value) => Ok(Tree::Leaf(f(&path.join("/"), value)?)),
            Self::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    path.push(i.to_string());
                    let mapped = item.try_map_path_inner(path, f);
                    path.pop();
                    out.push(mapped?);
                }
                Ok(Tree::Seq(out))
            }
            Self::Map(entries) => {
                let mut out = BTreeMap::new();
                for (key, item) in entries {
                    path.push(key.clone());
                    let mapped = item.try_map_path_inner(path, f);
                    path.pop();
                    out.insert(key.clone(), mapped?);
                }
                Ok(Tree::Map(out))
            }
        }
    }

    /// Returns the structure of this tree with leaves erased.
    #[must_use]
    pub fn structure(&self) -> Tree<()> {
        self.map_leaves(|_| ())
    }

    /// Returns `true` if both trees have identical shape (same node kinds,
    /// lengths and keys).
    #[must_use]
    pub fn same_structure<U>(&self, other: &Tree<U>) -> bool {
        match (self, other) {
            (Self::Leaf(_), Tree::Leaf(_)) => true,
            (Self::Seq(a), Tree::Seq(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Self::Map(a), Tree::Map(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, x), (kb, y))| ka == kb && x.same_structure(y))
            }
            _ => false,
        }
    }

    /// Builds a tree with this tree's structure from a flat list of leaves.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::StructureMismatch`] if the number of leaves
    /// differs from [`Tree::leaf_count`].
    pub fn unflatten<U>(&self, leaves: impl IntoIterator<Item = U>) -> Result<Tree<U>> {
        let mut iter = leaves.into_iter();
        let tree = self.try_map_leaves(|_| {
            iter.next().ok_or_else(|| {
                ExportError::structure_mismatch(format!(
                    "expected {} leaves, got fewer",
                    self.leaf_count()
                ))
            })
        })?;
        if iter.next().is_some() {
            return Err(ExportError::structure_mismatch(format!(
                "expected {} leaves, got more",
                self.leaf_count()
            )));
        }
        Ok(tree)
    }
}

impl<T> From<T> for Tree<T> {
    fn from(value: T) -> Self {
        Self::Leaf(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Tree<i32> {
        Tree::map([
            ("dense", Tree::map([("kernel", Tree::leaf(1)), ("bias", Tree::leaf(2))])),
            ("layers", Tree::seq([Tree::leaf(3), Tree::leaf(4)])),
        ])
    }

    #[test]
    fn flatten_order_sorts_map_keys() {
        let tree = sample();
        // dense/bias < dense/kernel, then layers/0, layers/1
        assert_eq!(tree.leaves(), vec![&2, &1, &3, &4]);
        assert_eq!(tree.clone().into_leaves(), vec![2, 1, 3, 4]);
        assert_eq!(tree.leaf_count(), 4);
    }

    #[test]
    fn map_preserves_structure() {
        let tree = sample();
        let doubled = tree.map_leaves(|v| v * 2);
        assert!(tree.same_structure(&doubled));
        assert_eq!(doubled.into_leaves(), vec![4, 2, 6, 8]);
    }

    #[test]
    fn paths_join_keys_and_indices() {
        let tree = sample();
        let names = tree
            .try_map_with_path(|path, _| Ok::<_, ExportError>(path.to_string()))
            .unwrap();
        assert_eq!(
            names.into_leaves(),
            vec!["dense/bias", "dense/kernel", "layers/0", "layers/1"]
        );

        let root = Tree::leaf(7)
            .try_map_with_path(|path, _| Ok::<_, ExportError>(path.to_string()))
            .unwrap();
        assert_eq!(root, Tree::leaf(String::new()));
    }

    #[test]
    fn unflatten_roundtrip() {
        let tree = sample();
        let rebuilt = tree.unflatten(vec!["a", "b", "c", "d"]).unwrap();
        assert!(tree.same_structure(&rebuilt));
        assert_eq!(rebuilt.leaves(), vec![&"a", &"b", &"c", &"d"]);
    }

    #[test]
    fn unflatten_wrong_count() {
        let tree = sample();
        assert!(matches!(
            tree.unflatten(vec![1, 2, 3]),
            Err(ExportError::StructureMismatch(_))
        ));
        assert!(matches!(
            tree.unflatten(vec![1, 2, 3, 4, 5]),
            Err(ExportError::StructureMismatch(_))
        ));
    }

    #[test]
    fn same_structure_detects_differences() {
        let a = Tree::seq([Tree::leaf(1), Tree::leaf(2)]);
        let b = Tree::seq([Tree::leaf(1)]);
        let c = Tree::map([("x", Tree::leaf(1)), ("y", Tree::leaf(2))]);
        assert!(!a.same_structure(&b));
        assert!(!a.same_structure(&c));
        assert!(a.same_structure(&a.structure()));
    }

    #[test]
    fn tree_serialization() {
        let tree = sample();
        let json = serde_json::to_string(&tree).unwrap();
        let parsed: Tree<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, tree);
    }
}
