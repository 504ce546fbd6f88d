//! Keyed set difference between current and desired resource state.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

/// Entries to add and remove to turn `current` into `desired`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<V> {
    pub to_add: Vec<V>,
    pub to_remove: Vec<V>,
}

impl<V> Diff<V> {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Computes the keyed difference of two maps.
///
/// Keys only in `desired` are added, keys only in `current` are removed, and
/// keys present in both are left alone even if their values differ. Output is
/// ordered by key so the result does not depend on map iteration order.
pub fn diff<K, V>(current: &HashMap<K, V>, desired: &HashMap<K, V>) -> Diff<V>
where
    K: Eq + Hash + Ord,
    V: Clone,
{
    let mut to_add: Vec<(&K, &V)> = desired
        .iter()
        .filter(|(k, _)| !current.contains_key(*k))
        .collect();
    let mut to_remove: Vec<(&K, &V)> = current
        .iter()
        .filter(|(k, _)| !desired.contains_key(*k))
        .collect();
    to_add.sort_by(|a, b| a.0.cmp(b.0));
    to_remove.sort_by(|a, b| a.0.cmp(b.0));

    Diff {
        to_add: to_add.into_iter().map(|(_, v)| v.clone()).collect(),
        to_remove: to_remove.into_iter().map(|(_, v)| v.clone()).collect(),
    }
}

/// Set flavour of [`diff`], for resources whose entries are their own keys.
pub fn diff_sets<T>(current: &BTreeSet<T>, desired: &BTreeSet<T>) -> Diff<T>
where
    T: Ord + Clone,
{
    Diff {
        to_add: desired.difference(current).cloned().collect(),
        to_remove: current.difference(desired).cloned().collect(),
    }
}
