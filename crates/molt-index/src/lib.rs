//! # Ordered address index
//!
//! A thin ordering layer over `BTreeMap` providing the queries the Molt
//! allocation table is built from: insert-if-absent, remove, exact lookup,
//! predecessor lookup, and ordered iteration.
//!
//! The predecessor query (greatest key `<=` a probe) is what turns a map of
//! allocation bases into an interval lookup: resolve the probe to the entry
//! starting at or below it, then check containment against that entry's
//! extent.

#![warn(clippy::all)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Ordered map keyed by a `Copy + Ord` key (an address, in practice).
///
/// Wraps `BTreeMap` so that callers depend on exactly the operations the
/// allocation table is specified against, nothing more.
#[derive(Debug, Clone)]
pub struct OrderedIndex<K, V> {
    map: BTreeMap<K, V>,
}

impl<K: Ord + Copy, V> OrderedIndex<K, V> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert `value` at `key` only if the key is absent.
    ///
    /// Returns true if the value was inserted, false if the key was
    /// already present (the existing value is left untouched).
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        match self.map.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Remove the entry at `key`, returning its value if present.
    pub fn remove(&mut self, key: K) -> Option<V> {
        self.map.remove(&key)
    }

    /// Exact lookup.
    pub fn get(&self, key: K) -> Option<&V> {
        self.map.get(&key)
    }

    /// Exact lookup, mutable.
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.map.get_mut(&key)
    }

    /// Entry with the greatest key `<=` `key`, if any.
    pub fn predecessor(&self, key: K) -> Option<(K, &V)> {
        self.map.range(..=key).next_back().map(|(k, v)| (*k, v))
    }

    /// Entry with the greatest key `<=` `key`, if any, mutable.
    pub fn predecessor_mut(&mut self, key: K) -> Option<(K, &mut V)> {
        self.map.range_mut(..=key).next_back().map(|(k, v)| (*k, v))
    }

    /// Iterate entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.map.iter().map(|(k, v)| (*k, v))
    }
}

impl<K: Ord + Copy, V> Default for OrderedIndex<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent_rejects_duplicate() {
        let mut index = OrderedIndex::new();
        assert!(index.insert_if_absent(10u64, "a"));
        assert!(!index.insert_if_absent(10u64, "b"));

        // Existing value untouched
        assert_eq!(index.get(10), Some(&"a"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_returns_value() {
        let mut index = OrderedIndex::new();
        index.insert_if_absent(5u64, 50);
        assert_eq!(index.remove(5), Some(50));
        assert_eq!(index.remove(5), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_predecessor_queries() {
        let mut index = OrderedIndex::new();
        index.insert_if_absent(10u64, "ten");
        index.insert_if_absent(20u64, "twenty");
        index.insert_if_absent(30u64, "thirty");

        // Exact hit
        assert_eq!(index.predecessor(20), Some((20, &"twenty")));
        // Between keys resolves downward
        assert_eq!(index.predecessor(29), Some((20, &"twenty")));
        // Before the first key there is nothing
        assert_eq!(index.predecessor(9), None);
        // Past the last key resolves to the last
        assert_eq!(index.predecessor(1000), Some((30, &"thirty")));
    }

    #[test]
    fn test_predecessor_mut_updates_in_place() {
        let mut index = OrderedIndex::new();
        index.insert_if_absent(10u64, 1);
        index.insert_if_absent(20u64, 2);

        if let Some((key, value)) = index.predecessor_mut(25) {
            assert_eq!(key, 20);
            *value = 42;
        }
        assert_eq!(index.get(20), Some(&42));
    }

    #[test]
    fn test_ordered_iteration() {
        let mut index = OrderedIndex::new();
        index.insert_if_absent(30u64, ());
        index.insert_if_absent(10u64, ());
        index.insert_if_absent(20u64, ());

        let keys: Vec<u64> = index.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    fn test_get_mut_updates_in_place() {
        let mut index = OrderedIndex::new();
        index.insert_if_absent(7u64, vec![1, 2]);
        index.get_mut(7).unwrap().push(3);
        assert_eq!(index.get(7), Some(&vec![1, 2, 3]));
    }
}
