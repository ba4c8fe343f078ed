//! # Mutation Buffer
//!
//! The per-commit, sorted representation of pending writes. An ordered map
//! from boundary key to a `RangeMutation` describing both the boundary
//! key's own mutation and whether the open interval *after* it (up to the
//! next boundary) is cleared.
//!
//! The buffer always contains the tree's lowest possible boundary (the
//! empty key) and its highest possible boundary (the reserved maximum key
//! sentinel); the highest begins as "clear at boundary" so a range clear
//! extending to the top of the keyspace needs no special casing. Because
//! every key falls inside some existing range, inserting a new boundary
//! always *splits* a range, so the new entry inherits the preceding
//! boundary's clear-after state to preserve covering-range semantics.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use crate::config::MAX_KEY_SENTINEL;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeMutation {
    pub boundary_changed: bool,
    pub boundary_value: Option<Vec<u8>>,
    pub clear_after_boundary: bool,
}

impl RangeMutation {
    /// The boundary key itself is cleared.
    pub fn boundary_cleared(&self) -> bool {
        self.boundary_changed && self.boundary_value.is_none()
    }

    /// The boundary key is set to a value.
    pub fn boundary_set(&self) -> bool {
        self.boundary_changed && self.boundary_value.is_some()
    }

    /// True when this mutation doesn't actually change anything.
    pub fn no_changes(&self) -> bool {
        !self.boundary_changed && !self.clear_after_boundary
    }

    pub fn clear_boundary(&mut self) {
        self.boundary_changed = true;
        self.boundary_value = None;
    }

    /// Clears the boundary key and the whole range after it.
    pub fn clear_all(&mut self) {
        self.clear_boundary();
        self.clear_after_boundary = true;
    }

    pub fn set_boundary_value(&mut self, value: Vec<u8>) {
        self.boundary_changed = true;
        self.boundary_value = Some(value);
    }
}

#[derive(Debug)]
pub struct MutationBuffer {
    mutations: BTreeMap<Vec<u8>, RangeMutation>,
}

impl Default for MutationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationBuffer {
    pub fn new() -> Self {
        let mut mutations = BTreeMap::new();
        mutations.insert(Vec::new(), RangeMutation::default());
        let mut top = RangeMutation::default();
        top.clear_boundary();
        mutations.insert(MAX_KEY_SENTINEL.to_vec(), top);
        Self { mutations }
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        // The two sentinels are structural, not user mutations.
        self.mutations.len() == 2
    }

    /// Finds or creates the boundary for `key`. A newly created boundary
    /// splits the range it lands in and inherits the preceding boundary's
    /// clear-after state.
    pub fn insert(&mut self, key: &[u8]) -> &mut RangeMutation {
        debug_assert!(key <= MAX_KEY_SENTINEL, "key above the reserved maximum");
        if !self.mutations.contains_key(key) {
            let inherited = self
                .mutations
                .range::<[u8], _>((Unbounded, Excluded(key)))
                .next_back()
                .map(|(_, m)| m.clear_after_boundary)
                .unwrap_or(false);
            let mut fresh = RangeMutation::default();
            if inherited {
                fresh.clear_all();
            }
            self.mutations.insert(key.to_vec(), fresh);
        }
        self.mutations.get_mut(key).unwrap()
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) {
        self.insert(key).set_boundary_value(value.to_vec());
    }

    /// Single-key clear: one boundary with `boundary_cleared` and no
    /// clear-after.
    pub fn clear_single(&mut self, key: &[u8]) {
        self.insert(key).clear_boundary();
    }

    /// Range clear of `[begin, end)`: begin gets boundary-clear plus
    /// clear-after, end stands as an anchor (existing or fresh), and any
    /// boundaries strictly between them are dropped as subsumed.
    pub fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        debug_assert!(begin < end);
        self.insert(begin);
        self.insert(end);
        self.mutations.get_mut(begin).unwrap().clear_all();

        let doomed: Vec<Vec<u8>> = self
            .mutations
            .range::<[u8], _>((Excluded(begin), Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.mutations.remove(&key);
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&RangeMutation> {
        self.mutations.get(key)
    }

    /// Consumes the buffer into a sorted slice for the commit walk.
    pub fn into_entries(self) -> Vec<(Vec<u8>, RangeMutation)> {
        self.mutations.into_iter().collect()
    }
}

/// Sorted view of a consumed mutation buffer, indexed by position. The
/// commit recursion carries index ranges instead of iterators.
pub struct MutationSlice<'a> {
    entries: &'a [(Vec<u8>, RangeMutation)],
}

impl<'a> MutationSlice<'a> {
    pub fn new(entries: &'a [(Vec<u8>, RangeMutation)]) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn key(&self, i: usize) -> &'a [u8] {
        &self.entries[i].0
    }

    pub fn mutation(&self, i: usize) -> &'a RangeMutation {
        &self.entries[i].1
    }

    /// Index of the first boundary with key > `key`.
    pub fn upper_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() <= key)
    }

    /// Index of the first boundary with key >= `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(k, _)| k.as_slice() < key)
    }
}
