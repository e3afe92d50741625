//! `LinearKeySet<K>` and `BulkLoader<K>`.
//!
//! `LinearKeySet` is the classic `Tree`/`LinearTree`/`CompleteLinearTree`
//! trio from the bulk-construction literature, generalized to any
//! [`SpatialKey`]: the underlying algorithms only ever call
//! `is_ancestor`/`children`/`parent`/`ancestors`, so nothing backend-specific
//! is lost by making them generic over the key type.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;
use rayon::prelude::*;

use crate::constants::MAX_LEVEL;
use crate::key::SpatialKey;
use crate::types::{Domain, Point};

/// An unsorted, deduplicated key set — the generalized `Tree`.
#[derive(Debug, Clone)]
pub struct LinearKeySet<K> {
    pub keys: HashSet<K>,
}

impl<K: SpatialKey> LinearKeySet<K> {
    pub fn from_iterable<I: Iterator<Item = K>>(keys: I) -> Self {
        LinearKeySet { keys: keys.collect() }
    }

    /// Sort and drop every key that is an ancestor of the key following it
    /// — the generalized `Tree::linearize`/`LinearTree::linearize`.
    pub fn linearize(&self) -> Vec<K> {
        let mut sorted: Vec<K> = self.keys.iter().copied().collect();
        sorted.sort();
        linearize_sorted(sorted)
    }

    /// Fill the gap between `a` and `b` (both inclusive) with the minimal
    /// set of keys whose union exactly tiles `[a, b]` — the generalized
    /// `LinearTree::complete_region`.
    pub fn complete_region(a: &K, b: &K) -> Vec<K> {
        let a_ancestors: HashSet<K> = a.ancestors().into_iter().collect();
        let b_ancestors: HashSet<K> = b.ancestors().into_iter().collect();

        let mut working_list: HashSet<K> = a
            .finest_ancestor_with(b)
            .children()
            .unwrap_or_default()
            .into_iter()
            .collect();

        loop {
            let mut aux_list: HashSet<K> = HashSet::new();
            let mut matched = 0usize;

            for w in &working_list {
                if a < w && w < b && !b_ancestors.contains(w) {
                    aux_list.insert(*w);
                    matched += 1;
                } else if a_ancestors.contains(w) || b_ancestors.contains(w) {
                    if let Ok(children) = w.children() {
                        aux_list.extend(children);
                    }
                }
            }

            if matched == working_list.len() {
                let mut result: Vec<K> = aux_list.into_iter().collect();
                result.sort();
                return result;
            }
            working_list = aux_list;
        }
    }

    /// Complete the region spanned by the set's own min/max key — the
    /// generalized `LinearTree::complete`.
    pub fn complete(&self) -> Vec<K> {
        if self.keys.is_empty() {
            return Vec::new();
        }
        let a = *self.keys.iter().min().unwrap();
        let b = *self.keys.iter().max().unwrap();
        let mut completion = Self::complete_region(&a, &b);
        completion.push(a);
        completion.push(b);
        completion.sort();
        completion.dedup();
        completion
    }
}

fn linearize_sorted<K: SpatialKey>(sorted: Vec<K>) -> Vec<K> {
    if sorted.is_empty() {
        return sorted;
    }
    let n = sorted.len();
    let mut out = Vec::with_capacity(n);
    for (i, (a, b)) in sorted.iter().copied().tuple_windows().enumerate() {
        if !a.is_descendant_of(&b) && !b.is_descendant_of(&a) {
            out.push(a);
        } else if a.is_descendant_of(&b) {
            // a is a (possibly improper) descendant of b: a is the finer
            // key and survives; b is redundant and dropped by not pushing
            // it on this iteration.
            out.push(a);
        }
        if i == n - 2 {
            out.push(b);
        }
    }
    out.dedup();
    out
}

/// What a bulk build produced: the leaf cells of the new tree, plus the
/// input indices of points whose coordinates could not be mapped (they are
/// skipped, not fatal).
#[derive(Debug, Clone)]
pub struct BulkOutcome<K> {
    pub leaves: Vec<K>,
    pub skipped: Vec<usize>,
}

/// Build a tree bottom-up from a flat point cloud: presort by key at
/// `max_level`, complete the region, then coarsen by a per-key weight cap
/// (entity count per node) via `coarsen_by_weights`, generalized past
/// `MortonKey` to any [`SpatialKey`]. Subdivision decisions all happen
/// here, on the stack of the coarsening walk; the engine files entities
/// into the finished leaves without any per-entity checks.
pub struct BulkLoader<K> {
    domain: Domain,
    max_entities_per_node: usize,
    _marker: std::marker::PhantomData<K>,
}

impl<K: SpatialKey + Send + Sync> BulkLoader<K> {
    pub fn new(domain: Domain, max_entities_per_node: usize) -> Self {
        BulkLoader { domain, max_entities_per_node, _marker: std::marker::PhantomData }
    }

    /// Map every point to its deepest-level key in parallel (rayon). The
    /// second list holds the input indices that failed to map.
    pub fn keys_for_points(&self, points: &[Point]) -> (Vec<K>, Vec<usize>) {
        let mapped: Vec<Option<K>> = points
            .par_iter()
            .map(|p| K::from_point(&p.coord, MAX_LEVEL, &self.domain).ok())
            .collect();

        let mut keys = Vec::with_capacity(mapped.len());
        let mut skipped = Vec::new();
        for (i, key) in mapped.into_iter().enumerate() {
            match key {
                Some(k) => keys.push(k),
                None => skipped.push(i),
            }
        }
        (keys, skipped)
    }

    /// Build a complete, coarsened linear tree from `points`: leaves are
    /// split down until each holds at most `max_entities_per_node` points,
    /// and merged back up wherever a coarser cell would already satisfy
    /// that bound.
    pub fn build(&self, points: &[Point]) -> BulkOutcome<K> {
        if points.is_empty() {
            return BulkOutcome { leaves: Vec::new(), skipped: Vec::new() };
        }

        let (deepest_keys, skipped) = self.keys_for_points(points);
        if deepest_keys.is_empty() {
            return BulkOutcome { leaves: Vec::new(), skipped };
        }

        let mut counts: HashMap<K, usize> = HashMap::new();
        for key in &deepest_keys {
            *counts.entry(*key).or_insert(0) += 1;
        }

        let set = LinearKeySet::from_iterable(deepest_keys.into_iter());
        let completed = set.complete();

        let weights: Vec<f64> =
            completed.iter().map(|k| *counts.get(k).unwrap_or(&0) as f64).collect();
        let leaves = coarsen_by_weights(&completed, &weights, self.max_entities_per_node as f64);
        BulkOutcome { leaves, skipped }
    }
}

/// Generalized `CompleteLinearTree::coarsen_by_weights`: merges a complete
/// linear tree's leaves upward wherever a parent's aggregate weight still
/// fits under `max_weight`.
pub fn coarsen_by_weights<K: SpatialKey>(keys: &[K], weights: &[f64], max_weight: f64) -> Vec<K> {
    assert_eq!(keys.len(), weights.len());
    if keys.is_empty() {
        return Vec::new();
    }

    let root = K::root();
    let mut weights_map: HashMap<K, f64> = HashMap::new();
    for (&key, &weight) in keys.iter().zip(weights.iter()) {
        let mut w = weight;
        let mut cur = key;
        weights_map.insert(cur, w);
        while cur != root {
            match cur.parent() {
                Some(parent) => {
                    let entry = weights_map.entry(parent).or_insert(0.0);
                    *entry += w;
                    w = *entry;
                    cur = parent;
                }
                None => break,
            }
        }
    }

    fn coarsen_impl<K: SpatialKey>(
        key: K,
        weights: &HashMap<K, f64>,
        out: &mut Vec<K>,
        max_weight: f64,
    ) {
        if key.level() >= MAX_LEVEL {
            out.push(key);
            return;
        }
        match weights.get(&key) {
            Some(&w) if w <= max_weight => out.push(key),
            Some(_) => {
                if let Ok(children) = key.children() {
                    if children.iter().any(|c| weights.contains_key(c)) {
                        for child in children {
                            coarsen_impl(child, weights, out, max_weight);
                        }
                    } else {
                        out.push(key);
                    }
                } else {
                    out.push(key);
                }
            }
            None => {}
        }
    }

    let mut out = Vec::with_capacity(keys.len());
    coarsen_impl(root, &weights_map, &mut out, max_weight);
    out.sort();
    out
}

trait FinestAncestorWith: SpatialKey {
    fn finest_ancestor_with(&self, other: &Self) -> Self {
        if self == other {
            return *other;
        }
        let my_ancestors: HashSet<Self> = self.ancestors().into_iter().collect();
        let mut current = other.parent().unwrap_or_else(Self::root);
        while !my_ancestors.contains(&current) && current.level() > 0 {
            current = current.parent().unwrap_or_else(Self::root);
        }
        current
    }
}

impl<K: SpatialKey> FinestAncestorWith for K {}
