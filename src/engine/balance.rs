//! `TreeBalancer`: split/merge policy plus an optional 2:1 balance pass.
//!
//! The split/merge thresholds are a simple policy object so callers can
//! swap in a different heuristic without touching the engine. The 2:1
//! balance pass follows the classic `Tree::balance` shape — insert missing
//! neighbor parents/siblings until no gap remains — generalized to call
//! `K::neighbors()` so it works for either backend instead of pushing
//! straight into a `Vec<MortonKey>`.

use std::collections::HashSet;

use crate::constants::{DEFAULT_MAX_ENTITIES_PER_NODE, DEFAULT_MERGE_THRESHOLD};
use crate::key::SpatialKey;

pub struct TreeBalancer {
    pub split_threshold: u16,
    pub merge_threshold: u16,
}

impl TreeBalancer {
    pub fn new(split_threshold: u16, merge_threshold: u16) -> Self {
        TreeBalancer { split_threshold, merge_threshold }
    }

    pub fn should_split(&self, entity_count: usize) -> bool {
        entity_count > self.split_threshold as usize
    }

    pub fn should_merge(&self, entity_count: usize) -> bool {
        entity_count <= self.merge_threshold as usize
    }

    /// Given the current set of leaf keys, return the keys that must be
    /// added so that no two adjacent leaves differ by more than one level
    /// (a 2:1 balance condition).
    ///
    /// Runs to a fixed point: adding a balancing ancestor can itself create
    /// a new imbalance against a different neighbor, so the pass repeats
    /// until a sweep adds nothing.
    pub fn balance_pass<K: SpatialKey>(&self, leaves: &HashSet<K>) -> HashSet<K> {
        let mut current = leaves.clone();
        loop {
            let mut to_add = HashSet::new();
            for key in &current {
                for neighbor in key.neighbors() {
                    if current.contains(&neighbor) {
                        continue;
                    }
                    // The neighbor cell isn't a leaf in `current`; find the
                    // ancestor of `neighbor` that *is*, and if it is more
                    // than one level coarser than `key`, split it down to
                    // one level coarser instead of leaving the big gap.
                    let mut ancestor = neighbor;
                    while ancestor.level() > 0 && !current.contains(&ancestor) {
                        if let Some(p) = ancestor.parent() {
                            ancestor = p;
                        } else {
                            break;
                        }
                    }
                    if current.contains(&ancestor) && key.level() > ancestor.level() + 1 {
                        if let Some(refined) = self.refine_towards(ancestor, key.level() - 1) {
                            to_add.insert(refined);
                        }
                    }
                }
            }
            if to_add.is_empty() {
                return current;
            }
            current.extend(to_add);
        }
    }

    /// Split `key` down to `target_level` along its first child at each
    /// step, a cheap stand-in for "the child under the imbalanced
    /// neighbor" used only to guarantee the 2:1 invariant, not to pick a
    /// geometrically exact replacement cell.
    fn refine_towards<K: SpatialKey>(&self, key: K, target_level: u8) -> Option<K> {
        let mut cur = key;
        while cur.level() < target_level {
            cur = cur.child_at(0).ok()?;
        }
        Some(cur)
    }
}

impl Default for TreeBalancer {
    fn default() -> Self {
        TreeBalancer::new(DEFAULT_MAX_ENTITIES_PER_NODE, DEFAULT_MERGE_THRESHOLD)
    }
}
