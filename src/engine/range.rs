//! `LazyRangeIterator`: incremental axis-aligned range query.
//!
//! Enumerates entities whose node's key falls under a cell intersecting the
//! query box by walking the key hierarchy with an explicit stack (not
//! recursion, and not a single eager collect-then-filter pass) so a caller
//! that only wants the first few hits doesn't pay for the rest — the
//! skip-ahead a LITMAX/BIGMIN range scan gives an SFC-ordered index, here
//! achieved by pruning whole subtrees whose `node_aabb` misses the query
//! box instead of visiting every descendant.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use crate::key::SpatialKey;
use crate::node::Node;
use crate::types::{Aabb, Domain, EntityId};

pub struct LazyRangeIterator<'a, K> {
    nodes: &'a BTreeMap<K, Node>,
    domain: &'a Domain,
    query: Aabb,
    stack: Vec<K>,
    pending: VecDeque<EntityId>,
}

impl<'a, K: SpatialKey> LazyRangeIterator<'a, K> {
    pub fn new(nodes: &'a BTreeMap<K, Node>, domain: &'a Domain, query: Aabb) -> Self {
        LazyRangeIterator {
            nodes,
            domain,
            query,
            stack: vec![K::root()],
            pending: VecDeque::new(),
        }
    }

    fn advance(&mut self) {
        while self.pending.is_empty() {
            let key = match self.stack.pop() {
                Some(k) => k,
                None => return,
            };

            let aabb = key.node_aabb(self.domain);
            if !aabb.intersects(&self.query) {
                continue;
            }

            if let Some(node) = self.nodes.get(&key) {
                for &entity in &node.entities {
                    self.pending.push_back(entity);
                }
                if node.has_any_children() {
                    if let Ok(children) = key.children() {
                        for (i, child) in children.into_iter().enumerate() {
                            if node.has_child(i as u8) {
                                self.stack.push(child);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<'a, K: SpatialKey> Iterator for LazyRangeIterator<'a, K> {
    type Item = EntityId;

    fn next(&mut self) -> Option<EntityId> {
        self.advance();
        self.pending.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonKey;

    fn link_under_root(nodes: &mut BTreeMap<MortonKey, Node>, key: MortonKey) {
        let mut cur = key;
        while let Some(parent) = cur.parent() {
            let idx = parent
                .children()
                .unwrap()
                .iter()
                .position(|c| *c == cur)
                .unwrap() as u8;
            nodes.entry(parent).or_insert_with(Node::new).set_child(idx);
            cur = parent;
        }
    }

    #[test]
    fn range_query_finds_entity_in_intersecting_cell() {
        let domain = Domain::unit();
        let mut nodes: BTreeMap<MortonKey, Node> = BTreeMap::new();
        let key = MortonKey::from_point(&[0.1, 0.1, 0.1], 3, &domain).unwrap();
        link_under_root(&mut nodes, key);
        nodes.entry(key).or_insert_with(Node::new).add_entity(EntityId::new(1));

        let query = Aabb::new([0.0, 0.0, 0.0], [0.2, 0.2, 0.2]);
        let found: Vec<EntityId> = LazyRangeIterator::new(&nodes, &domain, query).collect();
        assert_eq!(found, vec![EntityId::new(1)]);
    }

    #[test]
    fn range_query_skips_disjoint_subtree() {
        let domain = Domain::unit();
        let mut nodes: BTreeMap<MortonKey, Node> = BTreeMap::new();
        let near = MortonKey::from_point(&[0.1, 0.1, 0.1], 3, &domain).unwrap();
        let far = MortonKey::from_point(&[0.9, 0.9, 0.9], 3, &domain).unwrap();

        link_under_root(&mut nodes, near);
        link_under_root(&mut nodes, far);
        nodes.entry(near).or_insert_with(Node::new).add_entity(EntityId::new(1));
        nodes.entry(far).or_insert_with(Node::new).add_entity(EntityId::new(2));

        let query = Aabb::new([0.0, 0.0, 0.0], [0.3, 0.3, 0.3]);
        let found: Vec<EntityId> = LazyRangeIterator::new(&nodes, &domain, query).collect();
        assert_eq!(found, vec![EntityId::new(1)]);
    }
}
