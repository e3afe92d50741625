//! `Visitor`: the callback interface tree traversals report through,
//! instead of building an intermediate result `Vec` when the caller only
//! wants to react to each node or entity as it is reached.

use crate::types::EntityId;

/// What a visitor callback tells the traversal to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep going.
    Continue,
    /// From `node_pre`: skip this node's entities and subtree. From
    /// `entity`: skip this node's remaining entities.
    SkipSubtree,
    /// Stop the whole traversal.
    Terminate,
}

/// Receives nodes and entities as a traversal reaches them. Every hook
/// defaults to [`Flow::Continue`], so implementors only write the ones
/// they care about. Traversals run under the engine's read lock: a visitor
/// must not call back into the engine.
pub trait Visitor<K> {
    /// Called before a node's entities and children, with the parent key
    /// (`None` at the root) and the node's depth.
    fn node_pre(&mut self, _key: &K, _parent: Option<&K>, _depth: u8) -> Flow {
        Flow::Continue
    }

    /// Called once per entity filed at the current node.
    fn entity(&mut self, _key: &K, _id: EntityId) -> Flow {
        Flow::Continue
    }

    /// Called after a node's subtree (depth-first) or after its children
    /// are enqueued (breadth-first).
    fn node_post(&mut self, _key: &K, _depth: u8) -> Flow {
        Flow::Continue
    }
}

/// The simplest visitor: collect every entity into a `Vec`.
#[derive(Default)]
pub struct CollectVisitor {
    pub found: Vec<EntityId>,
}

impl CollectVisitor {
    pub fn new() -> Self {
        CollectVisitor { found: Vec::new() }
    }
}

impl<K> Visitor<K> for CollectVisitor {
    fn entity(&mut self, _key: &K, id: EntityId) -> Flow {
        self.found.push(id);
        Flow::Continue
    }
}

/// Terminates the traversal after `limit` entities, keeping what was seen.
pub struct LimitedVisitor<V> {
    inner: V,
    limit: usize,
    seen: usize,
}

impl<V> LimitedVisitor<V> {
    pub fn new(inner: V, limit: usize) -> Self {
        LimitedVisitor { inner, limit, seen: 0 }
    }

    pub fn into_inner(self) -> V {
        self.inner
    }
}

impl<K, V: Visitor<K>> Visitor<K> for LimitedVisitor<V> {
    fn node_pre(&mut self, key: &K, parent: Option<&K>, depth: u8) -> Flow {
        self.inner.node_pre(key, parent, depth)
    }

    fn entity(&mut self, key: &K, id: EntityId) -> Flow {
        if self.seen >= self.limit {
            return Flow::Terminate;
        }
        self.seen += 1;
        self.inner.entity(key, id)
    }

    fn node_post(&mut self, key: &K, depth: u8) -> Flow {
        self.inner.node_post(key, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_visitor_gathers_all() {
        let mut v = CollectVisitor::new();
        for i in 0..3u64 {
            assert_eq!(Visitor::<u32>::entity(&mut v, &0u32, EntityId::new(i)), Flow::Continue);
        }
        assert_eq!(v.found.len(), 3);
    }

    #[test]
    fn limited_visitor_terminates_at_limit() {
        let mut v = LimitedVisitor::new(CollectVisitor::new(), 2);
        assert_eq!(Visitor::<u32>::entity(&mut v, &0u32, EntityId::new(1)), Flow::Continue);
        assert_eq!(Visitor::<u32>::entity(&mut v, &0u32, EntityId::new(2)), Flow::Continue);
        assert_eq!(Visitor::<u32>::entity(&mut v, &0u32, EntityId::new(3)), Flow::Terminate);
        assert_eq!(v.into_inner().found.len(), 2);
    }

    #[test]
    fn default_hooks_continue() {
        struct Noop;
        impl Visitor<u32> for Noop {}
        let mut v = Noop;
        assert_eq!(v.node_pre(&0, None, 0), Flow::Continue);
        assert_eq!(v.entity(&0, EntityId::new(1)), Flow::Continue);
        assert_eq!(v.node_post(&0, 0), Flow::Continue);
    }
}
