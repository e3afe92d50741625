//! `IndexEngine<K, C>`: the generic, backend-agnostic spatial index.
//!
//! One engine-wide `parking_lot::RwLock` guards the key-to-node map and the
//! entity store together: readers (queries) run concurrently with each
//! other, writers (insert/remove/update, bulk load, balance) take exclusive
//! access. `parking_lot::RwLock` is poison-free, so a panicking writer
//! cannot wedge every future reader the way a poisoned `std::sync::RwLock`
//! would.

pub mod backend;
pub mod balance;
pub mod bulk;
pub mod query;
pub mod range;
pub mod visitor;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use log::{debug, info};
use parking_lot::RwLock;

use crate::collision::{self, Contact};
use crate::constants::{
    DEFAULT_MAX_DEPTH, DEFAULT_MAX_ENTITIES_PER_NODE, DEFAULT_MERGE_THRESHOLD, MAX_LEVEL,
};
use crate::entity::{EntityRecord, EntityStore, SpanPolicy};
use crate::error::{Error, Result};
use crate::key::SpatialKey;
use crate::node::Node;
use crate::pool::ObjectPool;
use crate::types::{Aabb, Domain, EntityId, Frustum, Plane, Point, PointType, Ray, Shape};

use backend::SpatialBackend;
use balance::TreeBalancer;
use bulk::BulkLoader;
use range::LazyRangeIterator;
use visitor::{Flow, Visitor};

/// Engine-wide knobs, fixed at construction.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// A leaf holding more than this many entities subdivides.
    pub max_entities_per_node: u16,
    /// Hard depth cap; leaves at this level never subdivide.
    pub max_depth: u8,
    /// How bounded entities are filed (point entities always occupy one
    /// cell).
    pub span_policy: SpanPolicy,
    /// Sibling leaves whose combined count is at most this merge back into
    /// their parent during [`IndexEngine::rebalance`].
    pub merge_threshold: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_entities_per_node: DEFAULT_MAX_ENTITIES_PER_NODE,
            max_depth: DEFAULT_MAX_DEPTH,
            span_policy: SpanPolicy::SpanCells,
            merge_threshold: DEFAULT_MERGE_THRESHOLD,
        }
    }
}

/// Outcome of a [`IndexEngine::bulk_load`] call: ids of the entities that
/// went in, in input order, plus the input indices that were skipped for
/// having out-of-domain coordinates.
#[derive(Debug)]
pub struct BulkLoadResult {
    pub inserted: Vec<EntityId>,
    pub skipped: Vec<usize>,
}

/// State guarded by the engine's single read-write lock.
struct EngineState<K, C> {
    nodes: BTreeMap<K, Node>,
    entities: EntityStore<K, C>,
}

pub struct IndexEngine<K, C = ()> {
    backend: SpatialBackend<K>,
    balancer: TreeBalancer,
    config: EngineConfig,
    scratch: ObjectPool<Vec<K>>,
    state: RwLock<EngineState<K, C>>,
}

impl<K: SpatialKey, C: Clone + Send + Sync> IndexEngine<K, C> {
    pub fn new(domain: Domain) -> Self {
        Self::with_config(domain, EngineConfig::default())
    }

    pub fn with_config(domain: Domain, mut config: EngineConfig) -> Self {
        config.max_depth = config.max_depth.min(MAX_LEVEL);
        let mut nodes = BTreeMap::new();
        nodes.insert(K::root(), Node::new());
        IndexEngine {
            backend: SpatialBackend::new(domain),
            balancer: TreeBalancer::new(config.max_entities_per_node, config.merge_threshold),
            config,
            scratch: ObjectPool::new(),
            state: RwLock::new(EngineState { nodes, entities: EntityStore::new() }),
        }
    }

    pub fn domain(&self) -> &Domain {
        self.backend.domain()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    /// Insert a point entity, filing it into the current leaf along its
    /// position's path.
    pub fn insert(&self, position: [PointType; 3], content: C) -> Result<EntityId> {
        self.insert_at(position, 0, content)
    }

    /// Insert a point entity no coarser than `level`.
    pub fn insert_at(&self, position: [PointType; 3], level: u8, content: C) -> Result<EntityId> {
        let mut state = self.state.write();
        let id = state.entities.allocate_id();
        self.insert_record(&mut state, id, position, level, None, content)?;
        Ok(id)
    }

    /// Insert a bounded entity; under [`SpanPolicy::SpanCells`] it is filed
    /// at every intersecting leaf cell.
    pub fn insert_shape(
        &self,
        position: [PointType; 3],
        shape: Shape,
        content: C,
    ) -> Result<EntityId> {
        self.insert_shape_at(position, self.config.max_depth, shape, content)
    }

    pub fn insert_shape_at(
        &self,
        position: [PointType; 3],
        level: u8,
        shape: Shape,
        content: C,
    ) -> Result<EntityId> {
        let mut state = self.state.write();
        let id = state.entities.allocate_id();
        self.insert_record(&mut state, id, position, level, Some(shape), content)?;
        Ok(id)
    }

    /// Insert under a caller-chosen id. Fails with `EntityAlreadyExists` if
    /// the id is live.
    pub fn insert_with_id(
        &self,
        id: EntityId,
        position: [PointType; 3],
        level: u8,
        shape: Option<Shape>,
        content: C,
    ) -> Result<()> {
        let mut state = self.state.write();
        self.insert_record(&mut state, id, position, level, shape, content)
    }

    pub fn remove(&self, id: EntityId) -> Result<()> {
        let mut state = self.state.write();
        let record = state.entities.remove(id)?;
        for key in &record.occupying_keys {
            if let Some(node) = state.nodes.get_mut(key) {
                node.remove_entity(id);
            }
            self.prune_upward(&mut state, *key);
        }
        Ok(())
    }

    /// Move an entity. When the new position maps to the entity's current
    /// cell only the stored position changes; otherwise the entity is
    /// unfiled and refiled under the write lock, so readers never observe a
    /// half-moved entity.
    pub fn update(&self, id: EntityId, new_position: [PointType; 3], level: u8) -> Result<()> {
        let mut state = self.state.write();
        {
            let record = state.entities.get(id)?;
            if record.shape.is_none() && record.occupying_keys.len() == 1 {
                let old_key = record.occupying_keys[0];
                let new_key = self.backend.key_for_point(&new_position, old_key.level())?;
                if new_key == old_key {
                    state.entities.get_mut(id)?.position = new_position;
                    return Ok(());
                }
            }
        }

        // Validate the destination before touching the tree.
        self.backend.key_for_point(&new_position, level)?;
        let record = state.entities.remove(id)?;
        for key in &record.occupying_keys {
            if let Some(node) = state.nodes.get_mut(key) {
                node.remove_entity(id);
            }
            self.prune_upward(&mut state, *key);
        }
        self.insert_record(&mut state, id, new_position, level, record.shape, record.content)
    }

    pub fn update_position(&self, id: EntityId, new_position: [PointType; 3]) -> Result<()> {
        self.update(id, new_position, 0)
    }

    /// The entity ids filed at the cell containing `position` at `level`,
    /// exactly as stored: entities that subdivision has pushed deeper are
    /// not folded back in.
    pub fn lookup(&self, position: &[PointType; 3], level: u8) -> Result<Vec<EntityId>> {
        let state = self.state.read();
        let key = self.backend.key_for_point(position, level)?;
        Ok(state.nodes.get(&key).map(|n| n.entities.clone()).unwrap_or_default())
    }

    pub fn content(&self, id: EntityId) -> Result<C> {
        let state = self.state.read();
        state.entities.get(id).map(|r| r.content.clone())
    }

    pub fn position(&self, id: EntityId) -> Result<[PointType; 3]> {
        let state = self.state.read();
        state.entities.get(id).map(|r| r.position)
    }

    /// The keys currently holding `id`.
    pub fn entity_keys(&self, id: EntityId) -> Result<Vec<K>> {
        let state = self.state.read();
        state.entities.get(id).map(|r| r.occupying_keys.clone())
    }

    /// Entities whose exact position (or bounds, for bounded entities)
    /// intersects `query`, in ascending id order.
    pub fn range_query(&self, query: Aabb) -> Vec<EntityId> {
        self.range_query_impl(query, None)
    }

    /// Cancellable range query: when `cancel` becomes true the partial
    /// result gathered so far is returned.
    pub fn range_query_with(&self, query: Aabb, cancel: &AtomicBool) -> Vec<EntityId> {
        self.range_query_impl(query, Some(cancel))
    }

    fn range_query_impl(&self, query: Aabb, cancel: Option<&AtomicBool>) -> Vec<EntityId> {
        let state = self.state.read();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in LazyRangeIterator::new(&state.nodes, self.backend.domain(), query) {
            if let Some(flag) = cancel {
                if flag.load(AtomicOrdering::Relaxed) {
                    break;
                }
            }
            if !seen.insert(id) {
                continue;
            }
            if let Ok(record) = state.entities.get(id) {
                let hit = match &record.shape {
                    None => query.contains_point(&record.position),
                    Some(shape) => {
                        shape_bounds(&record.position, Some(shape)).intersects(&query)
                    }
                };
                if hit {
                    out.push(id);
                }
            }
        }
        out.sort();
        out
    }

    /// The `k` entities nearest `query`, ascending by distance, ties by id.
    pub fn k_nearest(&self, query: &[PointType; 3], k: usize) -> Vec<EntityId> {
        self.k_nearest_impl(query, k, PointType::INFINITY, None)
    }

    /// As [`Self::k_nearest`], but ignoring entities farther than
    /// `max_dist`.
    pub fn k_nearest_within(
        &self,
        query: &[PointType; 3],
        k: usize,
        max_dist: PointType,
    ) -> Vec<EntityId> {
        self.k_nearest_impl(query, k, max_dist, None)
    }

    pub fn k_nearest_with(
        &self,
        query: &[PointType; 3],
        k: usize,
        max_dist: PointType,
        cancel: &AtomicBool,
    ) -> Vec<EntityId> {
        self.k_nearest_impl(query, k, max_dist, Some(cancel))
    }

    fn k_nearest_impl(
        &self,
        query: &[PointType; 3],
        k: usize,
        max_dist: PointType,
        cancel: Option<&AtomicBool>,
    ) -> Vec<EntityId> {
        let state = self.state.read();
        let mut stack = self.scratch.acquire();
        let out = query::k_nearest(
            &state.nodes,
            self.backend.domain(),
            &state.entities,
            query,
            k,
            max_dist * max_dist,
            cancel,
            &mut stack,
        );
        stack.clear();
        self.scratch.release(stack);
        out
    }

    /// Entities along `ray` within `max_t`, ordered by hit parameter:
    /// bounded entities by their shape's exact ray test, point entities by
    /// the parameter of the ray's closest approach.
    pub fn ray_intersect(&self, ray: &Ray, max_t: PointType) -> Vec<EntityId> {
        let state = self.state.read();
        let mut stack = self.scratch.acquire();
        let out = query::ray_intersect(
            &state.nodes,
            self.backend.domain(),
            &state.entities,
            ray,
            max_t,
            &mut stack,
        );
        stack.clear();
        self.scratch.release(stack);
        out
    }

    /// Entities inside or touching `frustum`, ascending by id.
    pub fn frustum_cull(&self, frustum: &Frustum) -> Vec<EntityId> {
        let state = self.state.read();
        let mut stack = self.scratch.acquire();
        let out = query::frustum_cull(
            &state.nodes,
            self.backend.domain(),
            &state.entities,
            frustum,
            &mut stack,
        );
        stack.clear();
        self.scratch.release(stack);
        out
    }

    /// Candidate entities in cells straddling `plane`, ascending by id.
    /// Bounded entities are filtered by their own bounds; point entities in
    /// a straddling cell are always reported, so callers wanting exact
    /// on-plane tests refine per entity.
    pub fn plane_intersect(&self, plane: &Plane) -> Vec<EntityId> {
        let state = self.state.read();
        let mut stack = self.scratch.acquire();
        let out = query::plane_cut(
            &state.nodes,
            self.backend.domain(),
            &state.entities,
            plane,
            &mut stack,
        );
        stack.clear();
        self.scratch.release(stack);
        out
    }

    /// Broad-phase over the index plus narrow-phase shape tests: every
    /// intersecting pair of bounded entities, ordered by descending
    /// penetration depth, ties by id pair. Entities without a shape do not
    /// collide.
    pub fn collide(&self) -> Vec<Contact> {
        let state = self.state.read();
        let mut contacts = Vec::new();
        let mut seen: HashSet<(EntityId, EntityId)> = HashSet::new();

        for record in state.entities.iter() {
            let shape = match &record.shape {
                Some(s) => s,
                None => continue,
            };
            let bounds = shape_bounds(&record.position, Some(shape));
            for other_id in
                LazyRangeIterator::new(&state.nodes, self.backend.domain(), bounds)
            {
                if other_id == record.id {
                    continue;
                }
                let pair = if record.id < other_id {
                    (record.id, other_id)
                } else {
                    (other_id, record.id)
                };
                if !seen.insert(pair) {
                    continue;
                }
                let other = match state.entities.get(other_id) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let other_shape = match &other.shape {
                    Some(s) => s,
                    None => continue,
                };
                if !bounds.intersects(&shape_bounds(&other.position, Some(other_shape))) {
                    continue;
                }
                let (first, second) = if record.id < other_id {
                    (shape, other_shape)
                } else {
                    (other_shape, shape)
                };
                if let Some(contact) = collision::contact(pair.0, pair.1, first, second) {
                    contacts.push(contact);
                }
            }
        }

        contacts.sort_by(|a, b| {
            b.penetration
                .partial_cmp(&a.penetration)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.a, a.b).cmp(&(b.a, b.b)))
        });
        contacts
    }

    /// Depth-first (pre-order) traversal with entity and post-order hooks.
    /// Visitors must not call back into the engine; the read lock is held
    /// throughout.
    pub fn traverse_depth_first<V: Visitor<K>>(&self, visitor: &mut V) {
        let state = self.state.read();
        Self::walk(&state, &K::root(), None, 0, visitor);
    }

    fn walk<V: Visitor<K>>(
        state: &EngineState<K, C>,
        key: &K,
        parent: Option<&K>,
        depth: u8,
        visitor: &mut V,
    ) -> Flow {
        let node = match state.nodes.get(key) {
            Some(n) => n,
            None => return Flow::Continue,
        };
        match visitor.node_pre(key, parent, depth) {
            Flow::Terminate => return Flow::Terminate,
            Flow::SkipSubtree => return Flow::Continue,
            Flow::Continue => {}
        }
        for &id in &node.entities {
            match visitor.entity(key, id) {
                Flow::Terminate => return Flow::Terminate,
                Flow::SkipSubtree => break,
                Flow::Continue => {}
            }
        }
        if node.has_any_children() {
            if let Ok(children) = key.children() {
                for (i, child) in children.iter().enumerate() {
                    if node.has_child(i as u8)
                        && Self::walk(state, child, Some(key), depth + 1, visitor)
                            == Flow::Terminate
                    {
                        return Flow::Terminate;
                    }
                }
            }
        }
        visitor.node_post(key, depth)
    }

    /// Breadth-first (level-order) traversal with the same hooks.
    pub fn traverse_breadth_first<V: Visitor<K>>(&self, visitor: &mut V) {
        let state = self.state.read();
        let mut queue: VecDeque<(K, Option<K>, u8)> = VecDeque::new();
        queue.push_back((K::root(), None, 0));

        while let Some((key, parent, depth)) = queue.pop_front() {
            let node = match state.nodes.get(&key) {
                Some(n) => n,
                None => continue,
            };
            match visitor.node_pre(&key, parent.as_ref(), depth) {
                Flow::Terminate => return,
                Flow::SkipSubtree => continue,
                Flow::Continue => {}
            }
            for &id in &node.entities {
                match visitor.entity(&key, id) {
                    Flow::Terminate => return,
                    Flow::SkipSubtree => break,
                    Flow::Continue => {}
                }
            }
            if node.has_any_children() {
                if let Ok(children) = key.children() {
                    for (i, child) in children.into_iter().enumerate() {
                        if node.has_child(i as u8) {
                            queue.push_back((child, Some(key), depth + 1));
                        }
                    }
                }
            }
            if visitor.node_post(&key, depth) == Flow::Terminate {
                return;
            }
        }
    }

    /// Discard the current tree and rebuild it from `points` via
    /// [`BulkLoader`]: leaves are laid out first from the sorted key runs,
    /// then entities are filed straight into them with no per-entity
    /// subdivision checks.
    pub fn bulk_load(&self, points: &[Point]) -> BulkLoadResult
    where
        C: Default,
    {
        let loader =
            BulkLoader::<K>::new(*self.backend.domain(), self.config.max_entities_per_node as usize);
        let outcome = loader.build(points);

        let mut state = self.state.write();
        state.nodes.clear();
        state.nodes.insert(K::root(), Node::new());
        state.entities = EntityStore::new();

        let leaf_set: HashSet<K> = outcome.leaves.iter().copied().collect();
        for key in &outcome.leaves {
            self.ensure_path(&mut state, *key);
        }

        let mut skipped_flags = vec![false; points.len()];
        for &i in &outcome.skipped {
            if i < points.len() {
                skipped_flags[i] = true;
            }
        }

        let mut inserted = Vec::with_capacity(points.len().saturating_sub(outcome.skipped.len()));
        for (i, point) in points.iter().enumerate() {
            if skipped_flags[i] {
                continue;
            }
            let deepest = match self.backend.key_for_point(&point.coord, MAX_LEVEL) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let mut target = deepest;
            while !leaf_set.contains(&target) {
                match target.parent() {
                    Some(p) => target = p,
                    None => break,
                }
            }
            let id = state.entities.allocate_id();
            if let Some(node) = state.nodes.get_mut(&target) {
                node.add_entity(id);
            }
            let _ = state.entities.insert(EntityRecord {
                id,
                content: C::default(),
                position: point.coord,
                shape: None,
                occupying_keys: vec![target],
            });
            inserted.push(id);
        }

        info!(
            "bulk load filed {} entities into {} leaves ({} skipped)",
            inserted.len(),
            outcome.leaves.len(),
            outcome.skipped.len()
        );
        BulkLoadResult { inserted, skipped: outcome.skipped }
    }

    /// Run a 2:1 balance pass over the current leaves, carving paths for
    /// any cells the pass adds.
    pub fn balance(&self) {
        let mut state = self.state.write();
        let leaves: HashSet<K> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.is_leaf())
            .map(|(k, _)| *k)
            .collect();
        let balanced = self.balancer.balance_pass(&leaves);

        let mut pending = Vec::new();
        for key in balanced {
            if !state.nodes.contains_key(&key) {
                pending.extend(self.ensure_path(&mut state, key));
            }
        }
        let mut seeds = Vec::new();
        for key in pending {
            seeds.extend(self.subdivide(&mut state, key));
        }
        self.split_cascade(&mut state, seeds);
    }

    /// Opt-in merge pass: sibling leaves whose combined entity count is at
    /// most the merge threshold (and that have no children of their own)
    /// collapse into their parent. Deepest nodes are considered first so a
    /// merge can cascade upward within a single pass.
    pub fn rebalance(&self) {
        let mut state = self.state.write();
        let mut keys: Vec<K> = state.nodes.keys().copied().collect();
        keys.sort_by(|a, b| b.level().cmp(&a.level()));

        for key in keys {
            let mergeable = {
                let node = match state.nodes.get(&key) {
                    Some(n) => n,
                    None => continue,
                };
                if node.is_leaf() {
                    continue;
                }
                let children = match key.children() {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                let mut combined = node.entities.len();
                let mut all_leaves = true;
                for (i, child) in children.iter().enumerate() {
                    if !node.has_child(i as u8) {
                        continue;
                    }
                    match state.nodes.get(child) {
                        Some(child_node) if child_node.is_leaf() => {
                            combined += child_node.entities.len()
                        }
                        _ => {
                            all_leaves = false;
                            break;
                        }
                    }
                }
                all_leaves && self.balancer.should_merge(combined)
            };
            if mergeable {
                self.merge_children(&mut state, key);
            }
        }
    }

    fn merge_children(&self, state: &mut EngineState<K, C>, key: K) {
        let children = match key.children() {
            Ok(c) => c,
            Err(_) => return,
        };
        debug!("merging children of level-{} node", key.level());
        for child in children {
            let child_ids = match state.nodes.remove(&child) {
                Some(node) => node.entities,
                None => continue,
            };
            for id in child_ids {
                if let Ok(record) = state.entities.get_mut(id) {
                    record.occupying_keys.retain(|k| k != &child);
                    if !record.occupying_keys.contains(&key) {
                        record.occupying_keys.push(key);
                    }
                }
                if let Some(node) = state.nodes.get_mut(&key) {
                    if !node.contains_entity(id) {
                        node.add_entity(id);
                    }
                }
            }
        }
        if let Some(node) = state.nodes.get_mut(&key) {
            node.children_mask = 0;
        }
    }

    fn insert_record(
        &self,
        state: &mut EngineState<K, C>,
        id: EntityId,
        position: [PointType; 3],
        level: u8,
        shape: Option<Shape>,
        content: C,
    ) -> Result<()> {
        if level > self.config.max_depth {
            return Err(Error::InvalidLevel { level, max: self.config.max_depth });
        }
        if state.entities.contains(id) {
            return Err(Error::EntityAlreadyExists(id));
        }
        // Validate the coordinate before mutating anything.
        self.backend.key_for_point(&position, level)?;

        state.entities.insert(EntityRecord {
            id,
            content,
            position,
            shape: shape.clone(),
            occupying_keys: Vec::new(),
        })?;

        let spans = shape.is_some() && self.config.span_policy == SpanPolicy::SpanCells;
        if spans {
            let bounds = shape_bounds(&position, shape.as_ref());
            let keys = self.span_keys(state, &bounds, level);
            let mut pending = Vec::new();
            for key in &keys {
                pending.extend(self.ensure_path(state, *key));
            }
            for key in &keys {
                if let Some(node) = state.nodes.get_mut(key) {
                    if !node.contains_entity(id) {
                        node.add_entity(id);
                    }
                }
            }
            if let Ok(record) = state.entities.get_mut(id) {
                record.occupying_keys = keys.clone();
            }
            let mut seeds = keys;
            for key in pending {
                seeds.extend(self.subdivide(state, key));
            }
            self.split_cascade(state, seeds);
            debug!("inserted bounded entity {} at level {}", id, level);
        } else {
            let (key, pending) = self.file_point(state, id, &position, level)?;
            if let Ok(record) = state.entities.get_mut(id) {
                record.occupying_keys.push(key);
            }
            let mut seeds = Vec::new();
            for k in pending {
                seeds.extend(self.subdivide(state, k));
            }
            seeds.push(key);
            self.split_cascade(state, seeds);
        }
        Ok(())
    }

    /// File a point entity at the current leaf along its path, starting no
    /// coarser than `level`. Returns the chosen key plus any nodes the new
    /// path turned from populated leaves into internal nodes.
    fn file_point(
        &self,
        state: &mut EngineState<K, C>,
        id: EntityId,
        position: &[PointType; 3],
        level: u8,
    ) -> Result<(K, Vec<K>)> {
        let mut key = self.backend.key_for_point(position, level)?;
        let mut pending = self.ensure_path(state, key);

        while key.level() < self.config.max_depth {
            let descend =
                state.nodes.get(&key).map(|n| n.has_any_children()).unwrap_or(false);
            if !descend {
                break;
            }
            key = self.backend.key_for_point(position, key.level() + 1)?;
            pending.extend(self.ensure_path(state, key));
        }

        if let Some(node) = state.nodes.get_mut(&key) {
            node.add_entity(id);
        }
        Ok((key, pending))
    }

    /// The leaf cells of the current tree intersecting `bounds`, no deeper
    /// than `level`.
    fn span_keys(&self, state: &EngineState<K, C>, bounds: &Aabb, level: u8) -> Vec<K> {
        let mut out = Vec::new();
        let mut stack = vec![K::root()];
        while let Some(key) = stack.pop() {
            if !self.backend.node_aabb(&key).intersects(bounds) {
                continue;
            }
            let descend = key.level() < level
                && state.nodes.get(&key).map(|n| n.has_any_children()).unwrap_or(false);
            if descend {
                if let Ok(children) = key.children() {
                    stack.extend(children);
                }
            } else {
                out.push(key);
            }
        }
        out.sort();
        out
    }

    /// Create every node from the root down to `key`, linking child bits
    /// along the way. Returns the nodes that were populated leaves before
    /// this path made them internal; their entities must be pushed down.
    fn ensure_path(&self, state: &mut EngineState<K, C>, key: K) -> Vec<K> {
        let mut chain: Vec<K> = key.ancestors();
        chain.reverse();
        chain.push(key);

        let mut freshly_internal = Vec::new();
        state.nodes.entry(chain[0]).or_insert_with(Node::new);
        for pair in chain.windows(2) {
            let (parent, child) = (pair[0], pair[1]);
            state.nodes.entry(child).or_insert_with(Node::new);
            if let Some(idx) = child_slot(&parent, &child) {
                if let Some(parent_node) = state.nodes.get_mut(&parent) {
                    if !parent_node.has_child(idx) {
                        if parent_node.is_leaf() && !parent_node.entities.is_empty() {
                            freshly_internal.push(parent);
                        }
                        parent_node.set_child(idx);
                    }
                }
            }
        }
        freshly_internal
    }

    /// Push every entity filed at `key` down a level: point entities to the
    /// current leaf containing them, bounded entities to every child their
    /// bounds intersect. Returns the child keys that received entities.
    fn subdivide(&self, state: &mut EngineState<K, C>, key: K) -> Vec<K> {
        let ids = match state.nodes.get_mut(&key) {
            Some(node) => std::mem::take(&mut node.entities),
            None => return Vec::new(),
        };
        if ids.is_empty() {
            return Vec::new();
        }
        debug!("subdividing level-{} node holding {} entities", key.level(), ids.len());

        let mut touched: Vec<K> = Vec::new();
        for id in ids {
            let (position, shape) = match state.entities.get(id) {
                Ok(r) => (r.position, r.shape.clone()),
                Err(_) => continue,
            };

            let targets: Vec<K> =
                if shape.is_some() && self.config.span_policy == SpanPolicy::SpanCells {
                    let bounds = shape_bounds(&position, shape.as_ref());
                    key.children()
                        .map(|children| {
                            children
                                .into_iter()
                                .filter(|c| self.backend.node_aabb(c).intersects(&bounds))
                                .collect()
                        })
                        .unwrap_or_default()
                } else {
                    match self.descend_key(state, &position, key.level() + 1) {
                        Some(k) => vec![k],
                        None => Vec::new(),
                    }
                };

            if targets.is_empty() {
                // Nothing to move to (depth cap or an unmappable position);
                // the entity stays where it was.
                if let Some(node) = state.nodes.get_mut(&key) {
                    node.add_entity(id);
                }
                continue;
            }

            if let Ok(record) = state.entities.get_mut(id) {
                record.occupying_keys.retain(|k| k != &key);
            }
            for child in &targets {
                self.ensure_path(state, *child);
                if let Some(node) = state.nodes.get_mut(child) {
                    if !node.contains_entity(id) {
                        node.add_entity(id);
                    }
                }
                if let Ok(record) = state.entities.get_mut(id) {
                    record.occupying_keys.push(*child);
                }
                if !touched.contains(child) {
                    touched.push(*child);
                }
            }
        }
        touched
    }

    /// The current leaf for `position`, starting the descent at `level`.
    fn descend_key(
        &self,
        state: &EngineState<K, C>,
        position: &[PointType; 3],
        level: u8,
    ) -> Option<K> {
        if level > self.config.max_depth {
            return None;
        }
        let mut key = self.backend.key_for_point(position, level).ok()?;
        while key.level() < self.config.max_depth {
            let descend =
                state.nodes.get(&key).map(|n| n.has_any_children()).unwrap_or(false);
            if !descend {
                break;
            }
            key = self.backend.key_for_point(position, key.level() + 1).ok()?;
        }
        Some(key)
    }

    /// Split any seed leaf over the entity threshold, cascading into the
    /// children that overflow in turn. Only point entities count towards
    /// the threshold: a stack of overlapping bounded entities spans every
    /// child of any cell it lands in, so splitting on them alone would
    /// recurse to the depth cap without ever thinning a node.
    fn split_cascade(&self, state: &mut EngineState<K, C>, seeds: Vec<K>) {
        let mut stack = seeds;
        while let Some(key) = stack.pop() {
            if key.level() >= self.config.max_depth {
                continue;
            }
            let over = match state.nodes.get(&key) {
                Some(node) if node.is_leaf() => {
                    let points = node
                        .entities
                        .iter()
                        .filter(|id| {
                            state.entities.get(**id).map(|r| r.shape.is_none()).unwrap_or(false)
                        })
                        .count();
                    self.balancer.should_split(points)
                }
                _ => false,
            };
            if over {
                stack.extend(self.subdivide(state, key));
            }
        }
    }

    /// Delete `key` and its ancestors while they are empty, childless
    /// leaves, clearing each parent's child bit on the way up.
    fn prune_upward(&self, state: &mut EngineState<K, C>, key: K) {
        let mut cur = key;
        while cur.level() > 0 {
            let removable = state
                .nodes
                .get(&cur)
                .map(|n| n.is_leaf() && n.entities.is_empty())
                .unwrap_or(false);
            if !removable {
                return;
            }
            state.nodes.remove(&cur);
            let parent = match cur.parent() {
                Some(p) => p,
                None => return,
            };
            if let Some(idx) = child_slot(&parent, &cur) {
                if let Some(parent_node) = state.nodes.get_mut(&parent) {
                    parent_node.clear_child(idx);
                }
            }
            cur = parent;
        }
    }
}

fn child_slot<K: SpatialKey>(parent: &K, child: &K) -> Option<u8> {
    parent
        .children()
        .ok()?
        .iter()
        .position(|c| c == child)
        .map(|i| i as u8)
}

/// The conservative world-space bounds of an entity: a degenerate box for a
/// point, the enclosing box for each bounded shape.
pub(crate) fn shape_bounds(position: &[PointType; 3], shape: Option<&Shape>) -> Aabb {
    match shape {
        None => Aabb::from_center_half_extent(*position, [0.0; 3]),
        Some(shape) => collision::shape_aabb(shape),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonKey;
    use crate::tet::TetKey;
    use crate::types::Sphere;

    #[test]
    fn insert_then_range_query_finds_point() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let id = engine.insert([0.2, 0.2, 0.2], ()).unwrap();
        let found = engine.range_query(Aabb::new([0.0, 0.0, 0.0], [0.5, 0.5, 0.5]));
        assert_eq!(found, vec![id]);
    }

    #[test]
    fn remove_makes_entity_unfindable_and_prunes_nodes() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let id = engine.insert_at([0.2, 0.2, 0.2], 6, ()).unwrap();
        assert!(engine.node_count() > 1);
        engine.remove(id).unwrap();
        let found = engine.range_query(Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]));
        assert!(found.is_empty());
        assert_eq!(engine.node_count(), 1, "empty branches are deleted");
    }

    #[test]
    fn update_position_moves_entity() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let id = engine.insert_at([0.1, 0.1, 0.1], 4, ()).unwrap();
        engine.update(id, [0.9, 0.9, 0.9], 4).unwrap();
        let near_old = engine.range_query(Aabb::new([0.0, 0.0, 0.0], [0.2, 0.2, 0.2]));
        let near_new = engine.range_query(Aabb::new([0.8, 0.8, 0.8], [1.0, 1.0, 1.0]));
        assert!(near_old.is_empty());
        assert_eq!(near_new, vec![id]);
    }

    #[test]
    fn out_of_domain_insert_errors_without_mutating() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        assert!(matches!(engine.insert([2.0, 0.0, 0.0], ()), Err(Error::OutOfDomain(_))));
        assert!(engine.is_empty());
        assert_eq!(engine.node_count(), 1);
    }

    #[test]
    fn explicit_id_collision_is_rejected() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let id = EntityId::new(42);
        engine.insert_with_id(id, [0.3, 0.3, 0.3], 0, None, ()).unwrap();
        assert!(matches!(
            engine.insert_with_id(id, [0.6, 0.6, 0.6], 0, None, ()),
            Err(Error::EntityAlreadyExists(_))
        ));
    }

    #[test]
    fn lookup_returns_entities_at_exact_cell() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let a = engine.insert_at([0.1, 0.1, 0.1], 3, ()).unwrap();
        let _b = engine.insert_at([0.9, 0.9, 0.9], 3, ()).unwrap();
        assert_eq!(engine.lookup(&[0.1, 0.1, 0.1], 3).unwrap(), vec![a]);
        assert!(engine.lookup(&[0.5, 0.1, 0.1], 3).unwrap().is_empty());
    }

    #[test]
    fn content_round_trips() {
        let engine: IndexEngine<MortonKey, String> = IndexEngine::new(Domain::unit());
        let id = engine.insert([0.4, 0.4, 0.4], "hello".to_string()).unwrap();
        assert_eq!(engine.content(id).unwrap(), "hello");
    }

    #[test]
    fn overflow_subdivides_and_leaves_respect_threshold() {
        let config = EngineConfig { max_entities_per_node: 2, ..EngineConfig::default() };
        let engine: IndexEngine<MortonKey> = IndexEngine::with_config(Domain::unit(), config);
        let points = [
            [0.1, 0.1, 0.1],
            [0.2, 0.2, 0.2],
            [0.6, 0.6, 0.6],
            [0.9, 0.9, 0.9],
            [0.8, 0.2, 0.4],
        ];
        for p in points {
            engine.insert(p, ()).unwrap();
        }

        struct LeafCheck {
            counts: Vec<usize>,
            max_seen: usize,
            total: usize,
        }
        impl Visitor<MortonKey> for LeafCheck {
            fn node_pre(
                &mut self,
                _key: &MortonKey,
                _parent: Option<&MortonKey>,
                _depth: u8,
            ) -> Flow {
                self.counts.push(0);
                Flow::Continue
            }
            fn entity(&mut self, _key: &MortonKey, _id: EntityId) -> Flow {
                if let Some(count) = self.counts.last_mut() {
                    *count += 1;
                }
                self.total += 1;
                Flow::Continue
            }
            fn node_post(&mut self, _key: &MortonKey, _depth: u8) -> Flow {
                if let Some(count) = self.counts.pop() {
                    self.max_seen = self.max_seen.max(count);
                }
                Flow::Continue
            }
        }
        let mut check = LeafCheck { counts: Vec::new(), max_seen: 0, total: 0 };
        engine.traverse_depth_first(&mut check);
        assert_eq!(check.total, points.len());
        assert!(check.max_seen <= 2, "no node holds more than the threshold");
    }

    #[test]
    fn k_nearest_orders_by_distance() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let far = engine.insert([0.9, 0.9, 0.9], ()).unwrap();
        let near = engine.insert([0.1, 0.1, 0.1], ()).unwrap();
        let result = engine.k_nearest(&[0.0, 0.0, 0.0], 2);
        assert_eq!(result, vec![near, far]);
    }

    #[test]
    fn k_nearest_within_honors_max_dist() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let near = engine.insert([0.1, 0.1, 0.1], ()).unwrap();
        let _far = engine.insert([0.9, 0.9, 0.9], ()).unwrap();
        let result = engine.k_nearest_within(&[0.0, 0.0, 0.0], 5, 0.5);
        assert_eq!(result, vec![near]);
    }

    #[test]
    fn cancelled_range_query_returns_partial_result() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        for i in 0..10 {
            engine.insert([0.05 * (i as f64 + 1.0); 3], ()).unwrap();
        }
        let cancel = AtomicBool::new(true);
        let out = engine.range_query_with(Aabb::new([0.0; 3], [1.0; 3]), &cancel);
        assert!(out.is_empty(), "pre-cancelled query yields nothing");
    }

    #[test]
    fn bounded_entity_spans_multiple_leaves_after_subdivision() {
        let config = EngineConfig { max_entities_per_node: 1, ..EngineConfig::default() };
        let engine: IndexEngine<MortonKey> = IndexEngine::with_config(Domain::unit(), config);
        // Two points force a split of the root region.
        engine.insert_at([0.2, 0.2, 0.2], 1, ()).unwrap();
        engine.insert_at([0.8, 0.8, 0.8], 1, ()).unwrap();

        let shape = Shape::Sphere(Sphere { center: [0.5, 0.5, 0.5], radius: 0.2 });
        let id = engine.insert_shape([0.5, 0.5, 0.5], shape, ()).unwrap();
        let keys = engine.entity_keys(id).unwrap();
        assert!(!keys.is_empty());
        let bounds = Aabb::from_center_half_extent([0.5, 0.5, 0.5], [0.2; 3]);
        let domain = Domain::unit();
        for key in keys {
            assert!(key.node_aabb(&domain).intersects(&bounds));
        }
    }

    #[test]
    fn rebalance_merges_sparse_siblings() {
        let config = EngineConfig {
            max_entities_per_node: 1,
            merge_threshold: 4,
            ..EngineConfig::default()
        };
        let engine: IndexEngine<MortonKey> = IndexEngine::with_config(Domain::unit(), config);
        let a = engine.insert_at([0.1, 0.1, 0.1], 1, ()).unwrap();
        let b = engine.insert_at([0.9, 0.9, 0.9], 1, ()).unwrap();
        engine.remove(b).unwrap();
        engine.rebalance();
        // Whatever the final shape, the surviving entity stays reachable.
        let found = engine.range_query(Aabb::new([0.0; 3], [0.5; 3]));
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn bulk_load_reports_skipped_inputs() {
        let engine: IndexEngine<MortonKey> = IndexEngine::new(Domain::unit());
        let points = vec![
            Point { coord: [0.1, 0.1, 0.1], global_idx: 0 },
            Point { coord: [5.0, 0.1, 0.1], global_idx: 1 },
            Point { coord: [0.9, 0.9, 0.9], global_idx: 2 },
        ];
        let result = engine.bulk_load(&points);
        assert_eq!(result.inserted.len(), 2);
        assert_eq!(result.skipped, vec![1]);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn tet_backend_supports_the_same_operations() {
        let engine: IndexEngine<TetKey> = IndexEngine::new(Domain::unit());
        let id = engine.insert_at([0.31, 0.77, 0.53], 5, ()).unwrap();
        let found = engine.range_query(Aabb::new([0.2, 0.6, 0.4], [0.4, 0.9, 0.6]));
        assert_eq!(found, vec![id]);
        let nearest = engine.k_nearest(&[0.3, 0.8, 0.5], 1);
        assert_eq!(nearest, vec![id]);
        engine.remove(id).unwrap();
        assert!(engine.is_empty());
    }
}
