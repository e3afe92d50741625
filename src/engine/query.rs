//! Query algorithms shared by every backend: k-nearest-neighbor, ray
//! intersection, frustum culling, and plane cuts. Each operates directly on
//! the engine's `BTreeMap<K, Node>` plus `EntityStore`, pruning by
//! `node_aabb` the same way [`crate::engine::range::LazyRangeIterator`]
//! does for range queries, and reusing a caller-provided traversal stack so
//! sustained query loads stay allocation-free.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use crate::collision;
use crate::entity::{EntityRecord, EntityStore};
use crate::key::SpatialKey;
use crate::node::Node;
use crate::types::{
    distance_squared, dot, sub, Classification, Domain, EntityId, Frustum, Plane, PointType, Ray,
    Shape,
};

struct HeapEntry {
    dist_sq: PointType,
    entity: EntityId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.dist_sq == other.dist_sq && self.entity == other.entity
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap on (distance, id): the worst kept candidate sits on top
        // so it is cheap to evict, and equal distances resolve by id.
        self.dist_sq
            .partial_cmp(&other.dist_sq)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.entity.cmp(&other.entity))
    }
}

/// Find the `k` entities nearest `query` within `max_dist_sq`, pruning
/// subtrees whose `node_aabb` cannot contain anything closer than the
/// current worst kept candidate. Ascending by distance, ties by id. A set
/// `cancel` flag stops the search and returns what has been gathered.
#[allow(clippy::too_many_arguments)]
pub fn k_nearest<K: SpatialKey, C>(
    nodes: &BTreeMap<K, Node>,
    domain: &Domain,
    entities: &EntityStore<K, C>,
    query: &[PointType; 3],
    k: usize,
    max_dist_sq: PointType,
    cancel: Option<&AtomicBool>,
    stack: &mut Vec<K>,
) -> Vec<EntityId> {
    if k == 0 {
        return Vec::new();
    }

    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
    let mut seen: HashSet<EntityId> = HashSet::new();
    stack.push(K::root());

    while let Some(key) = stack.pop() {
        if let Some(flag) = cancel {
            if flag.load(AtomicOrdering::Relaxed) {
                stack.clear();
                break;
            }
        }

        let lower_bound = key.node_aabb(domain).distance_squared_to_point(query);
        if lower_bound > max_dist_sq {
            continue;
        }
        if heap.len() >= k {
            if let Some(worst) = heap.peek() {
                if lower_bound > worst.dist_sq {
                    continue;
                }
            }
        }

        let node = match nodes.get(&key) {
            Some(n) => n,
            None => continue,
        };
        for &entity in &node.entities {
            if !seen.insert(entity) {
                continue;
            }
            let record = match entities.get(entity) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let d = distance_squared(&record.position, query);
            if d > max_dist_sq {
                continue;
            }
            if heap.len() < k {
                heap.push(HeapEntry { dist_sq: d, entity });
            } else if let Some(worst) = heap.peek() {
                if (d, entity) < (worst.dist_sq, worst.entity) {
                    heap.pop();
                    heap.push(HeapEntry { dist_sq: d, entity });
                }
            }
        }
        push_children(node, &key, stack);
    }

    let mut out: Vec<HeapEntry> = heap.into_vec();
    out.sort();
    out.into_iter().map(|e| e.entity).collect()
}

/// Entities along `ray` within `max_t`, ordered by hit parameter, ties by
/// id. Bounded entities are tested against their shape (exactly for
/// spheres and boxes, by enclosing box otherwise); point entities report
/// the parameter of the ray's closest approach, so they are candidates
/// rather than exact surface hits.
pub fn ray_intersect<K: SpatialKey, C>(
    nodes: &BTreeMap<K, Node>,
    domain: &Domain,
    entities: &EntityStore<K, C>,
    ray: &Ray,
    max_t: PointType,
    stack: &mut Vec<K>,
) -> Vec<EntityId> {
    let mut seen: HashSet<EntityId> = HashSet::new();
    let mut hits: Vec<(PointType, EntityId)> = Vec::new();
    stack.push(K::root());

    while let Some(key) = stack.pop() {
        if ray.intersect_aabb(&key.node_aabb(domain), max_t).is_none() {
            continue;
        }
        let node = match nodes.get(&key) {
            Some(n) => n,
            None => continue,
        };
        for &entity in &node.entities {
            if !seen.insert(entity) {
                continue;
            }
            if let Ok(record) = entities.get(entity) {
                if let Some(t) = entity_ray_t(record, ray, max_t) {
                    hits.push((t, entity));
                }
            }
        }
        push_children(node, &key, stack);
    }

    hits.sort_by(|a, b| {
        a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal).then_with(|| a.1.cmp(&b.1))
    });
    hits.into_iter().map(|(_, e)| e).collect()
}

fn entity_ray_t<K, C>(
    record: &EntityRecord<K, C>,
    ray: &Ray,
    max_t: PointType,
) -> Option<PointType> {
    match &record.shape {
        Some(Shape::Sphere(sphere)) => sphere.intersect_ray(ray, max_t),
        Some(Shape::Box(aabb)) => ray.intersect_aabb(aabb, max_t).map(|(t0, _)| t0.max(0.0)),
        Some(other) => {
            let bounds = collision::shape_aabb(other);
            ray.intersect_aabb(&bounds, max_t).map(|(t0, _)| t0.max(0.0))
        }
        None => {
            let len_sq = dot(&ray.direction, &ray.direction);
            if len_sq < PointType::EPSILON {
                return None;
            }
            let t = dot(&sub(&record.position, &ray.origin), &ray.direction) / len_sq;
            if t >= 0.0 && t <= max_t {
                Some(t)
            } else {
                None
            }
        }
    }
}

/// Entities under cells fully or partially inside `frustum`, ascending by
/// id. A fully inside cell's subtree is emitted without further testing;
/// entities in straddling cells are filtered by their own position or
/// bounds.
pub fn frustum_cull<K: SpatialKey, C>(
    nodes: &BTreeMap<K, Node>,
    domain: &Domain,
    entities: &EntityStore<K, C>,
    frustum: &Frustum,
    stack: &mut Vec<K>,
) -> Vec<EntityId> {
    let mut seen: HashSet<EntityId> = HashSet::new();
    let mut out = Vec::new();
    stack.push(K::root());

    while let Some(key) = stack.pop() {
        let node = match nodes.get(&key) {
            Some(n) => n,
            None => continue,
        };
        match frustum.classify_aabb(&key.node_aabb(domain)) {
            Classification::Outside => continue,
            Classification::Inside => {
                for &entity in &node.entities {
                    if seen.insert(entity) {
                        out.push(entity);
                    }
                }
            }
            Classification::Intersecting => {
                for &entity in &node.entities {
                    if !seen.insert(entity) {
                        continue;
                    }
                    let record = match entities.get(entity) {
                        Ok(r) => r,
                        Err(_) => continue,
                    };
                    let keep = match &record.shape {
                        None => frustum.contains_point(&record.position),
                        Some(shape) => {
                            frustum.classify_aabb(&collision::shape_aabb(shape))
                                != Classification::Outside
                        }
                    };
                    if keep {
                        out.push(entity);
                    }
                }
            }
        }
        push_children(node, &key, stack);
    }

    out.sort();
    out
}

/// Candidate entities in cells straddling `plane`, ascending by id.
/// Bounded entities are kept only when their own bounds straddle; point
/// entities in a straddling cell are always reported.
pub fn plane_cut<K: SpatialKey, C>(
    nodes: &BTreeMap<K, Node>,
    domain: &Domain,
    entities: &EntityStore<K, C>,
    plane: &Plane,
    stack: &mut Vec<K>,
) -> Vec<EntityId> {
    let mut seen: HashSet<EntityId> = HashSet::new();
    let mut out = Vec::new();
    stack.push(K::root());

    while let Some(key) = stack.pop() {
        let (min_d, max_d) = key.node_aabb(domain).signed_distance_to_plane(plane);
        if min_d > 0.0 || max_d < 0.0 {
            continue;
        }
        let node = match nodes.get(&key) {
            Some(n) => n,
            None => continue,
        };
        for &entity in &node.entities {
            if !seen.insert(entity) {
                continue;
            }
            let record = match entities.get(entity) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let keep = match &record.shape {
                None => true,
                Some(shape) => {
                    let (lo, hi) =
                        collision::shape_aabb(shape).signed_distance_to_plane(plane);
                    lo <= 0.0 && hi >= 0.0
                }
            };
            if keep {
                out.push(entity);
            }
        }
        push_children(node, &key, stack);
    }

    out.sort();
    out
}

fn push_children<K: SpatialKey>(node: &Node, key: &K, stack: &mut Vec<K>) {
    if !node.has_any_children() {
        return;
    }
    if let Ok(children) = key.children() {
        for (i, child) in children.into_iter().enumerate() {
            if node.has_child(i as u8) {
                stack.push(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRecord;
    use crate::morton::MortonKey;
    use crate::types::Sphere;

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

    fn build_fixture() -> (BTreeMap<MortonKey, Node>, EntityStore<MortonKey, ()>, Domain) {
        let domain = Domain::unit();
        let mut nodes: BTreeMap<MortonKey, Node> = BTreeMap::new();
        let mut store: EntityStore<MortonKey, ()> = EntityStore::new();

        let points = [[0.1, 0.1, 0.1], [0.5, 0.5, 0.5], [0.9, 0.9, 0.9]];
        for (i, p) in points.iter().enumerate() {
            let key = MortonKey::from_point(p, 3, &domain).unwrap();
            link_under_root(&mut nodes, key);

            let id = EntityId::new(i as u64);
            nodes.entry(key).or_insert_with(Node::new).add_entity(id);
            store
                .insert(EntityRecord {
                    id,
                    content: (),
                    position: *p,
                    shape: None,
                    occupying_keys: vec![key],
                })
                .unwrap();
        }

        (nodes, store, domain)
    }

    #[test]
    fn knn_returns_closest_first() {
        let (nodes, store, domain) = build_fixture();
        let mut stack = Vec::new();
        let result = k_nearest(
            &nodes,
            &domain,
            &store,
            &[0.0, 0.0, 0.0],
            2,
            PointType::INFINITY,
            None,
            &mut stack,
        );
        assert_eq!(result, vec![EntityId::new(0), EntityId::new(1)]);
    }

    #[test]
    fn knn_breaks_distance_ties_by_id() {
        let domain = Domain::unit();
        let mut nodes: BTreeMap<MortonKey, Node> = BTreeMap::new();
        let mut store: EntityStore<MortonKey, ()> = EntityStore::new();

        // Two entities mirrored about the query point, same distance.
        for (i, p) in [[0.25, 0.5, 0.5], [0.75, 0.5, 0.5]].iter().enumerate() {
            let key = MortonKey::from_point(p, 2, &domain).unwrap();
            link_under_root(&mut nodes, key);
            let id = EntityId::new(i as u64);
            nodes.entry(key).or_insert_with(Node::new).add_entity(id);
            store
                .insert(EntityRecord {
                    id,
                    content: (),
                    position: *p,
                    shape: None,
                    occupying_keys: vec![key],
                })
                .unwrap();
        }

        let mut stack = Vec::new();
        let result = k_nearest(
            &nodes,
            &domain,
            &store,
            &[0.5, 0.5, 0.5],
            1,
            PointType::INFINITY,
            None,
            &mut stack,
        );
        assert_eq!(result, vec![EntityId::new(0)]);
    }

    #[test]
    fn knn_max_dist_filters_far_entities() {
        let (nodes, store, domain) = build_fixture();
        let mut stack = Vec::new();
        let result = k_nearest(
            &nodes,
            &domain,
            &store,
            &[0.0, 0.0, 0.0],
            3,
            0.1, // squared: only the nearest point qualifies
            None,
            &mut stack,
        );
        assert_eq!(result, vec![EntityId::new(0)]);
    }

    #[test]
    fn ray_orders_sphere_hits_by_parameter() {
        let domain = Domain { origin: [0.0; 3], diameter: [1000.0; 3] };
        let mut nodes: BTreeMap<MortonKey, Node> = BTreeMap::new();
        let mut store: EntityStore<MortonKey, ()> = EntityStore::new();

        let centers = [[100.0, 500.0, 500.0], [300.0, 500.0, 500.0], [200.0, 500.0, 500.0]];
        for (i, c) in centers.iter().enumerate() {
            let key = MortonKey::from_point(c, 4, &domain).unwrap();
            link_under_root(&mut nodes, key);
            let id = EntityId::new(i as u64);
            nodes.entry(key).or_insert_with(Node::new).add_entity(id);
            store
                .insert(EntityRecord {
                    id,
                    content: (),
                    position: *c,
                    shape: Some(Shape::Sphere(Sphere { center: *c, radius: 10.0 })),
                    occupying_keys: vec![key],
                })
                .unwrap();
        }

        let ray = Ray { origin: [0.0, 500.0, 500.0], direction: [1.0, 0.0, 0.0] };
        let mut stack = Vec::new();
        let hits = ray_intersect(&nodes, &domain, &store, &ray, 1000.0, &mut stack);
        assert_eq!(hits, vec![EntityId::new(0), EntityId::new(2), EntityId::new(1)]);
    }

    #[test]
    fn frustum_filters_entities_in_straddling_cells() {
        let (nodes, store, domain) = build_fixture();
        let frustum = Frustum {
            planes: vec![
                Plane { normal: [1.0, 0.0, 0.0], d: 0.0 },
                Plane { normal: [-1.0, 0.0, 0.0], d: 0.3 },
                Plane { normal: [0.0, 1.0, 0.0], d: 0.0 },
                Plane { normal: [0.0, -1.0, 0.0], d: 0.3 },
                Plane { normal: [0.0, 0.0, 1.0], d: 0.0 },
                Plane { normal: [0.0, 0.0, -1.0], d: 0.3 },
            ],
        };
        let mut stack = Vec::new();
        let out = frustum_cull(&nodes, &domain, &store, &frustum, &mut stack);
        assert_eq!(out, vec![EntityId::new(0)]);
    }

    #[test]
    fn plane_cut_reports_straddling_candidates() {
        let (nodes, store, domain) = build_fixture();
        // x = 0.5 plane: the 0.5-point's cell straddles it.
        let plane = Plane { normal: [1.0, 0.0, 0.0], d: -0.5 };
        let mut stack = Vec::new();
        let out = plane_cut(&nodes, &domain, &store, &plane, &mut stack);
        assert!(out.contains(&EntityId::new(1)));
        assert!(!out.contains(&EntityId::new(2)));
    }
}
