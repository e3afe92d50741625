use std::sync::atomic::AtomicBool;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use spatial_tree::types::{Aabb, Plane, Ray, Shape, Sphere};
use spatial_tree::{
    Domain, EngineConfig, EntityId, Error, Flow, IndexEngine, MortonKey, Point, SpatialKey,
    TetKey, Visitor,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn big_domain() -> Domain {
    Domain { origin: [0.0; 3], diameter: [1000.0; 3] }
}

/// Seeded so failures reproduce run to run.
fn random_points(n: usize, scale: f64) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(123456789);
    (0..n)
        .map(|i| Point {
            coord: [
                rng.gen::<f64>() * scale,
                rng.gen::<f64>() * scale,
                rng.gen::<f64>() * scale,
            ],
            global_idx: i,
        })
        .collect()
}

#[test]
fn three_points_are_individually_addressable() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let a = engine.insert_at([100.0, 100.0, 100.0], 10, ()).unwrap();
    let b = engine.insert_at([200.0, 200.0, 200.0], 10, ()).unwrap();
    let c = engine.insert_at([900.0, 900.0, 900.0], 10, ()).unwrap();

    assert_eq!(engine.len(), 3);

    assert_eq!(engine.lookup(&[100.0, 100.0, 100.0], 10).unwrap(), vec![a]);
    assert_eq!(engine.lookup(&[200.0, 200.0, 200.0], 10).unwrap(), vec![b]);
    assert_eq!(engine.lookup(&[900.0, 900.0, 900.0], 10).unwrap(), vec![c]);

    let found_a = engine.range_query(Aabb::new([99.0, 99.0, 99.0], [101.0, 101.0, 101.0]));
    assert_eq!(found_a, vec![a]);
}

/// Counts entities per node and tracks the largest leaf seen.
struct Occupancy {
    counts: Vec<usize>,
    max_leaf: usize,
    total: usize,
}

impl Occupancy {
    fn new() -> Self {
        Occupancy { counts: Vec::new(), max_leaf: 0, total: 0 }
    }
}

impl<K: SpatialKey> Visitor<K> for Occupancy {
    fn node_pre(&mut self, _key: &K, _parent: Option<&K>, _depth: u8) -> Flow {
        self.counts.push(0);
        Flow::Continue
    }
    fn entity(&mut self, _key: &K, _id: EntityId) -> Flow {
        if let Some(count) = self.counts.last_mut() {
            *count += 1;
        }
        self.total += 1;
        Flow::Continue
    }
    fn node_post(&mut self, _key: &K, _depth: u8) -> Flow {
        if let Some(count) = self.counts.pop() {
            self.max_leaf = self.max_leaf.max(count);
        }
        Flow::Continue
    }
}

#[test]
fn hundred_points_split_until_leaves_fit() {
    init();
    let config = EngineConfig { max_entities_per_node: 4, ..EngineConfig::default() };
    let engine: IndexEngine<MortonKey> = IndexEngine::with_config(big_domain(), config);

    let points = random_points(100, 1000.0);
    for p in &points {
        engine.insert_at(p.coord, 10, ()).unwrap();
    }

    let mut occupancy = Occupancy::new();
    engine.traverse_depth_first(&mut occupancy);
    assert_eq!(occupancy.total, 100, "every inserted point is reachable");
    assert!(
        occupancy.max_leaf <= 4,
        "no leaf exceeds the threshold, saw {}",
        occupancy.max_leaf
    );
}

#[test]
fn k_nearest_matches_brute_force() {
    init();
    let domain = big_domain();
    let points = random_points(100, 1000.0);

    let engine: IndexEngine<MortonKey> = IndexEngine::new(domain);
    let mut ids = Vec::with_capacity(points.len());
    for p in &points {
        ids.push(engine.insert(p.coord, ()).unwrap());
    }

    let query = [500.0, 500.0, 500.0];
    let engine_result = engine.k_nearest(&query, 5);

    let mut brute: Vec<(f64, EntityId)> = points
        .iter()
        .zip(ids.iter())
        .map(|(p, id)| {
            let d = (p.coord[0] - query[0]).powi(2)
                + (p.coord[1] - query[1]).powi(2)
                + (p.coord[2] - query[2]).powi(2);
            (d, *id)
        })
        .collect();
    brute.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));
    let brute_ids: Vec<_> = brute.into_iter().take(5).map(|(_, id)| id).collect();

    assert_eq!(engine_result, brute_ids);
}

#[test]
fn bounded_entity_occupies_only_intersecting_cells() {
    init();
    let domain = big_domain();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(domain);

    // Some structure first, so the bounded entity has leaves to span.
    for p in random_points(50, 1000.0) {
        engine.insert_at(p.coord, 4, ()).unwrap();
    }

    let shape = Shape::Box(Aabb::new([475.0, 475.0, 475.0], [525.0, 525.0, 525.0]));
    let id = engine.insert_shape_at([500.0, 500.0, 500.0], 10, shape, ()).unwrap();

    let keys = engine.entity_keys(id).unwrap();
    assert!(!keys.is_empty());
    let bounds = Aabb::new([475.0; 3], [525.0; 3]);
    for key in &keys {
        assert!(key.node_aabb(&domain).intersects(&bounds));
    }

    let hits = engine.range_query(Aabb::new([450.0; 3], [550.0; 3]));
    assert!(hits.contains(&id));
}

#[test]
fn ray_hits_spheres_in_parameter_order() {
    init();
    let domain = big_domain();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(domain);

    let insert_sphere = |center: [f64; 3]| {
        let shape = Shape::Sphere(Sphere { center, radius: 10.0 });
        engine.insert_shape_at(center, 6, shape, ()).unwrap()
    };
    let at_100 = insert_sphere([100.0, 500.0, 500.0]);
    let at_300 = insert_sphere([300.0, 500.0, 500.0]);
    let at_200 = insert_sphere([200.0, 500.0, 500.0]);

    let ray = Ray { origin: [0.0, 500.0, 500.0], direction: [1.0, 0.0, 0.0] };
    let hits = engine.ray_intersect(&ray, 1000.0);

    assert_eq!(hits, vec![at_100, at_200, at_300]);
}

#[test]
fn point_entities_along_a_ray_order_by_closest_approach() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let far = engine.insert([300.0, 500.0, 500.0], ()).unwrap();
    let near = engine.insert([100.0, 500.0, 500.0], ()).unwrap();
    let mid = engine.insert([200.0, 500.0, 500.0], ()).unwrap();

    let ray = Ray { origin: [0.0, 500.0, 500.0], direction: [1.0, 0.0, 0.0] };
    let hits = engine.ray_intersect(&ray, 1000.0);
    assert_eq!(hits, vec![near, mid, far]);
}

#[test]
fn frustum_cull_keeps_only_contained_entity() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());

    let inside = engine.insert([100.0, 100.0, 100.0], ()).unwrap();
    let _outside = engine.insert([900.0, 900.0, 900.0], ()).unwrap();

    // Orthographic box frustum covering x, y, z in [0, 500].
    let planes = vec![
        Plane { normal: [1.0, 0.0, 0.0], d: 0.0 },
        Plane { normal: [-1.0, 0.0, 0.0], d: 500.0 },
        Plane { normal: [0.0, 1.0, 0.0], d: 0.0 },
        Plane { normal: [0.0, -1.0, 0.0], d: 500.0 },
        Plane { normal: [0.0, 0.0, 1.0], d: 0.0 },
        Plane { normal: [0.0, 0.0, -1.0], d: 500.0 },
    ];
    let frustum = spatial_tree::types::Frustum { planes };

    let hits = engine.frustum_cull(&frustum);
    assert_eq!(hits, vec![inside]);
}

#[test]
fn plane_intersect_reports_straddling_candidates() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let near_plane = engine.insert_at([500.0, 100.0, 100.0], 6, ()).unwrap();
    let far_from_plane = engine.insert_at([100.0, 100.0, 100.0], 6, ()).unwrap();

    let plane = Plane { normal: [1.0, 0.0, 0.0], d: -500.0 };
    let out = engine.plane_intersect(&plane);
    assert!(out.contains(&near_plane));
    assert!(!out.contains(&far_from_plane));
}

#[test]
fn range_query_equals_linear_scan_after_exact_filter() {
    init();
    let points = random_points(200, 1000.0);
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let mut ids = Vec::new();
    for p in &points {
        ids.push(engine.insert(p.coord, ()).unwrap());
    }

    let query = Aabb::new([200.0, 200.0, 200.0], [700.0, 700.0, 700.0]);
    let mut expected: Vec<EntityId> = points
        .iter()
        .zip(ids.iter())
        .filter(|(p, _)| query.contains_point(&p.coord))
        .map(|(_, id)| *id)
        .collect();
    expected.sort();

    assert_eq!(engine.range_query(query), expected);
}

#[test]
fn insert_all_then_remove_all_leaves_engine_empty() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let points = random_points(40, 1000.0);

    let ids: Vec<_> = points.iter().map(|p| engine.insert(p.coord, ()).unwrap()).collect();
    assert_eq!(engine.len(), 40);

    for id in ids {
        engine.remove(id).unwrap();
    }
    assert_eq!(engine.len(), 0);
    assert_eq!(engine.node_count(), 1, "only the root entry survives");
    assert!(engine.range_query(Aabb::new([0.0; 3], [1000.0; 3])).is_empty());
}

#[test]
fn deep_levels_distinguish_high_anchor_bits_end_to_end() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let deepest_cell = 1000.0 / (1u64 << 21) as f64;

    // 2^16 deepest cells apart: the anchors differ only in bit 16, which an
    // encoding reading two bytes per axis cannot see.
    let p1 = [0.0, 0.0, 0.0];
    let p2 = [(1u64 << 16) as f64 * deepest_cell, 0.0, 0.0];
    // And a pair whose anchors differ only in bit 20.
    let p3 = [(1u64 << 20) as f64 * deepest_cell, 0.0, 0.0];

    for level in 17..=21u8 {
        let k1 = MortonKey::from_point(&p1, level, engine.domain()).unwrap();
        let k2 = MortonKey::from_point(&p2, level, engine.domain()).unwrap();
        let k3 = MortonKey::from_point(&p3, level, engine.domain()).unwrap();
        assert_ne!(k1, k2, "bit-16 anchors at level {}", level);
        assert_ne!(k1, k3, "bit-20 anchors at level {}", level);
        assert_ne!(k2, k3, "level {}", level);
    }

    let a = engine.insert_at(p1, 21, ()).unwrap();
    let b = engine.insert_at(p2, 21, ()).unwrap();
    let c = engine.insert_at(p3, 21, ()).unwrap();
    assert_eq!(engine.lookup(&p1, 21).unwrap(), vec![a]);
    assert_eq!(engine.lookup(&p2, 21).unwrap(), vec![b]);
    assert_eq!(engine.lookup(&p3, 21).unwrap(), vec![c]);
}

#[test]
fn unknown_ids_surface_entity_not_found() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let ghost = EntityId::new(999);
    assert!(matches!(engine.remove(ghost), Err(Error::EntityNotFound(_))));
    assert!(matches!(
        engine.update(ghost, [1.0, 1.0, 1.0], 0),
        Err(Error::EntityNotFound(_))
    ));
}

#[test]
fn cancelled_knn_returns_partial_result() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    for p in random_points(30, 1000.0) {
        engine.insert(p.coord, ()).unwrap();
    }
    let cancel = AtomicBool::new(true);
    let out = engine.k_nearest_with(&[500.0, 500.0, 500.0], 5, f64::INFINITY, &cancel);
    assert!(out.len() <= 5);
}

#[test]
fn colliding_spheres_are_reported_deepest_first() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());

    let insert_sphere = |center: [f64; 3], radius: f64| {
        let shape = Shape::Sphere(Sphere { center, radius });
        engine.insert_shape_at(center, 6, shape, ()).unwrap()
    };
    let a = insert_sphere([100.0, 100.0, 100.0], 20.0);
    let b = insert_sphere([125.0, 100.0, 100.0], 20.0); // overlaps a by 15
    let c = insert_sphere([150.0, 100.0, 100.0], 20.0); // overlaps b by 15, touches a? no: 50 apart vs 40
    let _lonely = insert_sphere([800.0, 800.0, 800.0], 20.0);

    let contacts = engine.collide();
    let pairs: Vec<(EntityId, EntityId)> = contacts.iter().map(|ct| (ct.a, ct.b)).collect();
    assert!(pairs.contains(&(a, b)));
    assert!(pairs.contains(&(b, c)));
    assert!(!pairs.iter().any(|p| p.0 == a && p.1 == c));
    for window in contacts.windows(2) {
        assert!(window[0].penetration >= window[1].penetration);
    }
}

#[test]
fn bulk_load_skips_bad_points_and_files_the_rest() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    let mut points = random_points(100, 1000.0);
    points[17].coord = [-5.0, 0.0, 0.0];
    points[63].coord = [2000.0, 0.0, 0.0];

    let result = engine.bulk_load(&points);
    assert_eq!(result.skipped, vec![17, 63]);
    assert_eq!(result.inserted.len(), 98);
    assert_eq!(engine.len(), 98);

    let mut occupancy = Occupancy::new();
    engine.traverse_depth_first(&mut occupancy);
    assert_eq!(occupancy.total, 98);
}

#[test]
fn breadth_first_traversal_sees_the_root_first() {
    init();
    let engine: IndexEngine<MortonKey> = IndexEngine::new(big_domain());
    for p in random_points(20, 1000.0) {
        engine.insert_at(p.coord, 3, ()).unwrap();
    }

    struct Depths {
        seen: Vec<u8>,
    }
    impl Visitor<MortonKey> for Depths {
        fn node_pre(&mut self, _key: &MortonKey, _parent: Option<&MortonKey>, depth: u8) -> Flow {
            self.seen.push(depth);
            Flow::Continue
        }
    }
    let mut depths = Depths { seen: Vec::new() };
    engine.traverse_breadth_first(&mut depths);
    assert_eq!(depths.seen.first(), Some(&0));
    // Level order never revisits a shallower depth.
    for window in depths.seen.windows(2) {
        assert!(window[1] >= window[0]);
    }
}

#[test]
fn tet_backend_end_to_end() {
    init();
    let domain = big_domain();
    let engine: IndexEngine<TetKey> = IndexEngine::new(domain);

    let points = random_points(60, 1000.0);
    let mut ids = Vec::new();
    for p in &points {
        ids.push(engine.insert(p.coord, ()).unwrap());
    }
    assert_eq!(engine.len(), 60);

    // k-NN agrees with a brute-force scan.
    let query = [400.0, 600.0, 300.0];
    let engine_result = engine.k_nearest(&query, 4);
    let mut brute: Vec<(f64, EntityId)> = points
        .iter()
        .zip(ids.iter())
        .map(|(p, id)| {
            let d = (p.coord[0] - query[0]).powi(2)
                + (p.coord[1] - query[1]).powi(2)
                + (p.coord[2] - query[2]).powi(2);
            (d, *id)
        })
        .collect();
    brute.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)));
    let brute_ids: Vec<_> = brute.into_iter().take(4).map(|(_, id)| id).collect();
    assert_eq!(engine_result, brute_ids);

    // Range query equals the linear scan after the exact filter.
    let query_box = Aabb::new([100.0; 3], [600.0; 3]);
    let mut expected: Vec<EntityId> = points
        .iter()
        .zip(ids.iter())
        .filter(|(p, _)| query_box.contains_point(&p.coord))
        .map(|(_, id)| *id)
        .collect();
    expected.sort();
    assert_eq!(engine.range_query(query_box), expected);

    for id in ids {
        engine.remove(id).unwrap();
    }
    assert!(engine.is_empty());
    assert_eq!(engine.node_count(), 1);
}

#[test]
fn tet_backend_rejects_negative_coordinates() {
    init();
    let engine: IndexEngine<TetKey> = IndexEngine::new(big_domain());
    assert!(matches!(
        engine.insert([-10.0, 100.0, 100.0], ()),
        Err(Error::OutOfDomain(_))
    ));
}
