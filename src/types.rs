//! Basic geometric types shared by both SFC backends and the query layer.

/// Coordinate scalar used for point positions and bounds.
pub type PointType = f64;

/// A point entity's position in world space, with a caller-supplied index
/// used only for correlating results back to input order in bulk APIs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub coord: [PointType; 3],
    pub global_idx: usize,
}

/// Vector of [`Point`]s, the input shape for bulk load.
pub type Points = Vec<Point>;

/// The bounding box of the whole index, in world coordinates.
///
/// Both backends map world coordinates into their own integer domain via
/// this origin/diameter pair (see `MortonKey::from_point`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Domain {
    pub origin: [PointType; 3],
    pub diameter: [PointType; 3],
}

impl Domain {
    /// The unit domain `[0, 1)^3`.
    pub fn unit() -> Self {
        Domain {
            origin: [0.0; 3],
            diameter: [1.0; 3],
        }
    }
}

/// Opaque, totally ordered, hashable entity identifier.
///
/// Callers may supply their own ids on insert or let the engine allocate
/// one; either way the engine never interprets the value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

impl EntityId {
    pub fn new(raw: u64) -> Self {
        EntityId(raw)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An axis-aligned bounding box, used for node cells, entity bounds, and
/// range queries.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: [PointType; 3],
    pub max: [PointType; 3],
}

impl Aabb {
    pub fn new(min: [PointType; 3], max: [PointType; 3]) -> Self {
        Aabb { min, max }
    }

    pub fn from_center_half_extent(center: [PointType; 3], half_extent: [PointType; 3]) -> Self {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for i in 0..3 {
            min[i] = center[i] - half_extent[i];
            max[i] = center[i] + half_extent[i];
        }
        Aabb { min, max }
    }

    pub fn contains_point(&self, p: &[PointType; 3]) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..3).all(|i| self.min[i] <= other.max[i] && self.max[i] >= other.min[i])
    }

    pub fn center(&self) -> [PointType; 3] {
        let mut c = [0.0; 3];
        for i in 0..3 {
            c[i] = 0.5 * (self.min[i] + self.max[i]);
        }
        c
    }

    /// Squared distance from `p` to the nearest point of the box (0 if `p`
    /// is inside). Used by k-NN to prune subtrees whose AABB cannot hold a
    /// closer candidate than the current worst heap entry.
    pub fn distance_squared_to_point(&self, p: &[PointType; 3]) -> PointType {
        let mut acc = 0.0;
        for i in 0..3 {
            let d = if p[i] < self.min[i] {
                self.min[i] - p[i]
            } else if p[i] > self.max[i] {
                p[i] - self.max[i]
            } else {
                0.0
            };
            acc += d * d;
        }
        acc
    }

    /// Min/max signed distance of the box's extreme corners from a plane,
    /// via the standard center/half-extent projection trick. Used by the
    /// frustum/plane queries.
    pub fn signed_distance_to_plane(&self, plane: &Plane) -> (PointType, PointType) {
        let c = self.center();
        let half = [
            0.5 * (self.max[0] - self.min[0]),
            0.5 * (self.max[1] - self.min[1]),
            0.5 * (self.max[2] - self.min[2]),
        ];
        let dist = plane.signed_distance(&c);
        let radius = half[0] * plane.normal[0].abs()
            + half[1] * plane.normal[1].abs()
            + half[2] * plane.normal[2].abs();
        (dist - radius, dist + radius)
    }
}

/// A half-space, `normal . x + d = 0`, with `normal` pointing to the
/// "inside" half-space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Plane {
    pub normal: [PointType; 3],
    pub d: PointType,
}

impl Plane {
    pub fn signed_distance(&self, p: &[PointType; 3]) -> PointType {
        self.normal[0] * p[0] + self.normal[1] * p[1] + self.normal[2] * p[2] + self.d
    }
}

/// Classification of a node's AABB against a query region (frustum or
/// plane), per the frustum-culling operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    Outside,
    Intersecting,
    Inside,
}

/// Six-plane view frustum (or any other convex region bounded by half-spaces).
#[derive(Clone, Debug, PartialEq)]
pub struct Frustum {
    pub planes: Vec<Plane>,
}

impl Frustum {
    pub fn contains_point(&self, p: &[PointType; 3]) -> bool {
        self.planes.iter().all(|plane| plane.signed_distance(p) >= 0.0)
    }

    pub fn classify_aabb(&self, aabb: &Aabb) -> Classification {
        let mut all_inside = true;
        for plane in &self.planes {
            let (min_d, max_d) = aabb.signed_distance_to_plane(plane);
            if max_d < 0.0 {
                return Classification::Outside;
            }
            if min_d < 0.0 {
                all_inside = false;
            }
        }
        if all_inside {
            Classification::Inside
        } else {
            Classification::Intersecting
        }
    }
}

/// A ray for the ray-intersection query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub origin: [PointType; 3],
    pub direction: [PointType; 3],
}

impl Ray {
    /// Slab test against an AABB. Returns the entry/exit parametric `t`
    /// range if the ray intersects, clipped to `[0, max_t]`.
    pub fn intersect_aabb(&self, aabb: &Aabb, max_t: PointType) -> Option<(PointType, PointType)> {
        let mut t_min: PointType = 0.0;
        let mut t_max = max_t;

        for i in 0..3 {
            let d = self.direction[i];
            if d.abs() < 1e-12 {
                if self.origin[i] < aabb.min[i] || self.origin[i] > aabb.max[i] {
                    return None;
                }
                continue;
            }
            let inv_d = 1.0 / d;
            let mut t0 = (aabb.min[i] - self.origin[i]) * inv_d;
            let mut t1 = (aabb.max[i] - self.origin[i]) * inv_d;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_min = t_min.max(t0);
            t_max = t_max.min(t1);
            if t_min > t_max {
                return None;
            }
        }

        Some((t_min, t_max))
    }

    pub fn at(&self, t: PointType) -> [PointType; 3] {
        [
            self.origin[0] + t * self.direction[0],
            self.origin[1] + t * self.direction[1],
            self.origin[2] + t * self.direction[2],
        ]
    }
}

/// A bounding sphere: the simplest bounded-entity shape, used by both k-NN
/// seeding and the narrow-phase collision table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    pub center: [PointType; 3],
    pub radius: PointType,
}

impl Sphere {
    /// Ray-sphere intersection; returns the smallest non-negative `t`.
    pub fn intersect_ray(&self, ray: &Ray, max_t: PointType) -> Option<PointType> {
        let oc = sub(&ray.origin, &self.center);
        let a = dot(&ray.direction, &ray.direction);
        let b = 2.0 * dot(&oc, &ray.direction);
        let c = dot(&oc, &oc) - self.radius * self.radius;
        let disc = b * b - 4.0 * a * c;
        if disc < 0.0 {
            return None;
        }
        let sqrt_disc = disc.sqrt();
        let t0 = (-b - sqrt_disc) / (2.0 * a);
        let t1 = (-b + sqrt_disc) / (2.0 * a);
        let t = if t0 >= 0.0 { t0 } else { t1 };
        if t >= 0.0 && t <= max_t {
            Some(t)
        } else {
            None
        }
    }
}

/// An oriented bounding box, used by the narrow-phase OBB/SAT test.
#[derive(Clone, Debug, PartialEq)]
pub struct Obb {
    pub center: [PointType; 3],
    pub half_extent: [PointType; 3],
    /// Row-major orthonormal basis: `axes[i]` is the box's i-th local axis
    /// expressed in world coordinates.
    pub axes: [[PointType; 3]; 3],
}

/// A swept sphere, used by the narrow-phase capsule-capsule test.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Capsule {
    pub a: [PointType; 3],
    pub b: [PointType; 3],
    pub radius: PointType,
}

/// Any bounded shape an entity can occupy, dispatched by the narrow-phase
/// collision table.
#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Sphere(Sphere),
    Box(Aabb),
    Obb(Obb),
    Capsule(Capsule),
}

pub fn dot(a: &[PointType; 3], b: &[PointType; 3]) -> PointType {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn sub(a: &[PointType; 3], b: &[PointType; 3]) -> [PointType; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn add(a: &[PointType; 3], b: &[PointType; 3]) -> [PointType; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn scale(a: &[PointType; 3], s: PointType) -> [PointType; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

pub fn distance_squared(a: &[PointType; 3], b: &[PointType; 3]) -> PointType {
    let d = sub(a, b);
    dot(&d, &d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aabb_contains_and_intersects() {
        let a = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        assert!(a.contains_point(&[0.5, 0.5, 0.5]));
        assert!(!a.contains_point(&[1.5, 0.5, 0.5]));

        let b = Aabb::new([0.5, 0.5, 0.5], [2.0, 2.0, 2.0]);
        assert!(a.intersects(&b));

        let c = Aabb::new([2.0, 2.0, 2.0], [3.0, 3.0, 3.0]);
        assert!(!a.intersects(&c));
    }

    #[test]
    fn ray_hits_aabb() {
        let ray = Ray {
            origin: [-1.0, 0.5, 0.5],
            direction: [1.0, 0.0, 0.0],
        };
        let aabb = Aabb::new([0.0, 0.0, 0.0], [1.0, 1.0, 1.0]);
        let hit = ray.intersect_aabb(&aabb, 100.0);
        assert!(hit.is_some());
        let (t_min, _) = hit.unwrap();
        assert!((t_min - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sphere_ray_intersection_orders_by_t() {
        let ray = Ray {
            origin: [0.0, 500.0, 500.0],
            direction: [1.0, 0.0, 0.0],
        };
        let spheres = [
            Sphere { center: [100.0, 500.0, 500.0], radius: 10.0 },
            Sphere { center: [300.0, 500.0, 500.0], radius: 10.0 },
            Sphere { center: [200.0, 500.0, 500.0], radius: 10.0 },
        ];
        let mut hits: Vec<(usize, PointType)> = spheres
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.intersect_ray(&ray, 1000.0).map(|t| (i, t)))
            .collect();
        hits.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        let order: Vec<usize> = hits.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn frustum_classifies_containment() {
        let frustum = Frustum {
            planes: vec![
                Plane { normal: [1.0, 0.0, 0.0], d: 0.0 },
                Plane { normal: [-1.0, 0.0, 0.0], d: 10.0 },
                Plane { normal: [0.0, 1.0, 0.0], d: 0.0 },
                Plane { normal: [0.0, -1.0, 0.0], d: 10.0 },
                Plane { normal: [0.0, 0.0, 1.0], d: 0.0 },
                Plane { normal: [0.0, 0.0, -1.0], d: 10.0 },
            ],
        };
        let inside = Aabb::new([1.0, 1.0, 1.0], [2.0, 2.0, 2.0]);
        assert_eq!(frustum.classify_aabb(&inside), Classification::Inside);

        let outside = Aabb::new([20.0, 20.0, 20.0], [21.0, 21.0, 21.0]);
        assert_eq!(frustum.classify_aabb(&outside), Classification::Outside);

        let straddling = Aabb::new([-1.0, 1.0, 1.0], [1.0, 2.0, 2.0]);
        assert_eq!(frustum.classify_aabb(&straddling), Classification::Intersecting);
    }
}
