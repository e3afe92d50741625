//! Narrow-phase collision tests between the shape pairs
//! [`crate::types::Shape`] can hold. Broad-phase candidate generation lives
//! in [`crate::engine::IndexEngine::collide`], which walks the index for
//! overlapping bounds and hands each candidate pair to [`contact`].

use crate::types::{
    add, distance_squared, dot, scale, sub, Aabb, Capsule, EntityId, Obb, PointType, Shape, Sphere,
};

/// One resolved collision between two entities: where the shapes touch,
/// how deep they interpenetrate, and the contact normal pointing from `a`
/// towards `b`.
#[derive(Clone, Debug, PartialEq)]
pub struct Contact {
    pub a: EntityId,
    pub b: EntityId,
    pub point: [PointType; 3],
    pub penetration: PointType,
    pub normal: [PointType; 3],
}

/// Full narrow-phase dispatch: `Some` when the shapes interpenetrate, with
/// the normal oriented from `a_shape` towards `b_shape`. Pairs without an
/// exact test fall back to their enclosing boxes.
pub fn contact(a_id: EntityId, b_id: EntityId, a_shape: &Shape, b_shape: &Shape) -> Option<Contact> {
    let manifold = match (a_shape, b_shape) {
        (Shape::Sphere(a), Shape::Sphere(b)) => sphere_sphere_contact(a, b),
        (Shape::Box(a), Shape::Box(b)) => aabb_aabb_contact(a, b),
        (Shape::Sphere(s), Shape::Box(b)) => sphere_box_contact(s, b),
        (Shape::Box(b), Shape::Sphere(s)) => sphere_box_contact(s, b).map(flip),
        (Shape::Obb(a), Shape::Obb(b)) => obb_obb_contact(a, b),
        (Shape::Box(b), Shape::Obb(o)) => obb_obb_contact(&obb_from_aabb(b), o),
        (Shape::Obb(o), Shape::Box(b)) => obb_obb_contact(o, &obb_from_aabb(b)),
        (Shape::Capsule(a), Shape::Capsule(b)) => capsule_capsule_contact(a, b),
        (Shape::Sphere(s), Shape::Capsule(c)) => sphere_capsule_contact(s, c),
        (Shape::Capsule(c), Shape::Sphere(s)) => sphere_capsule_contact(s, c).map(flip),
        _ => aabb_aabb_contact(&shape_aabb(a_shape), &shape_aabb(b_shape)),
    };
    manifold.map(|m| Contact {
        a: a_id,
        b: b_id,
        point: m.point,
        penetration: m.penetration,
        normal: m.normal,
    })
}

struct Manifold {
    point: [PointType; 3],
    penetration: PointType,
    normal: [PointType; 3],
}

fn flip(m: Manifold) -> Manifold {
    Manifold {
        point: m.point,
        penetration: m.penetration,
        normal: scale(&m.normal, -1.0),
    }
}

pub fn shapes_intersect(a: &Shape, b: &Shape) -> bool {
    match (a, b) {
        (Shape::Sphere(a), Shape::Sphere(b)) => sphere_sphere(a, b),
        (Shape::Box(a), Shape::Box(b)) => a.intersects(b),
        (Shape::Sphere(s), Shape::Box(b)) | (Shape::Box(b), Shape::Sphere(s)) => sphere_box(s, b),
        (Shape::Obb(a), Shape::Obb(b)) => obb_obb(a, b),
        (Shape::Capsule(a), Shape::Capsule(b)) => capsule_capsule(a, b),
        (Shape::Box(b), Shape::Obb(o)) | (Shape::Obb(o), Shape::Box(b)) => {
            obb_obb(&obb_from_aabb(b), o)
        }
        _ => {
            // Remaining pairs (sphere/capsule cross terms, obb/capsule,
            // etc.) fall back to the conservative broad-phase bound.
            shape_aabb(a).intersects(&shape_aabb(b))
        }
    }
}

pub fn sphere_sphere(a: &Sphere, b: &Sphere) -> bool {
    let r = a.radius + b.radius;
    distance_squared(&a.center, &b.center) <= r * r
}

fn sphere_sphere_contact(a: &Sphere, b: &Sphere) -> Option<Manifold> {
    let offset = sub(&b.center, &a.center);
    let dist = dot(&offset, &offset).sqrt();
    let penetration = a.radius + b.radius - dist;
    if penetration < 0.0 {
        return None;
    }
    let normal = if dist > 1e-12 { scale(&offset, 1.0 / dist) } else { [1.0, 0.0, 0.0] };
    let point = add(&a.center, &scale(&normal, a.radius - 0.5 * penetration));
    Some(Manifold { point, penetration, normal })
}

pub fn sphere_box(s: &Sphere, b: &Aabb) -> bool {
    b.distance_squared_to_point(&s.center) <= s.radius * s.radius
}

fn sphere_box_contact(s: &Sphere, b: &Aabb) -> Option<Manifold> {
    let mut closest = s.center;
    for i in 0..3 {
        closest[i] = closest[i].clamp(b.min[i], b.max[i]);
    }
    let offset = sub(&closest, &s.center);
    let dist_sq = dot(&offset, &offset);
    if dist_sq > s.radius * s.radius {
        return None;
    }
    let dist = dist_sq.sqrt();
    let normal = if dist > 1e-12 {
        scale(&offset, 1.0 / dist)
    } else {
        // Sphere center inside the box; push out towards the box center.
        let towards = sub(&b.center(), &s.center);
        let len = dot(&towards, &towards).sqrt();
        if len > 1e-12 {
            scale(&towards, 1.0 / len)
        } else {
            [1.0, 0.0, 0.0]
        }
    };
    Some(Manifold { point: closest, penetration: s.radius - dist, normal })
}

fn aabb_aabb_contact(a: &Aabb, b: &Aabb) -> Option<Manifold> {
    let mut penetration = PointType::INFINITY;
    let mut axis = 0;
    for i in 0..3 {
        let overlap = a.max[i].min(b.max[i]) - a.min[i].max(b.min[i]);
        if overlap < 0.0 {
            return None;
        }
        if overlap < penetration {
            penetration = overlap;
            axis = i;
        }
    }
    let mut normal = [0.0; 3];
    normal[axis] = if b.center()[axis] >= a.center()[axis] { 1.0 } else { -1.0 };
    let mut point = [0.0; 3];
    for i in 0..3 {
        point[i] = 0.5 * (a.max[i].min(b.max[i]) + a.min[i].max(b.min[i]));
    }
    Some(Manifold { point, penetration, normal })
}

/// Separating-axis test over the 15 candidate axes (each box's 3 face
/// normals, plus the 9 cross products of edge pairs).
pub fn obb_obb(a: &Obb, b: &Obb) -> bool {
    obb_obb_contact(a, b).is_some()
}

fn obb_obb_contact(a: &Obb, b: &Obb) -> Option<Manifold> {
    let t = sub(&b.center, &a.center);

    let mut axes: Vec<[PointType; 3]> = Vec::with_capacity(15);
    axes.extend_from_slice(&a.axes);
    axes.extend_from_slice(&b.axes);
    for ai in &a.axes {
        for bi in &b.axes {
            let cross = [
                ai[1] * bi[2] - ai[2] * bi[1],
                ai[2] * bi[0] - ai[0] * bi[2],
                ai[0] * bi[1] - ai[1] * bi[0],
            ];
            if dot(&cross, &cross) > 1e-10 {
                axes.push(cross);
            }
        }
    }

    let mut penetration = PointType::INFINITY;
    let mut best_axis = [1.0, 0.0, 0.0];
    for axis in &axes {
        let len = dot(axis, axis).sqrt();
        let unit = scale(axis, 1.0 / len);
        let proj_a = projected_radius(a, &unit);
        let proj_b = projected_radius(b, &unit);
        let dist = dot(&t, &unit).abs();
        let overlap = proj_a + proj_b - dist;
        if overlap < 0.0 {
            return None;
        }
        if overlap < penetration {
            penetration = overlap;
            best_axis = unit;
        }
    }

    let normal = if dot(&best_axis, &t) >= 0.0 { best_axis } else { scale(&best_axis, -1.0) };
    let point = add(&a.center, &scale(&t, 0.5));
    Some(Manifold { point, penetration, normal })
}

fn projected_radius(obb: &Obb, axis: &[PointType; 3]) -> PointType {
    obb.half_extent[0] * dot(&obb.axes[0], axis).abs()
        + obb.half_extent[1] * dot(&obb.axes[1], axis).abs()
        + obb.half_extent[2] * dot(&obb.axes[2], axis).abs()
}

/// Closest points between the two segments, compared against the summed
/// radii.
pub fn capsule_capsule(a: &Capsule, b: &Capsule) -> bool {
    let (p, q) = closest_points_on_segments(&a.a, &a.b, &b.a, &b.b);
    let r = a.radius + b.radius;
    distance_squared(&p, &q) <= r * r
}

fn capsule_capsule_contact(a: &Capsule, b: &Capsule) -> Option<Manifold> {
    let (p, q) = closest_points_on_segments(&a.a, &a.b, &b.a, &b.b);
    sphere_sphere_contact(
        &Sphere { center: p, radius: a.radius },
        &Sphere { center: q, radius: b.radius },
    )
}

fn sphere_capsule_contact(s: &Sphere, c: &Capsule) -> Option<Manifold> {
    let on_axis = closest_point_on_segment(&c.a, &c.b, &s.center);
    sphere_sphere_contact(s, &Sphere { center: on_axis, radius: c.radius })
}

fn closest_point_on_segment(
    a: &[PointType; 3],
    b: &[PointType; 3],
    p: &[PointType; 3],
) -> [PointType; 3] {
    let ab = sub(b, a);
    let len_sq = dot(&ab, &ab);
    if len_sq < 1e-12 {
        return *a;
    }
    let t = (dot(&sub(p, a), &ab) / len_sq).clamp(0.0, 1.0);
    add(a, &scale(&ab, t))
}

fn closest_points_on_segments(
    p1: &[PointType; 3],
    q1: &[PointType; 3],
    p2: &[PointType; 3],
    q2: &[PointType; 3],
) -> ([PointType; 3], [PointType; 3]) {
    let d1 = sub(q1, p1);
    let d2 = sub(q2, p2);
    let r = sub(p1, p2);

    let a = dot(&d1, &d1);
    let e = dot(&d2, &d2);
    let f = dot(&d2, &r);

    let (mut s, mut t);
    if a <= 1e-12 && e <= 1e-12 {
        return (*p1, *p2);
    }
    if a <= 1e-12 {
        s = 0.0;
        t = (f / e).clamp(0.0, 1.0);
    } else {
        let c = dot(&d1, &r);
        if e <= 1e-12 {
            t = 0.0;
            s = (-c / a).clamp(0.0, 1.0);
        } else {
            let b = dot(&d1, &d2);
            let denom = a * e - b * b;
            s = if denom.abs() > 1e-12 { ((b * f - c * e) / denom).clamp(0.0, 1.0) } else { 0.0 };
            t = (b * s + f) / e;
            if t < 0.0 {
                t = 0.0;
                s = (-c / a).clamp(0.0, 1.0);
            } else if t > 1.0 {
                t = 1.0;
                s = ((b - c) / a).clamp(0.0, 1.0);
            }
        }
    }

    (add(p1, &scale(&d1, s)), add(p2, &scale(&d2, t)))
}

fn obb_from_aabb(b: &Aabb) -> Obb {
    Obb {
        center: b.center(),
        half_extent: [
            0.5 * (b.max[0] - b.min[0]),
            0.5 * (b.max[1] - b.min[1]),
            0.5 * (b.max[2] - b.min[2]),
        ],
        axes: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
    }
}

/// The enclosing axis-aligned box of any shape, used for broad-phase
/// pruning and as the fallback bound for pairs without an exact test.
pub fn shape_aabb(shape: &Shape) -> Aabb {
    match shape {
        Shape::Sphere(s) => Aabb::from_center_half_extent(s.center, [s.radius; 3]),
        Shape::Box(b) => *b,
        Shape::Obb(o) => {
            let mut half = [0.0; 3];
            for i in 0..3 {
                half[i] = o.half_extent[0] * o.axes[0][i].abs()
                    + o.half_extent[1] * o.axes[1][i].abs()
                    + o.half_extent[2] * o.axes[2][i].abs();
            }
            Aabb::from_center_half_extent(o.center, half)
        }
        Shape::Capsule(c) => {
            let min = [
                c.a[0].min(c.b[0]) - c.radius,
                c.a[1].min(c.b[1]) - c.radius,
                c.a[2].min(c.b[2]) - c.radius,
            ];
            let max = [
                c.a[0].max(c.b[0]) + c.radius,
                c.a[1].max(c.b[1]) + c.radius,
                c.a[2].max(c.b[2]) + c.radius,
            ];
            Aabb::new(min, max)
        }
    }
}
