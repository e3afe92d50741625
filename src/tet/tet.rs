//! Geometric tetrahedron: anchor cube, Kuhn type, and Bey refinement.
//!
//! A [`Tet`] is one of the six characteristic tetrahedra that tile an
//! axis-aligned cube along its main diagonal (the Kuhn, or Freudenthal,
//! triangulation). Refining a Tet splits it into eight children — four at
//! the corners, four from the interior octahedron — and those children are
//! again Kuhn tetrahedra of the half-size grid, so the whole hierarchy is
//! described by an anchor, a level, and a type, exactly like the cubic
//! backend's anchor-plus-level with one extra tag.

use std::cmp::Ordering;

use crate::constants::MAX_LEVEL;
use crate::error::{Error, Result};
use crate::tet::cache;
use crate::tet::tet_key::TetKey;
use crate::types::{Aabb, Domain, PointType};

/// Refinement depth below the six root tetrahedra. The key hierarchy spends
/// its first level selecting among the roots, so tets refine one level less
/// than [`TetKey`]s do.
pub const TET_DEPTH: u8 = MAX_LEVEL - 1;

/// Anchors live on the integer grid `[0, GRID_SIZE)^3`.
pub const GRID_SIZE: u64 = 1 << TET_DEPTH;

/// One of the six congruence classes of the Kuhn triangulation. Type `St`
/// covers the points of its cube whose local coordinates, sorted
/// descending, follow the axis order in `AXIS_ORDER[t]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TetType {
    S0 = 0,
    S1 = 1,
    S2 = 2,
    S3 = 3,
    S4 = 4,
    S5 = 5,
}

impl TetType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => TetType::S0,
            1 => TetType::S1,
            2 => TetType::S2,
            3 => TetType::S3,
            4 => TetType::S4,
            _ => TetType::S5,
        }
    }

    pub fn all() -> [TetType; 6] {
        [TetType::S0, TetType::S1, TetType::S2, TetType::S3, TetType::S4, TetType::S5]
    }
}

/// `AXIS_ORDER[t]` is the permutation `(i, j, k)` of the coordinate axes
/// walked from the anchor to the opposite cube corner: the type-`t` tet has
/// vertices `v0 = anchor`, `v1 = v0 + h·e_i`, `v2 = v1 + h·e_j`,
/// `v3 = v2 + h·e_k`.
const AXIS_ORDER: [[usize; 3]; 6] = [
    [0, 1, 2], // S0: x ≥ y ≥ z
    [1, 0, 2], // S1: y ≥ x ≥ z
    [2, 0, 1], // S2: z ≥ x ≥ y
    [2, 1, 0], // S3: z ≥ y ≥ x
    [0, 2, 1], // S4: x ≥ z ≥ y
    [1, 2, 0], // S5: y ≥ z ≥ x
];

/// `TYPE_OF_ORDER[i][j]` is the type whose axis order starts `(i, j, …)`;
/// the third axis is implied. The diagonal is never consulted.
const TYPE_OF_ORDER: [[u8; 3]; 3] = [
    [0, 0, 4], // largest axis x: middle y → S0, middle z → S4
    [1, 1, 5], // largest axis y: middle x → S1, middle z → S5
    [2, 3, 3], // largest axis z: middle x → S2, middle y → S3
];

/// Bey child types: `CHILD_TYPE[t][b]` is the type of the `b`-th Bey child
/// of a type-`t` tetrahedron. Children 0–3 sit at the parent's vertices and
/// keep its type; 4–7 split the interior octahedron.
const CHILD_TYPE: [[u8; 8]; 6] = [
    [0, 0, 0, 0, 5, 1, 2, 4],
    [1, 1, 1, 1, 4, 0, 3, 5],
    [2, 2, 2, 2, 0, 4, 5, 3],
    [3, 3, 3, 3, 1, 5, 4, 2],
    [4, 4, 4, 4, 3, 2, 1, 0],
    [5, 5, 5, 5, 2, 3, 0, 1],
];

/// `CHILD_OCTANT[t][b]` is the octant of the parent's cube holding the
/// `b`-th Bey child's anchor, as an xyz bit vector (bit 0 = +x half, bit 1 =
/// +y half, bit 2 = +z half).
const CHILD_OCTANT: [[u8; 8]; 6] = [
    [0, 1, 3, 7, 1, 1, 3, 3],
    [0, 2, 3, 7, 2, 2, 3, 3],
    [0, 4, 5, 7, 4, 4, 5, 5],
    [0, 4, 6, 7, 4, 4, 6, 6],
    [0, 1, 5, 7, 1, 1, 5, 5],
    [0, 2, 6, 7, 2, 2, 6, 6],
];

/// Inverse of the two tables above: `PARENT_TYPE[o][t]` is the type of the
/// parent of a type-`t` tet whose anchor sits in octant `o` of the parent's
/// cube. Every `(octant, type)` pair identifies exactly one parent.
const PARENT_TYPE: [[u8; 6]; 8] = [
    [0, 1, 2, 3, 4, 5],
    [0, 0, 4, 4, 4, 0],
    [1, 1, 5, 5, 1, 5],
    [0, 1, 0, 1, 0, 1],
    [2, 3, 2, 3, 2, 3],
    [4, 4, 2, 2, 4, 2],
    [5, 5, 3, 3, 3, 5],
    [0, 1, 2, 3, 4, 5],
];

/// The enumeration order used in key paths, as a permutation into Bey
/// indices: anchor-corner child first, then the cluster at `v1`, the
/// cluster at `v2`, and the far corner last, so successive children walk
/// the parent's own vertex chain.
const TM_TO_BEY: [usize; 8] = [0, 1, 4, 5, 2, 6, 7, 3];
const BEY_TO_TM: [u8; 8] = [0, 1, 4, 7, 2, 3, 5, 6];

/// One tetrahedron of the hierarchy: the anchor of its enclosing cube (in
/// `[0, GRID_SIZE)` grid units, a multiple of the cube side), its
/// refinement level, and its Kuhn type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tet {
    anchor: [u64; 3],
    level: u8,
    tet_type: TetType,
}

impl Tet {
    /// Construct from raw parts, checking anchor alignment and bounds.
    pub fn new(anchor: [u64; 3], level: u8, tet_type: TetType) -> Result<Tet> {
        if level > TET_DEPTH {
            return Err(Error::InvalidLevel { level, max: TET_DEPTH });
        }
        let h = 1u64 << (TET_DEPTH - level);
        for &a in &anchor {
            if a % h != 0 || a + h > GRID_SIZE {
                return Err(Error::OutOfDomain(format!(
                    "anchor {:?} not aligned to level-{} grid",
                    anchor, level
                )));
            }
        }
        Ok(Tet { anchor, level, tet_type })
    }

    /// The type-`t` tetrahedron spanning the whole grid cube.
    pub fn root(tet_type: TetType) -> Tet {
        Tet { anchor: [0; 3], level: 0, tet_type }
    }

    pub fn anchor(&self) -> &[u64; 3] {
        &self.anchor
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn tet_type(&self) -> TetType {
        self.tet_type
    }

    /// Side of the anchor cube in grid units.
    pub fn cell_size(&self) -> u64 {
        1 << (TET_DEPTH - self.level)
    }

    /// Locate the unique tetrahedron at `level` containing `point`.
    ///
    /// The anchor cube comes straight off the grid; the type is the sort
    /// order of the point's local coordinates within that cube, ties broken
    /// towards the lower axis index so boundary points classify the same
    /// way at every level.
    pub fn locate(point: &[PointType; 3], level: u8, domain: &Domain) -> Result<Tet> {
        if level > TET_DEPTH {
            return Err(Error::InvalidLevel { level, max: TET_DEPTH });
        }
        for i in 0..3 {
            if point[i] < domain.origin[i] || point[i] > domain.origin[i] + domain.diameter[i] {
                return Err(Error::OutOfDomain(format!(
                    "point {:?} outside domain origin={:?} diameter={:?}",
                    point, domain.origin, domain.diameter
                )));
            }
        }

        let h = 1u64 << (TET_DEPTH - level);
        let mut anchor = [0u64; 3];
        let mut local = [0.0; 3];
        for i in 0..3 {
            let scaled =
                (point[i] - domain.origin[i]) / domain.diameter[i] * (GRID_SIZE as PointType);
            let cell = (scaled.floor() as u64).min(GRID_SIZE - 1);
            anchor[i] = cell & !(h - 1);
            local[i] = scaled - anchor[i] as PointType;
        }

        Ok(Tet { anchor, level, tet_type: classify(&local) })
    }

    /// The four vertices in grid units: `v0` is the anchor, `v3` the
    /// opposite cube corner, and `v1`/`v2` the two intermediate corners the
    /// type's axis order picks out.
    pub fn vertices(&self) -> [[u64; 3]; 4] {
        let h = self.cell_size();
        let order = AXIS_ORDER[self.tet_type as usize];
        let mut out = [self.anchor; 4];
        for step in 0..3 {
            out[step + 1] = out[step];
            out[step + 1][order[step]] += h;
        }
        out
    }

    /// The vertices mapped into world coordinates.
    pub fn vertices_world(&self, domain: &Domain) -> [[PointType; 3]; 4] {
        let grid = GRID_SIZE as PointType;
        let mut out = [[0.0; 3]; 4];
        for (corner, vertex) in self.vertices().iter().zip(out.iter_mut()) {
            for i in 0..3 {
                vertex[i] =
                    domain.origin[i] + domain.diameter[i] * (corner[i] as PointType) / grid;
            }
        }
        out
    }

    /// The `i`-th child (in path enumeration order) under Bey refinement.
    pub fn child(&self, i: u8) -> Result<Tet> {
        if self.level >= TET_DEPTH {
            return Err(Error::InvalidLevel { level: self.level + 1, max: TET_DEPTH });
        }
        let bey = TM_TO_BEY[(i & 7) as usize];
        let t = self.tet_type as usize;
        let octant = CHILD_OCTANT[t][bey];
        let half = self.cell_size() >> 1;

        let mut anchor = self.anchor;
        for axis in 0..3 {
            if (octant >> axis) & 1 == 1 {
                anchor[axis] += half;
            }
        }
        Ok(Tet {
            anchor,
            level: self.level + 1,
            tet_type: TetType::from_u8(CHILD_TYPE[t][bey]),
        })
    }

    /// All eight children in path enumeration order.
    pub fn children(&self) -> Result<Vec<Tet>> {
        (0..8).map(|i| self.child(i)).collect()
    }

    /// The parent tetrahedron, or `None` at level 0.
    ///
    /// Goes through the process-wide parent caches first; on a miss the
    /// anchor is masked down to the coarser grid and the type read from the
    /// inverse refinement table.
    pub fn parent(&self) -> Option<Tet> {
        if self.level == 0 {
            return None;
        }
        let caches = cache::global();
        if let Some(parent) = caches.get_parent(self) {
            return Some(parent);
        }

        let h = self.cell_size();
        let parent_h = h << 1;
        let mut anchor = [0u64; 3];
        let mut octant = 0u8;
        for axis in 0..3 {
            anchor[axis] = self.anchor[axis] & !(parent_h - 1);
            if self.anchor[axis] != anchor[axis] {
                octant |= 1 << axis;
            }
        }

        let parent_type = match caches.get_parent_type(self) {
            Some(t) => t,
            None => {
                let t = PARENT_TYPE[octant as usize][self.tet_type as usize];
                caches.put_parent_type(self, t);
                t
            }
        };

        let parent = Tet {
            anchor,
            level: self.level - 1,
            tet_type: TetType::from_u8(parent_type),
        };
        caches.put_parent(self, parent);
        Some(parent)
    }

    /// This tet's index in its parent's child enumeration, or `None` at
    /// level 0.
    pub fn child_index(&self) -> Option<u8> {
        let parent = self.parent()?;
        let h = self.cell_size();
        let mut octant = 0u8;
        for axis in 0..3 {
            if self.anchor[axis] != parent.anchor[axis] {
                octant |= 1 << axis;
            }
        }
        let pt = parent.tet_type as usize;
        (0..8)
            .find(|&bey| {
                CHILD_OCTANT[pt][bey] == octant && CHILD_TYPE[pt][bey] == self.tet_type as u8
            })
            .map(|bey| BEY_TO_TM[bey])
    }

    /// The key identifying this tet: the root type followed by the child
    /// index taken at each level. O(level) on a cache miss, O(1) on a hit.
    pub fn tm_index(&self) -> TetKey {
        let caches = cache::global();
        if let Some(key) = caches.get_tm(self) {
            return key;
        }

        let mut steps = Vec::with_capacity(self.level as usize);
        let mut cur = *self;
        while cur.level > 0 {
            // Both fallbacks are unreachable above level 0.
            steps.push(cur.child_index().unwrap_or(0));
            cur = cur.parent().unwrap_or_else(|| Tet::root(cur.tet_type));
        }

        let mut path = cur.tet_type as u64;
        for (depth, step) in steps.iter().rev().enumerate() {
            path |= (*step as u64) << (3 * (depth as u32 + 1));
        }

        let key = TetKey::from_parts(path, self.level + 1);
        caches.put_tm(self, key);
        key
    }

    /// Exact containment via barycentric coordinates on the four vertices.
    pub fn contains(&self, point: &[PointType; 3], domain: &Domain) -> bool {
        let v = self.vertices_world(domain);
        let e1 = sub3(&v[1], &v[0]);
        let e2 = sub3(&v[2], &v[0]);
        let e3 = sub3(&v[3], &v[0]);
        let b = sub3(point, &v[0]);

        // The edge vectors are axis-aligned with the cell's world extents,
        // so the determinant is their (signed) product; it is zero only
        // for a degenerate domain.
        let det = det3(&e1, &e2, &e3);
        if det == 0.0 {
            return false;
        }
        let c1 = det3(&b, &e2, &e3) / det;
        let c2 = det3(&e1, &b, &e3) / det;
        let c3 = det3(&e1, &e2, &b) / det;

        let eps = 1e-9;
        c1 >= -eps && c2 >= -eps && c3 >= -eps && c1 + c2 + c3 <= 1.0 + eps
    }

    /// Conservative bounding box: the anchor cube rather than the tighter
    /// tetrahedral hull. The engine only ever prunes with it, so an
    /// overestimate never drops a hit.
    pub fn bounding_box(&self, domain: &Domain) -> Aabb {
        let grid = GRID_SIZE as PointType;
        let h = self.cell_size() as PointType;
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for i in 0..3 {
            min[i] = domain.origin[i] + domain.diameter[i] * (self.anchor[i] as PointType) / grid;
            max[i] = min[i] + domain.diameter[i] * h / grid;
        }
        Aabb::new(min, max)
    }
}

/// Pick the Kuhn type from local coordinates within the anchor cube: sort
/// the axes by coordinate value, descending, ties towards the lower axis.
fn classify(local: &[PointType; 3]) -> TetType {
    let mut idx = [0usize, 1, 2];
    idx.sort_by(|&a, &b| {
        local[b].partial_cmp(&local[a]).unwrap_or(Ordering::Equal).then(a.cmp(&b))
    });
    TetType::from_u8(TYPE_OF_ORDER[idx[0]][idx[1]])
}

fn sub3(a: &[PointType; 3], b: &[PointType; 3]) -> [PointType; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn det3(c0: &[PointType; 3], c1: &[PointType; 3], c2: &[PointType; 3]) -> PointType {
    c0[0] * (c1[1] * c2[2] - c1[2] * c2[1]) - c1[0] * (c0[1] * c2[2] - c0[2] * c2[1])
        + c2[0] * (c0[1] * c1[2] - c0[2] * c1[1])
}
