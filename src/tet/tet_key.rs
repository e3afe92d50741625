//! `TetKey`: the path from the root to a tetrahedron, packed into a `u64`.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use crate::constants::MAX_LEVEL;
use crate::error::{Error, Result};
use crate::key::SpatialKey;
use crate::tet::tet::{Tet, TetType};
use crate::types::{Aabb, Domain, PointType};

/// Bits of path consumed per level.
const BITS_PER_LEVEL: u32 = 3;
const ELEMENT_MASK: u64 = 0x7;

/// A node in the tetrahedral hierarchy.
///
/// The root (level 0) is the whole domain cube. Its six children are the
/// Kuhn tetrahedra `S0..S5` tiling that cube, so the path's first element
/// is a root type in `0..6`; every element after it is a Bey child index in
/// `0..8`. With 3 bits per element a full-depth path fits a `u64`.
///
/// Keys order by path prefix, ancestors first, which is the depth-first
/// traversal order of the tree — the same property the cubic backend gets
/// from comparing packed Morton words.
#[derive(Clone, Copy, Debug)]
pub struct TetKey {
    path: u64,
    level: u8,
}

impl Default for TetKey {
    fn default() -> Self {
        TetKey { path: 0, level: 0 }
    }
}

impl TetKey {
    pub(crate) fn from_parts(path: u64, level: u8) -> Self {
        TetKey { path, level }
    }

    pub fn path(&self) -> u64 {
        self.path
    }

    /// The path element consumed at `depth` (1-indexed).
    fn element(&self, depth: u8) -> u8 {
        let shift = BITS_PER_LEVEL * (depth as u32 - 1);
        ((self.path >> shift) & ELEMENT_MASK) as u8
    }

    fn with_element(&self, value: u8) -> TetKey {
        let shift = BITS_PER_LEVEL * self.level as u32;
        TetKey {
            path: self.path | ((value as u64) << shift),
            level: self.level + 1,
        }
    }

    /// Replay the path into the geometric [`Tet`] it identifies. `None` at
    /// the root, which covers the whole cube rather than one tetrahedron.
    pub fn to_tet(&self) -> Option<Tet> {
        if self.level == 0 {
            return None;
        }
        let mut tet = Tet::root(TetType::from_u8(self.element(1)));
        for depth in 2..=self.level {
            tet = tet.child(self.element(depth)).ok()?;
        }
        Some(tet)
    }

    /// The Kuhn type of the tetrahedron this key denotes, or `None` at the
    /// root.
    pub fn tet_type(&self) -> Option<TetType> {
        self.to_tet().map(|t| t.tet_type())
    }
}

impl SpatialKey for TetKey {
    fn root() -> Self {
        TetKey::default()
    }

    fn level(&self) -> u8 {
        self.level
    }

    fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            return None;
        }
        let shift = BITS_PER_LEVEL * (self.level as u32 - 1);
        let mask = (1u64 << shift) - 1;
        Some(TetKey {
            path: self.path & mask,
            level: self.level - 1,
        })
    }

    fn branching_factor() -> u8 {
        8
    }

    fn child_at(&self, i: u8) -> Result<Self> {
        if self.level >= MAX_LEVEL {
            return Err(Error::InvalidLevel { level: self.level + 1, max: MAX_LEVEL });
        }
        let fanout = if self.level == 0 { 6 } else { 8 };
        if i >= fanout {
            return Err(Error::OutOfDomain(format!(
                "child index {} out of range for a {}-way node",
                i, fanout
            )));
        }
        Ok(self.with_element(i))
    }

    /// Six children at the root (one per Kuhn type), eight everywhere else.
    fn children(&self) -> Result<Vec<Self>> {
        let fanout = if self.level == 0 { 6 } else { 8 };
        (0..fanout).map(|i| self.child_at(i)).collect()
    }

    fn from_point(point: &[PointType; 3], level: u8, domain: &Domain) -> Result<Self> {
        if level > MAX_LEVEL {
            return Err(Error::InvalidLevel { level, max: MAX_LEVEL });
        }
        if level == 0 {
            for i in 0..3 {
                if point[i] < domain.origin[i]
                    || point[i] > domain.origin[i] + domain.diameter[i]
                {
                    return Err(Error::OutOfDomain(format!(
                        "point {:?} outside domain origin={:?} diameter={:?}",
                        point, domain.origin, domain.diameter
                    )));
                }
            }
            return Ok(TetKey::root());
        }
        Ok(Tet::locate(point, level - 1, domain)?.tm_index())
    }

    fn node_aabb(&self, domain: &Domain) -> Aabb {
        match self.to_tet() {
            Some(tet) => tet.bounding_box(domain),
            None => Aabb::new(
                domain.origin,
                [
                    domain.origin[0] + domain.diameter[0],
                    domain.origin[1] + domain.diameter[1],
                    domain.origin[2] + domain.diameter[2],
                ],
            ),
        }
    }

    fn neighbors(&self) -> Vec<Self> {
        // Face neighbors of a tetrahedron can leave the parent cube and
        // land under a different ancestor; computing that needs the full
        // Bey face-neighbor table. Sibling cells are returned instead,
        // which covers the balance pass's same-parent case.
        match self.parent() {
            Some(p) => p
                .children()
                .unwrap_or_default()
                .into_iter()
                .filter(|k| k != self)
                .collect(),
            None => Vec::new(),
        }
    }
}

impl PartialEq for TetKey {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.level == other.level
    }
}

impl Eq for TetKey {}

impl PartialOrd for TetKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TetKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Element-wise along the shared prefix, ancestors before their
        // descendants: depth-first traversal order.
        let common = self.level.min(other.level);
        for depth in 1..=common {
            match self.element(depth).cmp(&other.element(depth)) {
                Ordering::Equal => continue,
                decided => return decided,
            }
        }
        self.level.cmp(&other.level)
    }
}

impl Hash for TetKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.level.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent_and_six_children() {
        let root = TetKey::root();
        assert_eq!(root.level(), 0);
        assert!(root.parent().is_none());
        assert_eq!(root.children().unwrap().len(), 6);
        assert!(root.child_at(6).is_err());
    }

    #[test]
    fn deeper_nodes_have_eight_children() {
        let node = TetKey::root().child_at(2).unwrap();
        assert_eq!(node.children().unwrap().len(), 8);
    }

    #[test]
    fn child_parent_round_trip() {
        let mut key = TetKey::root().child_at(4).unwrap();
        for i in [1u8, 6, 2, 7, 0] {
            key = key.child_at(i).unwrap();
        }
        assert_eq!(key.level(), 6);
        let mut cur = key;
        for _ in 0..6 {
            cur = cur.parent().unwrap();
        }
        assert_eq!(cur, TetKey::root());
    }

    #[test]
    fn ordering_is_depth_first() {
        let root = TetKey::root();
        let a = root.child_at(0).unwrap();
        let b = root.child_at(1).unwrap();
        let a_deep = a.child_at(7).unwrap();

        assert!(root < a);
        assert!(a < a_deep, "ancestors precede descendants");
        assert!(a_deep < b, "a whole subtree precedes the next sibling");
    }

    #[test]
    fn from_point_round_trips_through_containment() {
        let domain = Domain::unit();
        let p = [0.31, 0.77, 0.53];
        for level in 1..8 {
            let key = TetKey::from_point(&p, level, &domain).unwrap();
            assert_eq!(key.level(), level);
            let tet = key.to_tet().unwrap();
            assert!(tet.contains(&p, &domain));
            assert!(key.node_aabb(&domain).contains_point(&p));
        }
    }

    #[test]
    fn from_point_at_level_zero_is_the_root() {
        let domain = Domain::unit();
        assert_eq!(TetKey::from_point(&[0.5, 0.5, 0.5], 0, &domain).unwrap(), TetKey::root());
        assert!(TetKey::from_point(&[1.5, 0.5, 0.5], 0, &domain).is_err());
    }

    #[test]
    fn sibling_neighbors_exclude_self() {
        let key = TetKey::root().child_at(3).unwrap().child_at(5).unwrap();
        let neighbors = key.neighbors();
        assert_eq!(neighbors.len(), 7);
        assert!(!neighbors.contains(&key));
    }

    #[test]
    fn root_aabb_covers_the_domain() {
        let domain = Domain::unit();
        let aabb = TetKey::root().node_aabb(&domain);
        assert!(aabb.contains_point(&[0.0, 0.0, 0.0]));
        assert!(aabb.contains_point(&[1.0, 1.0, 1.0]));
    }
}
