//! The `SpatialKey` trait: the single parametric abstraction both SFC
//! backends (cubic Morton, tetrahedral type-path) implement so the engine,
//! queries, and bulk loader never need to know which one they are driving.

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::Result;
use crate::types::{Aabb, Domain, PointType};

/// A node identifier in some space-filling-curve hierarchy.
///
/// Implementors are cheap, `Copy` values (a packed integer in both shipped
/// backends) with a total order matching SFC traversal order, so a `BTreeMap`
/// or sorted `Vec` keyed by `K` enumerates nodes in locality-preserving
/// order for free.
pub trait SpatialKey:
    Copy + Clone + Debug + Eq + Ord + Hash + Send + Sync + 'static
{
    /// The root node, at level 0, covering the whole domain.
    fn root() -> Self;

    /// Depth in the hierarchy; the root is level 0.
    fn level(&self) -> u8;

    /// The unique parent of this key, or `None` at the root.
    fn parent(&self) -> Option<Self>;

    /// All ancestors from immediate parent up to (and including) the root,
    /// nearest first.
    fn ancestors(&self) -> Vec<Self> {
        let mut out = Vec::new();
        let mut cur = *self;
        while let Some(p) = cur.parent() {
            out.push(p);
            cur = p;
        }
        out
    }

    /// `true` if `self` is `other` or a descendant of `other`.
    fn is_descendant_of(&self, other: &Self) -> bool {
        if self == other {
            return true;
        }
        let mut cur = *self;
        while let Some(p) = cur.parent() {
            if &p == other {
                return true;
            }
            cur = p;
        }
        false
    }

    /// Branching factor: 8 for the cubic octree backend's cube bisection,
    /// and also 8 for the tetrahedral backend's Bey refinement (each
    /// tetrahedron splits into 8 children).
    fn branching_factor() -> u8;

    /// The `i`-th child (`0..branching_factor()`), or `Err` if `self` is
    /// already at `MAX_LEVEL`.
    fn child_at(&self, i: u8) -> Result<Self>;

    /// All children in canonical order.
    fn children(&self) -> Result<Vec<Self>> {
        (0..Self::branching_factor())
            .map(|i| self.child_at(i))
            .collect()
    }

    /// Map a world coordinate to the deepest key at `level` that contains
    /// it, given the index's overall `domain`. Returns `OutOfDomain` if the
    /// coordinate falls outside `domain`.
    fn from_point(point: &[PointType; 3], level: u8, domain: &Domain) -> Result<Self>;

    /// The axis-aligned bounding box this key's cell covers in world space.
    fn node_aabb(&self, domain: &Domain) -> Aabb;

    /// Keys of same-level cells edge/face/vertex-adjacent to this one
    /// (excluding `self`), used by the 2:1 balance pass and neighbor-based
    /// k-NN traversal. Backends that cannot cheaply enumerate neighbors may
    /// return a partial set; callers must not assume completeness beyond
    /// what each backend documents.
    fn neighbors(&self) -> Vec<Self>;
}
