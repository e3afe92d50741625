//! The tetrahedral backend: Bey-refinement type-path encoding.
//!
//! The root key covers the whole domain cube; below it, cells are the
//! tetrahedra of the recursively refined Kuhn triangulation, each
//! identified by the path of child indices taken from the root. A
//! tetrahedron's *type* (one of six congruence classes `S0..S5`) follows
//! from that path; [`cache::TetCache`] memoizes path replay and parent
//! derivation so hot lookups on deep keys stay cheap.

pub mod cache;
pub mod tet;
pub mod tet_key;

pub use tet::{Tet, TetType};
pub use tet_key::TetKey;
