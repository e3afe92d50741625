//! A generic hierarchical spatial index parametrized over a space-filling
//! curve key type ([`key::SpatialKey`]), with two concrete backends: a cubic
//! octree over Morton (Z-order) keys ([`morton::MortonKey`]) and a
//! tetrahedral mesh over Bey-refinement keys ([`tet::TetKey`]).
//!
//! [`engine::IndexEngine`] is the entry point: insert, remove, and move
//! entities, and query them by range, k-nearest-neighbor, ray, frustum, or
//! plane.

pub mod collision;
pub mod constants;
pub mod engine;
pub mod entity;
pub mod error;
pub mod key;
pub mod morton;
pub mod node;
pub mod pool;
pub mod tet;
pub mod types;

pub use collision::Contact;
pub use engine::visitor::{CollectVisitor, Flow, Visitor};
pub use engine::{BulkLoadResult, EngineConfig, IndexEngine};
pub use entity::SpanPolicy;
pub use error::{Error, Result};
pub use key::SpatialKey;
pub use morton::MortonKey;
pub use tet::{Tet, TetKey, TetType};
pub use types::{Domain, EntityId, Point, Points};
