//! `SpatialBackend`: binds a [`SpatialKey`] implementation to the domain it
//! was built over.
//!
//! Everything backend-specific that the engine needs — coordinate-to-key,
//! neighbor enumeration, node AABB — is already on `SpatialKey` itself;
//! `SpatialBackend` exists only to carry the `Domain` alongside the key
//! type so the engine doesn't thread a `&Domain` through every call.

use crate::error::Result;
use crate::key::SpatialKey;
use crate::types::{Aabb, Domain, PointType};

pub struct SpatialBackend<K> {
    domain: Domain,
    _marker: std::marker::PhantomData<K>,
}

impl<K: SpatialKey> SpatialBackend<K> {
    pub fn new(domain: Domain) -> Self {
        SpatialBackend { domain, _marker: std::marker::PhantomData }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn key_for_point(&self, point: &[PointType; 3], level: u8) -> Result<K> {
        K::from_point(point, level, &self.domain)
    }

    pub fn node_aabb(&self, key: &K) -> Aabb {
        key.node_aabb(&self.domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonKey;

    #[test]
    fn key_for_point_round_trips_through_node_aabb() {
        let backend: SpatialBackend<MortonKey> = SpatialBackend::new(Domain::unit());
        let key = backend.key_for_point(&[0.3, 0.3, 0.3], 4).unwrap();
        let aabb = backend.node_aabb(&key);
        assert!(aabb.contains_point(&[0.3, 0.3, 0.3]));
    }
}
