//! Crate wide constants.

/// Deepest representable level for both SFC backends.
///
/// The cubic backend packs `(level, morton)` into a single 64-bit word with
/// 21 bits per axis, so `MAX_LEVEL` is capped at 21 there; the tetrahedral
/// backend encodes one 3-bit child index per level, so a `TetKey` path fits
/// in a `u64` up to the same bound (21 * 3 = 63 bits, plus a level byte).
/// Using one constant for both backends keeps key comparison and engine
/// logic (which is generic over `K: SpatialKey`) agnostic to which backend
/// it was built against.
pub const MAX_LEVEL: u8 = 21;

/// Default split threshold: a [`crate::node::Node`] beyond this many
/// entities becomes a candidate for subdivision.
pub const DEFAULT_MAX_ENTITIES_PER_NODE: u16 = 16;

/// Default merge threshold used by [`crate::engine::balance::TreeBalancer`].
pub const DEFAULT_MERGE_THRESHOLD: u16 = 4;

/// Default maximum tree depth.
pub const DEFAULT_MAX_DEPTH: u8 = MAX_LEVEL;
