//! `ObjectPool<T>`: a thread-safe pool of reusable scratch buffers.
//!
//! Query hot paths (k-NN's max-heap, range queries' candidate lists) churn
//! through a `Vec`/`BinaryHeap` per call; pooling them avoids an allocation
//! per query under sustained load, the same way parallel octree builders
//! preallocate and reuse per-thread scratch vectors across rayon work items
//! instead of allocating inside the parallel closure.

use parking_lot::Mutex;

/// A pool of `T` values created on demand via `Default` and returned for
/// reuse via [`PooledGuard`]'s `Drop`.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
}

impl<T: Default> ObjectPool<T> {
    pub fn new() -> Self {
        ObjectPool { free: Mutex::new(Vec::new()) }
    }

    pub fn with_capacity(n: usize) -> Self {
        let mut free = Vec::with_capacity(n);
        for _ in 0..n {
            free.push(T::default());
        }
        ObjectPool { free: Mutex::new(free) }
    }

    /// Take an item, creating a fresh one if the pool is empty.
    pub fn acquire(&self) -> T {
        self.free.lock().pop().unwrap_or_default()
    }

    /// Return an item for reuse by a future `acquire`.
    pub fn release(&self, item: T) {
        self.free.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Default> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
