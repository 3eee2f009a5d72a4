//! Cuckoo set with a fixed array of lock stripes per table.
//!
//! The stripe arrays are sized at construction and never grow; only the
//! bucket arrays do. Because the stripe count and every capacity are
//! powers of two with stripes ≤ capacity, a cell's stripe is derivable
//! from any key that hashes to it, in every capacity epoch — which is
//! what keeps displacement's re-locking valid across a concurrent
//! resize. Resize itself serializes against all other operations by
//! acquiring every first-table stripe: any mutating or reading call
//! holds one of them.

use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::{Relaxed, Release, SeqCst};
use std::collections::hash_map::RandomState;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::bucket::{rebuild, Insert, Round, Tables};
use crate::config::Config;
use crate::hash::{bucket_index, hash_pair};

/// A concurrent cuckoo hash set with striped locking.
///
/// Operations on a key lock the two stripes its hashes select, always
/// first-table stripe before second-table stripe. The set grows
/// automatically; capacity never shrinks.
pub struct StripedCuckooSet<K, S = RandomState> {
    tables: UnsafeCell<Tables<K>>,
    locks: [Vec<Mutex<()>>; 2],
    capacity: CachePadded<AtomicUsize>,
    size: CachePadded<AtomicUsize>,
    build_hasher: S,
    cfg: Config,
}

// Keys move in and out through a shared reference; cells are only ever
// touched under their stripe locks.
unsafe impl<K: Send, S: Send> Send for StripedCuckooSet<K, S> {}
unsafe impl<K: Send, S: Send + Sync> Sync for StripedCuckooSet<K, S> {}

impl<K: Hash + Eq> StripedCuckooSet<K> {
    /// Creates an empty set with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty set with room for `capacity` buckets per table,
    /// rounded up to the next power of two.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(Config {
            initial_capacity: capacity,
            ..Config::default()
        })
    }

    /// Creates an empty set with the given tuning knobs.
    ///
    /// # Panics
    /// If the configuration is inconsistent (see [`Config`]).
    #[must_use]
    pub fn with_config(cfg: Config) -> Self {
        Self::with_config_and_hasher(cfg, RandomState::default())
    }
}

impl<K: Hash + Eq> Default for StripedCuckooSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> StripedCuckooSet<K, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty set hashing through `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self::with_config_and_hasher(Config::default(), build_hasher)
    }

    /// # Panics
    /// If the configuration is inconsistent (see [`Config`]).
    pub fn with_config_and_hasher(cfg: Config, build_hasher: S) -> Self {
        cfg.validate();
        let capacity = cfg.capacity();
        let mut stripes = || (0..capacity).map(|_| Mutex::new(())).collect();
        Self {
            tables: UnsafeCell::new(Tables::new(capacity)),
            locks: [stripes(), stripes()],
            capacity: CachePadded::new(AtomicUsize::new(capacity)),
            size: CachePadded::new(AtomicUsize::new(0)),
            build_hasher,
            cfg,
        }
    }

    /// Number of keys in the set. Exact once all writers have quiesced;
    /// a concurrent reader may observe an in-flight intermediate value.
    pub fn len(&self) -> usize {
        self.size.load(Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buckets per table. A power of two; never decreases.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Relaxed)
    }

    /// Returns whether `key` is in the set.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (h1, h2) = hash_pair(&self.build_hasher, key);
        let _pair = self.lock_pair(h1, h2);
        // Stable while we hold a first-table stripe: resize takes all of
        // them.
        let capacity = self.capacity.load(Relaxed);
        let tables = unsafe { &*self.tables.get() };
        // SAFETY: the stripe pair covers both candidate cells.
        unsafe {
            tables.contains_key(bucket_index(h1, capacity), bucket_index(h2, capacity), key)
        }
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (h1, h2) = hash_pair(&self.build_hasher, key);
        let _pair = self.lock_pair(h1, h2);
        let capacity = self.capacity.load(Relaxed);
        let tables = unsafe { &*self.tables.get() };
        // SAFETY: the stripe pair covers both candidate cells.
        let removed = unsafe {
            tables.remove_key(bucket_index(h1, capacity), bucket_index(h2, capacity), key)
        };
        if removed {
            self.size.fetch_sub(1, SeqCst);
        }
        removed
    }

    /// Inserts `key`, returning `true` iff it was not already present.
    pub fn insert(&self, mut key: K) -> bool
    where
        K: Clone,
    {
        loop {
            let (h1, h2) = hash_pair(&self.build_hasher, &key);
            let (outcome, capacity) = {
                let _pair = self.lock_pair(h1, h2);
                let capacity = self.capacity.load(Relaxed);
                let tables = unsafe { &*self.tables.get() };
                let b1 = bucket_index(h1, capacity);
                let b2 = bucket_index(h2, capacity);
                // SAFETY: the stripe pair covers both candidate cells.
                let outcome = unsafe { tables.insert(b1, b2, key, &self.cfg) };
                if matches!(outcome, Insert::Done | Insert::Parked { .. }) {
                    // Count at the moment the key physically lands in a
                    // cell; a displacement only moves it afterwards.
                    self.size.fetch_add(1, SeqCst);
                }
                (outcome, capacity)
            };
            match outcome {
                Insert::Duplicate => return false,
                Insert::Done => return true,
                Insert::Parked { side, bucket, head } => {
                    if !self.relocate(side, bucket, head) {
                        self.resize(capacity);
                    }
                    return true;
                }
                Insert::Full(k) => {
                    self.resize(capacity);
                    key = k;
                }
            }
        }
    }

    /// Sequentially inserts every key in `keys`. No atomicity across the
    /// batch.
    pub fn populate<I>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Clone,
    {
        for key in keys {
            self.insert(key);
        }
    }

    /// Counts every stored key under a full barrier, asserting the
    /// structural invariants along the way. A diagnostic; concurrent
    /// callers are blocked for the duration.
    ///
    /// # Panics
    /// If an invariant does not hold.
    pub fn census(&self) -> usize {
        let _barrier: Vec<MutexGuard<'_, ()>> =
            self.locks[0].iter().map(Mutex::lock).collect();
        let tables = unsafe { &*self.tables.get() };
        // SAFETY: the barrier excludes every mutator.
        let count = unsafe { tables.census(&self.build_hasher, &self.cfg) };
        assert_eq!(count, self.size.load(SeqCst), "len drifted from stored keys");
        count
    }

    fn stripe_count(&self) -> usize {
        self.locks[0].len()
    }

    /// Locks the stripe pair for a hash pair: first-table stripe, then
    /// second-table stripe. That order is total across every code path,
    /// so the two disjoint lock classes cannot deadlock.
    fn lock_pair(&self, h1: u64, h2: u64) -> (MutexGuard<'_, ()>, MutexGuard<'_, ()>) {
        let stripes = self.stripe_count();
        let g1 = self.locks[0][bucket_index(h1, stripes)].lock();
        let g2 = self.locks[1][bucket_index(h2, stripes)].lock();
        (g1, g2)
    }

    /// Runs displacement rounds until the parked cell is resolved, the
    /// round budget is exhausted, or a full target cell blocks the
    /// chain. Returns `false` when only a resize can help.
    fn relocate(&self, mut side: usize, mut from: usize, mut candidate: K) -> bool
    where
        K: Clone,
    {
        for _ in 0..self.cfg.relocation_limit {
            let (h1, h2) = hash_pair(&self.build_hasher, &candidate);
            let _pair = self.lock_pair(h1, h2);
            let capacity = self.capacity.load(Relaxed);
            let (own, to) = if side == 0 {
                (bucket_index(h1, capacity), bucket_index(h2, capacity))
            } else {
                (bucket_index(h2, capacity), bucket_index(h1, capacity))
            };
            if own != from {
                // A resize rebuilt the tables; the cell we parked into no
                // longer exists under this geometry.
                return true;
            }
            let tables = unsafe { &*self.tables.get() };
            // SAFETY: the candidate's stripe pair covers its cell on both
            // sides, and `from` == its own-side bucket.
            match unsafe { tables.displace(side, from, to, &candidate, &self.cfg) } {
                Round::Done => return true,
                Round::Blocked => return false,
                Round::Moved { next_head } => {
                    side = 1 - side;
                    from = to;
                    candidate = next_head;
                }
                Round::Stale { head } => candidate = head,
            }
        }
        false
    }

    /// Doubles the table, re-inserting every key. `expected` is the
    /// capacity under which the caller decided a resize was needed; at
    /// most one such resize makes progress, and the losers of the race
    /// observe the changed capacity under the barrier and back off.
    fn resize(&self, expected: usize)
    where
        K: Clone,
    {
        let _barrier: Vec<MutexGuard<'_, ()>> =
            self.locks[0].iter().map(Mutex::lock).collect();
        if self.capacity.load(Relaxed) != expected {
            // Another thread already resized.
            return;
        }
        let tables = unsafe { &mut *self.tables.get() };
        // SAFETY: the barrier excludes every reader and writer.
        let keys = unsafe { tables.drain_all() };
        let (fresh, capacity) = rebuild(&keys, expected * 2, &self.build_hasher, &self.cfg);
        *tables = fresh;
        self.capacity.store(capacity, Release);
        self.size.store(keys.len(), SeqCst);
    }
}

impl<K, S> Debug for StripedCuckooSet<K, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StripedCuckooSet")
            .field("len", &self.size.load(Relaxed))
            .field("capacity", &self.capacity.load(Relaxed))
            .field("stripes", &self.locks[0].len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::StripedCuckooSet;

    #[test]
    fn insert_contains_remove() {
        let set = StripedCuckooSet::new();
        assert!(set.insert(7_u64));
        assert!(set.contains(&7));
        assert!(!set.insert(7));
        assert!(set.remove(&7));
        assert!(!set.remove(&7));
        assert!(set.is_empty());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let set = StripedCuckooSet::with_capacity(4);
        for key in 0_u64..512 {
            assert!(set.insert(key));
        }
        assert_eq!(set.len(), 512);
        assert!(set.capacity() >= 64);
        assert!(set.capacity().is_power_of_two());
        assert_eq!(set.census(), 512);
    }
}
