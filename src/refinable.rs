//! Cuckoo set whose lock arrays grow with the table.
//!
//! Fixed stripes waste memory at small capacities and over-contend at
//! large ones, so here a *geometry* — the two bucket arrays plus their
//! two lock arrays, all of equal length — is swapped wholesale on
//! resize. Swapping is coordinated by a single-writer `owner` word:
//! bit 0 is the resizing flag, the remaining bits identify the resizing
//! thread by the address of its slot in a [`ThreadLocal`]. Lock
//! acquisition is optimistic: lock the pair in the geometry you saw,
//! then re-check that no resize invalidated it, else release and retry.
//!
//! Replaced geometries are retired, not freed: a lagging acquirer may
//! still be locking into one. Capacity doubles every swap, so the
//! retirement list stays logarithmic in the final capacity and the
//! retired arrays sum to less than one live generation.

use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::fmt::Debug;
use core::hash::{BuildHasher, Hash};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};
use core::sync::atomic::{AtomicPtr, AtomicUsize};
use std::collections::hash_map::RandomState;
use std::thread;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use thread_local::ThreadLocal;

use crate::bucket::{rebuild, Insert, Round, Tables};
use crate::config::Config;
use crate::hash::{bucket_index, hash_pair};

const RESIZING: usize = 1;

/// Bucket arrays and lock arrays of one capacity epoch.
struct Geometry<K> {
    tables: Tables<K>,
    locks: [Vec<Mutex<()>>; 2],
}

impl<K> Geometry<K> {
    fn new(capacity: usize) -> Self {
        Self::from_tables(Tables::new(capacity))
    }

    fn from_tables(tables: Tables<K>) -> Self {
        let capacity = tables.capacity();
        let mut stripes = || (0..capacity).map(|_| Mutex::new(())).collect();
        Self {
            tables,
            locks: [stripes(), stripes()],
        }
    }

    fn capacity(&self) -> usize {
        self.tables.capacity()
    }

    /// Locks and releases every first-table stripe. Every critical
    /// section holds one of them and re-checks the owner word on entry,
    /// so after this drain no operation is in flight and none can start
    /// until the owner word clears.
    fn quiesce(&self) {
        for stripe in &self.locks[0] {
            drop(stripe.lock());
        }
    }
}

/// A locked stripe pair, pinned to the geometry it was validated
/// against.
struct PairGuard<'a, K> {
    geometry: &'a Geometry<K>,
    _g1: MutexGuard<'a, ()>,
    _g2: MutexGuard<'a, ()>,
}

/// A concurrent cuckoo hash set with refinable locking.
///
/// Behaves like [`StripedCuckooSet`](crate::StripedCuckooSet) but keeps
/// one lock per bucket at every capacity, trading an optimistic
/// re-check on acquisition for contention that does not worsen as the
/// table grows.
pub struct RefinableCuckooSet<K, S = RandomState> {
    current: AtomicPtr<Geometry<K>>,
    /// Superseded geometries, kept alive until drop. Touched only by the
    /// thread holding the owner word.
    retired: UnsafeCell<Vec<Box<Geometry<K>>>>,
    owner: CachePadded<AtomicUsize>,
    size: CachePadded<AtomicUsize>,
    tag: ThreadLocal<usize>,
    build_hasher: S,
    cfg: Config,
}

// Keys move in and out through a shared reference; cells are only ever
// touched under a validated stripe pair or the owner exclusion.
unsafe impl<K: Send, S: Send> Send for RefinableCuckooSet<K, S> {}
unsafe impl<K: Send, S: Send + Sync> Sync for RefinableCuckooSet<K, S> {}

impl<K: Hash + Eq> RefinableCuckooSet<K> {
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

impl<K: Hash + Eq> Default for RefinableCuckooSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> RefinableCuckooSet<K, S>
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
        let geometry = Box::new(Geometry::new(cfg.capacity()));
        Self {
            current: AtomicPtr::new(Box::into_raw(geometry)),
            retired: UnsafeCell::new(Vec::new()),
            owner: CachePadded::new(AtomicUsize::new(0)),
            size: CachePadded::new(AtomicUsize::new(0)),
            tag: ThreadLocal::new(),
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

    /// Buckets (and locks) per table. A power of two; never decreases.
    pub fn capacity(&self) -> usize {
        self.live().capacity()
    }

    /// Returns whether `key` is in the set.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (h1, h2) = hash_pair(&self.build_hasher, key);
        let pair = self.lock_pair(h1, h2);
        let capacity = pair.geometry.capacity();
        // SAFETY: the validated pair covers both candidate cells.
        unsafe {
            pair.geometry.tables.contains_key(
                bucket_index(h1, capacity),
                bucket_index(h2, capacity),
                key,
            )
        }
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (h1, h2) = hash_pair(&self.build_hasher, key);
        let pair = self.lock_pair(h1, h2);
        let capacity = pair.geometry.capacity();
        // SAFETY: the validated pair covers both candidate cells.
        let removed = unsafe {
            pair.geometry.tables.remove_key(
                bucket_index(h1, capacity),
                bucket_index(h2, capacity),
                key,
            )
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
                let pair = self.lock_pair(h1, h2);
                let capacity = pair.geometry.capacity();
                let b1 = bucket_index(h1, capacity);
                let b2 = bucket_index(h2, capacity);
                // SAFETY: the validated pair covers both candidate cells.
                let outcome = unsafe { pair.geometry.tables.insert(b1, b2, key, &self.cfg) };
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

    /// Counts every stored key under the owner exclusion, asserting the
    /// structural invariants along the way. A diagnostic; concurrent
    /// callers are blocked for the duration.
    ///
    /// # Panics
    /// If an invariant does not hold.
    pub fn census(&self) -> usize {
        let me = self.thread_word();
        while self
            .owner
            .compare_exchange(0, me | RESIZING, AcqRel, Acquire)
            .is_err()
        {
            thread::yield_now();
        }
        let geometry = self.live();
        geometry.quiesce();
        // SAFETY: the owner word plus the quiesce exclude every mutator.
        let count = unsafe { geometry.tables.census(&self.build_hasher, &self.cfg) };
        assert_eq!(count, self.size.load(SeqCst), "len drifted from stored keys");
        self.owner.store(0, Release);
        count
    }

    /// The live geometry. Callers that need it to *stay* live must go
    /// through [`Self::lock_pair`] or hold the owner word.
    fn live(&self) -> &Geometry<K> {
        // SAFETY: geometries are never freed while the set is alive.
        unsafe { &*self.current.load(Acquire) }
    }

    /// This thread's identity word: the address of its slot in the
    /// per-set [`ThreadLocal`]. Slot alignment keeps bit 0 clear for the
    /// resizing flag.
    fn thread_word(&self) -> usize {
        let slot: &usize = self.tag.get_or(|| 0);
        let addr = core::ptr::from_ref(slot) as usize;
        debug_assert_eq!(addr & RESIZING, 0);
        addr
    }

    /// Optimistic stripe-pair acquisition.
    ///
    /// Lock the pair in the geometry observed, then re-check that the
    /// owner word is clear (or ours) and that no resize swapped the
    /// geometry in between. On failure release both and start over; on
    /// success the guard pins a pair that is valid until released,
    /// because a later resize must first quiesce the very locks it
    /// holds.
    fn lock_pair(&self, h1: u64, h2: u64) -> PairGuard<'_, K> {
        let me = self.thread_word();
        loop {
            let owner = self.owner.load(Acquire);
            if owner & RESIZING != 0 && owner & !RESIZING != me {
                thread::yield_now();
                continue;
            }
            let ptr = self.current.load(Acquire);
            // SAFETY: geometries are never freed while the set is alive.
            let geometry = unsafe { &*ptr };
            let capacity = geometry.capacity();
            let g1 = geometry.locks[0][bucket_index(h1, capacity)].lock();
            let g2 = geometry.locks[1][bucket_index(h2, capacity)].lock();
            let owner = self.owner.load(Acquire);
            let unmarked = owner & RESIZING == 0 || owner & !RESIZING == me;
            if unmarked && core::ptr::eq(self.current.load(Acquire), ptr) {
                return PairGuard {
                    geometry,
                    _g1: g1,
                    _g2: g2,
                };
            }
            // A resize slipped in between; these stripes may no longer
            // govern the live geometry.
            drop(g2);
            drop(g1);
        }
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
            let pair = self.lock_pair(h1, h2);
            let capacity = pair.geometry.capacity();
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
            // SAFETY: the candidate's validated pair covers its cell on
            // both sides, and `from` == its own-side bucket.
            match unsafe {
                pair.geometry
                    .tables
                    .displace(side, from, to, &candidate, &self.cfg)
            } {
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

    /// Doubles the table behind the owner word, installing a fresh
    /// geometry with lock arrays of the new length. `expected` is the
    /// capacity under which the caller decided a resize was needed.
    fn resize(&self, expected: usize)
    where
        K: Clone,
    {
        let me = self.thread_word();
        if self
            .owner
            .compare_exchange(0, me | RESIZING, AcqRel, Acquire)
            .is_err()
        {
            // Another resizer is active; it will make progress for us.
            return;
        }
        let old = self.live();
        if old.capacity() != expected {
            // Someone grew the table between our trigger and the claim.
            self.owner.store(0, Release);
            return;
        }
        old.quiesce();
        // SAFETY: owner word held and in-flight holders drained; we have
        // exclusive access to the old cells.
        let keys = unsafe { old.tables.drain_all() };
        let (tables, _) = rebuild(&keys, expected * 2, &self.build_hasher, &self.cfg);
        let fresh = Box::into_raw(Box::new(Geometry::from_tables(tables)));
        let previous = self.current.swap(fresh, AcqRel);
        // SAFETY: single writer under the owner word. The previous
        // geometry is retired, not freed: a lagging acquirer may still
        // lock into it before its post-check sends it around again.
        unsafe {
            (*self.retired.get()).push(Box::from_raw(previous));
        }
        self.size.store(keys.len(), SeqCst);
        self.owner.store(0, Release);
    }
}

impl<K, S> Drop for RefinableCuckooSet<K, S> {
    fn drop(&mut self) {
        let current = *self.current.get_mut();
        // SAFETY: exclusive access; `current` always holds a Box leaked
        // at construction or resize, and retired boxes drop with their
        // Vec.
        drop(unsafe { Box::from_raw(current) });
    }
}

impl<K, S> Debug for RefinableCuckooSet<K, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RefinableCuckooSet")
            .field("len", &self.size.load(Relaxed))
            .field("owner", &self.owner.load(Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::RefinableCuckooSet;

    #[test]
    fn insert_contains_remove() {
        let set = RefinableCuckooSet::new();
        assert!(set.insert(7_u64));
        assert!(set.contains(&7));
        assert!(!set.insert(7));
        assert!(set.remove(&7));
        assert!(!set.remove(&7));
        assert!(set.is_empty());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let set = RefinableCuckooSet::with_capacity(4);
        for key in 0_u64..512 {
            assert!(set.insert(key));
        }
        assert_eq!(set.len(), 512);
        assert!(set.capacity() >= 64);
        assert!(set.capacity().is_power_of_two());
        assert_eq!(set.census(), 512);
    }

    #[test]
    fn lock_arrays_track_capacity() {
        let set = RefinableCuckooSet::with_capacity(4);
        let before = set.capacity();
        for key in 0_u64..256 {
            set.insert(key);
        }
        assert!(set.capacity() > before);
        // The geometry swap keeps one lock per bucket; census exercises
        // the owner protocol end to end.
        assert_eq!(set.census(), 256);
    }
}
