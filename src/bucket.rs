//! The two-table bucket store and the displacement machinery shared by
//! both locking variants.
//!
//! Cells are interior-mutable so that threads holding disjoint stripe
//! locks can mutate disjoint cells through a shared reference. Every
//! `unsafe fn` here has the same contract: the caller must hold locks
//! (or an exclusion equivalent, such as a resize barrier) covering the
//! cells it names.

use core::borrow::Borrow;
use core::cell::UnsafeCell;
use core::hash::{BuildHasher, Hash};

use crate::config::{Config, MAX_CAPACITY};
use crate::hash::{bucket_index, hash_pair};

/// Outcome of classifying an insert into a key's two candidate cells.
pub(crate) enum Insert<K> {
    /// The key was already present; nothing was written.
    Duplicate,
    /// The key landed in a cell below the threshold.
    Done,
    /// The key was appended to a near-full cell; `head` is that cell's
    /// first element, cloned while the caller's locks still cover it,
    /// and is the first displacement candidate.
    Parked { side: usize, bucket: usize, head: K },
    /// Both candidate cells are at the probe size; the key is handed
    /// back so the caller can resize and retry.
    Full(K),
}

/// Outcome of a single displacement round.
pub(crate) enum Round<K> {
    /// The offending cell is resolved; displacement is finished.
    Done,
    /// The candidate moved into a cell that is itself over the
    /// threshold; continue by evicting that cell's head.
    Moved { next_head: K },
    /// The candidate vanished (a concurrent remove) but the source cell
    /// is still over the threshold; retry with its current head.
    Stale { head: K },
    /// The target cell is full; the candidate was put back. The caller
    /// must resize.
    Blocked,
}

/// Two parallel arrays of cells, one per hash function.
///
/// Not `Sync` on its own; the owning set vouches for the lock
/// discipline and re-asserts `Sync` at its level.
pub(crate) struct Tables<K> {
    cells: [Box<[UnsafeCell<Vec<K>>]>; 2],
}

impl<K> Tables<K> {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mut table = || (0..capacity).map(|_| UnsafeCell::new(Vec::new())).collect();
        Self {
            cells: [table(), table()],
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cells[0].len()
    }

    /// # Safety
    /// The caller must hold a lock covering `(side, bucket)`.
    unsafe fn cell(&self, side: usize, bucket: usize) -> &Vec<K> {
        &*self.cells[side][bucket].get()
    }

    /// # Safety
    /// The caller must hold a lock granting exclusive access to
    /// `(side, bucket)`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn cell_mut(&self, side: usize, bucket: usize) -> &mut Vec<K> {
        &mut *self.cells[side][bucket].get()
    }
}

impl<K: Eq> Tables<K> {
    /// # Safety
    /// The caller must hold the lock pair covering `(0, b1)` and
    /// `(1, b2)`.
    pub(crate) unsafe fn contains_key<Q>(&self, b1: usize, b2: usize, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        self.cell(0, b1).iter().any(|k| k.borrow() == key)
            || self.cell(1, b2).iter().any(|k| k.borrow() == key)
    }

    /// Erases `key` from whichever candidate cell holds it.
    ///
    /// # Safety
    /// The caller must hold the lock pair covering `(0, b1)` and
    /// `(1, b2)`.
    pub(crate) unsafe fn remove_key<Q>(&self, b1: usize, b2: usize, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let s1 = self.cell_mut(0, b1);
        if let Some(pos) = s1.iter().position(|k| k.borrow() == key) {
            s1.swap_remove(pos);
            return true;
        }
        let s2 = self.cell_mut(1, b2);
        if let Some(pos) = s2.iter().position(|k| k.borrow() == key) {
            s2.swap_remove(pos);
            return true;
        }
        false
    }

    /// Classifies and performs an insert into the key's candidate cells.
    ///
    /// The first table is preferred on ties; that skews occupancy, not
    /// correctness.
    ///
    /// # Safety
    /// The caller must hold the lock pair covering `(0, b1)` and
    /// `(1, b2)`.
    pub(crate) unsafe fn insert(&self, b1: usize, b2: usize, key: K, cfg: &Config) -> Insert<K>
    where
        K: Clone,
    {
        if self.contains_key(b1, b2, &key) {
            return Insert::Duplicate;
        }
        let s1 = self.cell_mut(0, b1);
        if s1.len() < cfg.threshold {
            s1.push(key);
            return Insert::Done;
        }
        let s2 = self.cell_mut(1, b2);
        if s2.len() < cfg.threshold {
            s2.push(key);
            return Insert::Done;
        }
        if s1.len() < cfg.probe_size {
            s1.push(key);
            return Insert::Parked {
                side: 0,
                bucket: b1,
                head: s1[0].clone(),
            };
        }
        if s2.len() < cfg.probe_size {
            s2.push(key);
            return Insert::Parked {
                side: 1,
                bucket: b2,
                head: s2[0].clone(),
            };
        }
        Insert::Full(key)
    }

    /// One displacement round: try to move `candidate` out of
    /// `(side, from)` into `(1 - side, to)`.
    ///
    /// Eviction erases order-preserving so the head position keeps its
    /// meaning; the candidate may have drifted from the head under
    /// concurrency, which is why it is searched rather than popped.
    ///
    /// # Safety
    /// The caller must hold the candidate's lock pair, which covers both
    /// `(side, from)` and `(1 - side, to)` — `from` and `to` must be the
    /// candidate's buckets under the current capacity.
    pub(crate) unsafe fn displace(
        &self,
        side: usize,
        from: usize,
        to: usize,
        candidate: &K,
        cfg: &Config,
    ) -> Round<K>
    where
        K: Clone,
    {
        let src = self.cell_mut(side, from);
        if let Some(pos) = src.iter().position(|k| k == candidate) {
            let evicted = src.remove(pos);
            let dst = self.cell_mut(1 - side, to);
            if dst.len() < cfg.threshold {
                dst.push(evicted);
                Round::Done
            } else if dst.len() < cfg.probe_size {
                dst.push(evicted);
                Round::Moved {
                    next_head: dst[0].clone(),
                }
            } else {
                src.push(evicted);
                Round::Blocked
            }
        } else if src.len() >= cfg.threshold {
            // The candidate was removed concurrently but the cell is
            // still over the threshold; its current head is the next
            // candidate.
            Round::Stale {
                head: src[0].clone(),
            }
        } else {
            Round::Done
        }
    }

    /// Moves every key out of both tables, leaving all cells empty.
    ///
    /// # Safety
    /// The caller must have exclusive access to every cell (a resize
    /// barrier or owner exclusion).
    pub(crate) unsafe fn drain_all(&self) -> Vec<K> {
        let mut keys = Vec::new();
        for slot in self.cells.iter().flat_map(|table| table.iter()) {
            keys.append(&mut *slot.get());
        }
        keys
    }
}

impl<K: Hash + Eq> Tables<K> {
    /// Counts every stored key while checking the structural invariants:
    /// the probe bound, placement in the key's own bucket, and absence
    /// from the twin cell.
    ///
    /// # Safety
    /// The caller must have exclusive access to every cell.
    pub(crate) unsafe fn census<S: BuildHasher>(&self, build_hasher: &S, cfg: &Config) -> usize {
        let capacity = self.capacity();
        let mut count = 0;
        for (side, table) in self.cells.iter().enumerate() {
            for (bucket, slot) in table.iter().enumerate() {
                let cell = &*slot.get();
                assert!(cell.len() <= cfg.probe_size, "cell exceeds the probe size");
                for key in cell {
                    let (h1, h2) = hash_pair(build_hasher, key);
                    let (own, other) = if side == 0 {
                        (bucket_index(h1, capacity), bucket_index(h2, capacity))
                    } else {
                        (bucket_index(h2, capacity), bucket_index(h1, capacity))
                    };
                    assert_eq!(own, bucket, "key stored outside its bucket");
                    assert_eq!(
                        cell.iter().filter(|k| *k == key).count(),
                        1,
                        "key duplicated within a cell"
                    );
                    let twin = &*self.cells[1 - side][other].get();
                    assert!(!twin.contains(key), "key present in both tables");
                    count += 1;
                }
            }
        }
        count
    }
}

/// Builds fresh tables of at least `capacity` cells per side holding
/// every key in `keys`, doubling until the whole batch fits without a
/// displacement failure.
///
/// Runs single-threaded under the caller's exclusion; both resize paths
/// funnel through here.
///
/// # Panics
/// If the required capacity exceeds [`MAX_CAPACITY`], which indicates
/// the hash function is not spreading keys.
pub(crate) fn rebuild<K, S>(
    keys: &[K],
    mut capacity: usize,
    build_hasher: &S,
    cfg: &Config,
) -> (Tables<K>, usize)
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    'grow: loop {
        assert!(
            capacity <= MAX_CAPACITY,
            "hash table too large; check the hash function"
        );
        let tables = Tables::new(capacity);
        for key in keys {
            if !insert_unlocked(&tables, capacity, build_hasher, cfg, key.clone()) {
                capacity *= 2;
                continue 'grow;
            }
        }
        return (tables, capacity);
    }
}

fn insert_unlocked<K, S>(
    tables: &Tables<K>,
    capacity: usize,
    build_hasher: &S,
    cfg: &Config,
    key: K,
) -> bool
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    let (h1, h2) = hash_pair(build_hasher, &key);
    let b1 = bucket_index(h1, capacity);
    let b2 = bucket_index(h2, capacity);
    // SAFETY: the rebuild owns the tables exclusively.
    match unsafe { tables.insert(b1, b2, key, cfg) } {
        Insert::Duplicate | Insert::Done => true,
        Insert::Full(_) => false,
        Insert::Parked { side, bucket, head } => {
            relocate_unlocked(tables, capacity, build_hasher, cfg, side, bucket, head)
        }
    }
}

fn relocate_unlocked<K, S>(
    tables: &Tables<K>,
    capacity: usize,
    build_hasher: &S,
    cfg: &Config,
    mut side: usize,
    mut from: usize,
    mut candidate: K,
) -> bool
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    for _ in 0..cfg.relocation_limit {
        let (h1, h2) = hash_pair(build_hasher, &candidate);
        let (own, to) = if side == 0 {
            (bucket_index(h1, capacity), bucket_index(h2, capacity))
        } else {
            (bucket_index(h2, capacity), bucket_index(h1, capacity))
        };
        debug_assert_eq!(own, from);
        // SAFETY: the rebuild owns the tables exclusively.
        match unsafe { tables.displace(side, from, to, &candidate, cfg) } {
            Round::Done => return true,
            Round::Blocked => return false,
            Round::Moved { next_head } => {
                side = 1 - side;
                from = to;
                candidate = next_head;
            }
            // Unreachable single-threaded; kept total for the shared body.
            Round::Stale { head } => candidate = head,
        }
    }
    false
}
