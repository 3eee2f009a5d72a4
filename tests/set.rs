//! Sequential semantics, mirrored against `std::collections::HashSet`.

use std::collections::HashSet;
use std::hash::{BuildHasher, Hash, Hasher};

use brood::{Config, RefinableCuckooSet, StripedCuckooSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn sequential_mixed_striped() {
    let set = StripedCuckooSet::with_capacity(16);
    let returns: Vec<bool> = [10, 20, 30, 40, 10]
        .into_iter()
        .map(|key| set.insert(key))
        .collect();
    assert_eq!(returns, [true, true, true, true, false]);
    assert_eq!(set.len(), 4);
    for key in [10, 20, 30, 40] {
        assert!(set.contains(&key));
    }
    assert!(!set.contains(&999));
}

#[test]
fn sequential_mixed_refinable() {
    let set = RefinableCuckooSet::with_capacity(16);
    let returns: Vec<bool> = [10, 20, 30, 40, 10]
        .into_iter()
        .map(|key| set.insert(key))
        .collect();
    assert_eq!(returns, [true, true, true, true, false]);
    assert_eq!(set.len(), 4);
    for key in [10, 20, 30, 40] {
        assert!(set.contains(&key));
    }
    assert!(!set.contains(&999));
}

#[test]
fn forced_growth_striped() {
    let set = StripedCuckooSet::with_capacity(4);
    let mut capacity = set.capacity();
    for key in 0_u64..1000 {
        assert!(set.insert(key));
        // Growth is monotone.
        assert!(set.capacity() >= capacity);
        capacity = set.capacity();
    }
    assert_eq!(set.len(), 1000);
    assert!(set.capacity().is_power_of_two());
    assert!(set.capacity() >= 128);
    for key in 0_u64..1000 {
        assert!(set.contains(&key));
    }
    assert_eq!(set.census(), 1000);
    for key in 0_u64..1000 {
        assert!(set.remove(&key));
    }
    assert_eq!(set.len(), 0);
    assert!(set.is_empty());
}

#[test]
fn forced_growth_refinable() {
    let set = RefinableCuckooSet::with_capacity(4);
    for key in 0_u64..1000 {
        assert!(set.insert(key));
    }
    assert_eq!(set.len(), 1000);
    assert!(set.capacity().is_power_of_two());
    assert!(set.capacity() >= 128);
    for key in 0_u64..1000 {
        assert!(set.contains(&key));
    }
    assert_eq!(set.census(), 1000);
    for key in 0_u64..1000 {
        assert!(set.remove(&key));
    }
    assert!(set.is_empty());
}

#[test]
fn idempotent_add_remove() {
    let striped = StripedCuckooSet::new();
    let refinable = RefinableCuckooSet::new();
    assert!(striped.insert("key"));
    assert!(!striped.insert("key"));
    assert!(refinable.insert("key"));
    assert!(!refinable.insert("key"));
    assert!(striped.remove("key"));
    assert!(!striped.remove("key"));
    assert!(refinable.remove("key"));
    assert!(!refinable.remove("key"));
    assert!(!striped.remove("never"));
    assert!(!refinable.remove("never"));
}

#[test]
fn populate_is_plain_insertion() {
    let set = StripedCuckooSet::new();
    set.populate(0_u64..100);
    set.populate(50_u64..150);
    assert_eq!(set.len(), 150);
    assert_eq!(set.census(), 150);
}

fn mirror_random_ops<K, F>(ops: usize, mut make_key: F)
where
    K: Hash + Eq + Clone,
    F: FnMut(&mut StdRng) -> K,
{
    let striped = StripedCuckooSet::new();
    let refinable = RefinableCuckooSet::new();
    let mut reference = HashSet::new();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..ops {
        let key = make_key(&mut rng);
        match rng.gen_range(0..3) {
            0 => {
                let expected = reference.insert(key.clone());
                assert_eq!(striped.insert(key.clone()), expected);
                assert_eq!(refinable.insert(key), expected);
            }
            1 => {
                let expected = reference.remove(&key);
                assert_eq!(striped.remove(&key), expected);
                assert_eq!(refinable.remove(&key), expected);
            }
            _ => {
                let expected = reference.contains(&key);
                assert_eq!(striped.contains(&key), expected);
                assert_eq!(refinable.contains(&key), expected);
            }
        }
    }
    assert_eq!(striped.len(), reference.len());
    assert_eq!(refinable.len(), reference.len());
    for key in &reference {
        assert!(striped.contains(key));
        assert!(refinable.contains(key));
    }
    assert_eq!(striped.census(), reference.len());
    assert_eq!(refinable.census(), reference.len());
}

#[test]
fn mirrors_reference_set_ints() {
    mirror_random_ops(10_000, |rng| rng.gen_range(0_u32..5_000));
}

#[test]
fn mirrors_reference_set_strings() {
    mirror_random_ops(5_000, |rng| {
        let len = rng.gen_range(1..=10);
        (0..len)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect::<String>()
    });
}

#[derive(Clone, Copy, Hash, PartialEq, Eq)]
struct Point {
    x: i32,
    y: i32,
}

#[test]
fn mirrors_reference_set_user_type() {
    mirror_random_ops(5_000, |rng| Point {
        x: rng.gen_range(0..50),
        y: rng.gen_range(0..50),
    });
}

/// Collapses every key to one of two base hashes, so each parity class
/// shares a single pair of candidate cells.
#[derive(Clone, Copy, Default)]
struct ParityHasher {
    state: u64,
}

impl Hasher for ParityHasher {
    fn finish(&self) -> u64 {
        self.state & 1
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state = self.state.wrapping_add(u64::from(byte));
        }
    }

    fn write_u64(&mut self, n: u64) {
        self.state = n;
    }
}

#[derive(Clone, Copy, Default)]
struct Parity;

impl BuildHasher for Parity {
    type Hasher = ParityHasher;

    fn build_hasher(&self) -> ParityHasher {
        ParityHasher::default()
    }
}

#[test]
fn degenerate_hasher_fills_both_cells() {
    // Every even key shares one (h1, h2) pair, every odd key the other.
    // With the default threshold of 2, three keys per class fit without
    // displacement: two in the first table, the third in the second.
    let set = StripedCuckooSet::with_config_and_hasher(Config::default(), Parity);
    let before = set.capacity();
    for key in [0_u64, 2, 4, 1, 3, 5] {
        assert!(set.insert(key));
    }
    assert_eq!(set.len(), 6);
    for key in [0_u64, 2, 4, 1, 3, 5] {
        assert!(set.contains(&key));
    }
    assert_eq!(set.capacity(), before);
    assert_eq!(set.census(), 6);
}

#[test]
fn custom_config_tightens_cells() {
    let cfg = Config {
        initial_capacity: 8,
        threshold: 1,
        probe_size: 2,
        relocation_limit: 4,
    };
    let striped = StripedCuckooSet::with_config(cfg);
    let refinable = RefinableCuckooSet::with_config(cfg);
    for key in 0_u64..500 {
        assert!(striped.insert(key));
        assert!(refinable.insert(key));
    }
    assert_eq!(striped.census(), 500);
    assert_eq!(refinable.census(), 500);
}

#[test]
fn borrowed_lookups() {
    let set = StripedCuckooSet::new();
    assert!(set.insert(String::from("alpha")));
    assert!(set.contains("alpha"));
    assert!(set.remove("alpha"));
    assert!(!set.contains("alpha"));
}
