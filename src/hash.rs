//! Two de-correlated hash functions derived from one base hash.
//!
//! Cuckoo hashing needs the two candidate buckets of a key to be
//! statistically independent; correlated hashes cause permanent
//! displacement loops and runaway growth. Both functions share the
//! key's single `Hash` result and diverge by seeding a strong
//! avalanche mix with two distinct constants.

use core::hash::{BuildHasher, Hash};

const SEED1: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED2: u64 = 0xbf58_476d_1ce4_e5b9;

/// Three xor-shift + multiply rounds; every input bit affects every
/// output bit.
#[inline]
pub(crate) fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Hashes `key` once and derives the two table hashes from the result.
#[inline]
pub(crate) fn hash_pair<S, Q>(build_hasher: &S, key: &Q) -> (u64, u64)
where
    S: BuildHasher,
    Q: Hash + ?Sized,
{
    let base = build_hasher.hash_one(key);
    (mix64(base ^ SEED1), mix64(base ^ SEED2))
}

/// Bucket index for a hash in a power-of-two sized table.
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn bucket_index(hash: u64, capacity: usize) -> usize {
    debug_assert!(capacity.is_power_of_two());
    hash as usize & (capacity - 1)
}
