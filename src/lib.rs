//==----------------------------------------------------------- ------------==//
//                                 Cuckoo
//                      Copyright (c) 2022 Rob Clucas
//      This file is distributed under the APACHE License, Version 2.0.
//                         See LICENSE for details.
//==------------------------------------------------------------------------==//

//! A concurrent hash map built on bucketized cuckoo hashing, with a
//! spinlock per bucket and a breadth-first displacement search. Lookups
//! touch at most two buckets regardless of how full the table is.

pub mod cuckoomap;
mod lock;
pub mod util;

use std::hash::Hasher;

pub use cuckoomap::CuckooMap;

/// A fast hasher for small keys which folds the input into one word and
/// finishes it with the splitmix64 finalizer.
///
/// Hash quality matters differently here than in an open-addressed map:
/// the table stores the *high* byte of the hash as the cell's partial tag
/// and derives the alternate bucket from it, so a hasher whose entropy
/// sits only in the low bits (enough for an index mask) starves the tags.
/// The finalizer's last multiply-and-shift rounds push mixed bits into
/// the top byte as well.
pub struct MixHasher(u64);

impl Default for MixHasher {
    #[inline]
    fn default() -> MixHasher {
        MixHasher(0)
    }
}

impl Hasher for MixHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        let mut state = self.0;
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            state = state.rotate_left(29) ^ u64::from_le_bytes(word);
            state = state.wrapping_mul(0xbf58476d1ce4e5b9);
        }
        state ^= state >> 30;
        state = state.wrapping_mul(0xbf58476d1ce4e5b9);
        state ^= state >> 27;
        state = state.wrapping_mul(0x94d049bb133111eb);
        state ^= state >> 31;
        self.0 = state;
    }
}

/// Not really a hasher: it reassembles the key's first eight bytes as the
/// hash value, so the bucket and tag a key lands on can be chosen by
/// constructing the key. The collision and growth tests are built on
/// this; it is also usable as a real hasher for keys already known to be
/// well distributed.
pub struct IdentityHasher {
    value: u64,
    shift: u32,
}

impl Default for IdentityHasher {
    #[inline]
    fn default() -> IdentityHasher {
        IdentityHasher { value: 0, shift: 0 }
    }
}

impl Hasher for IdentityHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.value
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.shift >= 64 {
                break;
            }
            self.value |= (byte as u64) << self.shift;
            self.shift += 8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hash::{BuildHasher, BuildHasherDefault, Hash};

    fn hash_one<H: Hasher + Default, T: Hash>(value: T) -> u64 {
        BuildHasherDefault::<H>::default().hash_one(value)
    }

    #[test]
    fn identity_hasher_returns_small_keys_unchanged() {
        assert_eq!(hash_one::<IdentityHasher, _>(0u64), 0);
        assert_eq!(hash_one::<IdentityHasher, _>(42u64), 42);
        assert_eq!(hash_one::<IdentityHasher, _>(u64::MAX), u64::MAX);
        assert_eq!(hash_one::<IdentityHasher, _>(7u32), 7);
    }

    #[test]
    fn mix_hasher_spreads_the_high_byte() {
        // Sequential keys differ only in their low bits; the tags the
        // table will store come from the top byte, which must not stay
        // constant across them.
        let mut tags = std::collections::HashSet::new();
        for key in 0u64..256 {
            tags.insert((hash_one::<MixHasher, _>(key) >> 56) as u8);
        }
        assert!(tags.len() > 64);
    }
}
