// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Collection of utility functions.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::thread::{current, ThreadId};

/// The non-cryptographic [`Hasher`] for integer keys.
///
/// Lock reference counters are keyed by resource identifiers, for which the default hasher is
/// needlessly slow.
#[derive(Clone, Copy, Debug, Default)]
pub struct IntHasher(u64);

/// Local lock reference counters keyed by resource identifiers.
pub(crate) type CountMap = HashMap<u64, u32, BuildHasherDefault<IntHasher>>;

/// Returns the current thread identifier.
///
/// It caches the thread identifier in it that makes this function significantly faster than
/// [`std::thread::Thread::id`].
///
/// # Examples
///
/// ```
/// use forseti_locks::utils;
///
/// assert_eq!(utils::thread_id(), std::thread::current().id());
/// ```
#[inline]
#[must_use]
pub fn thread_id() -> ThreadId {
    THREAD_ID.with(|id| *id)
}

/// Returns a non-zero hash value of the current thread identifier.
///
/// Different threads may produce the same value.
///
/// # Examples
///
/// ```
/// use forseti_locks::utils;
///
/// assert_ne!(utils::thread_hash(), 0);
/// assert_eq!(utils::thread_hash(), utils::thread_hash());
/// ```
#[inline]
#[must_use]
pub fn thread_hash() -> u64 {
    THREAD_HASH.with(|hash| *hash)
}

impl Hasher for IntHasher {
    #[inline]
    fn write(&mut self, msg: &[u8]) {
        let mut iter = msg.chunks_exact(8);
        for chunk in iter.by_ref() {
            let mut word = [0_u8; 8];
            word.copy_from_slice(chunk);
            self.0 ^= u64::from_le_bytes(word);
        }
        for (i, byte) in iter.remainder().iter().enumerate() {
            self.0 ^= u64::from(*byte) << (i * 8);
        }
    }

    #[inline]
    fn write_u64(&mut self, i: u64) {
        self.0 ^= i;
    }

    /// Mixes the bits with the `rrmxmx` finalizer by Pelle Evensen.
    #[inline]
    fn finish(&self) -> u64 {
        let mut v = self.0;
        v ^= v.rotate_right(49) ^ v.rotate_left(24);
        v = v.wrapping_mul(0x9FB2_1C65_1E98_DF25);
        v ^= v.wrapping_shr(24);
        v = v.wrapping_mul(0x9FB2_1C65_1E98_DF25);
        v ^ v.wrapping_shr(24)
    }
}

fn hash_thread_id(thread_id: ThreadId) -> u64 {
    let mut hasher = IntHasher::default();
    thread_id.hash(&mut hasher);
    hasher.finish().max(1)
}

thread_local! {
    static THREAD_ID: ThreadId = current().id();
    static THREAD_HASH: u64 = hash_thread_id(current().id());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn int_hasher() {
        let mut counts = CountMap::default();
        for id in 0..1024_u64 {
            counts.insert(id, 1);
        }
        assert_eq!(counts.len(), 1024);

        let mut a = IntHasher::default();
        a.write_u64(7);
        let mut b = IntHasher::default();
        b.write(&7_u64.to_le_bytes());
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn thread_hash_non_zero() {
        let here = thread_hash();
        let there = std::thread::spawn(thread_hash).join().unwrap_or(here);
        assert_ne!(here, 0);
        assert_ne!(there, 0);
    }
}
