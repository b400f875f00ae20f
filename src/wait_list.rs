// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::ClientId;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Release};

/// [`WaitList`] is a fixed-capacity set of client identifiers.
///
/// It is used both for the set of clients a client is transitively waiting for, and for the set of
/// clients holding a shared lock. Readers and writers do not synchronize with each other apart
/// from individual word operations, therefore a snapshot of a [`WaitList`] may be torn.
pub(crate) struct WaitList {
    words: Box<[AtomicU64]>,
}

impl WaitList {
    /// Creates a [`WaitList`] that can hold identifiers below `capacity`.
    pub(crate) fn with_capacity(capacity: usize) -> WaitList {
        let num_words = (capacity + 63) / 64;
        let mut words = Vec::with_capacity(num_words);
        words.resize_with(num_words, || AtomicU64::new(0));
        WaitList {
            words: words.into_boxed_slice(),
        }
    }

    /// Adds the identifier.
    ///
    /// Returns `false` if the identifier was already in the set.
    pub(crate) fn insert(&self, id: ClientId) -> bool {
        let (word, mask) = Self::position(id);
        self.words[word].fetch_or(mask, Release) & mask == 0
    }

    /// Removes the identifier.
    ///
    /// Returns `false` if the identifier was not in the set.
    pub(crate) fn remove(&self, id: ClientId) -> bool {
        let (word, mask) = Self::position(id);
        self.words[word].fetch_and(!mask, Release) & mask != 0
    }

    pub(crate) fn contains(&self, id: ClientId) -> bool {
        let (word, mask) = Self::position(id);
        self.words
            .get(word)
            .map_or(false, |w| w.load(Acquire) & mask != 0)
    }

    pub(crate) fn clear(&self) {
        self.words.iter().for_each(|w| w.store(0, Release));
    }

    /// Adds all the identifiers in `other` to `self`.
    pub(crate) fn merge(&self, other: &WaitList) {
        for (mine, theirs) in self.words.iter().zip(other.words.iter()) {
            let bits = theirs.load(Acquire);
            if bits != 0 {
                mine.fetch_or(bits, Release);
            }
        }
    }

    /// Returns the number of identifiers in the set.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Acquire).count_ones() as usize)
            .sum()
    }

    /// Returns an iterator over a snapshot of the identifiers.
    pub(crate) fn iter(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.words.iter().enumerate().flat_map(|(index, word)| {
            let mut bits = word.load(Acquire);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let offset = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(index * 64 + offset)
            })
        })
    }

    fn position(id: ClientId) -> (usize, u64) {
        (id / 64, 1_u64 << (id % 64))
    }
}

impl fmt::Debug for WaitList {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
