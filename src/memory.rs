// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::Error;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;

/// [`MemoryTracker`] accounts for the heap memory consumed by lock table entries.
pub trait MemoryTracker: Send + Sync {
    /// Accounts for newly allocated heap memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the allocation cannot be granted.
    fn allocate_heap(&self, bytes: usize) -> Result<(), Error>;

    /// Accounts for released heap memory.
    fn release_heap(&self, bytes: usize);

    /// Returns the number of bytes currently accounted for.
    fn estimated_heap_memory(&self) -> usize;
}

/// [`LocalMemoryTracker`] counts bytes with an atomic counter and an optional limit.
#[derive(Debug, Default)]
pub struct LocalMemoryTracker {
    allocated: AtomicUsize,
    limit: Option<usize>,
}

/// [`ScopedMemoryTracker`] keeps the memory allocated on behalf of a single client.
///
/// Once stopped, releases are deferred until the tracker is closed, as a stopped client may be
/// released by a thread other than the one that allocated the memory.
pub(crate) struct ScopedMemoryTracker {
    delegate: Arc<dyn MemoryTracker>,
    allocated: usize,
    stopped: bool,
}

impl LocalMemoryTracker {
    /// Creates a [`LocalMemoryTracker`] refusing allocations above `limit` bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LocalMemoryTracker, MemoryTracker};
    ///
    /// let memory_tracker = LocalMemoryTracker::with_limit(64);
    /// assert!(memory_tracker.allocate_heap(48).is_ok());
    /// assert!(memory_tracker.allocate_heap(48).is_err());
    /// memory_tracker.release_heap(48);
    /// assert_eq!(memory_tracker.estimated_heap_memory(), 0);
    /// ```
    #[inline]
    #[must_use]
    pub fn with_limit(limit: usize) -> LocalMemoryTracker {
        LocalMemoryTracker {
            allocated: AtomicUsize::new(0),
            limit: Some(limit),
        }
    }
}

impl MemoryTracker for LocalMemoryTracker {
    #[inline]
    fn allocate_heap(&self, bytes: usize) -> Result<(), Error> {
        let limit = self.limit.unwrap_or(usize::MAX);
        self.allocated
            .fetch_update(AcqRel, Acquire, |allocated| {
                allocated.checked_add(bytes).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|_| Error::OutOfMemory)
    }

    #[inline]
    fn release_heap(&self, bytes: usize) {
        let prev = self
            .allocated
            .fetch_update(AcqRel, Acquire, |allocated| {
                Some(allocated.saturating_sub(bytes))
            })
            .unwrap_or(0);
        debug_assert!(prev >= bytes);
    }

    #[inline]
    fn estimated_heap_memory(&self) -> usize {
        self.allocated.load(Acquire)
    }
}

impl ScopedMemoryTracker {
    pub(crate) fn new(delegate: Arc<dyn MemoryTracker>) -> ScopedMemoryTracker {
        ScopedMemoryTracker {
            delegate,
            allocated: 0,
            stopped: false,
        }
    }

    pub(crate) fn allocate_heap(&mut self, bytes: usize) -> Result<(), Error> {
        self.delegate.allocate_heap(bytes)?;
        self.allocated += bytes;
        Ok(())
    }

    pub(crate) fn release_heap(&mut self, bytes: usize) {
        if !self.stopped {
            let bytes = bytes.min(self.allocated);
            self.delegate.release_heap(bytes);
            self.allocated -= bytes;
        }
    }

    /// Defers all subsequent releases until [`Self::close`].
    pub(crate) fn stop(&mut self) {
        self.stopped = true;
    }

    /// Releases everything still accounted for.
    pub(crate) fn close(&mut self) {
        if self.allocated != 0 {
            self.delegate.release_heap(self.allocated);
            self.allocated = 0;
        }
        self.stopped = false;
    }
}
