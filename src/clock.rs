// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// [`Clock`] is a monotonic time source used to enforce lock acquisition timeouts.
///
/// Developers are able to substitute the time source, for instance, with a manually driven clock
/// in tests.
pub trait Clock: Send + Sync {
    /// Returns the number of nanoseconds elapsed since an arbitrary fixed point in time.
    ///
    /// The returned values must never decrease.
    fn nanos(&self) -> u64;
}

/// [`MonotonicClock`] reads [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

/// [`ManualClock`] only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl Clock for MonotonicClock {
    #[inline]
    fn nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    #[inline]
    fn nanos(&self) -> u64 {
        (**self).nanos()
    }
}

impl Default for MonotonicClock {
    #[inline]
    fn default() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl ManualClock {
    /// Moves the clock forward.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{Clock, ManualClock};
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// clock.advance(Duration::from_micros(3));
    /// assert_eq!(clock.nanos(), 3000);
    /// ```
    #[inline]
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(AcqRel, Acquire, |n| Some(n.saturating_add(nanos)));
    }
}

impl Clock for ManualClock {
    #[inline]
    fn nanos(&self) -> u64 {
        self.nanos.load(Acquire)
    }
}
