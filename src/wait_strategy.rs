// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::hint;
use std::thread;
use std::time::Duration;

/// [`WaitStrategy`] decides how long a client backs off between attempts to acquire a contended
/// lock.
pub trait WaitStrategy: Send + Sync {
    /// Blocks the calling thread for a while.
    ///
    /// `iteration` is the number of failed attempts to acquire the current resource.
    fn apply(&self, iteration: u32);
}

/// [`IncrementalBackoff`] spins, then yields briefly, and finally sleeps for a fixed interval.
#[derive(Clone, Debug)]
pub struct IncrementalBackoff {
    /// The number of iterations that only spin.
    pub max_spins: u32,

    /// The number of iterations, after spinning, that park the thread for a very short time.
    pub max_parks: u32,

    /// The sleep interval after spinning and parking.
    pub sleep: Duration,
}

/// [`ExponentialBackoff`] doubles the sleep interval after every attempt up to a limit.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// The first sleep interval.
    pub base: Duration,

    /// The longest sleep interval.
    pub max: Duration,
}

impl Default for IncrementalBackoff {
    #[inline]
    fn default() -> Self {
        IncrementalBackoff {
            max_spins: 1000,
            max_parks: 2,
            sleep: Duration::from_millis(1),
        }
    }
}

impl WaitStrategy for IncrementalBackoff {
    #[inline]
    fn apply(&self, iteration: u32) {
        if iteration < self.max_spins {
            hint::spin_loop();
        } else if iteration - self.max_spins < self.max_parks {
            thread::park_timeout(Duration::from_nanos(500));
        } else {
            thread::sleep(self.sleep);
        }
    }
}

impl Default for ExponentialBackoff {
    #[inline]
    fn default() -> Self {
        ExponentialBackoff {
            base: Duration::from_micros(1),
            max: Duration::from_millis(10),
        }
    }
}

impl WaitStrategy for ExponentialBackoff {
    #[inline]
    fn apply(&self, iteration: u32) {
        let factor = 1_u32.checked_shl(iteration.min(31)).unwrap_or(u32::MAX);
        let interval = self.base.saturating_mul(factor).min(self.max);
        if interval.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(interval);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[test]
    fn exponential_backoff() {
        let backoff = ExponentialBackoff {
            base: Duration::from_micros(100),
            max: Duration::from_millis(2),
        };
        let start = Instant::now();
        backoff.apply(u32::MAX);
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn incremental_backoff() {
        let backoff = IncrementalBackoff::default();
        let start = Instant::now();
        for iteration in 0..backoff.max_spins {
            backoff.apply(iteration);
        }
        let spun = start.elapsed();
        let start = Instant::now();
        backoff.apply(backoff.max_spins + backoff.max_parks);
        assert!(start.elapsed() >= backoff.sleep);
        assert!(spun < Duration::from_secs(1));
    }
}
