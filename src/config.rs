// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::Error;
use std::time::Duration;

/// [`Config`] holds the tunable parameters of a [`LockManager`](super::LockManager).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The longest time a client waits for any single lock; [`Duration::ZERO`] waits forever.
    pub lock_acquisition_timeout: Duration,

    /// Attaches the wait cycle and a dump of the lock tables to deadlock errors.
    pub verbose_deadlocks: bool,

    /// The maximum number of clients alive at the same time.
    ///
    /// Client identifiers are below this value, and it determines the size of every wait list.
    pub max_clients: usize,

    /// The number of failed attempts to acquire an exclusive lock on a shared lock held by others
    /// before the client tries to upgrade it.
    pub upgrade_grace_period: u32,

    /// The number of failed attempts after which a suspected deadlock is verified.
    pub deadlock_verification_threshold: u32,
}

impl Config {
    /// Sets the lock acquisition timeout.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::Config;
    /// use std::time::Duration;
    ///
    /// let config = Config::default().with_lock_acquisition_timeout(Duration::from_secs(1));
    /// assert_eq!(config.lock_acquisition_timeout, Duration::from_secs(1));
    /// ```
    #[inline]
    #[must_use]
    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    /// Enables or disables verbose deadlock messages.
    #[inline]
    #[must_use]
    pub fn with_verbose_deadlocks(mut self, verbose_deadlocks: bool) -> Self {
        self.verbose_deadlocks = verbose_deadlocks;
        self
    }

    /// Sets the maximum number of clients.
    #[inline]
    #[must_use]
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Sets the upgrade grace period.
    #[inline]
    #[must_use]
    pub fn with_upgrade_grace_period(mut self, tries: u32) -> Self {
        self.upgrade_grace_period = tries;
        self
    }

    /// Sets the deadlock verification threshold.
    #[inline]
    #[must_use]
    pub fn with_deadlock_verification_threshold(mut self, tries: u32) -> Self {
        self.deadlock_verification_threshold = tries;
        self
    }

    /// Checks the parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] if the configuration cannot be used.
    #[inline]
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_clients == 0 {
            return Err(Error::WrongParameter("max_clients must be positive"));
        }
        if self.max_clients > MAX_CLIENTS_LIMIT {
            return Err(Error::WrongParameter("max_clients is too large"));
        }
        Ok(())
    }
}

/// Client identifiers must fit into a shared lock holder count.
const MAX_CLIENTS_LIMIT: usize = 1 << 20;

impl Default for Config {
    #[inline]
    fn default() -> Self {
        Config {
            lock_acquisition_timeout: Duration::ZERO,
            verbose_deadlocks: false,
            max_clients: 1024,
            upgrade_grace_period: 50,
            deadlock_verification_threshold: 100,
        }
    }
}
