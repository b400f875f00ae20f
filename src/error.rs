// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::ResourceType;
use std::time::Duration;

/// [`Error`] defines all the error codes used by the lock manager.
///
/// [`Error::Timeout`] and [`Error::Deadlock`] abort only the pending acquisition; the caller is
/// expected to roll back the transaction and may retry it as a whole. The other variants indicate
/// that the client cannot be used any longer, or that the caller is misusing the API.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// The client has begun stopping, and no further operations are accepted.
    #[error("{0} has been stopped")]
    ClientStopped(String),

    /// Acquiring the lock would form a wait cycle among clients.
    #[error("deadlock detected: {0}")]
    Deadlock(String),

    /// The operation encountered a lock in a state that the client cannot have produced.
    ///
    /// This is a programming error of the caller, e.g., releasing a lock that is not held.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The memory tracker refused to account for a new lock entry.
    #[error("memory limit exceeded")]
    OutOfMemory,

    /// The lock could not be acquired within the configured acquisition timeout.
    #[error("unable to acquire lock on {resource_type}({resource_id}) within {timeout:?}")]
    Timeout {
        /// The type of the contended resource.
        resource_type: ResourceType,

        /// The identifier of the contended resource.
        resource_id: u64,

        /// The configured acquisition timeout.
        timeout: Duration,
    },

    /// The supplied parameter value is wrong.
    #[error("wrong parameter: {0}")]
    WrongParameter(&'static str),
}

impl Error {
    /// Returns `true` if retrying the whole transaction may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::Error;
    ///
    /// assert!(Error::Deadlock(String::new()).is_transient());
    /// assert!(!Error::OutOfMemory.is_transient());
    /// ```
    #[inline]
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Deadlock(_) | Error::Timeout { .. })
    }
}
