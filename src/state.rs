// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::thread;
use std::time::Duration;

/// [`StateHolder`] tracks the operations in progress on a client.
///
/// The state is a single word: the most significant bit marks the client stopped, the next one
/// marks it prepared for commit, and the remaining bits count the active operations.
#[derive(Debug, Default)]
pub(crate) struct StateHolder {
    state: AtomicU32,
}

/// [`ActiveOperation`] is an operation in progress on a client.
///
/// The operation is deregistered when the [`ActiveOperation`] is dropped.
#[derive(Debug)]
pub(crate) struct ActiveOperation<'s> {
    state_holder: &'s StateHolder,
}

const STOPPED: u32 = 1_u32 << 31;
const PREPARED: u32 = 1_u32 << 30;
const OPERATION_MASK: u32 = PREPARED - 1;

/// The interval at which draining threads check the state.
const DRAIN_INTERVAL: Duration = Duration::from_millis(1);

impl StateHolder {
    /// Registers an operation.
    ///
    /// Returns `None` if the client is stopped.
    pub(crate) fn enter(&self) -> Option<ActiveOperation<'_>> {
        self.state
            .fetch_update(AcqRel, Acquire, |state| {
                if state & STOPPED != 0 || state & OPERATION_MASK == OPERATION_MASK {
                    None
                } else {
                    Some(state + 1)
                }
            })
            .ok()
            .map(|_| ActiveOperation { state_holder: self })
    }

    /// Marks the client prepared for commit.
    ///
    /// Returns `false` if the client is stopped.
    pub(crate) fn prepare(&self) -> bool {
        self.state
            .fetch_update(AcqRel, Acquire, |state| {
                (state & STOPPED == 0).then_some(state | PREPARED)
            })
            .is_ok()
    }

    /// Marks the client stopped.
    ///
    /// Returns `true` if this call stopped the client.
    pub(crate) fn stop(&self) -> bool {
        self.state.fetch_or(STOPPED, AcqRel) & STOPPED == 0
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.load(Acquire) & STOPPED != 0
    }

    #[cfg(test)]
    pub(crate) fn is_prepared(&self) -> bool {
        self.state.load(Acquire) & PREPARED != 0
    }

    pub(crate) fn active_operations(&self) -> u32 {
        self.state.load(Acquire) & OPERATION_MASK
    }

    /// Waits until at most `max` operations are active.
    pub(crate) fn drain(&self, max: u32) {
        while self.active_operations() > max {
            thread::sleep(DRAIN_INTERVAL);
        }
    }

    fn leave(&self) {
        let prev = self.state.fetch_sub(1, Release);
        debug_assert_ne!(prev & OPERATION_MASK, 0);
    }
}

impl<'s> Drop for ActiveOperation<'s> {
    #[inline]
    fn drop(&mut self) {
        self.state_holder.leave();
    }
}
