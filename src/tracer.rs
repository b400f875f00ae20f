// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::{LockMode, ResourceType};
use std::time::Instant;

/// [`LockTracer`] is notified whenever a client starts waiting for a lock.
pub trait LockTracer: Send + Sync {
    /// Returns a [`LockWaitEvent`] that is closed when the wait ends, whatever the outcome.
    fn wait_for_lock(
        &self,
        mode: LockMode,
        resource_type: ResourceType,
        transaction_id: u64,
        resource_id: u64,
    ) -> Box<dyn LockWaitEvent>;
}

/// [`LockWaitEvent`] represents a single lock wait.
pub trait LockWaitEvent {
    /// The wait has ended.
    fn close(&mut self);
}

/// [`NoopTracer`] ignores all lock waits.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

/// [`TracingLockTracer`] reports lock waits through [`tracing`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLockTracer;

struct NoopWaitEvent;

struct TracingWaitEvent {
    mode: LockMode,
    resource_type: ResourceType,
    transaction_id: u64,
    resource_id: u64,
    start: Instant,
    closed: bool,
}

impl LockTracer for NoopTracer {
    #[inline]
    fn wait_for_lock(&self, _: LockMode, _: ResourceType, _: u64, _: u64) -> Box<dyn LockWaitEvent> {
        Box::new(NoopWaitEvent)
    }
}

impl LockWaitEvent for NoopWaitEvent {
    #[inline]
    fn close(&mut self) {}
}

impl LockTracer for TracingLockTracer {
    #[inline]
    fn wait_for_lock(
        &self,
        mode: LockMode,
        resource_type: ResourceType,
        transaction_id: u64,
        resource_id: u64,
    ) -> Box<dyn LockWaitEvent> {
        tracing::debug!(%mode, %resource_type, resource_id, transaction_id, "lock wait started");
        Box::new(TracingWaitEvent {
            mode,
            resource_type,
            transaction_id,
            resource_id,
            start: Instant::now(),
            closed: false,
        })
    }
}

impl LockWaitEvent for TracingWaitEvent {
    #[inline]
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            tracing::debug!(
                mode = %self.mode,
                resource_type = %self.resource_type,
                resource_id = self.resource_id,
                transaction_id = self.transaction_id,
                waited = ?self.start.elapsed(),
                "lock wait ended"
            );
        }
    }
}
