// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::lock::Lock;
use super::wait_list::WaitList;
use super::{ClientId, LockMode, ResourceType};
use scc::ebr;
use std::fmt::Write;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::AtomicU64;

/// [`Participant`] is the part of a client that other clients inspect for deadlock detection.
///
/// A [`Participant`] is bound to a client identifier for the lifetime of the lock manager; it is
/// reset whenever the identifier is handed out to a new client.
#[derive(Debug)]
pub(crate) struct Participant {
    id: ClientId,

    /// The transaction currently using the client.
    transaction_id: AtomicU64,

    /// The clients this client is (transitively) waiting for.
    wait_list: WaitList,

    /// The lock the client is currently waiting for.
    waiting_for: ebr::AtomicArc<WaitTarget>,

    /// The number of locks held in the lock tables.
    active_lock_count: AtomicU64,

    /// The hashed identifier of the thread that prepared the client for commit, or `0`.
    prepare_thread: AtomicU64,
}

/// [`WaitTarget`] is the lock a client is waiting for along with the resource it protects.
#[derive(Debug)]
pub(crate) struct WaitTarget {
    pub(crate) lock: ebr::Arc<Lock>,
    pub(crate) resource_type: ResourceType,
    pub(crate) resource_id: u64,
    pub(crate) mode: LockMode,
}

impl Participant {
    pub(crate) fn new(id: ClientId, capacity: usize) -> Participant {
        Participant {
            id,
            transaction_id: AtomicU64::new(0),
            wait_list: WaitList::with_capacity(capacity),
            waiting_for: ebr::AtomicArc::null(),
            active_lock_count: AtomicU64::new(0),
            prepare_thread: AtomicU64::new(0),
        }
    }

    /// Makes the [`Participant`] ready for a new client.
    pub(crate) fn reset(&self, transaction_id: u64) {
        self.clear_wait_state();
        self.active_lock_count.store(0, Relaxed);
        self.prepare_thread.store(0, Relaxed);
        self.transaction_id.store(transaction_id, Release);
    }

    pub(crate) fn transaction_id(&self) -> u64 {
        self.transaction_id.load(Acquire)
    }

    pub(crate) fn wait_list(&self) -> &WaitList {
        &self.wait_list
    }

    /// Returns `true` if the other client is in the wait list.
    pub(crate) fn is_waiting_for(&self, other: ClientId) -> bool {
        other != self.id && self.wait_list.contains(other)
    }

    /// Adds itself and its wait list to `other`.
    pub(crate) fn copy_wait_list_into(&self, other: &WaitList) {
        other.insert(self.id);
        other.merge(&self.wait_list);
    }

    /// Publishes the lock the client is about to wait for.
    pub(crate) fn note_waiting_for(
        &self,
        lock: &ebr::Arc<Lock>,
        resource_type: ResourceType,
        resource_id: u64,
        mode: LockMode,
    ) {
        let barrier = ebr::Barrier::new();
        if let Some(current) = self.waiting_for.load(Acquire, &barrier).as_ref() {
            if ptr::eq(&*current.lock, &**lock)
                && current.resource_type == resource_type
                && current.resource_id == resource_id
                && current.mode == mode
            {
                return;
            }
        }
        let target = ebr::Arc::new(WaitTarget {
            lock: lock.clone(),
            resource_type,
            resource_id,
            mode,
        });
        self.waiting_for.swap((Some(target), ebr::Tag::None), Release);
    }

    /// Returns the lock the client is waiting for.
    pub(crate) fn waiting_for<'b>(&self, barrier: &'b ebr::Barrier) -> Option<&'b WaitTarget> {
        self.waiting_for.load(Acquire, barrier).as_ref()
    }

    pub(crate) fn clear_wait_state(&self) {
        self.wait_list.clear();
        self.waiting_for.swap((None, ebr::Tag::None), Release);
    }

    pub(crate) fn active_lock_count(&self) -> u64 {
        self.active_lock_count.load(Acquire)
    }

    pub(crate) fn lock_acquired(&self) {
        self.active_lock_count.fetch_add(1, AcqRel);
    }

    pub(crate) fn lock_released(&self) {
        // Saturates as a forced release may meet a lock that has already been released.
        let _ = self
            .active_lock_count
            .fetch_update(AcqRel, Acquire, |count| count.checked_sub(1));
    }

    pub(crate) fn clear_lock_count(&self) {
        self.active_lock_count.store(0, Release);
    }

    /// Records the thread committing the client.
    pub(crate) fn mark_prepared(&self, thread_hash: u64) {
        self.prepare_thread.store(thread_hash.max(1), Release);
    }

    /// Returns `true` if the client has been prepared for commit by the specified thread.
    pub(crate) fn is_committing_on(&self, thread_hash: u64) -> bool {
        self.prepare_thread.load(Acquire) == thread_hash.max(1)
    }

    pub(crate) fn describe_wait_list(&self) -> String {
        let mut description = String::new();
        let _ = write!(description, "\nClient[{}] waits for [", self.id);
        let mut first = true;
        for other in self.wait_list.iter().filter(|other| *other != self.id) {
            if !first {
                description.push(',');
            }
            let _ = write!(description, "{other}");
            first = false;
        }
        description.push(']');
        description
    }
}
