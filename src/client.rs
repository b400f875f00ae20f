// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::lock::{Lock, SharedLock};
use super::lock_table::LockTable;
use super::manager::Kernel;
use super::memory::ScopedMemoryTracker;
use super::participant::Participant;
use super::state::{ActiveOperation, StateHolder};
use super::utils::{self, CountMap};
use super::{
    ActiveLock, ClientId, Error, LockMode, LockTracer, LockWaitEvent, MemoryTracker, ResourceType,
};
use scc::ebr;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::{self, Write};
use std::mem::take;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// [`LockClient`] acquires and releases locks on behalf of a single transaction.
///
/// A [`LockClient`] is owned by the thread running the transaction; only [`LockClient::stop`],
/// [`LockClient::close`] and the read-only queries can be called from other threads.
///
/// Dropping a [`LockClient`] closes it.
pub struct LockClient {
    kernel: Arc<Kernel>,
    id: ClientId,
    transaction_id: u64,
    lock_acquisition_timeout: Duration,

    /// Tracks operations in progress, and whether the client is stopped or prepared.
    state: StateHolder,

    /// Set once the client is closed.
    closed: AtomicBool,

    /// The lock installed for every exclusively locked resource.
    exclusive_lock: ebr::Arc<Lock>,

    /// Set when the client may hold locks in the lock tables.
    has_locks: AtomicBool,

    local: Mutex<LocalLocks>,
}

/// The locks held by a client, and the memory they consume.
struct LocalLocks {
    /// Reference counts of shared locks, indexed by resource type.
    shared: [CountMap; ResourceType::COUNT],

    /// Reference counts of exclusive locks, indexed by resource type.
    exclusive: [CountMap; ResourceType::COUNT],

    memory: ScopedMemoryTracker,
}

/// [`WaitScope`] reports a lock wait to the tracer and withdraws the published wait state once
/// the wait is over.
struct WaitScope<'c> {
    client: &'c LockClient,
    tracer: &'c dyn LockTracer,
    event: Option<Box<dyn LockWaitEvent>>,
}

/// A step in a wait cycle: the owner of a lock waiting for another lock.
#[derive(Clone, Debug)]
struct WaitStep {
    owner: ClientId,
    transaction_id: u64,
    resource_type: ResourceType,
    resource_id: u64,
    mode: LockMode,
}

/// A chain of clients each waiting for a lock held by the previous one.
struct WaitPath {
    steps: Vec<WaitStep>,
    waiting_for: ebr::Arc<Lock>,
}

/// The memory accounted for a single lock entry.
const ENTRY_SIZE: usize = 48;

/// Maps holding more entries are reallocated rather than cleared when the client releases all its
/// locks.
const MAX_RECYCLED_MAP_LEN: usize = 32;

/// A waiter looks for clients committing on its own thread every this many tries.
const COMMITTING_CHECK_INTERVAL: u32 = 8192;

/// A suspected deadlock is checked again after this pause to rule out transient wait states.
const DEADLOCK_RECHECK_DELAY: Duration = Duration::from_millis(10);

impl LockClient {
    /// Returns the identifier of the client.
    ///
    /// The identifier is reused by another client once the client is closed.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Returns the identifier of the transaction using the client.
    #[inline]
    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Acquires shared locks on the resources, waiting for them if necessary.
    ///
    /// Locks that are already held are reentered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientStopped`] if the client is stopped, [`Error::Deadlock`] if the
    /// client is aborted to resolve a deadlock, [`Error::Timeout`] if a lock could not be acquired
    /// in time, or [`Error::OutOfMemory`] if the memory tracker refused the allocation. Locks
    /// acquired for the preceding resources are kept.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, LockMode, NoopTracer, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client = lock_manager.client().unwrap();
    /// assert!(client.acquire_shared(&NoopTracer, ResourceType::Node, &[7, 7]).is_ok());
    /// assert!(client.holds_lock(ResourceType::Node, 7, LockMode::Shared));
    /// assert!(client.release_shared(ResourceType::Node, &[7]).is_ok());
    /// assert!(client.holds_lock(ResourceType::Node, 7, LockMode::Shared));
    /// ```
    #[inline]
    pub fn acquire_shared(
        &self,
        tracer: &dyn LockTracer,
        resource_type: ResourceType,
        resource_ids: &[u64],
    ) -> Result<(), Error> {
        let _operation = self.enter()?;
        self.has_locks.store(true, Release);
        let mut local = self.local();
        let type_id = resource_type.type_id();
        let table = self.kernel.table(resource_type);
        for &resource_id in resource_ids {
            if let Some(count) = local.shared[type_id].get_mut(&resource_id) {
                *count = reenter(*count, resource_type, resource_id)?;
                continue;
            }
            if local.exclusive[type_id].contains_key(&resource_id) {
                // The exclusive lock covers it.
                local.shared[type_id].insert(resource_id, 1);
                continue;
            }
            local.memory.allocate_heap(ENTRY_SIZE)?;
            if let Err(error) = self.grab_shared(tracer, table, resource_type, resource_id) {
                local.memory.release_heap(ENTRY_SIZE);
                return Err(error);
            }
            self.participant().lock_acquired();
            local.shared[type_id].insert(resource_id, 1);
        }
        Ok(())
    }

    /// Acquires exclusive locks on the resources, waiting for them if necessary.
    ///
    /// A shared lock held by the client is upgraded.
    ///
    /// # Errors
    ///
    /// Same as [`LockClient::acquire_shared`].
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, LockMode, NoopTracer, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client = lock_manager.client().unwrap();
    /// assert!(client.acquire_shared(&NoopTracer, ResourceType::Node, &[3]).is_ok());
    /// assert!(client.acquire_exclusive(&NoopTracer, ResourceType::Node, &[3]).is_ok());
    /// assert!(client.holds_lock(ResourceType::Node, 3, LockMode::Exclusive));
    /// ```
    #[inline]
    pub fn acquire_exclusive(
        &self,
        tracer: &dyn LockTracer,
        resource_type: ResourceType,
        resource_ids: &[u64],
    ) -> Result<(), Error> {
        let _operation = self.enter()?;
        self.has_locks.store(true, Release);
        let mut local = self.local();
        let type_id = resource_type.type_id();
        let table = self.kernel.table(resource_type);
        for &resource_id in resource_ids {
            if let Some(count) = local.exclusive[type_id].get_mut(&resource_id) {
                *count = reenter(*count, resource_type, resource_id)?;
                continue;
            }
            local.memory.allocate_heap(ENTRY_SIZE)?;
            match self.grab_exclusive(&mut local, tracer, table, resource_type, resource_id) {
                Ok(upgraded) => {
                    if upgraded {
                        // The shared lock entry is reused.
                        local.memory.release_heap(ENTRY_SIZE);
                    } else {
                        self.participant().lock_acquired();
                    }
                    local.exclusive[type_id].insert(resource_id, 1);
                }
                Err(error) => {
                    local.memory.release_heap(ENTRY_SIZE);
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Tries to acquire an exclusive lock on the resource without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientStopped`] if the client is stopped, or [`Error::OutOfMemory`] if the
    /// memory tracker refused the allocation.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client_a = lock_manager.client().unwrap();
    /// let client_b = lock_manager.client().unwrap();
    /// assert_eq!(client_a.try_exclusive_lock(ResourceType::Node, 5), Ok(true));
    /// assert_eq!(client_b.try_exclusive_lock(ResourceType::Node, 5), Ok(false));
    /// assert!(client_a.release_exclusive(ResourceType::Node, &[5]).is_ok());
    /// assert_eq!(client_b.try_exclusive_lock(ResourceType::Node, 5), Ok(true));
    /// ```
    #[inline]
    pub fn try_exclusive_lock(
        &self,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Result<bool, Error> {
        let _operation = self.enter()?;
        self.has_locks.store(true, Release);
        let mut local = self.local();
        let type_id = resource_type.type_id();
        if let Some(count) = local.exclusive[type_id].get_mut(&resource_id) {
            *count = reenter(*count, resource_type, resource_id)?;
            return Ok(true);
        }
        local.memory.allocate_heap(ENTRY_SIZE)?;
        let table = self.kernel.table(resource_type);
        let Some(existing) = table.insert_if_absent(resource_id, &self.exclusive_lock) else {
            self.participant().lock_acquired();
            local.exclusive[type_id].insert(resource_id, 1);
            return Ok(true);
        };
        local.memory.release_heap(ENTRY_SIZE);
        if let Lock::Shared(shared) = &*existing {
            if local.shared[type_id].contains_key(&resource_id)
                && shared.try_acquire_update_lock(self.id)
            {
                if shared.number_of_holders() == 1 {
                    local.exclusive[type_id].insert(resource_id, 1);
                    return Ok(true);
                }
                shared.release_update_lock();
            }
        }
        Ok(false)
    }

    /// Tries to acquire a shared lock on the resource without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientStopped`] if the client is stopped, or [`Error::OutOfMemory`] if the
    /// memory tracker refused the allocation.
    #[inline]
    pub fn try_shared_lock(
        &self,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Result<bool, Error> {
        let _operation = self.enter()?;
        self.has_locks.store(true, Release);
        let mut local = self.local();
        let type_id = resource_type.type_id();
        if let Some(count) = local.shared[type_id].get_mut(&resource_id) {
            *count = reenter(*count, resource_type, resource_id)?;
            return Ok(true);
        }
        if local.exclusive[type_id].contains_key(&resource_id) {
            local.shared[type_id].insert(resource_id, 1);
            return Ok(true);
        }
        local.memory.allocate_heap(ENTRY_SIZE)?;
        match self.try_grab_shared(self.kernel.table(resource_type), resource_id) {
            Ok(true) => {
                self.participant().lock_acquired();
                local.shared[type_id].insert(resource_id, 1);
                Ok(true)
            }
            result => {
                local.memory.release_heap(ENTRY_SIZE);
                result
            }
        }
    }

    /// Releases shared locks on the resources.
    ///
    /// A lock is released from the lock table when its reference count drops to zero, unless the
    /// client still holds the resource exclusively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientStopped`] if the client is stopped, or [`Error::IllegalState`] if
    /// the client does not hold a shared lock on a resource.
    #[inline]
    pub fn release_shared(
        &self,
        resource_type: ResourceType,
        resource_ids: &[u64],
    ) -> Result<(), Error> {
        let _operation = self.enter()?;
        let mut local = self.local();
        let type_id = resource_type.type_id();
        let table = self.kernel.table(resource_type);
        for &resource_id in resource_ids {
            if release_local(&mut local.shared[type_id], resource_type, resource_id)? {
                continue;
            }
            if !local.exclusive[type_id].contains_key(&resource_id) {
                self.release_global(&mut local, table, resource_type, resource_id);
            }
        }
        Ok(())
    }

    /// Releases exclusive locks on the resources.
    ///
    /// If the client still holds a shared lock on a resource, the exclusive lock is downgraded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientStopped`] if the client is stopped, or [`Error::IllegalState`] if
    /// the client does not hold an exclusive lock on a resource.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, LockMode, NoopTracer, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client = lock_manager.client().unwrap();
    /// assert!(client.acquire_exclusive(&NoopTracer, ResourceType::Node, &[9]).is_ok());
    /// assert!(client.acquire_shared(&NoopTracer, ResourceType::Node, &[9]).is_ok());
    /// assert!(client.release_exclusive(ResourceType::Node, &[9]).is_ok());
    /// assert!(client.holds_lock(ResourceType::Node, 9, LockMode::Shared));
    /// assert!(!client.holds_lock(ResourceType::Node, 9, LockMode::Exclusive));
    /// ```
    #[inline]
    pub fn release_exclusive(
        &self,
        resource_type: ResourceType,
        resource_ids: &[u64],
    ) -> Result<(), Error> {
        let _operation = self.enter()?;
        let mut local = self.local();
        let type_id = resource_type.type_id();
        let table = self.kernel.table(resource_type);
        for &resource_id in resource_ids {
            if release_local(&mut local.exclusive[type_id], resource_type, resource_id)? {
                continue;
            }
            if local.shared[type_id].contains_key(&resource_id) {
                self.downgrade(table, resource_type, resource_id)?;
            } else {
                self.release_global(&mut local, table, resource_type, resource_id);
            }
        }
        Ok(())
    }

    /// Prepares the client for commit.
    ///
    /// Clients waiting for a lock held by this client give up if the thread that prepared it is
    /// their own, as the commit cannot proceed until they do.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientStopped`] if the client is stopped.
    #[inline]
    pub fn prepare_for_commit(&self) -> Result<(), Error> {
        if !self.state.prepare() {
            return Err(self.stopped_error());
        }
        self.participant().mark_prepared(utils::thread_hash());
        tracing::debug!(client = %self, "prepared for commit");
        Ok(())
    }

    /// Stops the client and releases all its locks.
    ///
    /// Any operation in progress or started afterwards fails with [`Error::ClientStopped`]. Can
    /// be called from any thread, any number of times.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, NoopTracer, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client = lock_manager.client().unwrap();
    /// assert!(client.acquire_exclusive(&NoopTracer, ResourceType::Node, &[1]).is_ok());
    /// client.stop();
    /// client.stop();
    /// assert_eq!(lock_manager.lock_count(ResourceType::Node), 0);
    /// assert!(client.try_shared_lock(ResourceType::Node, 1).is_err());
    /// ```
    #[inline]
    pub fn stop(&self) {
        let Some(_operation) = self.state.enter() else {
            return;
        };
        if !self.state.stop() {
            return;
        }
        tracing::debug!(client = %self, "stopping");

        // Waits for the operation in progress to bail out.
        self.state.drain(1);
        let mut local = self.local();
        local.memory.stop();
        self.release_all_locks(&mut local);
    }

    /// Closes the client, releasing all its locks and returning its identifier to the lock
    /// manager.
    ///
    /// Can be called from any thread, any number of times.
    #[inline]
    pub fn close(&self) {
        if self.closed.swap(true, AcqRel) {
            return;
        }
        self.state.stop();
        self.state.drain(0);
        let mut local = self.local();
        self.release_all_locks(&mut local);
        local.memory.close();
        drop(local);

        if let Lock::Exclusive(exclusive) = &*self.exclusive_lock {
            exclusive.close();
        }
        self.participant().clear_wait_state();
        self.kernel.release_client_id(self.id);
        tracing::debug!(client = %self, "closed");
    }

    /// Returns the locks held by the client in the lock tables.
    ///
    /// The locks are collected when the method is called. A closed client holds no locks.
    #[inline]
    pub fn active_locks(&self) -> impl Iterator<Item = ActiveLock> {
        let mut active_locks = Vec::new();
        if self.is_closed() {
            return active_locks.into_iter();
        }
        for resource_type in ResourceType::ALL {
            self.kernel
                .table(resource_type)
                .for_each(|resource_id, lock| {
                    if let Some(mode) = lock.held_mode(self.id) {
                        active_locks.push(ActiveLock {
                            resource_type,
                            mode,
                            transaction_id: self.transaction_id,
                            resource_id,
                        });
                    }
                });
        }
        active_locks.into_iter()
    }

    /// Returns the number of locks held by the client in the lock tables.
    #[inline]
    #[must_use]
    pub fn active_lock_count(&self) -> u64 {
        if self.is_closed() {
            return 0;
        }
        self.participant().active_lock_count()
    }

    /// Returns `true` if the client holds a lock on the resource at least as strong as `mode`.
    #[inline]
    #[must_use]
    pub fn holds_lock(&self, resource_type: ResourceType, resource_id: u64, mode: LockMode) -> bool {
        !self.is_closed()
            && self
                .kernel
                .table(resource_type)
                .get(resource_id)
                .and_then(|lock| lock.held_mode(self.id))
                .map_or(false, |held| held == mode || held == LockMode::Exclusive)
    }

    pub(crate) fn new(
        kernel: Arc<Kernel>,
        id: ClientId,
        transaction_id: u64,
        lock_acquisition_timeout: Duration,
        memory_tracker: Arc<dyn MemoryTracker>,
    ) -> LockClient {
        LockClient {
            kernel,
            id,
            transaction_id,
            lock_acquisition_timeout,
            state: StateHolder::default(),
            closed: AtomicBool::new(false),
            exclusive_lock: ebr::Arc::new(Lock::exclusive(id)),
            has_locks: AtomicBool::new(false),
            local: Mutex::new(LocalLocks {
                shared: Default::default(),
                exclusive: Default::default(),
                memory: ScopedMemoryTracker::new(memory_tracker),
            }),
        }
    }

    fn enter(&self) -> Result<ActiveOperation<'_>, Error> {
        self.state.enter().ok_or_else(|| self.stopped_error())
    }

    fn local(&self) -> MutexGuard<'_, LocalLocks> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The identifier of a closed client may already belong to another client.
    fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    fn participant(&self) -> &Participant {
        self.kernel.participant(self.id)
    }

    fn stopped_error(&self) -> Error {
        Error::ClientStopped(self.to_string())
    }

    /// Fails if the client is stopped or the wait timed out.
    fn assert_valid(
        &self,
        wait_start: u64,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Result<(), Error> {
        if self.state.is_stopped() {
            return Err(self.stopped_error());
        }
        let timeout = self.lock_acquisition_timeout;
        if !timeout.is_zero() {
            let elapsed = self.kernel.clock().nanos().saturating_sub(wait_start);
            if u128::from(elapsed) > timeout.as_nanos() {
                tracing::info!(client = %self, %resource_type, resource_id, ?timeout, "lock acquisition timed out");
                return Err(Error::Timeout {
                    resource_type,
                    resource_id,
                    timeout,
                });
            }
        }
        Ok(())
    }

    /// Installs or joins a shared lock on the resource.
    fn grab_shared(
        &self,
        tracer: &dyn LockTracer,
        table: &LockTable,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Result<(), Error> {
        let mut scope = WaitScope::new(self, tracer);
        let mut new_lock: Option<ebr::Arc<Lock>> = None;
        let wait_start = self.kernel.clock().nanos();
        let mut tries = 0_u32;
        loop {
            self.assert_valid(wait_start, resource_type, resource_id)?;
            let existing = if let Some(existing) = table.get(resource_id) {
                existing
            } else {
                let lock = new_lock.get_or_insert_with(|| {
                    ebr::Arc::new(Lock::shared(self.id, self.kernel.config().max_clients))
                });
                match table.insert_if_absent(resource_id, lock) {
                    None => return Ok(()),
                    Some(existing) => existing,
                }
            };
            if let Lock::Shared(shared) = &*existing {
                if shared.acquire(self.id) {
                    return Ok(());
                }
            }
            scope.begin(LockMode::Shared, resource_type, resource_id);
            self.wait_for(&existing, resource_type, resource_id, LockMode::Shared, tries)?;
            tries = tries.saturating_add(1);
        }
    }

    /// Single attempt at installing or joining a shared lock.
    fn try_grab_shared(&self, table: &LockTable, resource_id: u64) -> Result<bool, Error> {
        loop {
            if self.state.is_stopped() {
                return Err(self.stopped_error());
            }
            let Some(existing) = table.get(resource_id) else {
                let lock = ebr::Arc::new(Lock::shared(self.id, self.kernel.config().max_clients));
                if table.insert_if_absent(resource_id, &lock).is_none() {
                    return Ok(true);
                }
                continue;
            };
            match &*existing {
                Lock::Shared(shared) => {
                    if shared.acquire(self.id) {
                        return Ok(true);
                    }
                    if shared.is_update_lock() {
                        return Ok(false);
                    }
                    // The lock is dead and about to be removed.
                    thread::yield_now();
                }
                Lock::Exclusive(_) => return Ok(false),
            }
        }
    }

    /// Installs the exclusive lock of the client on the resource, or upgrades the shared lock on
    /// it.
    ///
    /// Returns `true` if a shared lock was upgraded.
    fn grab_exclusive(
        &self,
        local: &mut LocalLocks,
        tracer: &dyn LockTracer,
        table: &LockTable,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Result<bool, Error> {
        let mut scope = WaitScope::new(self, tracer);
        let wait_start = self.kernel.clock().nanos();
        let grace_period = self.kernel.config().upgrade_grace_period;
        let mut tries = 0_u32;
        while let Some(existing) = table.insert_if_absent(resource_id, &self.exclusive_lock) {
            self.assert_valid(wait_start, resource_type, resource_id)?;
            if let Lock::Shared(shared) = &*existing {
                let held = local.shared[resource_type.type_id()].contains_key(&resource_id);
                if (held || tries >= grace_period)
                    && self.try_upgrade(
                        local,
                        &mut scope,
                        table,
                        &existing,
                        shared,
                        resource_type,
                        resource_id,
                        wait_start,
                    )?
                {
                    return Ok(true);
                }
            }
            scope.begin(LockMode::Exclusive, resource_type, resource_id);
            self.wait_for(&existing, resource_type, resource_id, LockMode::Exclusive, tries)?;
            tries = tries.saturating_add(1);
        }
        Ok(false)
    }

    /// Upgrades the shared lock, joining it first if the client does not hold it.
    #[allow(clippy::too_many_arguments)]
    fn try_upgrade(
        &self,
        local: &mut LocalLocks,
        scope: &mut WaitScope<'_>,
        table: &LockTable,
        lock: &ebr::Arc<Lock>,
        shared: &SharedLock,
        resource_type: ResourceType,
        resource_id: u64,
        wait_start: u64,
    ) -> Result<bool, Error> {
        if local.shared[resource_type.type_id()].contains_key(&resource_id) {
            return self.upgrade_held(scope, lock, shared, resource_type, resource_id, wait_start);
        }
        local.memory.allocate_heap(ENTRY_SIZE)?;
        if !shared.acquire(self.id) {
            local.memory.release_heap(ENTRY_SIZE);
            return Ok(false);
        }
        self.participant().lock_acquired();
        let result = self.upgrade_held(scope, lock, shared, resource_type, resource_id, wait_start);
        if !matches!(result, Ok(true)) {
            self.release_global(local, table, resource_type, resource_id);
        }
        result
    }

    /// Takes the update slot of a shared lock held by the client, and waits for the other holders
    /// to leave.
    fn upgrade_held(
        &self,
        scope: &mut WaitScope<'_>,
        lock: &ebr::Arc<Lock>,
        shared: &SharedLock,
        resource_type: ResourceType,
        resource_id: u64,
        wait_start: u64,
    ) -> Result<bool, Error> {
        if !shared.try_acquire_update_lock(self.id) {
            return Ok(false);
        }
        let mut tries = 0_u32;
        while shared.number_of_holders() > 1 {
            let waited = self
                .assert_valid(wait_start, resource_type, resource_id)
                .and_then(|()| {
                    scope.begin(LockMode::Exclusive, resource_type, resource_id);
                    self.wait_for(lock, resource_type, resource_id, LockMode::Exclusive, tries)
                });
            if let Err(error) = waited {
                shared.release_update_lock();
                self.participant().clear_wait_state();
                return Err(error);
            }
            tries = tries.saturating_add(1);
        }
        Ok(true)
    }

    /// Turns the exclusive lock on a resource also held in shared mode into a shared lock.
    fn downgrade(
        &self,
        table: &LockTable,
        resource_type: ResourceType,
        resource_id: u64,
    ) -> Result<(), Error> {
        let Some(lock) = table.get(resource_id) else {
            return Err(Error::IllegalState(format!(
                "{self} holds {resource_type}({resource_id}) but the lock table has no entry"
            )));
        };
        match &*lock {
            Lock::Shared(shared) if shared.update_holder() == Some(self.id) => {
                shared.release_update_lock();
                Ok(())
            }
            Lock::Shared(_) => Err(Error::IllegalState(format!(
                "{self} holds {resource_type}({resource_id}) exclusively but {} is not upgraded",
                &*lock
            ))),
            Lock::Exclusive(_) if lock.is_owned_by(self.id) => {
                table.replace(
                    resource_id,
                    ebr::Arc::new(Lock::shared(self.id, self.kernel.config().max_clients)),
                );
                Ok(())
            }
            Lock::Exclusive(_) => Err(Error::IllegalState(format!(
                "{self} holds {resource_type}({resource_id}) but the lock table has {}",
                &*lock
            ))),
        }
    }

    /// Releases the lock held by the client in the lock table.
    fn release_global(
        &self,
        local: &mut LocalLocks,
        table: &LockTable,
        resource_type: ResourceType,
        resource_id: u64,
    ) {
        let released = table.get(resource_id).map_or(false, |lock| match &*lock {
            Lock::Exclusive(_) => table.remove_if_same(resource_id, &self.exclusive_lock),
            Lock::Shared(shared) => {
                if !lock.is_owned_by(self.id) {
                    return false;
                }
                if shared.release(self.id) {
                    table.remove_if_same(resource_id, &lock);
                }
                true
            }
        });
        if !released {
            tracing::warn!(client = %self, %resource_type, resource_id, "released lock not found in the lock table");
        }
        local.memory.release_heap(ENTRY_SIZE);
        self.participant().lock_released();
    }

    /// Releases every lock held by the client.
    fn release_all_locks(&self, local: &mut LocalLocks) {
        if !self.has_locks.swap(false, AcqRel) {
            return;
        }
        for resource_type in ResourceType::ALL {
            let type_id = resource_type.type_id();
            let table = self.kernel.table(resource_type);

            // Exclusive locks first; shared locks under them are released along with them.
            let mut exclusive = take(&mut local.exclusive[type_id]);
            for &resource_id in exclusive.keys() {
                self.release_global(local, table, resource_type, resource_id);
                local.shared[type_id].remove(&resource_id);
            }
            let mut shared = take(&mut local.shared[type_id]);
            for &resource_id in shared.keys() {
                self.release_global(local, table, resource_type, resource_id);
            }
            if exclusive.len() <= MAX_RECYCLED_MAP_LEN {
                exclusive.clear();
                local.exclusive[type_id] = exclusive;
            }
            if shared.len() <= MAX_RECYCLED_MAP_LEN {
                shared.clear();
                local.shared[type_id] = shared;
            }
        }
        self.participant().clear_lock_count();
        self.participant().clear_wait_state();
    }

    /// Publishes the wait state of the client, backs off, and checks for deadlocks.
    fn wait_for(
        &self,
        lock: &ebr::Arc<Lock>,
        resource_type: ResourceType,
        resource_id: u64,
        mode: LockMode,
        tries: u32,
    ) -> Result<(), Error> {
        let participant = self.participant();
        let participants = self.kernel.participants();
        participant.wait_list().clear();
        lock.copy_holder_wait_lists_into(participant.wait_list(), participants);
        participant.note_waiting_for(lock, resource_type, resource_id, mode);
        self.kernel.wait_strategy(resource_type).apply(tries);

        if let Some(other) = lock.detect_deadlock(self.id, participants) {
            if tries > self.kernel.config().deadlock_verification_threshold
                && self.should_abort(other)
            {
                tracing::trace!(client = %self, other, tries, "verifying a suspected deadlock");
                if let Some(depth) = self.is_deadlock_real(lock) {
                    if let Some(error) =
                        self.deadlock_error(lock, resource_type, resource_id, mode, depth)
                    {
                        return Err(error);
                    }
                }
            }
            thread::yield_now();
        } else if tries % COMMITTING_CHECK_INTERVAL == COMMITTING_CHECK_INTERVAL - 1 {
            let thread_hash = utils::thread_hash();
            let committing = participant
                .wait_list()
                .iter()
                .find(|other| self.is_committing_on(*other, thread_hash));
            if let Some(other) = committing {
                if self.is_deadlock_real(lock).is_some() {
                    tracing::info!(client = %self, committing = other, "waiting for a client committing on the same thread");
                    return Err(Error::Deadlock(format!(
                        "{self} can't acquire {mode} {resource_type}({resource_id}) because it is \
                         waiting for Client[{other}] that is committing on the same thread"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Decides which of the two clients in a deadlock gives up: the one holding fewer locks, or
    /// the younger one if both hold as many.
    fn should_abort(&self, other: ClientId) -> bool {
        let Some(other_participant) = self.kernel.participants().get(other) else {
            return true;
        };
        if other == self.id {
            return true;
        }
        let ours = self.participant().active_lock_count();
        let theirs = other_participant.active_lock_count();
        match ours.cmp(&theirs) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                (self.transaction_id, self.id) > (other_participant.transaction_id(), other)
            }
        }
    }

    fn is_committing_on(&self, other: ClientId, thread_hash: u64) -> bool {
        other != self.id
            && self
                .kernel
                .participants()
                .get(other)
                .map_or(false, |participant| participant.is_committing_on(thread_hash))
    }

    /// Confirms the deadlock twice, pausing in between.
    ///
    /// Returns the length of the wait cycle.
    fn is_deadlock_real(&self, lock: &Lock) -> Option<usize> {
        self.find_wait_cycle(lock)?;
        thread::sleep(DEADLOCK_RECHECK_DELAY);
        self.find_wait_cycle(lock)
    }

    /// Follows the published wait states breadth-first from the owners of the lock, looking for
    /// an owner waiting for this client.
    fn find_wait_cycle(&self, lock: &Lock) -> Option<usize> {
        let barrier = ebr::Barrier::new();
        let participants = self.kernel.participants();
        let thread_hash = utils::thread_hash();
        let mut visited: HashSet<*const Lock> = HashSet::new();
        let mut owners = HashSet::new();
        let mut next_owners = HashSet::new();
        let mut next_locks: Vec<&Lock> = Vec::new();
        lock.collect_owners(&mut owners);
        let mut depth = 1;
        loop {
            depth += 1;
            next_locks.clear();
            for &owner in &owners {
                if self.is_committing_on(owner, thread_hash) {
                    return Some(depth);
                }
                let Some(target) = participants
                    .get(owner)
                    .and_then(|participant| participant.waiting_for(&barrier))
                else {
                    continue;
                };
                let waiting_for: &Lock = &target.lock;
                if !waiting_for.is_closed() && visited.insert(waiting_for as *const Lock) {
                    next_locks.push(waiting_for);
                }
            }
            for next_lock in &next_locks {
                next_lock.collect_owners(&mut next_owners);
            }
            if next_owners.contains(&self.id) && lock.detect_deadlock(self.id, participants).is_some()
            {
                return Some(depth);
            }
            if next_locks.is_empty() {
                return None;
            }
            owners.clear();
            std::mem::swap(&mut owners, &mut next_owners);
        }
    }

    /// Builds the deadlock error.
    ///
    /// Returns `None` if the verbose mode is on and no precise wait cycle could be found.
    fn deadlock_error(
        &self,
        lock: &Lock,
        resource_type: ResourceType,
        resource_id: u64,
        mode: LockMode,
        depth: usize,
    ) -> Option<Error> {
        tracing::info!(client = %self, %resource_type, resource_id, %mode, "deadlock detected");
        if !self.kernel.config().verbose_deadlocks {
            return Some(Error::Deadlock(format!(
                "{self} can't acquire {mode} {resource_type}({resource_id}) on {lock} because \
                 holders of that lock are waiting for {self}.\n Wait list:{}",
                lock.describe_wait_list(self.kernel.participants())
            )));
        }
        let cycle = self.describe_wait_cycle(lock, resource_type, resource_id, mode, depth)?;
        Some(Error::Deadlock(format!(
            "{self} can't acquire {mode} {resource_type}({resource_id}) because it would form \
             this deadlock wait cycle:\n{cycle}\nLock tables:\n{}",
            self.kernel.describe()
        )))
    }

    /// Searches the wait cycle through the lock breadth-first, up to the specified depth.
    fn describe_wait_cycle(
        &self,
        lock: &Lock,
        resource_type: ResourceType,
        resource_id: u64,
        mode: LockMode,
        max_depth: usize,
    ) -> Option<String> {
        let barrier = ebr::Barrier::new();
        let mut parents = Vec::new();
        let mut paths = Vec::new();
        drop(self.extend_wait_paths(None, lock, &mut parents, 0, &barrier));
        for depth in 1..=max_depth + 1 {
            for parent in &parents {
                if parent.waiting_for.is_closed() {
                    continue;
                }
                if let Some(cycle) =
                    self.extend_wait_paths(Some(parent), &parent.waiting_for, &mut paths, depth, &barrier)
                {
                    return Some(self.describe_path(&cycle, resource_type, resource_id, mode));
                }
            }
            if paths.is_empty() {
                break;
            }
            parents = take(&mut paths);
        }
        None
    }

    /// Extends the path with every owner of the lock that is waiting for another lock.
    ///
    /// Returns the path if it comes back to this client.
    fn extend_wait_paths(
        &self,
        parent: Option<&WaitPath>,
        lock: &Lock,
        paths: &mut Vec<WaitPath>,
        depth: usize,
        barrier: &ebr::Barrier,
    ) -> Option<WaitPath> {
        let participants = self.kernel.participants();
        let mut owners = HashSet::new();
        lock.collect_owners(&mut owners);
        for owner in owners {
            if parent.map_or(false, |parent| parent.steps.iter().any(|s| s.owner == owner)) {
                continue;
            }
            let Some(participant) = participants.get(owner) else {
                continue;
            };
            let Some(target) = participant.waiting_for(barrier) else {
                continue;
            };
            if target.lock.is_closed() {
                continue;
            }
            let mut steps = parent.map_or_else(Vec::new, |parent| parent.steps.clone());
            steps.push(WaitStep {
                owner,
                transaction_id: participant.transaction_id(),
                resource_type: target.resource_type,
                resource_id: target.resource_id,
                mode: target.mode,
            });
            let path = WaitPath {
                steps,
                waiting_for: target.lock.clone(),
            };
            if owner == self.id && depth > 0 {
                return Some(path);
            }
            paths.push(path);
        }
        None
    }

    fn describe_path(
        &self,
        path: &WaitPath,
        resource_type: ResourceType,
        resource_id: u64,
        mode: LockMode,
    ) -> String {
        let mut description = String::new();
        let _ = write!(
            description,
            "{self} waits for {mode} {resource_type}({resource_id})"
        );
        for step in &path.steps {
            let _ = write!(
                description,
                "\n  held by Client[{}](transaction {}) waiting for {} {}({})",
                step.owner, step.transaction_id, step.mode, step.resource_type, step.resource_id
            );
        }
        description
    }
}

impl fmt::Debug for LockClient {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockClient")
            .field("id", &self.id)
            .field("transaction_id", &self.transaction_id)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for LockClient {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LockClient[transaction_id={}, client_id={}]",
            self.transaction_id, self.id
        )
    }
}

impl Drop for LockClient {
    #[inline]
    fn drop(&mut self) {
        self.close();
    }
}

impl<'c> WaitScope<'c> {
    fn new(client: &'c LockClient, tracer: &'c dyn LockTracer) -> WaitScope<'c> {
        WaitScope {
            client,
            tracer,
            event: None,
        }
    }

    /// Starts reporting the wait unless it is already being reported.
    fn begin(&mut self, mode: LockMode, resource_type: ResourceType, resource_id: u64) {
        if self.event.is_none() {
            self.event = Some(self.tracer.wait_for_lock(
                mode,
                resource_type,
                self.client.transaction_id,
                resource_id,
            ));
        }
    }
}

impl<'c> Drop for WaitScope<'c> {
    fn drop(&mut self) {
        if let Some(mut event) = self.event.take() {
            event.close();
            self.client.participant().clear_wait_state();
        }
    }
}

/// Increments the local reference count of a lock.
fn reenter(count: u32, resource_type: ResourceType, resource_id: u64) -> Result<u32, Error> {
    count.checked_add(1).ok_or_else(|| {
        Error::IllegalState(format!(
            "too many reentrant locks on {resource_type}({resource_id})"
        ))
    })
}

/// Decrements the local reference count of a lock.
///
/// Returns `true` if the client still holds the lock.
fn release_local(
    counts: &mut CountMap,
    resource_type: ResourceType,
    resource_id: u64,
) -> Result<bool, Error> {
    match counts.get_mut(&resource_id) {
        None => Err(Error::IllegalState(format!(
            "cannot release {resource_type}({resource_id}) which is not held"
        ))),
        Some(count) if *count > 1 => {
            *count -= 1;
            Ok(true)
        }
        Some(_) => {
            counts.remove(&resource_id);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Config, LocalMemoryTracker, LockManager, NoopTracer};

    #[test]
    fn reentrant_locks() {
        let lock_manager = LockManager::new();
        let Ok(client) = lock_manager.client() else {
            unreachable!()
        };
        assert!(client
            .acquire_shared(&NoopTracer, ResourceType::Node, &[1, 1, 2])
            .is_ok());
        assert_eq!(client.active_lock_count(), 2);
        assert!(client.release_shared(ResourceType::Node, &[1]).is_ok());
        assert!(client.holds_lock(ResourceType::Node, 1, LockMode::Shared));
        assert!(client.release_shared(ResourceType::Node, &[1, 2]).is_ok());
        assert_eq!(client.active_lock_count(), 0);
        assert_eq!(lock_manager.lock_count(ResourceType::Node), 0);
        assert!(matches!(
            client.release_shared(ResourceType::Node, &[1]),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn exclusive_covers_shared() {
        let lock_manager = LockManager::new();
        let Ok(client) = lock_manager.client() else {
            unreachable!()
        };
        assert!(client
            .acquire_exclusive(&NoopTracer, ResourceType::Label, &[4])
            .is_ok());
        assert_eq!(client.try_shared_lock(ResourceType::Label, 4), Ok(true));
        assert_eq!(client.active_lock_count(), 1);

        assert!(client.release_shared(ResourceType::Label, &[4]).is_ok());
        assert!(client.holds_lock(ResourceType::Label, 4, LockMode::Exclusive));
        assert!(client.release_exclusive(ResourceType::Label, &[4]).is_ok());
        assert!(!client.holds_lock(ResourceType::Label, 4, LockMode::Shared));
        assert_eq!(lock_manager.lock_count(ResourceType::Label), 0);
    }

    #[test]
    fn upgrade_and_downgrade() {
        let lock_manager = LockManager::new();
        let (Ok(client_a), Ok(client_b)) = (lock_manager.client(), lock_manager.client()) else {
            unreachable!()
        };
        assert_eq!(client_a.try_shared_lock(ResourceType::Node, 8), Ok(true));
        assert_eq!(client_b.try_shared_lock(ResourceType::Node, 8), Ok(true));

        // Another holder prevents the upgrade.
        assert_eq!(client_a.try_exclusive_lock(ResourceType::Node, 8), Ok(false));
        assert!(client_b.release_shared(ResourceType::Node, &[8]).is_ok());
        assert_eq!(client_a.try_exclusive_lock(ResourceType::Node, 8), Ok(true));
        assert_eq!(client_b.try_shared_lock(ResourceType::Node, 8), Ok(false));
        assert_eq!(client_a.active_lock_count(), 1);

        let active: Vec<ActiveLock> = client_a.active_locks().collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].mode, LockMode::Exclusive);

        assert!(client_a.release_exclusive(ResourceType::Node, &[8]).is_ok());
        assert!(client_a.holds_lock(ResourceType::Node, 8, LockMode::Shared));
        assert_eq!(client_b.try_shared_lock(ResourceType::Node, 8), Ok(true));
        assert_eq!(lock_manager.holder_count(ResourceType::Node, 8), 2);
    }

    #[test]
    fn downgrade_replaces_exclusive_lock() {
        let lock_manager = LockManager::new();
        let (Ok(client_a), Ok(client_b)) = (lock_manager.client(), lock_manager.client()) else {
            unreachable!()
        };
        assert!(client_a
            .acquire_exclusive(&NoopTracer, ResourceType::Schema, &[0])
            .is_ok());
        assert!(client_a
            .acquire_shared(&NoopTracer, ResourceType::Schema, &[0])
            .is_ok());
        assert_eq!(client_b.try_shared_lock(ResourceType::Schema, 0), Ok(false));
        assert!(client_a.release_exclusive(ResourceType::Schema, &[0]).is_ok());
        assert_eq!(client_b.try_shared_lock(ResourceType::Schema, 0), Ok(true));
        assert!(client_a.release_shared(ResourceType::Schema, &[0]).is_ok());
        assert!(client_b.release_shared(ResourceType::Schema, &[0]).is_ok());
        assert_eq!(lock_manager.lock_count(ResourceType::Schema), 0);
    }

    #[test]
    fn stop_and_close() {
        let memory_tracker = Arc::new(LocalMemoryTracker::default());
        let lock_manager = LockManager::builder()
            .memory_tracker(memory_tracker.clone())
            .build();
        let Ok(lock_manager) = lock_manager else {
            unreachable!()
        };
        let Ok(client) = lock_manager.client() else {
            unreachable!()
        };
        assert!(client
            .acquire_exclusive(&NoopTracer, ResourceType::Relationship, &[1, 2, 3])
            .is_ok());
        assert_eq!(memory_tracker.estimated_heap_memory(), 3 * ENTRY_SIZE);

        client.stop();
        assert_eq!(lock_manager.lock_count(ResourceType::Relationship), 0);
        assert_eq!(client.active_lock_count(), 0);
        assert!(matches!(
            client.acquire_shared(&NoopTracer, ResourceType::Relationship, &[1]),
            Err(Error::ClientStopped(_))
        ));
        assert!(client.prepare_for_commit().is_err());

        // Memory is returned on close.
        assert_eq!(memory_tracker.estimated_heap_memory(), 3 * ENTRY_SIZE);
        client.close();
        client.close();
        assert_eq!(memory_tracker.estimated_heap_memory(), 0);
    }

    #[test]
    fn out_of_memory() {
        let memory_tracker = Arc::new(LocalMemoryTracker::with_limit(ENTRY_SIZE));
        let lock_manager = LockManager::builder()
            .memory_tracker(memory_tracker.clone())
            .build();
        let Ok(lock_manager) = lock_manager else {
            unreachable!()
        };
        let Ok(client) = lock_manager.client() else {
            unreachable!()
        };
        assert!(client.try_shared_lock(ResourceType::Node, 1).is_ok());
        assert_eq!(
            client.try_shared_lock(ResourceType::Node, 2),
            Err(Error::OutOfMemory)
        );
        assert!(client.release_shared(ResourceType::Node, &[1]).is_ok());
        assert_eq!(memory_tracker.estimated_heap_memory(), 0);
    }

    #[test]
    fn many_locks_released() {
        let lock_manager = LockManager::with_config(Config::default());
        let Ok(lock_manager) = lock_manager else {
            unreachable!()
        };
        let Ok(client) = lock_manager.client() else {
            unreachable!()
        };
        let ids: Vec<u64> = (0..100).collect();
        assert!(client
            .acquire_exclusive(&NoopTracer, ResourceType::IndexEntry, &ids)
            .is_ok());
        assert!(client
            .acquire_shared(&NoopTracer, ResourceType::IndexEntry, &ids[..50])
            .is_ok());
        assert_eq!(client.active_locks().count(), 100);
        client.stop();
        assert_eq!(lock_manager.lock_count(ResourceType::IndexEntry), 0);
    }

    #[test]
    fn display() {
        let lock_manager = LockManager::new();
        let Ok(client) =
            lock_manager.client_with(crate::ClientOptions::default().transaction_id(11))
        else {
            unreachable!()
        };
        assert_eq!(
            client.to_string(),
            format!("LockClient[transaction_id=11, client_id={}]", client.id())
        );
    }
}
