// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::lock_table::LockTable;
use super::participant::Participant;
use super::{
    ClientId, Clock, Config, Error, IncrementalBackoff, LocalMemoryTracker, LockClient,
    MemoryTracker, MonotonicClock, ResourceType, WaitStrategy,
};
use scc::Bag;
use std::array;
use std::fmt::{self, Write};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;
use std::time::Duration;

/// [`LockManager`] grants shared and exclusive locks on database resources to [`LockClient`]
/// instances.
///
/// [`LockManager`] can be cloned and shared among threads; each transaction obtains its own
/// [`LockClient`].
#[derive(Clone, Debug)]
pub struct LockManager {
    kernel: Arc<Kernel>,
}

/// [`LockManagerBuilder`] assembles a [`LockManager`].
pub struct LockManagerBuilder {
    config: Config,
    clock: Box<dyn Clock>,
    memory_tracker: Arc<dyn MemoryTracker>,
    wait_strategies: [Box<dyn WaitStrategy>; ResourceType::COUNT],
}

/// [`ClientOptions`] customizes a single [`LockClient`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    /// The transaction that is going to use the client.
    pub transaction_id: u64,

    /// Overrides the lock acquisition timeout of the [`Config`].
    pub lock_acquisition_timeout: Option<Duration>,

    /// Accounts for the memory consumed by the client instead of the manager's tracker.
    pub memory_tracker: Option<Arc<dyn MemoryTracker>>,
}

/// [`Kernel`] is the state shared by a [`LockManager`] and all its [`LockClient`] instances.
pub(crate) struct Kernel {
    config: Config,
    clock: Box<dyn Clock>,
    memory_tracker: Arc<dyn MemoryTracker>,
    tables: [LockTable; ResourceType::COUNT],
    wait_strategies: [Box<dyn WaitStrategy>; ResourceType::COUNT],

    /// Indexed by client identifiers.
    participants: Box<[Participant]>,

    /// Identifiers of closed clients.
    free_ids: Bag<ClientId, 16>,

    /// The next identifier to issue when no closed client identifiers are available.
    next_id: AtomicUsize,
}

impl LockManager {
    /// Creates a [`LockManager`] with the default configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, NoopTracer, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client = lock_manager.client().unwrap();
    /// assert!(client
    ///     .acquire_exclusive(&NoopTracer, ResourceType::Node, &[1, 2])
    ///     .is_ok());
    /// assert_eq!(client.active_lock_count(), 2);
    /// ```
    #[inline]
    #[must_use]
    pub fn new() -> LockManager {
        LockManager {
            kernel: Arc::new(LockManagerBuilder::default().into_kernel()),
        }
    }

    /// Creates a [`LockManager`] with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] if the configuration is invalid.
    #[inline]
    pub fn with_config(config: Config) -> Result<LockManager, Error> {
        LockManager::builder().config(config).build()
    }

    /// Returns a [`LockManagerBuilder`].
    #[inline]
    #[must_use]
    pub fn builder() -> LockManagerBuilder {
        LockManagerBuilder::default()
    }

    /// Returns a [`LockClient`] with default options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] if `max_clients` clients are already alive.
    #[inline]
    pub fn client(&self) -> Result<LockClient, Error> {
        self.client_with(ClientOptions::default())
    }

    /// Returns a [`LockClient`] for the transaction.
    ///
    /// The identifier of a closed client is reused before a new one is issued.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] if `max_clients` clients are already alive.
    #[inline]
    pub fn client_with(&self, options: ClientOptions) -> Result<LockClient, Error> {
        let id = self.kernel.allocate_client_id()?;
        self.kernel.participant(id).reset(options.transaction_id);
        let memory_tracker = options
            .memory_tracker
            .unwrap_or_else(|| self.kernel.memory_tracker.clone());
        let timeout = options
            .lock_acquisition_timeout
            .unwrap_or(self.kernel.config.lock_acquisition_timeout);
        tracing::debug!(client_id = id, transaction_id = options.transaction_id, "client issued");
        Ok(LockClient::new(
            self.kernel.clone(),
            id,
            options.transaction_id,
            timeout,
            memory_tracker,
        ))
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.kernel.config
    }

    /// Returns the number of locked resources of the type.
    #[inline]
    #[must_use]
    pub fn lock_count(&self, resource_type: ResourceType) -> usize {
        self.kernel.table(resource_type).len()
    }

    /// Returns the number of clients holding a lock on the resource.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{LockManager, NoopTracer, ResourceType};
    ///
    /// let lock_manager = LockManager::new();
    /// let client = lock_manager.client().unwrap();
    /// assert_eq!(lock_manager.holder_count(ResourceType::Label, 3), 0);
    /// assert!(client.acquire_shared(&NoopTracer, ResourceType::Label, &[3]).is_ok());
    /// assert_eq!(lock_manager.holder_count(ResourceType::Label, 3), 1);
    /// ```
    #[inline]
    #[must_use]
    pub fn holder_count(&self, resource_type: ResourceType, resource_id: u64) -> usize {
        self.kernel
            .table(resource_type)
            .get(resource_id)
            .map_or(0, |lock| lock.holder_count())
    }

    /// Describes every lock in the lock tables.
    #[inline]
    #[must_use]
    pub fn describe(&self) -> String {
        self.kernel.describe()
    }
}

impl Default for LockManager {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl LockManagerBuilder {
    /// Sets the configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock used to enforce lock acquisition timeouts.
    #[inline]
    #[must_use]
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Sets the default memory tracker of clients.
    #[inline]
    #[must_use]
    pub fn memory_tracker(mut self, memory_tracker: Arc<dyn MemoryTracker>) -> Self {
        self.memory_tracker = memory_tracker;
        self
    }

    /// Sets the wait strategy of the resource type.
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::{ExponentialBackoff, LockManager, ResourceType};
    ///
    /// let lock_manager = LockManager::builder()
    ///     .wait_strategy(ResourceType::Schema, ExponentialBackoff::default())
    ///     .build();
    /// assert!(lock_manager.is_ok());
    /// ```
    #[inline]
    #[must_use]
    pub fn wait_strategy<W: WaitStrategy + 'static>(
        mut self,
        resource_type: ResourceType,
        wait_strategy: W,
    ) -> Self {
        self.wait_strategies[resource_type.type_id()] = Box::new(wait_strategy);
        self
    }

    /// Builds the [`LockManager`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::WrongParameter`] if the configuration is invalid.
    #[inline]
    pub fn build(self) -> Result<LockManager, Error> {
        self.config.validate()?;
        Ok(LockManager {
            kernel: Arc::new(self.into_kernel()),
        })
    }

    fn into_kernel(self) -> Kernel {
        let max_clients = self.config.max_clients;
        let participants: Vec<Participant> = (0..max_clients)
            .map(|id| Participant::new(id, max_clients))
            .collect();
        Kernel {
            config: self.config,
            clock: self.clock,
            memory_tracker: self.memory_tracker,
            tables: array::from_fn(|_| LockTable::default()),
            wait_strategies: self.wait_strategies,
            participants: participants.into_boxed_slice(),
            free_ids: Bag::new(),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl Default for LockManagerBuilder {
    #[inline]
    fn default() -> Self {
        LockManagerBuilder {
            config: Config::default(),
            clock: Box::new(MonotonicClock::default()),
            memory_tracker: Arc::new(LocalMemoryTracker::default()),
            wait_strategies: array::from_fn(|_| {
                Box::new(IncrementalBackoff::default()) as Box<dyn WaitStrategy>
            }),
        }
    }
}

impl ClientOptions {
    /// Sets the transaction identifier.
    #[inline]
    #[must_use]
    pub fn transaction_id(mut self, transaction_id: u64) -> Self {
        self.transaction_id = transaction_id;
        self
    }

    /// Sets the lock acquisition timeout.
    #[inline]
    #[must_use]
    pub fn lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = Some(timeout);
        self
    }

    /// Sets the memory tracker.
    #[inline]
    #[must_use]
    pub fn memory_tracker(mut self, memory_tracker: Arc<dyn MemoryTracker>) -> Self {
        self.memory_tracker = Some(memory_tracker);
        self
    }
}

impl fmt::Debug for ClientOptions {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("transaction_id", &self.transaction_id)
            .field("lock_acquisition_timeout", &self.lock_acquisition_timeout)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub(crate) fn table(&self, resource_type: ResourceType) -> &LockTable {
        &self.tables[resource_type.type_id()]
    }

    pub(crate) fn wait_strategy(&self, resource_type: ResourceType) -> &dyn WaitStrategy {
        &*self.wait_strategies[resource_type.type_id()]
    }

    pub(crate) fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub(crate) fn participant(&self, id: ClientId) -> &Participant {
        &self.participants[id]
    }

    /// Reuses the identifier of a closed client, or issues a new one.
    fn allocate_client_id(&self) -> Result<ClientId, Error> {
        if let Some(id) = self.free_ids.pop() {
            return Ok(id);
        }
        let max_clients = self.config.max_clients;
        self.next_id
            .fetch_update(AcqRel, Acquire, |id| (id < max_clients).then_some(id + 1))
            .map_err(|_| Error::WrongParameter("the number of clients exceeds max_clients"))
    }

    /// Makes the identifier available to new clients.
    pub(crate) fn release_client_id(&self, id: ClientId) {
        self.free_ids.push(id);
    }

    /// Writes every lock in the lock tables.
    pub(crate) fn describe(&self) -> String {
        let mut description = String::new();
        for resource_type in ResourceType::ALL {
            self.table(resource_type).for_each(|resource_id, lock| {
                let _ = writeln!(description, "{resource_type}({resource_id}): {lock}");
            });
        }
        description
    }
}

impl fmt::Debug for Kernel {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("tables", &self.tables)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}
