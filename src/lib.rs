// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

//! Transactional lock manager with deadlock detection.
//!
//! A [`LockManager`] hands out [`LockClient`] instances, one per transaction. Clients lock
//! resources identified by a [`ResourceType`] and a 64-bit identifier in shared or exclusive
//! mode; locks are reentrant, shared locks can be upgraded, and clients waiting for each other in
//! a cycle are detected and one of them is aborted with [`Error::Deadlock`].
//!
//! # Examples
//!
//! ```
//! use forseti_locks::{LockManager, NoopTracer, ResourceType};
//!
//! let lock_manager = LockManager::new();
//! let reader = lock_manager.client().unwrap();
//! let writer = lock_manager.client().unwrap();
//!
//! assert!(reader.acquire_shared(&NoopTracer, ResourceType::Node, &[1]).is_ok());
//! assert_eq!(writer.try_exclusive_lock(ResourceType::Node, 1), Ok(false));
//!
//! drop(reader);
//! assert_eq!(writer.try_exclusive_lock(ResourceType::Node, 1), Ok(true));
//! ```

#![warn(missing_docs)]

mod client;
pub use client::LockClient;

mod clock;
pub use clock::{Clock, ManualClock, MonotonicClock};

mod config;
pub use config::Config;

mod error;
pub use error::Error;

mod manager;
pub use manager::{ClientOptions, LockManager, LockManagerBuilder};

mod memory;
pub use memory::{LocalMemoryTracker, MemoryTracker};

mod resource;
pub use resource::{ActiveLock, LockMode, ResourceType};

mod tracer;
pub use tracer::{LockTracer, LockWaitEvent, NoopTracer, TracingLockTracer};

mod wait_strategy;
pub use wait_strategy::{ExponentialBackoff, IncrementalBackoff, WaitStrategy};

pub mod utils;

mod lock;
mod lock_table;
mod participant;
mod state;
mod wait_list;

/// Identifies a client while it is open.
///
/// Identifiers are dense, below [`Config::max_clients`], and reused once a client is closed.
pub type ClientId = usize;
