// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::lock::Lock;
use scc::{ebr, HashMap};
use std::ptr;

/// [`LockTable`] maps resource identifiers of a single resource type to their [`Lock`].
///
/// A resource that has no entry in the table is not locked.
#[derive(Debug, Default)]
pub(crate) struct LockTable {
    table: HashMap<u64, ebr::Arc<Lock>>,
}

impl LockTable {
    /// Returns the lock occupying the resource.
    pub(crate) fn get(&self, resource_id: u64) -> Option<ebr::Arc<Lock>> {
        self.table.read(&resource_id, |_, lock| lock.clone())
    }

    /// Installs the lock if the resource is not locked.
    ///
    /// Returns the lock occupying the resource if the lock could not be installed.
    pub(crate) fn insert_if_absent(
        &self,
        resource_id: u64,
        lock: &ebr::Arc<Lock>,
    ) -> Option<ebr::Arc<Lock>> {
        loop {
            if self.table.insert(resource_id, lock.clone()).is_ok() {
                return None;
            }
            if let Some(existing) = self.get(resource_id) {
                return Some(existing);
            }
            // The existing lock was removed in the meantime.
        }
    }

    /// Removes the entry if it is occupied by the specified lock.
    pub(crate) fn remove_if_same(&self, resource_id: u64, lock: &Lock) -> bool {
        self.table
            .remove_if(&resource_id, |existing| ptr::eq(&**existing, lock))
            .is_some()
    }

    /// Replaces the lock occupying the resource.
    pub(crate) fn replace(&self, resource_id: u64, lock: ebr::Arc<Lock>) {
        let mut replacement = Some(lock);
        while let Some(lock) = replacement.take() {
            let updated = self.table.update(&resource_id, |_, existing| {
                *existing = lock.clone();
            });
            if updated.is_none() {
                if let Err((_, lock)) = self.table.insert(resource_id, lock) {
                    replacement = Some(lock);
                }
            }
        }
    }

    /// Calls the closure for every entry.
    pub(crate) fn for_each<F: FnMut(u64, &Lock)>(&self, mut f: F) {
        self.table.scan(|resource_id, lock| f(*resource_id, lock));
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}
