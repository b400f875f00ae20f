// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use super::participant::Participant;
use super::wait_list::WaitList;
use super::{ClientId, LockMode};
use std::collections::HashSet;
use std::fmt::{self, Write};
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};

/// [`Lock`] occupies a slot in a lock table while a resource is locked.
///
/// Every field of a [`Lock`] is read and written by multiple clients without any coarse mutex;
/// clients only communicate through atomic operations on the lock and the lock table.
#[derive(Debug)]
pub(crate) enum Lock {
    /// Exclusively owned by a single client.
    Exclusive(ExclusiveLock),

    /// Held by a set of clients, one of which may be upgrading it.
    Shared(SharedLock),
}

/// [`ExclusiveLock`] is owned by a single client.
///
/// A client reuses one [`ExclusiveLock`] for every exclusive lock it takes during its lifetime,
/// and closes it when the client is closed so that stale references to it are ignored by deadlock
/// detection.
#[derive(Debug)]
pub(crate) struct ExclusiveLock {
    owner: ClientId,
    closed: AtomicBool,
}

/// [`SharedLock`] is held by one or more clients.
#[derive(Debug)]
pub(crate) struct SharedLock {
    /// The number of holders, and [`UPDATE_LOCK_FLAG`] if a holder is upgrading the lock.
    ///
    /// The lock is dead once the number of holders drops to zero, and it can never be acquired
    /// again.
    ref_count: AtomicU32,

    /// The clients holding the lock.
    holders: WaitList,

    /// The client upgrading the lock, or [`NO_CLIENT`].
    update_holder: AtomicUsize,
}

/// Set when a holder of a [`SharedLock`] is waiting for the others to leave.
const UPDATE_LOCK_FLAG: u32 = 1_u32 << 31;

/// Marks the absence of a client.
pub(crate) const NO_CLIENT: ClientId = ClientId::MAX;

impl Lock {
    /// Creates a new [`ExclusiveLock`] owned by the client.
    pub(crate) fn exclusive(owner: ClientId) -> Lock {
        Lock::Exclusive(ExclusiveLock {
            owner,
            closed: AtomicBool::new(false),
        })
    }

    /// Creates a new [`SharedLock`] held by the client.
    pub(crate) fn shared(holder: ClientId, capacity: usize) -> Lock {
        let holders = WaitList::with_capacity(capacity);
        holders.insert(holder);
        Lock::Shared(SharedLock {
            ref_count: AtomicU32::new(1),
            holders,
            update_holder: AtomicUsize::new(NO_CLIENT),
        })
    }

    /// Returns the mode in which the client holds the lock.
    ///
    /// A holder of a [`SharedLock`] that has taken its update slot holds it exclusively once the
    /// other holders are gone.
    pub(crate) fn held_mode(&self, client: ClientId) -> Option<LockMode> {
        match self {
            Lock::Exclusive(_) => self.is_owned_by(client).then_some(LockMode::Exclusive),
            Lock::Shared(shared) if shared.holders.contains(client) => {
                if shared.is_update_lock()
                    && shared.update_holder() == Some(client)
                    && shared.number_of_holders() == 1
                {
                    Some(LockMode::Exclusive)
                } else {
                    Some(LockMode::Shared)
                }
            }
            Lock::Shared(_) => None,
        }
    }

    /// Returns the number of clients holding the lock.
    pub(crate) fn holder_count(&self) -> usize {
        match self {
            Lock::Exclusive(exclusive) => usize::from(!exclusive.is_closed()),
            Lock::Shared(shared) => shared.number_of_holders() as usize,
        }
    }

    /// Returns `true` if the lock must not be trusted anymore.
    pub(crate) fn is_closed(&self) -> bool {
        match self {
            Lock::Exclusive(exclusive) => exclusive.is_closed(),
            Lock::Shared(shared) => shared.number_of_holders() == 0,
        }
    }

    pub(crate) fn is_owned_by(&self, client: ClientId) -> bool {
        match self {
            Lock::Exclusive(exclusive) => !exclusive.is_closed() && exclusive.owner() == client,
            Lock::Shared(shared) => shared.holders.contains(client),
        }
    }

    /// Adds the owners of the lock to `owners`.
    pub(crate) fn collect_owners(&self, owners: &mut HashSet<ClientId>) {
        match self {
            Lock::Exclusive(exclusive) => {
                if !exclusive.is_closed() {
                    owners.insert(exclusive.owner());
                }
            }
            Lock::Shared(shared) => owners.extend(shared.holders.iter()),
        }
    }

    /// Returns an owner of the lock that is waiting for the client.
    ///
    /// The result is only a candidate as wait lists are updated without synchronization.
    pub(crate) fn detect_deadlock(
        &self,
        client: ClientId,
        participants: &[Participant],
    ) -> Option<ClientId> {
        match self {
            Lock::Exclusive(exclusive) => {
                if exclusive.is_closed() {
                    return None;
                }
                participants
                    .get(exclusive.owner())
                    .filter(|owner| owner.is_waiting_for(client))
                    .map(|_| exclusive.owner())
            }
            Lock::Shared(shared) => shared.holders.iter().find(|holder| {
                participants
                    .get(*holder)
                    .map_or(false, |h| h.is_waiting_for(client))
            }),
        }
    }

    /// Copies the wait lists of the owners of the lock into `wait_list`.
    pub(crate) fn copy_holder_wait_lists_into(
        &self,
        wait_list: &WaitList,
        participants: &[Participant],
    ) {
        match self {
            Lock::Exclusive(exclusive) => {
                if !exclusive.is_closed() {
                    if let Some(owner) = participants.get(exclusive.owner()) {
                        owner.copy_wait_list_into(wait_list);
                    }
                }
            }
            Lock::Shared(shared) => {
                for holder in shared.holders.iter() {
                    if let Some(holder) = participants.get(holder) {
                        holder.copy_wait_list_into(wait_list);
                    }
                }
            }
        }
    }

    /// Describes the wait lists of the owners.
    pub(crate) fn describe_wait_list(&self, participants: &[Participant]) -> String {
        let mut owners = HashSet::new();
        self.collect_owners(&mut owners);
        let mut owners: Vec<ClientId> = owners.into_iter().collect();
        owners.sort_unstable();
        let mut description = String::new();
        for owner in owners {
            if let Some(owner) = participants.get(owner) {
                description.push_str(&owner.describe_wait_list());
            }
        }
        description
    }

    #[cfg(test)]
    pub(crate) fn as_shared(&self) -> Option<&SharedLock> {
        match self {
            Lock::Shared(shared) => Some(shared),
            Lock::Exclusive(_) => None,
        }
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lock::Exclusive(exclusive) => write!(f, "ExclusiveLock[Client[{}]]", exclusive.owner()),
            Lock::Shared(shared) => {
                f.write_str("SharedLock{holders=[")?;
                for (i, holder) in shared.holders.iter().enumerate() {
                    if i != 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{holder}")?;
                }
                f.write_char(']')?;
                let update_holder = shared.update_holder.load(Acquire);
                if update_holder != NO_CLIENT {
                    write!(f, ", update_holder={update_holder}")?;
                }
                f.write_char('}')
            }
        }
    }
}

impl ExclusiveLock {
    pub(crate) fn owner(&self) -> ClientId {
        self.owner
    }

    /// Closes the lock; this cannot be undone.
    pub(crate) fn close(&self) {
        self.closed.store(true, Release);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }
}

impl SharedLock {
    /// Adds the client to the holders.
    ///
    /// Fails if the lock is dead, or if the lock is being upgraded and the client is not a holder;
    /// new readers must not starve an upgrade in progress.
    pub(crate) fn acquire(&self, client: ClientId) -> bool {
        let acquired = self
            .ref_count
            .fetch_update(AcqRel, Acquire, |refs| {
                let holders = refs & !UPDATE_LOCK_FLAG;
                if holders == 0
                    || holders == !UPDATE_LOCK_FLAG
                    || (refs & UPDATE_LOCK_FLAG != 0 && !self.holders.contains(client))
                {
                    None
                } else {
                    Some(refs + 1)
                }
            })
            .is_ok();
        if acquired {
            self.holders.insert(client);
        }
        acquired
    }

    /// Removes the client from the holders.
    ///
    /// Returns `true` if the client was the last holder, in which case the lock is dead and the
    /// caller must remove it from the lock table.
    pub(crate) fn release(&self, client: ClientId) -> bool {
        self.holders.remove(client);
        match self.ref_count.fetch_update(AcqRel, Acquire, |refs| {
            let holders = refs & !UPDATE_LOCK_FLAG;
            if holders == 0 {
                None
            } else {
                Some((holders - 1) | (refs & UPDATE_LOCK_FLAG))
            }
        }) {
            Ok(prev) => prev & !UPDATE_LOCK_FLAG == 1,
            Err(_) => {
                debug_assert!(false, "released a dead shared lock");
                false
            }
        }
    }

    /// Marks the lock as being upgraded by the client.
    ///
    /// Only a holder can take the update slot, and only one at a time.
    pub(crate) fn try_acquire_update_lock(&self, client: ClientId) -> bool {
        if !self.holders.contains(client) {
            return false;
        }
        let acquired = self
            .ref_count
            .fetch_update(AcqRel, Acquire, |refs| {
                if refs & UPDATE_LOCK_FLAG != 0 || refs == 0 {
                    None
                } else {
                    Some(refs | UPDATE_LOCK_FLAG)
                }
            })
            .is_ok();
        if acquired {
            self.update_holder.store(client, Release);
        }
        acquired
    }

    /// Clears the update slot.
    pub(crate) fn release_update_lock(&self) {
        self.update_holder.store(NO_CLIENT, Release);
        self.ref_count.fetch_and(!UPDATE_LOCK_FLAG, AcqRel);
    }

    pub(crate) fn number_of_holders(&self) -> u32 {
        self.ref_count.load(Acquire) & !UPDATE_LOCK_FLAG
    }

    pub(crate) fn is_update_lock(&self) -> bool {
        self.ref_count.load(Acquire) & UPDATE_LOCK_FLAG != 0
    }

    pub(crate) fn update_holder(&self) -> Option<ClientId> {
        let update_holder = self.update_holder.load(Acquire);
        (update_holder != NO_CLIENT).then_some(update_holder)
    }
}
