// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// [`ResourceType`] classifies lockable database resources.
///
/// Each variant has a stable dense identifier that selects its lock table and wait strategy.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ResourceType {
    /// A node.
    Node,

    /// A relationship.
    Relationship,

    /// A label token.
    Label,

    /// A relationship type token.
    RelationshipType,

    /// An entry in an index, identified by its hashed key.
    IndexEntry,

    /// A schema rule.
    Schema,
}

/// [`LockMode`] is either shared or exclusive.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum LockMode {
    /// Multiple clients can hold the lock at the same time.
    Shared,

    /// Only a single client can hold the lock.
    Exclusive,
}

/// [`ActiveLock`] describes a lock held by a client.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ActiveLock {
    /// The type of the locked resource.
    pub resource_type: ResourceType,

    /// The mode of the lock.
    pub mode: LockMode,

    /// The transaction holding the lock.
    pub transaction_id: u64,

    /// The identifier of the locked resource.
    pub resource_id: u64,
}

impl ResourceType {
    /// The number of resource types.
    pub const COUNT: usize = 6;

    /// All the resource types ordered by their identifiers.
    pub const ALL: [ResourceType; Self::COUNT] = [
        ResourceType::Node,
        ResourceType::Relationship,
        ResourceType::Label,
        ResourceType::RelationshipType,
        ResourceType::IndexEntry,
        ResourceType::Schema,
    ];

    /// Returns the dense identifier of the [`ResourceType`].
    ///
    /// # Examples
    ///
    /// ```
    /// use forseti_locks::ResourceType;
    ///
    /// for (i, resource_type) in ResourceType::ALL.iter().enumerate() {
    ///     assert_eq!(resource_type.type_id(), i);
    /// }
    /// ```
    #[inline]
    #[must_use]
    pub const fn type_id(self) -> usize {
        self as usize
    }

    /// Returns the [`ResourceType`] corresponding to the identifier.
    #[inline]
    #[must_use]
    pub fn from_id(type_id: usize) -> Option<ResourceType> {
        Self::ALL.get(type_id).copied()
    }
}

impl fmt::Display for ResourceType {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Node => "NODE",
            ResourceType::Relationship => "RELATIONSHIP",
            ResourceType::Label => "LABEL",
            ResourceType::RelationshipType => "RELATIONSHIP_TYPE",
            ResourceType::IndexEntry => "INDEX_ENTRY",
            ResourceType::Schema => "SCHEMA",
        };
        f.write_str(name)
    }
}

impl fmt::Display for LockMode {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("SHARED"),
            LockMode::Exclusive => f.write_str("EXCLUSIVE"),
        }
    }
}
