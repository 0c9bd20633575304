// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bookmark scopes: correlation partitions for named bookmarks.
//!
//! A scope is created by an activity, optionally without a key. An uninitialized scope
//! can be claimed by the first resumption that names one of its bookmarks together
//! with a key that no scope holds yet; from then on only lookups with that key reach
//! it. Keys are queued for association with the instance store when a scope is
//! initialized and queued for disassociation when its owner completes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Bookmark, BookmarkInfo, BookmarkManager, BookmarkRecord};
use crate::error::{ExecutorError, Result};
use crate::instance::InstanceId;

/// Scope a host addresses when resuming a bookmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkScope {
    /// The always-present default scope.
    Default,
    /// A scope initialized with an external correlation key.
    Keyed(Uuid),
}

impl fmt::Display for BookmarkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default scope"),
            Self::Keyed(key) => write!(f, "scope {}", key),
        }
    }
}

/// Handle to a scope registered by an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(u64);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ScopeRecord {
    owner: InstanceId,
    key: Option<Uuid>,
    bookmarks: BookmarkManager,
}

/// Where a keyed lookup landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeLookup {
    /// The bookmark lives in `scope`; `claim` is set when the scope must first be
    /// initialized with the lookup key.
    Found { scope: ScopeId, claim: Option<Uuid> },
    Missing,
}

/// Registry of non-default bookmark scopes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookmarkScopeManager {
    next_id: u64,
    scopes: BTreeMap<ScopeId, ScopeRecord>,
    keys_to_associate: Vec<Uuid>,
    keys_to_disassociate: Vec<Uuid>,
}

impl BookmarkScopeManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scope owned by `owner`, initialized right away when `key` is given.
    pub fn create_scope(&mut self, owner: InstanceId, key: Option<Uuid>) -> Result<ScopeId> {
        if let Some(key) = key {
            self.ensure_key_free(key)?;
        }
        self.next_id += 1;
        let id = ScopeId(self.next_id);
        self.scopes.insert(
            id,
            ScopeRecord {
                owner,
                key,
                bookmarks: BookmarkManager::new(),
            },
        );
        if let Some(key) = key {
            self.keys_to_associate.push(key);
        }
        Ok(id)
    }

    /// Give an uninitialized scope its key.
    pub fn initialize(&mut self, scope: ScopeId, key: Uuid) -> Result<()> {
        let record = self
            .scopes
            .get(&scope)
            .ok_or_else(|| ExecutorError::BookmarkScopeNotRegistered {
                scope: scope.to_string(),
            })?;
        if record.key.is_some() {
            return Err(ExecutorError::BookmarkScopeAlreadyInitialized {
                scope: scope.to_string(),
            });
        }
        self.ensure_key_free(key)?;
        if let Some(record) = self.scopes.get_mut(&scope) {
            record.key = Some(key);
        }
        self.keys_to_associate.push(key);
        Ok(())
    }

    fn ensure_key_free(&self, key: Uuid) -> Result<()> {
        if self.find_by_key(key).is_some() {
            return Err(ExecutorError::InvalidOperation(format!(
                "bookmark scope key {} is already in use",
                key
            )));
        }
        Ok(())
    }

    /// Scope initialized with `key`.
    pub fn find_by_key(&self, key: Uuid) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|(_, record)| record.key == Some(key))
            .map(|(id, _)| *id)
    }

    /// Key of a scope, if initialized.
    pub fn key_of(&self, scope: ScopeId) -> Option<Uuid> {
        self.scopes.get(&scope).and_then(|record| record.key)
    }

    /// Whether the scope is registered.
    pub fn contains(&self, scope: ScopeId) -> bool {
        self.scopes.contains_key(&scope)
    }

    /// Register a named bookmark in `scope`.
    pub fn create_bookmark(
        &mut self,
        scope: ScopeId,
        name: &str,
        record: BookmarkRecord,
    ) -> Result<Bookmark> {
        let entry =
            self.scopes
                .get_mut(&scope)
                .ok_or_else(|| ExecutorError::BookmarkScopeNotRegistered {
                    scope: scope.to_string(),
                })?;
        let label = match entry.key {
            Some(key) => BookmarkScope::Keyed(key).to_string(),
            None => scope.to_string(),
        };
        entry.bookmarks.create_named(name, record, &label)
    }

    /// Find the scope that can resume `bookmark` for `key`.
    ///
    /// The scope initialized with `key` answers alone. Without one, uninitialized
    /// scopes are scanned in creation order and the first holding the bookmark wins.
    pub(crate) fn locate(&self, key: Uuid, bookmark: &Bookmark) -> ScopeLookup {
        if let Some(scope) = self.find_by_key(key) {
            let holds = self
                .scopes
                .get(&scope)
                .is_some_and(|record| record.bookmarks.contains(bookmark));
            return if holds {
                ScopeLookup::Found { scope, claim: None }
            } else {
                ScopeLookup::Missing
            };
        }
        self.scopes
            .iter()
            .find(|(_, record)| record.key.is_none() && record.bookmarks.contains(bookmark))
            .map(|(scope, _)| ScopeLookup::Found {
                scope: *scope,
                claim: Some(key),
            })
            .unwrap_or(ScopeLookup::Missing)
    }

    /// Whether a miss for `key` is final.
    ///
    /// It is final only when no uninitialized scope could still be claimed, no other
    /// scope holds bookmarks, and nothing outside scopes is still alive to create one.
    pub(crate) fn is_stable(&self, key: Uuid, outside_activity: bool) -> bool {
        if outside_activity {
            return false;
        }
        self.scopes.values().all(|record| match record.key {
            None => false,
            Some(k) if k == key => true,
            Some(_) => !record.bookmarks.has_bookmarks(),
        })
    }

    /// Remove a resumed bookmark (unless multi-resume). Returns the record and whether it was removed.
    pub(crate) fn take_for_resume(
        &mut self,
        scope: ScopeId,
        bookmark: &Bookmark,
    ) -> Option<(BookmarkRecord, bool)> {
        self.scopes
            .get_mut(&scope)?
            .bookmarks
            .take_for_resume(bookmark)
    }

    /// Look up a bookmark in a scope.
    pub(crate) fn get(&self, scope: ScopeId, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.scopes.get(&scope)?.bookmarks.get(bookmark)
    }

    /// Remove bookmarks owned by `owner` from every scope.
    pub(crate) fn remove_bookmarks_owned_by(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        self.scopes
            .values_mut()
            .flat_map(|record| record.bookmarks.remove_owned_by(owner))
            .map(|(_, record)| record)
            .collect()
    }

    /// Unregister scopes owned by `owner`, queueing their keys for disassociation.
    /// Returns the bookmarks that disappeared with them.
    pub(crate) fn unregister_owned_by(&mut self, owner: InstanceId) -> Vec<BookmarkRecord> {
        let owned: Vec<ScopeId> = self
            .scopes
            .iter()
            .filter(|(_, record)| record.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        let mut dropped = Vec::new();
        for id in owned {
            if let Some(mut record) = self.scopes.remove(&id) {
                if let Some(key) = record.key {
                    self.keys_to_associate.retain(|k| *k != key);
                    self.keys_to_disassociate.push(key);
                }
                dropped.extend(record.bookmarks.drain().into_iter().map(|(_, r)| r));
            }
        }
        dropped
    }

    /// Whether any key association change is queued.
    pub fn has_keys_to_update(&self) -> bool {
        !self.keys_to_associate.is_empty() || !self.keys_to_disassociate.is_empty()
    }

    /// Take queued key changes as `(associate, disassociate)`.
    pub(crate) fn take_key_updates(&mut self) -> (Vec<Uuid>, Vec<Uuid>) {
        (
            std::mem::take(&mut self.keys_to_associate),
            std::mem::take(&mut self.keys_to_disassociate),
        )
    }

    /// Whether any scope holds a bookmark.
    pub fn has_bookmarks(&self) -> bool {
        self.scopes
            .values()
            .any(|record| record.bookmarks.has_bookmarks())
    }

    /// Describe named bookmarks, optionally only those of one keyed scope.
    pub(crate) fn describe(
        &self,
        filter: Option<Uuid>,
        mut owner_name: impl FnMut(InstanceId) -> String,
    ) -> Vec<BookmarkInfo> {
        let mut infos = Vec::new();
        for record in self.scopes.values() {
            if filter.is_some() && record.key != filter {
                continue;
            }
            for (bookmark, entry) in record.bookmarks.iter() {
                if let Some(name) = bookmark.name() {
                    infos.push(BookmarkInfo {
                        name: name.to_string(),
                        owner: entry.owner,
                        owner_display_name: owner_name(entry.owner),
                        scope: record.key.map(BookmarkScope::Keyed),
                    });
                }
            }
        }
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmark::BookmarkOptions;

    fn record(owner: u64) -> BookmarkRecord {
        BookmarkRecord {
            owner: InstanceId::new(owner),
            callback: Some("on_message".to_string()),
            options: BookmarkOptions::NONE,
        }
    }

    #[test]
    fn test_uninitialized_scope_claimed_by_lowest_id() {
        let mut manager = BookmarkScopeManager::new();
        let first = manager.create_scope(InstanceId::new(1), None).unwrap();
        let second = manager.create_scope(InstanceId::new(2), None).unwrap();
        manager.create_bookmark(second, "reply", record(2)).unwrap();
        manager.create_bookmark(first, "reply", record(1)).unwrap();

        let key = Uuid::new_v4();
        assert_eq!(
            manager.locate(key, &"reply".into()),
            ScopeLookup::Found {
                scope: first,
                claim: Some(key)
            }
        );
    }

    #[test]
    fn test_initialized_scope_isolated_from_other_keys() {
        let mut manager = BookmarkScopeManager::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let scope_a = manager.create_scope(InstanceId::new(1), Some(a)).unwrap();
        manager.create_scope(InstanceId::new(2), Some(b)).unwrap();
        manager.create_bookmark(scope_a, "reply", record(1)).unwrap();

        assert!(matches!(
            manager.locate(a, &"reply".into()),
            ScopeLookup::Found { claim: None, .. }
        ));
        assert_eq!(manager.locate(b, &"reply".into()), ScopeLookup::Missing);
    }

    #[test]
    fn test_stability() {
        let mut manager = BookmarkScopeManager::new();
        let key = Uuid::new_v4();
        assert!(manager.is_stable(key, false));
        assert!(!manager.is_stable(key, true));

        let pending = manager.create_scope(InstanceId::new(1), None).unwrap();
        assert!(!manager.is_stable(key, false), "a scope may still be claimed");

        manager.initialize(pending, Uuid::new_v4()).unwrap();
        assert!(manager.is_stable(key, false));

        manager.create_bookmark(pending, "x", record(1)).unwrap();
        assert!(!manager.is_stable(key, false), "another scope is alive");
    }

    #[test]
    fn test_initialize_errors() {
        let mut manager = BookmarkScopeManager::new();
        let key = Uuid::new_v4();
        let scope = manager.create_scope(InstanceId::new(1), Some(key)).unwrap();

        assert_eq!(
            manager
                .initialize(scope, Uuid::new_v4())
                .unwrap_err()
                .error_code(),
            "BOOKMARK_SCOPE_ALREADY_INITIALIZED"
        );
        let other = manager.create_scope(InstanceId::new(1), None).unwrap();
        assert!(manager.initialize(other, key).is_err());
    }

    #[test]
    fn test_key_lifecycle_queues_association_changes() {
        let mut manager = BookmarkScopeManager::new();
        let owner = InstanceId::new(4);
        let scope = manager.create_scope(owner, None).unwrap();
        manager.create_bookmark(scope, "reply", record(5)).unwrap();
        let key = Uuid::new_v4();
        manager.initialize(scope, key).unwrap();

        assert!(manager.has_keys_to_update());
        assert_eq!(manager.take_key_updates(), (vec![key], vec![]));

        let dropped = manager.unregister_owned_by(owner);
        assert_eq!(dropped.len(), 1);
        assert_eq!(manager.take_key_updates(), (vec![], vec![key]));
        assert!(!manager.contains(scope));
    }
}
