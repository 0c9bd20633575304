// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bookmarks: resumption points owned by activity instances.
//!
//! A bookmark is either named (addressable by the host) or anonymous (handed out
//! internally, e.g. for persistence waiters and transaction completion callbacks).
//! The callback is stored by name and dispatched to the owning instance's activity.

pub mod scope;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};
use crate::instance::InstanceId;

pub use scope::{BookmarkScope, BookmarkScopeManager, ScopeId};

/// A resumption token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bookmark {
    /// Host-addressable bookmark, unique per scope.
    Named(String),
    /// Internal bookmark.
    Anonymous(u64),
}

impl Bookmark {
    /// A named bookmark.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// The name, if this is a named bookmark.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Anonymous(_) => None,
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => f.write_str(name),
            Self::Anonymous(id) => write!(f, "<anonymous {}>", id),
        }
    }
}

impl From<&str> for Bookmark {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for Bookmark {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// Bookmark behavior flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookmarkOptions {
    /// The bookmark stays registered after being resumed.
    pub multiple_resume: bool,
    /// The bookmark does not keep its owner from completing.
    pub non_blocking: bool,
}

impl BookmarkOptions {
    /// Single-fire, blocking.
    pub const NONE: BookmarkOptions = BookmarkOptions {
        multiple_resume: false,
        non_blocking: false,
    };

    /// Set the multiple-resume flag.
    pub fn multiple_resume(mut self) -> Self {
        self.multiple_resume = true;
        self
    }

    /// Set the non-blocking flag.
    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }
}

/// What a bookmark resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkRecord {
    /// Instance that created the bookmark.
    pub owner: InstanceId,
    /// Callback on the owner's activity; `None` just wakes the owner up.
    pub callback: Option<String>,
    /// Flags.
    pub options: BookmarkOptions,
}

impl BookmarkRecord {
    /// Whether this bookmark keeps its owner executing.
    pub fn is_blocking(&self) -> bool {
        !self.options.non_blocking
    }
}

/// Outcome of a resumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkResumptionResult {
    /// A work item was scheduled for the callback.
    Success,
    /// The bookmark exists (or may still appear) but cannot be resumed right now.
    NotReady,
    /// The bookmark does not exist and cannot appear anymore.
    NotFound,
}

/// Externally visible description of a named bookmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookmarkInfo {
    /// Bookmark name.
    pub name: String,
    /// Owning instance.
    pub owner: InstanceId,
    /// Display name of the owning activity.
    pub owner_display_name: String,
    /// Scope holding the bookmark, `None` for a scope that has no key yet.
    pub scope: Option<BookmarkScope>,
}

#[derive(Serialize, Deserialize)]
struct BookmarkManagerImage {
    next_anonymous: u64,
    bookmarks: Vec<(Bookmark, BookmarkRecord)>,
}

/// Bookmarks of one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BookmarkManagerImage", into = "BookmarkManagerImage")]
pub struct BookmarkManager {
    next_anonymous: u64,
    bookmarks: BTreeMap<Bookmark, BookmarkRecord>,
}

impl From<BookmarkManagerImage> for BookmarkManager {
    fn from(image: BookmarkManagerImage) -> Self {
        Self {
            next_anonymous: image.next_anonymous,
            bookmarks: image.bookmarks.into_iter().collect(),
        }
    }
}

impl From<BookmarkManager> for BookmarkManagerImage {
    fn from(manager: BookmarkManager) -> Self {
        Self {
            next_anonymous: manager.next_anonymous,
            bookmarks: manager.bookmarks.into_iter().collect(),
        }
    }
}

impl BookmarkManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named bookmark. `scope` only feeds the error message.
    pub fn create_named(
        &mut self,
        name: &str,
        record: BookmarkRecord,
        scope: &str,
    ) -> Result<Bookmark> {
        let bookmark = Bookmark::named(name);
        if self.bookmarks.contains_key(&bookmark) {
            return Err(ExecutorError::BookmarkAlreadyExists {
                name: name.to_string(),
                scope: scope.to_string(),
            });
        }
        self.bookmarks.insert(bookmark.clone(), record);
        Ok(bookmark)
    }

    /// Register an anonymous bookmark.
    pub fn create_anonymous(&mut self, record: BookmarkRecord) -> Bookmark {
        self.next_anonymous += 1;
        let bookmark = Bookmark::Anonymous(self.next_anonymous);
        self.bookmarks.insert(bookmark.clone(), record);
        bookmark
    }

    /// Look up a bookmark by value.
    pub fn get(&self, bookmark: &Bookmark) -> Option<&BookmarkRecord> {
        self.bookmarks.get(bookmark)
    }

    /// Whether the bookmark is registered.
    pub fn contains(&self, bookmark: &Bookmark) -> bool {
        self.bookmarks.contains_key(bookmark)
    }

    /// Consume a resumption: single-fire bookmarks are removed.
    /// Returns the record and whether it was removed.
    pub fn take_for_resume(&mut self, bookmark: &Bookmark) -> Option<(BookmarkRecord, bool)> {
        let record = self.bookmarks.get(bookmark)?.clone();
        if record.options.multiple_resume {
            Some((record, false))
        } else {
            self.bookmarks.remove(bookmark);
            Some((record, true))
        }
    }

    /// Remove a bookmark.
    pub fn remove(&mut self, bookmark: &Bookmark) -> Option<BookmarkRecord> {
        self.bookmarks.remove(bookmark)
    }

    /// Remove every bookmark owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: InstanceId) -> Vec<(Bookmark, BookmarkRecord)> {
        let owned: Vec<Bookmark> = self
            .bookmarks
            .iter()
            .filter(|(_, record)| record.owner == owner)
            .map(|(bookmark, _)| bookmark.clone())
            .collect();
        owned
            .into_iter()
            .filter_map(|bookmark| {
                self.bookmarks
                    .remove(&bookmark)
                    .map(|record| (bookmark, record))
            })
            .collect()
    }

    /// Remove and return every bookmark.
    pub fn drain(&mut self) -> Vec<(Bookmark, BookmarkRecord)> {
        std::mem::take(&mut self.bookmarks).into_iter().collect()
    }

    /// Whether any bookmark is registered.
    pub fn has_bookmarks(&self) -> bool {
        !self.bookmarks.is_empty()
    }

    /// Whether any named bookmark is registered.
    pub fn has_named_bookmarks(&self) -> bool {
        self.bookmarks.keys().any(|b| b.name().is_some())
    }

    /// Number of registered bookmarks.
    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    /// Whether no bookmark is registered.
    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    /// Iterate registered bookmarks in order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bookmark, &BookmarkRecord)> {
        self.bookmarks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: u64, options: BookmarkOptions) -> BookmarkRecord {
        BookmarkRecord {
            owner: InstanceId::new(owner),
            callback: Some("resumed".to_string()),
            options,
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut manager = BookmarkManager::new();
        manager
            .create_named("approve", record(1, BookmarkOptions::NONE), "default scope")
            .unwrap();

        let err = manager
            .create_named("approve", record(2, BookmarkOptions::NONE), "default scope")
            .unwrap_err();
        assert_eq!(err.error_code(), "BOOKMARK_ALREADY_EXISTS");
    }

    #[test]
    fn test_single_fire_removed_on_resume() {
        let mut manager = BookmarkManager::new();
        let bookmark = manager
            .create_named("b", record(1, BookmarkOptions::NONE), "default scope")
            .unwrap();

        // Lookup is by value: an equal token built elsewhere finds it.
        let (_, removed) = manager.take_for_resume(&Bookmark::named("b")).unwrap();
        assert!(removed);
        assert!(manager.take_for_resume(&bookmark).is_none());
    }

    #[test]
    fn test_multiple_resume_stays_registered() {
        let mut manager = BookmarkManager::new();
        manager
            .create_named(
                "tick",
                record(1, BookmarkOptions::NONE.multiple_resume()),
                "default scope",
            )
            .unwrap();

        for _ in 0..3 {
            let (_, removed) = manager.take_for_resume(&"tick".into()).unwrap();
            assert!(!removed);
        }
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_owned_by() {
        let mut manager = BookmarkManager::new();
        manager
            .create_named("a", record(1, BookmarkOptions::NONE), "default scope")
            .unwrap();
        manager.create_anonymous(record(1, BookmarkOptions::NONE));
        manager
            .create_named("c", record(2, BookmarkOptions::NONE), "default scope")
            .unwrap();

        let removed = manager.remove_owned_by(InstanceId::new(1));
        assert_eq!(removed.len(), 2);
        assert_eq!(manager.len(), 1);
        assert!(manager.contains(&"c".into()));
    }

    #[test]
    fn test_manager_serializes_through_list() {
        let mut manager = BookmarkManager::new();
        manager
            .create_named("a", record(1, BookmarkOptions::NONE), "default scope")
            .unwrap();
        let anonymous = manager.create_anonymous(record(1, BookmarkOptions::NONE.non_blocking()));

        let json = serde_json::to_string(&manager).unwrap();
        let mut back: BookmarkManager = serde_json::from_str(&json).unwrap();

        assert_eq!(back, manager);
        assert!(!back.get(&anonymous).unwrap().is_blocking());
        // The anonymous counter survives so new ids do not collide.
        assert_ne!(back.create_anonymous(record(1, BookmarkOptions::NONE)), anonymous);
    }
}
