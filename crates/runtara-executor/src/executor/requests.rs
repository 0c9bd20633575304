// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Requests activities make through their context: bookmarks, values, properties.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::ActivityExecutor;
use crate::bookmark::{Bookmark, BookmarkOptions, BookmarkRecord, ScopeId};
use crate::error::{ExecutorError, Result};
use crate::extensions::Extensions;
use crate::instance::{ActivityInstance, InstanceId};

impl ActivityExecutor {
    fn require_live(&mut self, id: InstanceId) -> Result<&mut ActivityInstance> {
        let instance = self.state.tree.require_mut(id)?;
        if instance.is_completed() {
            return Err(ExecutorError::InvalidOperation(format!(
                "instance {} has already completed",
                id
            )));
        }
        Ok(instance)
    }

    /// Default-scope bookmark; anonymous when `name` is `None`.
    pub(crate) fn create_bookmark(
        &mut self,
        owner: InstanceId,
        name: Option<&str>,
        callback: Option<&str>,
        options: BookmarkOptions,
    ) -> Result<Bookmark> {
        self.require_live(owner)?;
        let record = BookmarkRecord {
            owner,
            callback: callback.map(str::to_string),
            options,
        };
        let blocking = record.is_blocking();
        let bookmark = match name {
            Some(name) => self
                .state
                .bookmarks
                .create_named(name, record, "default scope")?,
            None => self.state.bookmarks.create_anonymous(record),
        };
        if blocking && let Some(instance) = self.state.tree.get_mut(owner) {
            instance.blocking_bookmarks += 1;
        }
        debug!(owner = %owner, bookmark = %bookmark, "bookmark created");
        Ok(bookmark)
    }

    pub(crate) fn create_scoped_bookmark(
        &mut self,
        owner: InstanceId,
        scope: ScopeId,
        name: &str,
        callback: Option<&str>,
        options: BookmarkOptions,
    ) -> Result<Bookmark> {
        self.require_live(owner)?;
        let record = BookmarkRecord {
            owner,
            callback: callback.map(str::to_string),
            options,
        };
        let blocking = record.is_blocking();
        let bookmark = self.state.scopes.create_bookmark(scope, name, record)?;
        if blocking && let Some(instance) = self.state.tree.get_mut(owner) {
            instance.blocking_bookmarks += 1;
        }
        debug!(owner = %owner, scope = %scope, bookmark = %bookmark, "scoped bookmark created");
        Ok(bookmark)
    }

    /// Remove a default-scope bookmark owned by `owner`.
    pub(crate) fn remove_bookmark(&mut self, owner: InstanceId, bookmark: &Bookmark) -> bool {
        if self.state.bookmarks.get(bookmark).map(|r| r.owner) != Some(owner) {
            return false;
        }
        let Some(record) = self.state.bookmarks.remove(bookmark) else {
            return false;
        };
        if record.is_blocking()
            && let Some(instance) = self.state.tree.get_mut(owner)
        {
            instance.blocking_bookmarks = instance.blocking_bookmarks.saturating_sub(1);
        }
        true
    }

    pub(crate) fn create_bookmark_scope(
        &mut self,
        owner: InstanceId,
        key: Option<Uuid>,
    ) -> Result<ScopeId> {
        self.require_live(owner)?;
        let scope = self.state.scopes.create_scope(owner, key)?;
        debug!(owner = %owner, scope = %scope, ?key, "bookmark scope created");
        Ok(scope)
    }

    pub(crate) fn initialize_bookmark_scope(&mut self, scope: ScopeId, key: Uuid) -> Result<()> {
        self.state.scopes.initialize(scope, key)
    }

    /// Resume `callback` on `owner` once the main root completes. The value is the
    /// root's final state.
    pub(crate) fn register_main_root_complete_callback(
        &mut self,
        owner: InstanceId,
        callback: &str,
    ) -> Result<Bookmark> {
        let bookmark = self.create_bookmark(
            owner,
            None,
            Some(callback),
            BookmarkOptions::NONE.non_blocking(),
        )?;
        self.state.main_root_complete.push((owner, bookmark.clone()));
        Ok(bookmark)
    }

    /// Read an argument or variable visible from `id`.
    pub(crate) fn get_value(&self, id: InstanceId, name: &str) -> Result<Value> {
        let env = self.state.tree.require(id)?.environment;
        self.state
            .environments
            .lookup(env, name)
            .cloned()
            .ok_or_else(|| ExecutorError::LocationNotFound {
                instance: id,
                name: name.to_string(),
            })
    }

    /// Write an argument or variable visible from `id`.
    pub(crate) fn set_value(&mut self, id: InstanceId, name: &str, value: Value) -> Result<()> {
        let env = self.require_live(id)?.environment;
        self.state.environments.assign(env, name, value, id)
    }

    pub(crate) fn private_value(&self, id: InstanceId, key: &str) -> Option<Value> {
        self.state.tree.get(id)?.private_state.get(key).cloned()
    }

    pub(crate) fn set_private_value(&mut self, id: InstanceId, key: &str, value: Value) -> Result<()> {
        self.require_live(id)?
            .private_state
            .insert(key.to_string(), value);
        Ok(())
    }

    pub(crate) fn set_result(&mut self, id: InstanceId, value: Value) -> Result<()> {
        self.require_live(id)?.result = Some(value);
        Ok(())
    }

    pub(crate) fn add_property(&mut self, id: InstanceId, name: &str, value: Value) -> Result<()> {
        let instance = self.require_live(id)?;
        if instance.properties.contains_key(name) {
            return Err(ExecutorError::InvalidOperation(format!(
                "property '{}' is already registered on instance {}",
                name, id
            )));
        }
        instance.properties.insert(name.to_string(), value);
        Ok(())
    }

    /// Nearest registration of `name` walking up from `id`, then the host properties.
    pub(crate) fn find_property(&self, id: InstanceId, name: &str) -> Option<Value> {
        let mut current = Some(id);
        while let Some(instance) = current.and_then(|c| self.state.tree.get(c)) {
            if let Some(value) = instance.properties.get(name) {
                return Some(value.clone());
            }
            current = instance.parent();
        }
        self.state.host_properties.get(name).cloned()
    }

    pub(crate) fn cancel_child(&mut self, parent: InstanceId, child: InstanceId) -> Result<()> {
        let is_child = self
            .state
            .tree
            .get(parent)
            .is_some_and(|p| p.children().contains(&child));
        if !is_child {
            return Err(ExecutorError::InvalidOperation(format!(
                "instance {} is not a child of {}",
                child, parent
            )));
        }
        self.schedule_cancel(child, true);
        Ok(())
    }

    pub(crate) fn children_of(&self, id: InstanceId) -> Vec<InstanceId> {
        self.state
            .tree
            .get(id)
            .map(|i| i.children().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn mark_instance_canceled(&mut self, id: InstanceId) -> Result<()> {
        self.require_live(id)?.mark_canceled()
    }

    pub(crate) fn extensions(&self) -> &Arc<Extensions> {
        &self.services.extensions
    }
}
