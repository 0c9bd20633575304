// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Location environments.
//!
//! Each environment declares named locations (arguments and variables) and may chain
//! to a parent environment for lookups. Environments are reference counted: every
//! instance using one holds a reference, and a child environment holds one on its
//! parent, so a chain is only torn down once nothing references any part of it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecutorError, Result};
use crate::instance::InstanceId;

/// Identifier of an environment in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(u64);

impl EnvironmentId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env{}", self.0)
    }
}

/// A set of named locations with an optional parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationEnvironment {
    parent: Option<EnvironmentId>,
    locations: BTreeMap<String, Value>,
    references: u32,
}

impl LocationEnvironment {
    /// Parent environment.
    pub fn parent(&self) -> Option<EnvironmentId> {
        self.parent
    }

    /// Locally declared value.
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locations.get(name)
    }

    /// Current reference count.
    pub fn references(&self) -> u32 {
        self.references
    }
}

/// Arena of environments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentArena {
    next_id: u64,
    environments: BTreeMap<EnvironmentId, LocationEnvironment>,
}

impl EnvironmentArena {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an environment with one reference, chained to `parent` if given.
    pub(crate) fn create(&mut self, parent: Option<EnvironmentId>) -> Result<EnvironmentId> {
        if let Some(parent) = parent {
            self.add_reference(parent)?;
        }
        self.next_id += 1;
        let id = EnvironmentId(self.next_id);
        self.environments.insert(
            id,
            LocationEnvironment {
                parent,
                locations: BTreeMap::new(),
                references: 1,
            },
        );
        Ok(id)
    }

    /// Take another reference on `id`.
    pub(crate) fn add_reference(&mut self, id: EnvironmentId) -> Result<()> {
        let env = self.require_mut(id)?;
        env.references += 1;
        Ok(())
    }

    /// Drop a reference. Environments that reach zero are removed and release their parent.
    pub(crate) fn release(&mut self, id: EnvironmentId) {
        let mut current = Some(id);
        while let Some(env_id) = current {
            let Some(env) = self.environments.get_mut(&env_id) else {
                return;
            };
            env.references = env.references.saturating_sub(1);
            if env.references > 0 {
                return;
            }
            current = env.parent;
            self.environments.remove(&env_id);
        }
    }

    /// Look up an environment.
    pub fn get(&self, id: EnvironmentId) -> Option<&LocationEnvironment> {
        self.environments.get(&id)
    }

    /// Number of live environments.
    pub fn len(&self) -> usize {
        self.environments.len()
    }

    /// Whether no environment is live.
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }

    /// Declare a location locally, initialized to `null`. Redeclaring keeps the value.
    pub(crate) fn declare(&mut self, id: EnvironmentId, name: &str) -> Result<()> {
        let env = self.require_mut(id)?;
        env.locations.entry(name.to_string()).or_insert(Value::Null);
        Ok(())
    }

    /// Read `name` from `id` or the closest ancestor that declares it.
    pub(crate) fn lookup(&self, id: EnvironmentId, name: &str) -> Option<&Value> {
        let mut current = Some(id);
        while let Some(env_id) = current {
            let env = self.environments.get(&env_id)?;
            if let Some(value) = env.locations.get(name) {
                return Some(value);
            }
            current = env.parent;
        }
        None
    }

    /// Write `name` in `id` or the closest ancestor that declares it.
    pub(crate) fn assign(
        &mut self,
        id: EnvironmentId,
        name: &str,
        value: Value,
        instance: InstanceId,
    ) -> Result<()> {
        let mut current = Some(id);
        while let Some(env_id) = current {
            let Some(env) = self.environments.get_mut(&env_id) else {
                break;
            };
            if let Some(slot) = env.locations.get_mut(name) {
                *slot = value;
                return Ok(());
            }
            current = env.parent;
        }
        Err(ExecutorError::LocationNotFound {
            instance,
            name: name.to_string(),
        })
    }

    fn require_mut(&mut self, id: EnvironmentId) -> Result<&mut LocationEnvironment> {
        self.environments.get_mut(&id).ok_or_else(|| {
            ExecutorError::InvalidOperation(format!("environment {} has been released", id))
        })
    }
}
