// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance store interface and backends.
//!
//! The executor only produces and consumes [`PersistedImage`]s and key association
//! changes. Where they end up is the store's business.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryInstanceStore;
pub use self::sqlite::SqliteInstanceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ActivityFault, ExecutorError, FaultKind};
use crate::instance::ActivityInstanceState;
use crate::snapshot::ExecutorSnapshot;

/// Coarse status stored alongside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    /// Still running (idle or mid-flight).
    Executing,
    /// Completed successfully.
    Closed,
    /// Completed canceled.
    Canceled,
    /// Completed faulted or terminated.
    Faulted,
}

impl ImageStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Faulted => "faulted",
        }
    }

    /// Parse a stored status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executing" => Some(Self::Executing),
            "closed" => Some(Self::Closed),
            "canceled" => Some(Self::Canceled),
            "faulted" => Some(Self::Faulted),
            _ => None,
        }
    }
}

impl From<Option<ActivityInstanceState>> for ImageStatus {
    fn from(state: Option<ActivityInstanceState>) -> Self {
        match state {
            None | Some(ActivityInstanceState::Executing) => Self::Executing,
            Some(ActivityInstanceState::Closed) => Self::Closed,
            Some(ActivityInstanceState::Canceled) => Self::Canceled,
            Some(ActivityInstanceState::Faulted) => Self::Faulted,
        }
    }
}

/// A durable image of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedImage {
    /// Workflow instance id.
    pub instance_id: Uuid,
    /// Identity of the definition the image belongs to.
    pub definition_identity: String,
    /// Status at save time.
    pub status: ImageStatus,
    /// Serialized [`ExecutorSnapshot`].
    pub snapshot: serde_json::Value,
    /// When the image was produced.
    pub saved_at: DateTime<Utc>,
}

impl PersistedImage {
    /// Wrap a snapshot.
    pub fn from_snapshot(snapshot: &ExecutorSnapshot) -> Result<Self, ExecutorError> {
        Ok(Self {
            instance_id: snapshot.instance_id(),
            definition_identity: snapshot.definition_identity().to_string(),
            status: snapshot.execution_state().into(),
            snapshot: serde_json::to_value(snapshot)?,
            saved_at: Utc::now(),
        })
    }

    /// Decode the snapshot.
    pub fn to_snapshot(&self) -> Result<ExecutorSnapshot, ExecutorError> {
        Ok(serde_json::from_value(self.snapshot.clone())?)
    }
}

/// Store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing database failed.
    #[error("database error during {operation}: {details}")]
    Database {
        /// Operation being performed.
        operation: String,
        /// Failure description.
        details: String,
    },

    /// Driver error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Stored data could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The key is owned by another instance.
    #[error("key {key} is already associated with instance {owner}")]
    KeyConflict {
        /// The contested key.
        key: Uuid,
        /// Current owner.
        owner: Uuid,
    },
}

impl From<StoreError> for ActivityFault {
    fn from(err: StoreError) -> Self {
        ActivityFault::with_kind(FaultKind::Persistence, err.to_string())
    }
}

impl From<StoreError> for ExecutorError {
    fn from(err: StoreError) -> Self {
        ExecutorError::Store(err.to_string())
    }
}

/// Durable storage for workflow instance images and correlation keys.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or replace the image of `image.instance_id`.
    async fn save(&self, image: &PersistedImage) -> Result<(), StoreError>;

    /// Latest image of an instance.
    async fn load(&self, instance_id: Uuid) -> Result<Option<PersistedImage>, StoreError>;

    /// Associate correlation keys with an instance.
    async fn associate_keys(&self, instance_id: Uuid, keys: &[Uuid]) -> Result<(), StoreError>;

    /// Drop key associations.
    async fn disassociate_keys(&self, keys: &[Uuid]) -> Result<(), StoreError>;

    /// Instance a key is associated with.
    async fn lookup_key(&self, key: Uuid) -> Result<Option<Uuid>, StoreError>;
}
