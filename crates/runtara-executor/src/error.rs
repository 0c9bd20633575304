// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-executor.
//!
//! Two families live here:
//!
//! - [`ExecutorError`]: misuse of the executor API (duplicate bookmark names,
//!   unknown instances, loading an image into the wrong definition, ...).
//!   These are returned from host and context calls.
//! - [`ActivityFault`]: the fault value that travels through the instance tree.
//!   Activities return it from their callbacks, work items carry it while it is
//!   propagated, and it is persisted as part of queued work items, so it is
//!   cloneable and serde-serializable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::ActivityId;
use crate::instance::InstanceId;

/// Result type using ExecutorError
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors raised by executor operations.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// A named bookmark already exists in the target scope.
    #[error("bookmark '{name}' already exists in {scope}")]
    BookmarkAlreadyExists {
        /// The duplicated bookmark name.
        name: String,
        /// Human readable scope description.
        scope: String,
    },

    /// The bookmark scope is not registered with the scope manager.
    #[error("bookmark scope {scope} is not registered")]
    BookmarkScopeNotRegistered {
        /// Human readable scope description.
        scope: String,
    },

    /// The bookmark scope was already initialized with a key.
    #[error("bookmark scope {scope} is already initialized")]
    BookmarkScopeAlreadyInitialized {
        /// Human readable scope description.
        scope: String,
    },

    /// No instance with this id exists in the tree.
    #[error("activity instance {instance} not found")]
    InstanceNotFound {
        /// The missing instance.
        instance: InstanceId,
    },

    /// The definition has no activity with this id.
    #[error("activity {activity} is not part of the workflow definition")]
    ActivityNotFound {
        /// The missing activity id.
        activity: ActivityId,
    },

    /// A location (argument or variable) could not be resolved.
    #[error("location '{name}' is not visible from instance {instance}")]
    LocationNotFound {
        /// The instance performing the lookup.
        instance: InstanceId,
        /// The argument or variable name.
        name: String,
    },

    /// The workflow definition is malformed.
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The monotonic instance id counter is exhausted.
    #[error("activity instance id space exhausted")]
    OutOfInstanceIds,

    /// An async operation is already active for the instance.
    #[error("instance {instance} already has an active async operation")]
    AsyncOperationAlreadyActive {
        /// The instance that owns the operation.
        instance: InstanceId,
    },

    /// The executor is waiting on an asynchronous work item.
    #[error("executor is busy with an asynchronous work item")]
    Busy,

    /// The executor is inside a no-persist region.
    #[error("instance is not persistable (no-persist count {count})")]
    NotPersistable {
        /// Current no-persist count.
        count: u32,
    },

    /// A persisted image was produced by a different workflow definition.
    #[error("definition mismatch: image was persisted for {expected}, got {found}")]
    DefinitionMismatch {
        /// Identity recorded in the image.
        expected: String,
        /// Identity of the definition supplied at load time.
        found: String,
    },

    /// The instance store failed.
    #[error("store error: {0}")]
    Store(String),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ExecutorError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BookmarkAlreadyExists { .. } => "BOOKMARK_ALREADY_EXISTS",
            Self::BookmarkScopeNotRegistered { .. } => "BOOKMARK_SCOPE_NOT_REGISTERED",
            Self::BookmarkScopeAlreadyInitialized { .. } => "BOOKMARK_SCOPE_ALREADY_INITIALIZED",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::ActivityNotFound { .. } => "ACTIVITY_NOT_FOUND",
            Self::LocationNotFound { .. } => "LOCATION_NOT_FOUND",
            Self::InvalidDefinition(_) => "INVALID_DEFINITION",
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::OutOfInstanceIds => "OUT_OF_INSTANCE_IDS",
            Self::AsyncOperationAlreadyActive { .. } => "ASYNC_OPERATION_ALREADY_ACTIVE",
            Self::Busy => "EXECUTOR_BUSY",
            Self::NotPersistable { .. } => "NOT_PERSISTABLE",
            Self::DefinitionMismatch { .. } => "DEFINITION_MISMATCH",
            Self::Store(_) => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_json::Error> for ExecutorError {
    fn from(err: serde_json::Error) -> Self {
        ExecutorError::Serialization(err.to_string())
    }
}

/// Category of an [`ActivityFault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Raised by activity execution logic.
    Activity,
    /// An executor call made by an activity was rejected.
    InvalidOperation,
    /// The whole workflow instance is being aborted.
    WorkflowAborted,
    /// The ambient transaction failed or was rolled back.
    Transaction,
    /// The transaction outcome did not arrive in time.
    Timeout,
    /// The instance was terminated by the host or an activity.
    Terminated,
    /// The instance store failed.
    Persistence,
    /// A tracking participant failed.
    Tracking,
}

impl FaultKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::InvalidOperation => "invalid_operation",
            Self::WorkflowAborted => "workflow_aborted",
            Self::Transaction => "transaction",
            Self::Timeout => "timeout",
            Self::Terminated => "terminated",
            Self::Persistence => "persistence",
            Self::Tracking => "tracking",
        }
    }
}

/// A fault raised inside the activity tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ActivityFault {
    /// Fault category.
    pub kind: FaultKind,
    /// Human readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// The fault this one wraps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[source]
    pub inner: Option<Box<ActivityFault>>,
}

impl ActivityFault {
    /// Create an activity-level fault.
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Activity, message)
    }

    /// Create a fault of the given kind.
    pub fn with_kind(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            inner: None,
        }
    }

    /// Create an invalid-operation fault.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::InvalidOperation, message)
    }

    /// Create a transaction fault.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::with_kind(FaultKind::Transaction, message)
    }

    /// Wrap `inner` in a workflow-abort signal.
    pub fn workflow_aborted(message: impl Into<String>, inner: ActivityFault) -> Self {
        Self::with_kind(FaultKind::WorkflowAborted, message).caused_by(inner)
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Attach the fault that caused this one.
    pub fn caused_by(mut self, inner: ActivityFault) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// The innermost fault in the chain.
    pub fn root_cause(&self) -> &ActivityFault {
        let mut current = self;
        while let Some(inner) = current.inner.as_deref() {
            current = inner;
        }
        current
    }
}

impl From<ExecutorError> for ActivityFault {
    fn from(err: ExecutorError) -> Self {
        ActivityFault::invalid_operation(err.to_string())
            .with_data(Value::String(err.error_code().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_executor_error_codes() {
        let test_cases = vec![
            (
                ExecutorError::BookmarkAlreadyExists {
                    name: "approve".to_string(),
                    scope: "default scope".to_string(),
                },
                "BOOKMARK_ALREADY_EXISTS",
            ),
            (
                ExecutorError::InstanceNotFound {
                    instance: InstanceId::new(7),
                },
                "INSTANCE_NOT_FOUND",
            ),
            (
                ExecutorError::ActivityNotFound {
                    activity: ActivityId(3),
                },
                "ACTIVITY_NOT_FOUND",
            ),
            (ExecutorError::OutOfInstanceIds, "OUT_OF_INSTANCE_IDS"),
            (ExecutorError::Busy, "EXECUTOR_BUSY"),
            (
                ExecutorError::DefinitionMismatch {
                    expected: "abc".to_string(),
                    found: "def".to_string(),
                },
                "DEFINITION_MISMATCH",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error code mismatch for {:?}",
                error
            );
        }
    }

    #[test]
    fn test_executor_error_display() {
        let err = ExecutorError::BookmarkAlreadyExists {
            name: "approve".to_string(),
            scope: "default scope".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "bookmark 'approve' already exists in default scope"
        );

        let err = ExecutorError::NotPersistable { count: 2 };
        assert_eq!(
            err.to_string(),
            "instance is not persistable (no-persist count 2)"
        );
    }

    #[test]
    fn test_fault_chain_exposes_source() {
        let inner = ActivityFault::new("disk on fire");
        let outer = ActivityFault::workflow_aborted("tracking flush failed", inner.clone());

        assert_eq!(outer.kind, FaultKind::WorkflowAborted);
        assert_eq!(outer.root_cause(), &inner);
        let source = outer.source().expect("source should be set");
        assert_eq!(source.to_string(), "disk on fire");
    }

    #[test]
    fn test_executor_error_converts_to_invalid_operation_fault() {
        let fault: ActivityFault = ExecutorError::Busy.into();
        assert_eq!(fault.kind, FaultKind::InvalidOperation);
        assert_eq!(fault.data, Some(Value::String("EXECUTOR_BUSY".to_string())));
    }

    #[test]
    fn test_fault_serializes_without_empty_fields() {
        let fault = ActivityFault::new("boom");
        let json = serde_json::to_value(&fault).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "activity", "message": "boom"}));

        let back: ActivityFault = serde_json::from_value(json).unwrap();
        assert_eq!(back, fault);
    }
}
