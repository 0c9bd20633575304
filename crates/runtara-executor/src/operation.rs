// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host-provided async operations.
//!
//! An activity starts an operation with `ActivityContext::begin_async_operation` and
//! passes the returned handle to whatever service does the work (usually an
//! extension). The service completes the handle from any task; the completion is
//! queued on a channel and applied by the driver on the scheduler's side. A handle
//! dropped without an outcome completes the operation with a fault.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ActivityFault;
use crate::instance::InstanceId;

/// Result of an async operation, addressed to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationCompletion {
    /// Instance that started the operation.
    pub instance: InstanceId,
    /// Operation id.
    pub operation: Uuid,
    /// Outcome.
    pub result: Result<Value, ActivityFault>,
}

/// Handle to an in-flight async operation.
///
/// Not `Clone`: exactly one owner reports the outcome.
#[derive(Debug)]
pub struct AsyncOperationHandle {
    instance: InstanceId,
    operation: Uuid,
    completions: Option<mpsc::UnboundedSender<OperationCompletion>>,
}

impl AsyncOperationHandle {
    pub(crate) fn new(
        instance: InstanceId,
        operation: Uuid,
        completions: mpsc::UnboundedSender<OperationCompletion>,
    ) -> Self {
        Self {
            instance,
            operation,
            completions: Some(completions),
        }
    }

    /// Owner instance.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Operation id.
    pub fn id(&self) -> Uuid {
        self.operation
    }

    /// Report the outcome. Returns `false` if the workflow instance is gone.
    pub fn complete(mut self, result: Result<Value, ActivityFault>) -> bool {
        let delivered = self.send(result);
        if !delivered {
            warn!(
                instance = %self.instance,
                operation = %self.operation,
                "async operation completed after its workflow instance went away"
            );
        }
        delivered
    }

    /// Report success.
    pub fn succeed(self, value: Value) -> bool {
        self.complete(Ok(value))
    }

    /// Report failure.
    pub fn fail(self, fault: ActivityFault) -> bool {
        self.complete(Err(fault))
    }

    fn send(&mut self, result: Result<Value, ActivityFault>) -> bool {
        let Some(completions) = self.completions.take() else {
            return false;
        };
        completions
            .send(OperationCompletion {
                instance: self.instance,
                operation: self.operation,
                result,
            })
            .is_ok()
    }
}

impl Drop for AsyncOperationHandle {
    fn drop(&mut self) {
        if self.completions.is_none() {
            return;
        }
        warn!(
            instance = %self.instance,
            operation = %self.operation,
            "async operation handle dropped without an outcome"
        );
        let fault = ActivityFault::new("async operation handle dropped without completing");
        if !self.send(Err(fault)) {
            debug!(operation = %self.operation, "workflow instance already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_completion_travels_over_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AsyncOperationHandle::new(InstanceId::new(3), Uuid::new_v4(), tx);
        let id = handle.id();

        tokio::spawn(async move {
            handle.succeed(json!({"doubled": 8}));
        });

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.instance, InstanceId::new(3));
        assert_eq!(completion.operation, id);
        assert_eq!(completion.result, Ok(json!({"doubled": 8})));
    }

    #[test]
    fn test_complete_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = AsyncOperationHandle::new(InstanceId::new(1), Uuid::new_v4(), tx);
        assert!(!handle.fail(ActivityFault::new("late")));
    }

    #[test]
    fn test_dropped_handle_reports_fault() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AsyncOperationHandle::new(InstanceId::new(4), Uuid::new_v4(), tx);
        let id = handle.id();
        drop(handle);

        let completion = rx.try_recv().unwrap();
        assert_eq!(completion.operation, id);
        let fault = completion.result.unwrap_err();
        assert!(fault.message.contains("dropped without completing"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_completed_handle_sends_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = AsyncOperationHandle::new(InstanceId::new(5), Uuid::new_v4(), tx);
        assert!(handle.succeed(json!(1)));

        assert_eq!(rx.try_recv().unwrap().result, Ok(json!(1)));
        assert!(rx.try_recv().is_err());
    }
}
