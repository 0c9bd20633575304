// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Work items: deferred, schedulable units of execution.
//!
//! A work item is bound to exactly one instance and keeps it busy from creation until
//! it is released (at the start of its execution, or at disposal if it never ran).
//! Items are plain data. What they do lives in the executor, which matches on
//! [`WorkItemKind`], so a queued item can be serialized as part of an image and
//! executed after a reload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::bookmark::Bookmark;
use crate::error::ActivityFault;
use crate::executor::TransactionHandleId;
use crate::instance::{CompletedInstance, InstanceId, InstanceInfo};

/// What a work item does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Nothing to execute; only post-processing (state update) runs.
    Empty,
    /// First execution of the root, resolving arguments with host overrides.
    ExecuteRoot {
        /// Values that replace the root's argument bindings.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        argument_overrides: BTreeMap<String, Value>,
    },
    /// Execution of a scheduled activity.
    ExecuteActivity {
        /// Arguments and variables still need resolving.
        requires_symbol_resolution: bool,
    },
    /// Execution of an expression whose result feeds a location.
    ExecuteExpression,
    /// Continue argument resolution after an expression was scheduled.
    ResolveNextArgument {
        /// Index of the next argument to resolve.
        next_index: usize,
        /// Root argument overrides, carried along.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        argument_overrides: BTreeMap<String, Value>,
    },
    /// Deliver a cancellation request.
    Cancel,
    /// Invoke a bookmark callback with the resumption value.
    Bookmark {
        /// Callback on the owner's activity.
        callback: Option<String>,
        /// The resumed bookmark.
        bookmark: Bookmark,
        /// Value supplied with the resumption.
        value: Value,
    },
    /// A child completed: invoke the parent's completion callback (if any) and
    /// re-evaluate the parent, including the default-cancelation check.
    Completion {
        /// Callback on the parent's activity.
        callback: Option<String>,
        /// The child.
        completed: CompletedInstance,
    },
    /// Invoke a fault handler.
    Fault {
        /// Callback on the handler owner's activity.
        callback: String,
        /// The propagated fault.
        fault: ActivityFault,
        /// Child through which the fault arrived.
        source: InstanceInfo,
        /// Instance that originally raised the fault.
        original_source: Option<InstanceInfo>,
    },
    /// Abort the instance and re-propagate `reason` from it.
    AbortActivity {
        /// Abort reason.
        reason: ActivityFault,
    },
    /// Grant a requested transaction context.
    TransactionContext {
        /// Callback on the requester's activity.
        callback: String,
        /// Runtime transaction handle the request came through.
        handle: TransactionHandleId,
    },
    /// Deliver the result of a host async operation.
    CompleteAsyncOperation {
        /// Operation id.
        operation: Uuid,
        /// Callback on the owner's activity.
        callback: Option<String>,
        /// Operation result.
        result: std::result::Result<Value, ActivityFault>,
    },
    /// Persist, commit and check the outcome of the ambient transaction.
    CompleteTransaction {
        /// Bookmark resumed once the transaction completed.
        completion: Option<Bookmark>,
    },
    /// Persist on behalf of a persistence waiter.
    Persist {
        /// Waiter's bookmark, resumed before the image is written.
        bookmark: Bookmark,
    },
}

impl WorkItemKind {
    /// Short name used in logs and tracking.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::ExecuteRoot { .. } => "execute_root",
            Self::ExecuteActivity { .. } => "execute_activity",
            Self::ExecuteExpression => "execute_expression",
            Self::ResolveNextArgument { .. } => "resolve_next_argument",
            Self::Cancel => "cancel",
            Self::Bookmark { .. } => "bookmark",
            Self::Completion { .. } => "completion",
            Self::Fault { .. } => "fault",
            Self::AbortActivity { .. } => "abort_activity",
            Self::TransactionContext { .. } => "transaction_context",
            Self::CompleteAsyncOperation { .. } => "complete_async_operation",
            Self::CompleteTransaction { .. } => "complete_transaction",
            Self::Persist { .. } => "persist",
        }
    }

    fn pool_slot(&self) -> Option<usize> {
        match self {
            Self::Empty => Some(0),
            Self::ExecuteActivity { .. } => Some(1),
            Self::Completion { .. } => Some(2),
            _ => None,
        }
    }
}

/// A unit of deferred work bound to one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    instance: InstanceId,
    kind: WorkItemKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) exception_to_propagate: Option<ActivityFault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) original_exception_source: Option<InstanceInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) workflow_abort: Option<ActivityFault>,
    #[serde(default)]
    pub(crate) exit_no_persist_required: bool,
    #[serde(default)]
    pub(crate) skip_instance_abort: bool,
    #[serde(skip)]
    released: bool,
    #[serde(skip)]
    pooled: bool,
}

impl WorkItem {
    fn new(instance: InstanceId, kind: WorkItemKind, pooled: bool) -> Self {
        Self {
            instance,
            kind,
            exception_to_propagate: None,
            original_exception_source: None,
            workflow_abort: None,
            exit_no_persist_required: false,
            skip_instance_abort: false,
            released: false,
            pooled,
        }
    }

    /// Instance this item keeps busy.
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// What the item does.
    pub fn kind(&self) -> &WorkItemKind {
        &self.kind
    }

    /// Short kind name.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Whether the item has no execute step.
    pub fn is_empty(&self) -> bool {
        matches!(self.kind, WorkItemKind::Empty)
    }

    /// Fault waiting to be propagated once the item finishes.
    pub fn exception_to_propagate(&self) -> Option<&ActivityFault> {
        self.exception_to_propagate.as_ref()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }

    /// Copy that can be queued in an image: not released and not pooled.
    pub(crate) fn detached_copy(&self) -> WorkItem {
        let mut copy = self.clone();
        copy.released = false;
        copy.pooled = false;
        copy
    }

    /// Fault and propagation bookkeeping is done; forget the fault.
    pub(crate) fn exception_propagated(&mut self) {
        self.exception_to_propagate = None;
    }

    /// Reset every field so the allocation can be handed out again.
    pub(crate) fn clear(&mut self) {
        self.instance = InstanceId::new(0);
        self.kind = WorkItemKind::Empty;
        self.exception_to_propagate = None;
        self.original_exception_source = None;
        self.workflow_abort = None;
        self.exit_no_persist_required = false;
        self.skip_instance_abort = false;
        self.released = false;
    }
}

/// Typed free list for the hot work item kinds (empty, execute, completion).
#[derive(Debug)]
pub struct WorkItemPool {
    free: [Vec<WorkItem>; 3],
    capacity: usize,
}

impl Default for WorkItemPool {
    fn default() -> Self {
        Self::with_capacity(16)
    }
}

impl WorkItemPool {
    /// A pool keeping at most `capacity` idle items per kind.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            free: [Vec::new(), Vec::new(), Vec::new()],
            capacity,
        }
    }

    /// Hand out an item, reusing a cleared one when the kind is pooled.
    pub fn acquire(&mut self, instance: InstanceId, kind: WorkItemKind) -> WorkItem {
        let Some(slot) = kind.pool_slot() else {
            return WorkItem::new(instance, kind, false);
        };
        match self.free[slot].pop() {
            Some(mut item) => {
                item.instance = instance;
                item.kind = kind;
                item.pooled = true;
                item
            }
            None => WorkItem::new(instance, kind, true),
        }
    }

    /// Return a disposed item. Unpooled items are dropped.
    pub fn release(&mut self, mut item: WorkItem) {
        if !item.pooled {
            return;
        }
        let Some(slot) = item.kind.pool_slot() else {
            return;
        };
        item.clear();
        if self.free[slot].len() < self.capacity {
            self.free[slot].push(item);
        }
    }

    /// Idle items across all kinds.
    pub fn idle(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_items_are_cleared_before_reuse() {
        let mut pool = WorkItemPool::with_capacity(4);
        let mut item = pool.acquire(InstanceId::new(3), WorkItemKind::Empty);
        item.exception_to_propagate = Some(ActivityFault::new("stale"));
        item.exit_no_persist_required = true;
        item.mark_released();
        pool.release(item);
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire(InstanceId::new(9), WorkItemKind::Empty);
        assert_eq!(reused.instance(), InstanceId::new(9));
        assert!(reused.exception_to_propagate().is_none());
        assert!(!reused.exit_no_persist_required);
        assert!(!reused.is_released());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_unpooled_kinds_are_dropped() {
        let mut pool = WorkItemPool::with_capacity(4);
        let item = pool.acquire(InstanceId::new(1), WorkItemKind::Cancel);
        assert!(!item.pooled);
        pool.release(item);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_capacity_is_respected() {
        let mut pool = WorkItemPool::with_capacity(1);
        let a = pool.acquire(InstanceId::new(1), WorkItemKind::Empty);
        let b = pool.acquire(InstanceId::new(2), WorkItemKind::Empty);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_serialized_item_drops_transient_flags() {
        let mut pool = WorkItemPool::default();
        let mut item = pool.acquire(
            InstanceId::new(5),
            WorkItemKind::Bookmark {
                callback: Some("on_resume".to_string()),
                bookmark: Bookmark::named("approve"),
                value: serde_json::json!(42),
            },
        );
        item.mark_released();

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["kind"]["kind"], "bookmark");
        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert!(!back.is_released());
        assert_eq!(back.kind(), item.kind());
    }
}
