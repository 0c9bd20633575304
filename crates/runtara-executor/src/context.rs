// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! What an activity sees while one of its methods runs.
//!
//! An [`ActivityContext`] borrows the executor for the duration of a single call and
//! is bound to the calling instance. Everything an activity can do to the workflow
//! instance goes through it.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::activity::ActivityId;
use crate::bookmark::{Bookmark, BookmarkOptions, ScopeId};
use crate::error::{ActivityFault, Result};
use crate::executor::{ActivityExecutor, TransactionHandleId};
use crate::instance::{InstanceId, InstanceInfo};
use crate::operation::AsyncOperationHandle;
use crate::transaction::Transaction;

/// Callbacks to run on the parent when a scheduled child finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildCallbacks {
    pub(crate) on_completed: Option<String>,
    pub(crate) on_faulted: Option<String>,
}

impl ChildCallbacks {
    /// No callbacks: faults bubble past the parent.
    pub fn none() -> Self {
        Self::default()
    }

    /// Run `callback` when the child completes in any state.
    pub fn on_completed(mut self, callback: impl Into<String>) -> Self {
        self.on_completed = Some(callback.into());
        self
    }

    /// Route faults from the child's subtree to `callback`.
    pub fn on_faulted(mut self, callback: impl Into<String>) -> Self {
        self.on_faulted = Some(callback.into());
        self
    }
}

/// Context for one activity call.
pub struct ActivityContext<'a> {
    executor: &'a mut ActivityExecutor,
    instance: InstanceId,
    activity: ActivityId,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(
        executor: &'a mut ActivityExecutor,
        instance: InstanceId,
        activity: ActivityId,
    ) -> Self {
        Self {
            executor,
            instance,
            activity,
        }
    }

    /// The calling instance.
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// The calling instance's activity.
    pub fn activity_id(&self) -> ActivityId {
        self.activity
    }

    /// Workflow instance id.
    pub fn workflow_instance_id(&self) -> Uuid {
        self.executor.instance_id()
    }

    /// Snapshot of the calling instance.
    pub fn info(&self) -> InstanceInfo {
        self.executor.info_or_placeholder(self.instance)
    }

    /// Declared child activities, in declaration order.
    pub fn child_activities(&self) -> Vec<ActivityId> {
        self.executor
            .definition()
            .node(self.activity)
            .map(|node| node.children().to_vec())
            .unwrap_or_default()
    }

    // Children ------------------------------------------------------------

    /// Schedule a declared child activity.
    pub fn schedule_child(&mut self, child: ActivityId, callbacks: ChildCallbacks) -> Result<InstanceId> {
        self.executor.schedule_child(self.instance, child, callbacks)
    }

    /// Schedule a declared child as an independent root of the workflow instance.
    pub fn schedule_secondary_root(&mut self, child: ActivityId, share_environment: bool) -> Result<InstanceId> {
        self.executor
            .schedule_secondary_root(self.instance, child, share_environment)
    }

    /// Executing children of the calling instance.
    pub fn children(&self) -> Vec<InstanceId> {
        self.executor.children_of(self.instance)
    }

    /// Request cancellation of one child.
    pub fn cancel_child(&mut self, child: InstanceId) -> Result<()> {
        self.executor.cancel_child(self.instance, child)
    }

    // Cancellation ----------------------------------------------------------

    /// Whether cancellation of the calling instance was requested.
    pub fn is_cancellation_requested(&self) -> bool {
        self.executor
            .instance(self.instance)
            .is_some_and(|i| i.is_cancellation_requested())
    }

    /// Cancel every child and let outstanding bookmarks be dropped.
    pub fn default_cancel(&mut self) {
        self.executor.default_cancel(self.instance);
    }

    /// Acknowledge cancellation; the instance completes `Canceled`.
    pub fn mark_canceled(&mut self) -> Result<()> {
        self.executor.mark_instance_canceled(self.instance)
    }

    // Bookmarks -------------------------------------------------------------

    /// Named blocking bookmark resumed into `callback`.
    pub fn create_bookmark(&mut self, name: &str, callback: &str) -> Result<Bookmark> {
        self.create_bookmark_with(Some(name), Some(callback), BookmarkOptions::NONE)
    }

    /// Bookmark with explicit options; anonymous when `name` is `None`.
    pub fn create_bookmark_with(
        &mut self,
        name: Option<&str>,
        callback: Option<&str>,
        options: BookmarkOptions,
    ) -> Result<Bookmark> {
        self.executor
            .create_bookmark(self.instance, name, callback, options)
    }

    /// Remove a bookmark owned by the calling instance.
    pub fn remove_bookmark(&mut self, bookmark: &Bookmark) -> bool {
        self.executor.remove_bookmark(self.instance, bookmark)
    }

    /// Create a bookmark scope owned by the calling instance.
    pub fn create_bookmark_scope(&mut self, key: Option<Uuid>) -> Result<ScopeId> {
        self.executor.create_bookmark_scope(self.instance, key)
    }

    /// Give an uninitialized scope its key.
    pub fn initialize_bookmark_scope(&mut self, scope: ScopeId, key: Uuid) -> Result<()> {
        self.executor.initialize_bookmark_scope(scope, key)
    }

    /// Named bookmark in a scope.
    pub fn create_scoped_bookmark(
        &mut self,
        scope: ScopeId,
        name: &str,
        callback: Option<&str>,
        options: BookmarkOptions,
    ) -> Result<Bookmark> {
        self.executor
            .create_scoped_bookmark(self.instance, scope, name, callback, options)
    }

    /// Run `callback` once the main root completes.
    pub fn on_main_root_complete(&mut self, callback: &str) -> Result<Bookmark> {
        self.executor
            .register_main_root_complete_callback(self.instance, callback)
    }

    // Values ----------------------------------------------------------------

    /// Read an argument or variable in scope.
    pub fn get_value(&self, name: &str) -> Result<Value> {
        self.executor.get_value(self.instance, name)
    }

    /// Write an argument or variable in scope.
    pub fn set_value(&mut self, name: &str, value: Value) -> Result<()> {
        self.executor.set_value(self.instance, name, value)
    }

    /// Per-instance state that survives persistence.
    pub fn private_state(&self, key: &str) -> Option<Value> {
        self.executor.private_value(self.instance, key)
    }

    /// Store a private state value.
    pub fn set_private_state(&mut self, key: &str, value: Value) -> Result<()> {
        self.executor.set_private_value(self.instance, key, value)
    }

    /// Result handed to the parent (and to the result location of an expression).
    pub fn set_result(&mut self, value: Value) -> Result<()> {
        self.executor.set_result(self.instance, value)
    }

    /// Register a property visible to the calling instance's subtree.
    pub fn add_property(&mut self, name: &str, value: Value) -> Result<()> {
        self.executor.add_property(self.instance, name, value)
    }

    /// Closest property registration, falling back to host properties.
    pub fn find_property(&self, name: &str) -> Option<Value> {
        self.executor.find_property(self.instance, name)
    }

    /// Host service registered in the extensions.
    pub fn extension<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.executor.extensions().get::<T>()
    }

    // Persistence -----------------------------------------------------------

    /// Save an image once persistable; `callback` runs afterwards.
    pub fn request_persist(&mut self, callback: Option<&str>) -> Result<Bookmark> {
        self.executor.request_persist(self.instance, callback)
    }

    /// Open a no-persist block held by the calling instance.
    pub fn enter_no_persist(&mut self) -> Result<()> {
        self.executor.enter_instance_no_persist(self.instance)
    }

    /// Close a block opened with [`enter_no_persist`](Self::enter_no_persist).
    pub fn exit_no_persist(&mut self) -> Result<()> {
        self.executor.exit_instance_no_persist(self.instance)
    }

    /// Start an async operation. The instance cannot be persisted until it completes.
    pub fn begin_async_operation(&mut self, callback: Option<&str>) -> Result<AsyncOperationHandle> {
        self.executor.begin_async_operation(self.instance, callback)
    }

    // Transactions ----------------------------------------------------------

    /// Handle for requesting transaction contexts.
    pub fn create_transaction_handle(&mut self, abort_on_failure: bool) -> TransactionHandleId {
        self.executor
            .create_transaction_handle(self.instance, abort_on_failure)
    }

    /// Ask for a transaction context; `callback` receives it once granted.
    pub fn request_transaction_context(
        &mut self,
        handle: TransactionHandleId,
        requires: bool,
        callback: &str,
    ) -> Result<()> {
        self.executor
            .request_transaction_context(self.instance, handle, requires, callback)
    }

    /// Complete the attached transaction; `callback` receives its final status.
    pub fn complete_transaction(&mut self, handle: TransactionHandleId, callback: Option<&str>) -> Result<()> {
        self.executor
            .request_transaction_completion(self.instance, handle, callback)
    }

    /// Dependent clone of the attached transaction.
    pub fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.executor.current_transaction()
    }

    // Workflow --------------------------------------------------------------

    /// Terminate the workflow instance once the current work drains.
    pub fn terminate_workflow(&mut self, reason: ActivityFault) {
        self.executor.schedule_terminate(reason);
    }

    /// Abort the workflow instance. Nothing further runs.
    pub fn abort_workflow(&mut self, reason: ActivityFault) {
        self.executor.abort_workflow_instance(reason);
    }
}

/// A fault delivered to a parent's fault callback.
#[derive(Debug)]
pub struct FaultContext {
    fault: ActivityFault,
    source: InstanceInfo,
    original_source: Option<InstanceInfo>,
    handled: bool,
}

impl FaultContext {
    pub(crate) fn new(
        fault: ActivityFault,
        source: InstanceInfo,
        original_source: Option<InstanceInfo>,
    ) -> Self {
        Self {
            fault,
            source,
            original_source,
            handled: false,
        }
    }

    /// Stop propagation.
    pub fn handle(&mut self) {
        self.handled = true;
    }

    /// Whether [`handle`](Self::handle) was called.
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// The fault.
    pub fn fault(&self) -> &ActivityFault {
        &self.fault
    }

    /// The child the fault came through.
    pub fn source(&self) -> &InstanceInfo {
        &self.source
    }

    /// The instance that raised the fault in the first place.
    pub fn original_source(&self) -> Option<&InstanceInfo> {
        self.original_source.as_ref()
    }
}

/// A granted transaction context.
#[derive(Debug)]
pub struct TransactionContext {
    handle: TransactionHandleId,
    current: Option<Arc<dyn Transaction>>,
    attached: Option<Arc<dyn Transaction>>,
}

impl TransactionContext {
    pub(crate) fn new(handle: TransactionHandleId, current: Option<Arc<dyn Transaction>>) -> Self {
        Self {
            handle,
            current,
            attached: None,
        }
    }

    /// Handle the context was requested with.
    pub fn handle(&self) -> TransactionHandleId {
        self.handle
    }

    /// Transaction already attached to the workflow instance, if any.
    pub fn current_transaction(&self) -> Option<&Arc<dyn Transaction>> {
        self.current.as_ref()
    }

    /// Attach `transaction`; the calling instance becomes its isolation scope.
    pub fn set_transaction(&mut self, transaction: Arc<dyn Transaction>) {
        self.attached = Some(transaction);
    }

    pub(crate) fn take_transaction(&mut self) -> Option<Arc<dyn Transaction>> {
        self.attached.take()
    }
}
