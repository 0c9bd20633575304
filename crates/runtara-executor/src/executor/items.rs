// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-kind work item execution and post-processing.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ActivityExecutor, FaultResult, OperationOutcome, PendingOperation};
use crate::bookmark::Bookmark;
use crate::context::FaultContext;
use crate::error::ActivityFault;
use crate::instance::{ActivityInstanceState, CompletedInstance, InstanceId, InstanceInfo};
use crate::work_item::{WorkItem, WorkItemKind};

impl ActivityExecutor {
    /// Execute step of the pipeline. Returns an operation when the item has to wait for I/O.
    pub(super) fn execute_item(&mut self, item: &mut WorkItem) -> Option<PendingOperation> {
        let id = item.instance();
        let result = match item.kind().clone() {
            WorkItemKind::Empty => Ok(()),
            WorkItemKind::ExecuteRoot { argument_overrides } => {
                self.execute_activity(id, true, Some(&argument_overrides))
            }
            WorkItemKind::ExecuteActivity {
                requires_symbol_resolution,
            } => self.execute_activity(id, requires_symbol_resolution, None),
            WorkItemKind::ExecuteExpression => self.execute_activity(id, true, None),
            WorkItemKind::ResolveNextArgument {
                next_index,
                argument_overrides,
            } => {
                let overrides = (!argument_overrides.is_empty()).then_some(&argument_overrides);
                self.resolve_arguments(id, overrides, next_index).map(|_| ())
            }
            WorkItemKind::Cancel => self.cancel_instance(id),
            WorkItemKind::Bookmark {
                callback,
                bookmark,
                value,
            } => self.execute_bookmark(id, callback, &bookmark, value),
            WorkItemKind::Completion {
                callback,
                completed,
            } => self.execute_completion(id, callback, &completed),
            WorkItemKind::Fault {
                callback,
                fault,
                source,
                original_source,
            } => {
                self.execute_fault(item, &callback, fault, source, original_source);
                Ok(())
            }
            WorkItemKind::AbortActivity { reason } => {
                self.abort_activity_instance(id, &reason);
                item.skip_instance_abort = true;
                Err(reason)
            }
            WorkItemKind::TransactionContext { callback, handle } => {
                self.execute_transaction_context(id, &callback, handle)
            }
            WorkItemKind::CompleteAsyncOperation {
                operation,
                callback,
                result,
            } => self.execute_operation_completion(id, operation, callback, result),
            WorkItemKind::CompleteTransaction { .. } => return self.begin_transaction_completion(item),
            WorkItemKind::Persist { bookmark } => return self.begin_persist(item, &bookmark),
        };
        if let Err(fault) = result {
            debug!(instance = %id, kind = item.kind_name(), error = %fault, "work item faulted");
            item.exception_to_propagate = Some(fault);
        }
        None
    }

    /// Apply the result of the operation an item suspended on.
    pub(super) fn finish_execute(&mut self, item: &mut WorkItem, outcome: OperationOutcome) {
        match outcome {
            OperationOutcome::Persisted(Ok(())) => {}
            OperationOutcome::Persisted(Err(fault)) => {
                warn!(instance = %item.instance(), error = %fault, "persist requested by activity failed");
                item.exception_to_propagate = Some(fault);
            }
            OperationOutcome::TransactionCompleted(result) => self.finish_transaction(item, result),
            other => {
                warn!(outcome = ?other, kind = item.kind_name(), "unexpected outcome for suspended work item");
            }
        }
    }

    /// Update the instance after its item ran: abort on fault, else re-evaluate and
    /// complete it if it reached a terminal state.
    pub(super) fn post_process(&mut self, item: &mut WorkItem) {
        if matches!(item.kind(), WorkItemKind::AbortActivity { .. }) {
            return;
        }
        let id = item.instance();
        if let Some(exception) = item.exception_to_propagate.clone() {
            if !item.skip_instance_abort {
                self.abort_activity_instance(id, &exception);
            }
            return;
        }
        if !self.is_executing(id) {
            return;
        }
        match self.update_state(id) {
            Ok(true) => {
                if let Err(fault) = self.complete_activity_instance(id) {
                    item.exception_to_propagate = Some(fault);
                }
            }
            Ok(false) => {}
            Err(fault) => {
                self.abort_activity_instance(id, &fault);
                item.exception_to_propagate = Some(fault);
            }
        }
    }

    fn execute_bookmark(
        &mut self,
        id: InstanceId,
        callback: Option<String>,
        bookmark: &Bookmark,
        value: Value,
    ) -> FaultResult {
        let Some(callback) = callback else {
            return Ok(());
        };
        self.invoke(id, |activity, ctx| {
            activity.on_bookmark_resumed(ctx, &callback, bookmark, value)
        })
    }

    fn execute_completion(
        &mut self,
        id: InstanceId,
        callback: Option<String>,
        completed: &CompletedInstance,
    ) -> FaultResult {
        let child_closed = completed.state() == ActivityInstanceState::Closed;
        if !child_closed
            && let Some(instance) = self.state.tree.get_mut(id)
            && instance.has_not_executed()
        {
            instance.initialization_incomplete = true;
        }

        let result = match callback {
            Some(callback) => self.invoke(id, |activity, ctx| {
                activity.on_child_completed(ctx, &callback, completed)
            }),
            None => Ok(()),
        };

        if !child_closed
            && let Some(instance) = self.state.tree.get_mut(id)
            && !instance.is_completed()
            && instance.performing_default_cancelation
            && let Err(e) = instance.mark_canceled()
        {
            warn!(instance = %id, error = %e, "default cancelation could not mark instance canceled");
        }
        result
    }

    fn execute_fault(
        &mut self,
        item: &mut WorkItem,
        callback: &str,
        fault: ActivityFault,
        source: InstanceInfo,
        original_source: Option<InstanceInfo>,
    ) {
        let id = item.instance();
        let mut context = FaultContext::new(fault.clone(), source, original_source);
        let result = self.invoke(id, |activity, ctx| {
            activity.on_child_faulted(ctx, callback, &mut context)
        });

        match result {
            Err(handler_fault) => {
                warn!(instance = %id, error = %handler_fault, "fault handler failed");
                item.original_exception_source = None;
                item.exception_to_propagate = Some(handler_fault);
            }
            Ok(()) if context.is_handled() => {
                debug!(instance = %id, fault = %fault, "fault handled");
            }
            Ok(()) => {
                item.exception_to_propagate = Some(fault);
                item.skip_instance_abort = true;
            }
        }
    }

    fn execute_operation_completion(
        &mut self,
        id: InstanceId,
        operation: Uuid,
        callback: Option<String>,
        result: Result<Value, ActivityFault>,
    ) -> FaultResult {
        let instance = self.state.tree.require_mut(id)?;
        if instance.active_operation != Some(operation) {
            debug!(instance = %id, operation = %operation, "stale async operation completion dropped");
            return Ok(());
        }
        instance.active_operation = None;
        instance.operation_callback = None;
        self.exit_instance_no_persist(id)?;

        let value = result?;
        match callback {
            Some(callback) => self.invoke(id, |activity, ctx| {
                activity.on_operation_completed(ctx, &callback, value)
            }),
            None => Ok(()),
        }
    }
}
