// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fault propagation, workflow abort and termination.

use tracing::{debug, info, warn};

use super::ActivityExecutor;
use crate::error::ActivityFault;
use crate::instance::{ActivityInstanceState, InstanceId};
use crate::tracking::{TrackingEvent, WorkflowInstanceEvent};
use crate::work_item::{WorkItem, WorkItemKind};

impl ActivityExecutor {
    /// Route the item's fault to the nearest handler.
    ///
    /// Walks from the item's instance towards the root. The walk stops at the isolation
    /// scope of an attached transaction (the scope is aborted first), at an instance
    /// being canceled (the workflow is aborted), or at a child registered with a fault
    /// callback (its parent gets a fault work item). If nothing stops it, the fault
    /// stays on the item and escapes as unhandled.
    pub(super) fn propagate_exception(&mut self, item: &mut WorkItem) {
        let Some(exception) = item.exception_to_propagate.clone() else {
            return;
        };
        self.enter_no_persist_for_propagation();

        let source = self.info_or_placeholder(item.instance());
        let original = item
            .original_exception_source
            .get_or_insert_with(|| source.clone())
            .clone();

        let mut current = Some(item.instance());
        while let Some(id) = current {
            let Some(instance) = self.state.tree.get(id) else {
                break;
            };
            let parent = instance.parent();

            let is_isolation_scope = !instance.is_completed()
                && self
                    .runtime_transaction
                    .as_ref()
                    .is_some_and(|rt| rt.isolation_scope == id);
            if is_isolation_scope {
                debug!(scope = %id, error = %exception, "fault reached the transaction scope");
                let mut abort = self.new_work_item(
                    id,
                    WorkItemKind::AbortActivity {
                        reason: exception.clone(),
                    },
                );
                abort.original_exception_source = Some(original);
                self.state.scheduler.push(abort);
                if let Some(rt) = self.runtime_transaction.as_mut() {
                    rt.should_schedule_completion = false;
                }
                item.exception_propagated();
                self.exit_no_persist_for_propagation();
                return;
            }

            if instance.is_cancellation_requested() {
                let message = format!(
                    "fault raised while '{}' was being canceled",
                    instance.display_name()
                );
                warn!(instance = %id, error = %exception, "{}", message);
                self.abort_workflow_instance(ActivityFault::workflow_aborted(message, exception));
                item.exception_propagated();
                self.exit_no_persist_for_propagation();
                return;
            }

            if let Some(callback) = instance.fault_callback.clone()
                && let Some(owner) = parent
            {
                let via = instance.info();
                let handler = self.info_or_placeholder(owner);
                self.track(TrackingEvent::FaultPropagation {
                    source: source.clone(),
                    handler: Some(handler),
                    fault: exception.clone(),
                });
                let mut fault_item = self.new_work_item(
                    owner,
                    WorkItemKind::Fault {
                        callback,
                        fault: exception,
                        source: via,
                        original_source: Some(original.clone()),
                    },
                );
                fault_item.original_exception_source = Some(original);
                fault_item.exit_no_persist_required = !self.services.config.persist_exceptions;
                self.state.scheduler.push(fault_item);
                item.exception_propagated();
                debug!(source = %source.id, handler = %owner, "fault routed to handler");
                return;
            }

            current = parent;
        }

        self.track(TrackingEvent::FaultPropagation {
            source,
            handler: None,
            fault: exception,
        });
    }

    /// Mark the workflow instance for abort. The drain loop stops and tears it down.
    pub(crate) fn abort_workflow_instance(&mut self, reason: ActivityFault) {
        if self.abort_reason.is_some() {
            return;
        }
        warn!(
            instance_id = %self.state.instance_id,
            reason = %reason,
            "Workflow instance abort requested"
        );
        if let Some(rt) = self.runtime_transaction.as_ref() {
            rt.original.rollback(Some(&reason));
        }
        self.abort_reason = Some(reason);
    }

    /// Abort right away, dropping any outstanding operation.
    pub fn abort(&mut self, reason: ActivityFault) {
        self.abort_workflow_instance(reason);
        if self.in_flight.take().is_some() {
            self.state.scheduler.set_suspended(false);
        }
        self.tear_down();
    }

    /// Run abort hooks and discard the queue. Nothing is completed and nothing is
    /// scheduled; the executor cannot be used afterwards.
    pub(super) fn tear_down(&mut self) {
        if self.torn_down {
            return;
        }
        let Some(reason) = self.abort_reason.clone() else {
            return;
        };
        self.torn_down = true;
        self.runtime_transaction = None;
        for item in self.state.scheduler.take_all() {
            self.pool.release(item);
        }

        let mut roots: Vec<InstanceId> = self.state.secondary_roots.iter().copied().collect();
        roots.extend(self.state.root);
        for root in roots {
            for id in self.state.tree.post_order(root) {
                if !self.is_executing(id) {
                    continue;
                }
                let info = self.info_or_placeholder(id);
                if let Ok(activity) = self.activity_of(id) {
                    activity.abort(&info, &reason);
                }
                if let Some(instance) = self.state.tree.get_mut(id) {
                    instance.set_state(ActivityInstanceState::Faulted);
                }
            }
        }
        self.track(TrackingEvent::WorkflowInstance {
            state: WorkflowInstanceEvent::Aborted,
        });
        info!(
            instance_id = %self.state.instance_id,
            reason = %reason,
            "Workflow instance aborted"
        );
    }

    /// Abort every root and finish the workflow `Faulted` with `reason`.
    pub fn terminate(&mut self, reason: ActivityFault) {
        if self.is_completed() || self.abort_reason.is_some() {
            return;
        }
        let Some(root) = self.state.root else {
            return;
        };
        info!(
            instance_id = %self.state.instance_id,
            reason = %reason,
            "Workflow instance terminated"
        );
        self.state.completion_exception = Some(reason.clone());
        if self.state.root_state.is_some() {
            self.state.root_state = Some(ActivityInstanceState::Faulted);
        }
        self.track(TrackingEvent::WorkflowInstance {
            state: WorkflowInstanceEvent::Terminated,
        });

        let secondary: Vec<InstanceId> = self.state.secondary_roots.iter().copied().collect();
        for id in secondary {
            self.abort_activity_instance(id, &reason);
            self.sweep(id);
        }
        self.abort_activity_instance(root, &reason);
        self.sweep(root);
    }

    /// Terminate once the scheduler goes idle.
    pub(crate) fn schedule_terminate(&mut self, reason: ActivityFault) {
        if self.state.pending_terminate.is_none() {
            debug!(reason = %reason, "termination scheduled");
            self.state.pending_terminate = Some(reason);
        }
    }
}
