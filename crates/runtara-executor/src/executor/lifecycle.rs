// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle: creation, symbol resolution, state updates, completion and abort.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use super::{ActivityExecutor, FaultResult};
use crate::activity::{Activity, ActivityId, ArgumentDirection, ResolvedBinding};
use crate::bookmark::BookmarkRecord;
use crate::context::{ActivityContext, ChildCallbacks};
use crate::environment::EnvironmentId;
use crate::error::{ActivityFault, ExecutorError, Result};
use crate::instance::{
    ActivityInstance, ActivityInstanceState, CompletedInstance, InstanceId, ResultLocation,
    Substate,
};
use crate::tracking::{TrackingEvent, WorkflowInstanceEvent};
use crate::work_item::WorkItemKind;

impl ActivityExecutor {
    /// Run `f` against the instance's activity with a fresh context.
    pub(crate) fn invoke<F>(&mut self, id: InstanceId, f: F) -> FaultResult
    where
        F: FnOnce(&dyn Activity, &mut ActivityContext<'_>) -> FaultResult,
    {
        let activity_id = self.state.tree.require(id)?.activity();
        let activity = Arc::clone(self.definition.activity(activity_id)?);
        let mut ctx = ActivityContext::new(self, id, activity_id);
        f(activity.as_ref(), &mut ctx)
    }

    /// Allocate an instance and its environment.
    ///
    /// An activity that declares arguments or variables gets its own environment
    /// chained to `scope_env`; any other activity shares `scope_env`.
    pub(crate) fn create_instance(
        &mut self,
        activity: ActivityId,
        parent: Option<InstanceId>,
        scope_env: Option<EnvironmentId>,
    ) -> Result<InstanceId> {
        let definition = Arc::clone(&self.definition);
        let node = definition.node(activity)?;
        let id = self.state.tree.allocate_id()?;
        let environment = match scope_env {
            Some(env) if !node.declares_symbols() => {
                self.state.environments.add_reference(env)?;
                env
            }
            other => self.state.environments.create(other)?,
        };
        let symbols = node
            .arguments
            .iter()
            .map(|a| a.name.as_str())
            .chain(node.variables.iter().map(|v| v.name.as_str()));
        for name in symbols {
            self.state.environments.declare(environment, name)?;
        }

        let instance = ActivityInstance::new(
            id,
            activity,
            node.activity().display_name().to_string(),
            parent,
            environment,
        );
        let child = instance.info();
        self.state.tree.insert(instance);
        let parent = parent.map(|p| self.info_or_placeholder(p));
        self.track(TrackingEvent::ActivityScheduled { parent, child });
        Ok(id)
    }

    fn require_executing(&self, id: InstanceId) -> Result<&ActivityInstance> {
        let instance = self.state.tree.require(id)?;
        if instance.is_completed() {
            return Err(ExecutorError::InvalidOperation(format!(
                "instance {} has already completed",
                id
            )));
        }
        Ok(instance)
    }

    fn ensure_declared_child(&self, parent_activity: ActivityId, child: ActivityId) -> Result<()> {
        if self
            .definition
            .node(parent_activity)?
            .children()
            .contains(&child)
        {
            return Ok(());
        }
        Err(ExecutorError::InvalidOperation(format!(
            "activity {} is not a declared child of {}",
            child, parent_activity
        )))
    }

    pub(crate) fn schedule_child(
        &mut self,
        parent: InstanceId,
        child: ActivityId,
        callbacks: ChildCallbacks,
    ) -> Result<InstanceId> {
        let (parent_activity, environment) = {
            let instance = self.require_executing(parent)?;
            (instance.activity(), instance.environment)
        };
        self.ensure_declared_child(parent_activity, child)?;

        let id = self.create_instance(child, Some(parent), Some(environment))?;
        if let Some(instance) = self.state.tree.get_mut(id) {
            instance.completion_callback = callbacks.on_completed;
            instance.fault_callback = callbacks.on_faulted;
        }
        let item = self.new_work_item(
            id,
            WorkItemKind::ExecuteActivity {
                requires_symbol_resolution: true,
            },
        );
        self.state.scheduler.push(item);
        debug!(parent = %parent, child = %id, activity = %child, "child scheduled");
        Ok(id)
    }

    pub(crate) fn schedule_secondary_root(
        &mut self,
        spawner: InstanceId,
        child: ActivityId,
        share_environment: bool,
    ) -> Result<InstanceId> {
        let (spawner_activity, environment) = {
            let instance = self.require_executing(spawner)?;
            (instance.activity(), instance.environment)
        };
        self.ensure_declared_child(spawner_activity, child)?;

        let scope_env = share_environment.then_some(environment);
        let id = self.create_instance(child, None, scope_env)?;
        self.state.secondary_roots.insert(id);
        let item = self.new_work_item(
            id,
            WorkItemKind::ExecuteActivity {
                requires_symbol_resolution: true,
            },
        );
        self.state.scheduler.push(item);
        info!(spawner = %spawner, root = %id, activity = %child, "secondary root scheduled");
        Ok(id)
    }

    fn schedule_expression(
        &mut self,
        expression: ActivityId,
        owner: InstanceId,
        scope_env: EnvironmentId,
        location: ResultLocation,
    ) -> Result<InstanceId> {
        let id = self.create_instance(expression, Some(owner), Some(scope_env))?;
        if let Some(instance) = self.state.tree.get_mut(id) {
            instance.result_location = Some(location);
        }
        let item = self.new_work_item(id, WorkItemKind::ExecuteExpression);
        self.state.scheduler.push(item);
        Ok(id)
    }

    fn schedule_body(&mut self, id: InstanceId) {
        let item = self.new_work_item(
            id,
            WorkItemKind::ExecuteActivity {
                requires_symbol_resolution: false,
            },
        );
        self.state.scheduler.push(item);
    }

    /// Resolve, then run the activity body.
    pub(crate) fn execute_activity(
        &mut self,
        id: InstanceId,
        requires_symbol_resolution: bool,
        argument_overrides: Option<&BTreeMap<String, Value>>,
    ) -> FaultResult {
        if requires_symbol_resolution {
            if !self.resolve_arguments(id, argument_overrides, 0)? {
                return Ok(());
            }
            self.state
                .tree
                .require_mut(id)?
                .set_substate(Substate::ResolvingVariables);
            if !self.resolve_variables(id)? {
                return Ok(());
            }
        }
        let instance = self.state.tree.require_mut(id)?;
        if instance.is_cancellation_requested() || instance.initialization_incomplete {
            return Ok(());
        }
        instance.mark_executed();
        self.invoke(id, |activity, ctx| activity.execute(ctx))
    }

    /// Environments used for resolution: the instance's own and the one bindings read from.
    fn resolution_environments(&self, id: InstanceId) -> Result<(ActivityId, EnvironmentId, EnvironmentId)> {
        let instance = self.state.tree.require(id)?;
        let own = instance.environment;
        let scope = instance
            .parent()
            .and_then(|parent| self.state.tree.get(parent))
            .map(|parent| parent.environment)
            .unwrap_or(own);
        Ok((instance.activity(), own, scope))
    }

    /// Resolve arguments from `start`. Returns `false` when an expression was scheduled
    /// and resolution continues asynchronously.
    pub(crate) fn resolve_arguments(
        &mut self,
        id: InstanceId,
        argument_overrides: Option<&BTreeMap<String, Value>>,
        start: usize,
    ) -> FaultResult<bool> {
        let (activity, own, scope) = self.resolution_environments(id)?;
        let definition = Arc::clone(&self.definition);
        let node = definition.node(activity)?;
        let count = node.arguments.len();

        for (index, argument) in node.arguments.iter().enumerate().skip(start) {
            if argument.direction == ArgumentDirection::Out {
                continue;
            }
            if let Some(value) = argument_overrides.and_then(|o| o.get(&argument.name)) {
                self.state
                    .environments
                    .assign(own, &argument.name, value.clone(), id)?;
                continue;
            }
            match &argument.binding {
                ResolvedBinding::Unbound => {}
                ResolvedBinding::Literal(value) => {
                    self.state
                        .environments
                        .assign(own, &argument.name, value.clone(), id)?;
                }
                ResolvedBinding::Variable(source) => {
                    let value = self
                        .state
                        .environments
                        .lookup(scope, source)
                        .cloned()
                        .ok_or_else(|| ExecutorError::LocationNotFound {
                            instance: id,
                            name: source.clone(),
                        })?;
                    self.state
                        .environments
                        .assign(own, &argument.name, value, id)?;
                }
                ResolvedBinding::Expression(expression) => {
                    if index + 1 < count {
                        let item = self.new_work_item(
                            id,
                            WorkItemKind::ResolveNextArgument {
                                next_index: index + 1,
                                argument_overrides: argument_overrides.cloned().unwrap_or_default(),
                            },
                        );
                        self.state.scheduler.push(item);
                    }
                    let location = ResultLocation {
                        environment: own,
                        name: argument.name.clone(),
                    };
                    self.schedule_expression(*expression, id, scope, location)?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Resolve variable defaults. Expression defaults are all scheduled at once;
    /// returns `false` if any was.
    pub(crate) fn resolve_variables(&mut self, id: InstanceId) -> FaultResult<bool> {
        let (activity, own, _) = self.resolution_environments(id)?;
        let definition = Arc::clone(&self.definition);
        let node = definition.node(activity)?;
        let mut synchronous = true;

        for variable in &node.variables {
            match &variable.default {
                ResolvedBinding::Unbound => {}
                ResolvedBinding::Literal(value) => {
                    self.state
                        .environments
                        .assign(own, &variable.name, value.clone(), id)?;
                }
                ResolvedBinding::Variable(source) => {
                    let value = self
                        .state
                        .environments
                        .lookup(own, source)
                        .cloned()
                        .ok_or_else(|| ExecutorError::LocationNotFound {
                            instance: id,
                            name: source.clone(),
                        })?;
                    self.state
                        .environments
                        .assign(own, &variable.name, value, id)?;
                }
                ResolvedBinding::Expression(expression) => {
                    let location = ResultLocation {
                        environment: own,
                        name: variable.name.clone(),
                    };
                    self.schedule_expression(*expression, id, own, location)?;
                    synchronous = false;
                }
            }
        }
        Ok(synchronous)
    }

    /// Re-evaluate an instance after one of its work items ran.
    /// Returns `true` when the instance reached a terminal state.
    pub(crate) fn update_state(&mut self, id: InstanceId) -> FaultResult<bool> {
        let instance = self.state.tree.require(id)?;

        if instance.has_not_executed() {
            if instance.is_cancellation_requested() {
                let children = instance.children().to_vec();
                if !children.is_empty() {
                    for child in children {
                        self.schedule_cancel(child, true);
                    }
                    return Ok(false);
                }
                if instance.has_pending_work() {
                    return Ok(false);
                }
                self.state
                    .tree
                    .require_mut(id)?
                    .set_state(ActivityInstanceState::Canceled);
                return Ok(true);
            }
            if instance.has_pending_work() {
                return Ok(false);
            }
            if instance.initialization_incomplete {
                self.state
                    .tree
                    .require_mut(id)?
                    .set_state(ActivityInstanceState::Canceled);
                return Ok(true);
            }
            match instance.substate() {
                Substate::ResolvingArguments => {
                    self.state
                        .tree
                        .require_mut(id)?
                        .set_substate(Substate::ResolvingVariables);
                    if self.resolve_variables(id)? {
                        self.schedule_body(id);
                    }
                }
                Substate::ResolvingVariables => self.schedule_body(id),
                Substate::Executing | Substate::Canceling => {}
            }
            return Ok(false);
        }

        if !instance.has_pending_work() {
            if self.is_completing_transaction(id) {
                return Ok(false);
            }
            self.state.tree.require_mut(id)?.set_closed_or_canceled();
            return Ok(true);
        }

        if instance.performing_default_cancelation && instance.only_has_outstanding_bookmarks() {
            self.remove_all_bookmarks(id);
            let instance = self.state.tree.require_mut(id)?;
            instance.mark_canceled()?;
            instance.set_closed_or_canceled();
            return Ok(true);
        }
        Ok(false)
    }

    /// Close out an instance that reached a terminal state on its own.
    pub(crate) fn complete_activity_instance(&mut self, id: InstanceId) -> FaultResult {
        let state = self.state.tree.require(id)?.state();
        let mut failure = None;
        if state == ActivityInstanceState::Closed {
            if let Err(fault) = self.copy_out_arguments(id) {
                failure = Some(fault);
            }
            if let Err(fault) = self.write_result(id) {
                failure.get_or_insert(fault);
            }
            if self.state.root == Some(id) {
                self.state.root_outputs = self.gather_root_outputs(id);
            }
        }

        self.release_instance_resources(id);
        self.mark_as_complete(id);
        self.schedule_completion_bookmark(id);
        let info = self.info_or_placeholder(id);
        self.track(TrackingEvent::ActivityState { instance: info });
        debug!(instance = %id, state = %state, "activity instance completed");
        self.on_root_completed(id);

        failure.map_or(Ok(()), Err)
    }

    fn copy_out_arguments(&mut self, id: InstanceId) -> FaultResult {
        let instance = self.state.tree.require(id)?;
        let Some(parent) = instance.parent() else {
            return Ok(());
        };
        let own = instance.environment;
        let activity = instance.activity();
        let Some(scope) = self.state.tree.get(parent).map(|p| p.environment) else {
            return Ok(());
        };
        let definition = Arc::clone(&self.definition);
        for argument in &definition.node(activity)?.arguments {
            if argument.direction == ArgumentDirection::In {
                continue;
            }
            if let ResolvedBinding::Variable(target) = &argument.binding {
                let value = self
                    .state
                    .environments
                    .get(own)
                    .and_then(|env| env.local(&argument.name))
                    .cloned()
                    .unwrap_or(Value::Null);
                self.state.environments.assign(scope, target, value, id)?;
            }
        }
        Ok(())
    }

    fn write_result(&mut self, id: InstanceId) -> FaultResult {
        let instance = self.state.tree.require(id)?;
        let Some(location) = instance.result_location.clone() else {
            return Ok(());
        };
        let value = instance.result.clone().unwrap_or(Value::Null);
        self.state
            .environments
            .assign(location.environment, &location.name, value, id)?;
        Ok(())
    }

    fn gather_root_outputs(&self, id: InstanceId) -> BTreeMap<String, Value> {
        let mut outputs = BTreeMap::new();
        let Some(instance) = self.state.tree.get(id) else {
            return outputs;
        };
        if let Ok(node) = self.definition.node(instance.activity()) {
            let env = self.state.environments.get(instance.environment);
            for argument in node
                .arguments
                .iter()
                .filter(|a| a.direction != ArgumentDirection::In)
            {
                let value = env
                    .and_then(|env| env.local(&argument.name))
                    .cloned()
                    .unwrap_or(Value::Null);
                outputs.insert(argument.name.clone(), value);
            }
        }
        if let Some(result) = &instance.result {
            outputs.insert("Result".to_string(), result.clone());
        }
        outputs
    }

    /// Give back everything an instance holds: no-persist blocks, transaction handles,
    /// bookmark scopes and its environment reference.
    fn release_instance_resources(&mut self, id: InstanceId) {
        let Some(instance) = self.state.tree.get_mut(id) else {
            return;
        };
        let held = std::mem::take(&mut instance.no_persist_count);
        instance.active_operation = None;
        instance.operation_callback = None;
        instance.waiting_for_transaction = false;
        let environment = instance.environment;

        for _ in 0..held {
            self.exit_no_persist();
        }
        self.state
            .transaction_handles
            .retain(|_, handle| handle.owner != id);
        self.state.transaction_waiters.retain(|w| w.instance != id);
        self.state.persistence_waiters.retain(|w| w.instance != id);
        let dropped = self.state.scopes.unregister_owned_by(id);
        self.release_dropped_bookmarks(id, dropped);
        self.state.environments.release(environment);
    }

    /// Other owners lost bookmarks with a scope; fix their counts and let them re-evaluate.
    fn release_dropped_bookmarks(&mut self, completing: InstanceId, dropped: Vec<BookmarkRecord>) {
        let mut touched = BTreeSet::new();
        for record in dropped {
            if record.owner == completing || !record.is_blocking() {
                continue;
            }
            if let Some(owner) = self.state.tree.get_mut(record.owner) {
                owner.blocking_bookmarks = owner.blocking_bookmarks.saturating_sub(1);
                touched.insert(record.owner);
            }
        }
        for owner in touched {
            if self.is_executing(owner) {
                let item = self.new_work_item(owner, WorkItemKind::Empty);
                self.state.scheduler.enqueue(item);
            }
        }
    }

    pub(crate) fn remove_all_bookmarks(&mut self, id: InstanceId) {
        self.state.bookmarks.remove_owned_by(id);
        self.state.scopes.remove_bookmarks_owned_by(id);
        if let Some(instance) = self.state.tree.get_mut(id) {
            instance.blocking_bookmarks = 0;
        }
    }

    fn mark_as_complete(&mut self, id: InstanceId) {
        self.remove_all_bookmarks(id);
        self.state.main_root_complete.retain(|(owner, _)| *owner != id);
        let parent = self.state.tree.get(id).and_then(ActivityInstance::parent);
        if let Some(parent) = parent
            && let Some(parent) = self.state.tree.get_mut(parent)
        {
            parent.remove_child(id);
        }
    }

    fn schedule_completion_bookmark(&mut self, id: InstanceId) {
        let Some(instance) = self.state.tree.get(id) else {
            return;
        };
        let Some(parent) = instance.parent() else {
            return;
        };
        let completed = CompletedInstance {
            info: instance.info(),
            result: if instance.state() == ActivityInstanceState::Closed {
                instance.result.clone()
            } else {
                None
            },
        };
        let callback = instance.completion_callback.clone();
        if !self.is_executing(parent) {
            return;
        }
        let item = self.new_work_item(parent, WorkItemKind::Completion { callback, completed });
        self.state.scheduler.push(item);
    }

    /// Root and secondary-root bookkeeping once an instance without a parent completes.
    fn on_root_completed(&mut self, id: InstanceId) {
        let Some(state) = self.state.tree.get(id).map(ActivityInstance::state) else {
            return;
        };
        if self.state.root == Some(id) {
            self.state.root_state = Some(state);
            let waiters = std::mem::take(&mut self.state.main_root_complete);
            for (_, bookmark) in waiters {
                self.resume_internal(&bookmark, json!(state.as_str()));
            }
        } else if !self.state.secondary_roots.remove(&id) {
            return;
        }
        if self.state.root_state.is_some() && self.state.secondary_roots.is_empty() {
            self.complete_workflow();
        }
    }

    fn complete_workflow(&mut self) {
        if self.state.execution_state.is_some() {
            return;
        }
        let Some(state) = self.state.root_state else {
            return;
        };
        self.state.execution_state = Some(state);
        self.state.workflow_outputs = std::mem::take(&mut self.state.root_outputs);
        let event = match state {
            ActivityInstanceState::Closed => WorkflowInstanceEvent::Closed,
            ActivityInstanceState::Canceled => WorkflowInstanceEvent::Canceled,
            _ => WorkflowInstanceEvent::Faulted,
        };
        self.track(TrackingEvent::WorkflowInstance { state: event });
        info!(
            instance_id = %self.state.instance_id,
            state = %state,
            "Workflow completed"
        );
    }

    pub(super) fn activity_of(&self, id: InstanceId) -> Result<Arc<dyn Activity>> {
        let activity = self.state.tree.require(id)?.activity();
        Ok(Arc::clone(self.definition.activity(activity)?))
    }

    /// Tear down an instance and its executing descendants, children first.
    ///
    /// The top instance's parent is told through a completion item. The top instance
    /// itself stays in the arena until the work item holding it is disposed, so the
    /// fault can still be propagated from it.
    pub(crate) fn abort_activity_instance(&mut self, id: InstanceId, reason: &ActivityFault) {
        if !self.is_executing(id) {
            return;
        }
        for current in self.state.tree.post_order(id) {
            if !self.is_executing(current) {
                continue;
            }
            self.terminate_special_execution_blocks(current, reason);
            let info = self.info_or_placeholder(current);
            if let Ok(activity) = self.activity_of(current) {
                activity.abort(&info, reason);
            }
            if let Some(instance) = self.state.tree.get_mut(current) {
                instance.set_state(ActivityInstanceState::Faulted);
            }
            self.release_instance_resources(current);
            self.mark_as_complete(current);
            let info = self.info_or_placeholder(current);
            self.track(TrackingEvent::ActivityState { instance: info });
            if current != id {
                self.sweep(current);
            }
        }
        debug!(instance = %id, reason = %reason, "activity instance aborted");
        self.schedule_completion_bookmark(id);
        self.on_root_completed(id);
    }

    pub(crate) fn schedule_cancel(&mut self, id: InstanceId, push: bool) {
        let eligible = self
            .state
            .tree
            .get(id)
            .is_some_and(|i| !i.is_completed() && !i.is_cancellation_requested());
        if !eligible {
            return;
        }
        let item = self.new_work_item(id, WorkItemKind::Cancel);
        if push {
            self.state.scheduler.push(item);
        } else {
            self.state.scheduler.enqueue(item);
        }
    }

    /// Body of a cancel work item.
    pub(crate) fn cancel_instance(&mut self, id: InstanceId) -> FaultResult {
        let instance = self.state.tree.require_mut(id)?;
        if instance.is_cancellation_requested() {
            return Ok(());
        }
        instance.request_cancellation();
        let has_not_executed = instance.has_not_executed();
        let info = instance.info();
        self.track(TrackingEvent::CancelRequested { instance: info });
        debug!(instance = %id, "cancellation requested");
        if has_not_executed {
            return Ok(());
        }
        self.invoke(id, |activity, ctx| activity.cancel(ctx))
    }

    pub(crate) fn default_cancel(&mut self, id: InstanceId) {
        let children = match self.state.tree.get_mut(id) {
            Some(instance) => {
                instance.performing_default_cancelation = true;
                instance.children().to_vec()
            }
            None => return,
        };
        for child in children {
            self.schedule_cancel(child, true);
        }
    }
}
