// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity instances and the instance arena.
//!
//! The tree is stored flat: [`InstanceTree`] maps monotonic [`InstanceId`]s to
//! [`ActivityInstance`] records. A parent owns the ordered list of its children's ids,
//! and a child only keeps its parent's id, so walking towards the root is a chain of
//! map lookups and there are no reference cycles to break on teardown.
//!
//! Ids are never reused. A completed instance stays in the arena until its busy count
//! drops to zero, which is what lets a work item that is still queued for it be
//! released and disposed normally.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::ActivityId;
use crate::environment::EnvironmentId;
use crate::error::{ExecutorError, Result};

/// Identifier of an activity instance, unique for the lifetime of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public state of an activity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityInstanceState {
    /// Still running.
    Executing,
    /// Completed successfully.
    Closed,
    /// Completed because of a cancellation.
    Canceled,
    /// Completed because of a fault or an abort.
    Faulted,
}

impl ActivityInstanceState {
    /// Returns the string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executing => "executing",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Faulted => "faulted",
        }
    }

    /// Whether this is a terminal state.
    pub fn is_completed(&self) -> bool {
        !matches!(self, Self::Executing)
    }
}

impl fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained progress of an executing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substate {
    /// Arguments are being resolved (possibly waiting on expressions).
    ResolvingArguments,
    /// Variables are being resolved (possibly waiting on expressions).
    ResolvingVariables,
    /// The body has been scheduled or is running.
    Executing,
    /// The activity acknowledged cancellation; it will end `Canceled`.
    Canceling,
}

/// Where an expression writes its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultLocation {
    /// Environment that declares the location.
    pub environment: EnvironmentId,
    /// Location name.
    pub name: String,
}

/// Lightweight, serializable reference to an instance for fault contexts and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance id.
    pub id: InstanceId,
    /// Activity id in the definition.
    pub activity: ActivityId,
    /// Activity display name.
    pub display_name: String,
    /// State when the reference was taken.
    pub state: ActivityInstanceState,
}

/// A child instance as seen by its parent's completion callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedInstance {
    /// The child.
    pub info: InstanceInfo,
    /// Value set with `ActivityContext::set_result` (only meaningful when `Closed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CompletedInstance {
    /// Final state of the child.
    pub fn state(&self) -> ActivityInstanceState {
        self.info.state
    }
}

/// One execution of one activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInstance {
    id: InstanceId,
    activity: ActivityId,
    display_name: String,
    parent: Option<InstanceId>,
    children: Vec<InstanceId>,
    state: ActivityInstanceState,
    substate: Substate,
    has_not_executed: bool,
    pub(crate) environment: EnvironmentId,
    pub(crate) completion_callback: Option<String>,
    pub(crate) fault_callback: Option<String>,
    pub(crate) result_location: Option<ResultLocation>,
    is_cancellation_requested: bool,
    pub(crate) performing_default_cancelation: bool,
    pub(crate) initialization_incomplete: bool,
    busy_count: u32,
    pub(crate) blocking_bookmarks: u32,
    pub(crate) no_persist_count: u32,
    pub(crate) waiting_for_transaction: bool,
    pub(crate) active_operation: Option<uuid::Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) operation_callback: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) private_state: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) result: Option<Value>,
}

impl ActivityInstance {
    pub(crate) fn new(
        id: InstanceId,
        activity: ActivityId,
        display_name: String,
        parent: Option<InstanceId>,
        environment: EnvironmentId,
    ) -> Self {
        Self {
            id,
            activity,
            display_name,
            parent,
            children: Vec::new(),
            state: ActivityInstanceState::Executing,
            substate: Substate::ResolvingArguments,
            has_not_executed: true,
            environment,
            completion_callback: None,
            fault_callback: None,
            result_location: None,
            is_cancellation_requested: false,
            performing_default_cancelation: false,
            initialization_incomplete: false,
            busy_count: 0,
            blocking_bookmarks: 0,
            no_persist_count: 0,
            waiting_for_transaction: false,
            active_operation: None,
            operation_callback: None,
            private_state: BTreeMap::new(),
            properties: BTreeMap::new(),
            result: None,
        }
    }

    /// Instance id.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Activity this instance executes.
    pub fn activity(&self) -> ActivityId {
        self.activity
    }

    /// Activity display name.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Parent instance, `None` for the root and secondary roots.
    pub fn parent(&self) -> Option<InstanceId> {
        self.parent
    }

    /// Executing children in scheduling order.
    pub fn children(&self) -> &[InstanceId] {
        &self.children
    }

    /// Public state.
    pub fn state(&self) -> ActivityInstanceState {
        self.state
    }

    /// Substate.
    pub fn substate(&self) -> Substate {
        self.substate
    }

    /// Whether the instance reached a terminal state.
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Whether the body has not run yet.
    pub fn has_not_executed(&self) -> bool {
        self.has_not_executed
    }

    /// Whether cancellation was requested.
    pub fn is_cancellation_requested(&self) -> bool {
        self.is_cancellation_requested
    }

    /// Outstanding work items referencing this instance.
    pub fn busy_count(&self) -> u32 {
        self.busy_count
    }

    /// Blocking bookmarks owned by this instance.
    pub fn blocking_bookmarks(&self) -> u32 {
        self.blocking_bookmarks
    }

    /// Snapshot reference to this instance.
    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            id: self.id,
            activity: self.activity,
            display_name: self.display_name.clone(),
            state: self.state,
        }
    }

    /// Whether anything still keeps the instance from completing.
    pub fn has_pending_work(&self) -> bool {
        !self.children.is_empty()
            || self.busy_count > 0
            || self.blocking_bookmarks > 0
            || self.waiting_for_transaction
            || self.active_operation.is_some()
    }

    pub(crate) fn only_has_outstanding_bookmarks(&self) -> bool {
        self.children.is_empty()
            && self.busy_count == 0
            && self.blocking_bookmarks > 0
            && !self.waiting_for_transaction
            && self.active_operation.is_none()
    }

    pub(crate) fn increment_busy(&mut self) {
        self.busy_count += 1;
    }

    pub(crate) fn decrement_busy(&mut self) {
        debug_assert!(self.busy_count > 0, "busy count underflow on {}", self.id);
        self.busy_count = self.busy_count.saturating_sub(1);
    }

    pub(crate) fn add_child(&mut self, child: InstanceId) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: InstanceId) {
        self.children.retain(|c| *c != child);
    }

    pub(crate) fn set_substate(&mut self, substate: Substate) {
        self.substate = substate;
    }

    pub(crate) fn mark_executed(&mut self) {
        self.has_not_executed = false;
        self.substate = Substate::Executing;
    }

    pub(crate) fn request_cancellation(&mut self) {
        self.is_cancellation_requested = true;
    }

    /// Acknowledge cancellation. Only legal once cancellation was requested.
    pub(crate) fn mark_canceled(&mut self) -> Result<()> {
        if !self.is_cancellation_requested {
            return Err(ExecutorError::InvalidOperation(format!(
                "instance {} cannot be marked canceled without a cancellation request",
                self.id
            )));
        }
        self.substate = Substate::Canceling;
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: ActivityInstanceState) {
        self.state = state;
    }

    pub(crate) fn set_closed_or_canceled(&mut self) {
        self.state = if self.substate == Substate::Canceling {
            ActivityInstanceState::Canceled
        } else {
            ActivityInstanceState::Closed
        };
    }
}

/// Arena of activity instances keyed by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceTree {
    next_id: u64,
    instances: BTreeMap<InstanceId, ActivityInstance>,
}

impl InstanceTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next id. Ids start at 1 and are never handed out twice.
    pub(crate) fn allocate_id(&mut self) -> Result<InstanceId> {
        self.next_id = self
            .next_id
            .checked_add(1)
            .ok_or(ExecutorError::OutOfInstanceIds)?;
        Ok(InstanceId(self.next_id))
    }

    pub(crate) fn insert(&mut self, instance: ActivityInstance) {
        if let Some(parent) = instance.parent
            && let Some(parent) = self.instances.get_mut(&parent)
        {
            parent.add_child(instance.id);
        }
        self.instances.insert(instance.id, instance);
    }

    /// Look up an instance.
    pub fn get(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.instances.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InstanceId) -> Option<&mut ActivityInstance> {
        self.instances.get_mut(&id)
    }

    /// Look up an instance, failing with `InstanceNotFound`.
    pub fn require(&self, id: InstanceId) -> Result<&ActivityInstance> {
        self.instances
            .get(&id)
            .ok_or(ExecutorError::InstanceNotFound { instance: id })
    }

    pub(crate) fn require_mut(&mut self, id: InstanceId) -> Result<&mut ActivityInstance> {
        self.instances
            .get_mut(&id)
            .ok_or(ExecutorError::InstanceNotFound { instance: id })
    }

    pub(crate) fn remove(&mut self, id: InstanceId) -> Option<ActivityInstance> {
        self.instances.remove(&id)
    }

    /// Number of instances held (completed-but-busy ones included).
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the arena is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All instances in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.instances.values()
    }

    /// Whether `id` is `ancestor` or lies below it.
    pub fn is_in_subtree(&self, id: InstanceId, ancestor: InstanceId) -> bool {
        let mut current = Some(id);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return true;
            }
            current = self.instances.get(&candidate).and_then(|i| i.parent);
        }
        false
    }

    /// Ids of `id` and all its executing descendants, children before parents.
    pub(crate) fn post_order(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut out = Vec::new();
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                out.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(instance) = self.instances.get(&current) {
                for child in instance.children.iter().rev() {
                    stack.push((*child, false));
                }
            }
        }
        out
    }
}
