// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serializable image of an executor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::ExecutorState;
use crate::instance::ActivityInstanceState;

/// Current snapshot layout version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Everything needed to resume a workflow instance in another process.
///
/// Produced by `ActivityExecutor::prepare_for_serialization` and consumed by
/// `ActivityExecutor::from_snapshot`. Only the header is inspectable; the state is
/// opaque outside the crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    format_version: u32,
    definition_identity: String,
    state: ExecutorState,
}

impl ExecutorSnapshot {
    pub(crate) fn new(definition_identity: String, state: ExecutorState) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            definition_identity,
            state,
        }
    }

    /// Layout version the snapshot was written with.
    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Workflow instance id.
    pub fn instance_id(&self) -> Uuid {
        self.state.instance_id()
    }

    /// Identity of the definition the snapshot belongs to.
    pub fn definition_identity(&self) -> &str {
        &self.definition_identity
    }

    /// Final workflow state, `None` while running.
    pub fn execution_state(&self) -> Option<ActivityInstanceState> {
        self.state.execution_state()
    }

    /// Number of live activity instances.
    pub fn instance_count(&self) -> usize {
        self.state.instance_count()
    }

    /// Number of queued work items.
    pub fn queued_work_items(&self) -> usize {
        self.state.queued_work_items()
    }

    /// Names of the named bookmarks in the default scope.
    pub fn bookmark_names(&self) -> Vec<String> {
        self.state.bookmark_names()
    }

    pub(crate) fn into_state(self) -> ExecutorState {
        self.state
    }
}
