// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Images, no-persist blocks and persist requests.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ActivityExecutor, ExecutorServices, PendingOperation, PersistenceWaiter};
use crate::activity::WorkflowDefinition;
use crate::bookmark::{Bookmark, BookmarkOptions, BookmarkRecord};
use crate::error::{ExecutorError, Result};
use crate::instance::InstanceId;
use crate::operation::AsyncOperationHandle;
use crate::persistence::PersistedImage;
use crate::snapshot::{ExecutorSnapshot, SNAPSHOT_FORMAT_VERSION};
use crate::tracking::{TrackingEvent, WorkflowInstanceEvent};
use crate::work_item::WorkItem;

impl ActivityExecutor {
    /// Snapshot of the whole instance. Fails while an operation is outstanding, after
    /// an abort, or inside a no-persist block.
    pub fn prepare_for_serialization(&self) -> Result<ExecutorSnapshot> {
        if self.in_flight.is_some() || self.state.scheduler.is_suspended() {
            return Err(ExecutorError::Busy);
        }
        if self.abort_reason.is_some() {
            return Err(ExecutorError::InvalidOperation(
                "an aborted workflow instance cannot be persisted".to_string(),
            ));
        }
        if !self.is_persistable() {
            return Err(ExecutorError::NotPersistable {
                count: self.state.no_persist_count,
            });
        }
        Ok(ExecutorSnapshot::new(
            self.definition.identity().to_string(),
            self.state.clone(),
        ))
    }

    /// [`prepare_for_serialization`](Self::prepare_for_serialization) wrapped for a store.
    pub fn persist_image(&self) -> Result<PersistedImage> {
        PersistedImage::from_snapshot(&self.prepare_for_serialization()?)
    }

    /// Rebuild an executor from a snapshot of the same definition.
    pub fn from_snapshot(
        snapshot: ExecutorSnapshot,
        definition: Arc<WorkflowDefinition>,
        services: ExecutorServices,
    ) -> Result<Self> {
        if snapshot.format_version() != SNAPSHOT_FORMAT_VERSION {
            return Err(ExecutorError::InvalidOperation(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version()
            )));
        }
        if snapshot.definition_identity() != definition.identity() {
            return Err(ExecutorError::DefinitionMismatch {
                expected: snapshot.definition_identity().to_string(),
                found: definition.identity().to_string(),
            });
        }
        let mut executor = Self::with_state(snapshot.into_state(), definition, services);
        executor.track(TrackingEvent::WorkflowInstance {
            state: WorkflowInstanceEvent::Resumed,
        });
        info!(
            instance_id = %executor.state.instance_id,
            instances = executor.state.tree.len(),
            queued = executor.state.scheduler.len(),
            "Workflow instance restored"
        );
        Ok(executor)
    }

    /// Image of the current state. `requeue` is put back at the head of the queue of
    /// the copy so the restored instance runs it again.
    pub(super) fn capture_image(&self, requeue: Option<&WorkItem>) -> Result<PersistedImage> {
        let mut state = self.state.clone();
        if let Some(item) = requeue {
            if let Some(instance) = state.tree.get_mut(item.instance()) {
                instance.increment_busy();
            }
            state.scheduler.push(item.detached_copy());
        }
        let snapshot = ExecutorSnapshot::new(self.definition.identity().to_string(), state);
        PersistedImage::from_snapshot(&snapshot)
    }

    /// Pause the drain loop as soon as the instance becomes persistable.
    pub fn pause_when_persistable(&mut self) {
        if self.is_persistable() {
            self.state.scheduler.request_pause();
        } else {
            self.pause_when_persistable = true;
        }
    }

    /// Ask for an image to be saved once the instance is persistable. `callback` runs
    /// on `owner` after the save.
    pub(crate) fn request_persist(&mut self, owner: InstanceId, callback: Option<&str>) -> Result<Bookmark> {
        let instance = self.state.tree.require_mut(owner)?;
        instance.blocking_bookmarks += 1;
        let bookmark = self.state.bookmarks.create_anonymous(BookmarkRecord {
            owner,
            callback: callback.map(str::to_string),
            options: BookmarkOptions::NONE,
        });
        self.state.persistence_waiters.push_back(PersistenceWaiter {
            instance: owner,
            bookmark: bookmark.clone(),
        });
        debug!(instance = %owner, bookmark = %bookmark, "persist requested");
        Ok(bookmark)
    }

    /// Execute step of a persist item: resume the requester, then hand out the image.
    pub(super) fn begin_persist(
        &mut self,
        item: &mut WorkItem,
        bookmark: &Bookmark,
    ) -> Option<PendingOperation> {
        self.resume_internal(bookmark, Value::Null);
        match self.capture_image(None) {
            Ok(image) => Some(PendingOperation::Persist(image)),
            Err(e) => {
                item.exception_to_propagate = Some(e.into());
                None
            }
        }
    }

    pub(crate) fn enter_instance_no_persist(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.state.tree.require_mut(id)?;
        instance.no_persist_count += 1;
        self.enter_no_persist();
        Ok(())
    }

    pub(crate) fn exit_instance_no_persist(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.state.tree.require_mut(id)?;
        if instance.no_persist_count == 0 {
            return Err(ExecutorError::InvalidOperation(format!(
                "instance {} has no no-persist block to exit",
                id
            )));
        }
        instance.no_persist_count -= 1;
        self.exit_no_persist();
        Ok(())
    }

    /// Start an async operation on `owner`. The instance stays in a no-persist block
    /// until the completion is applied.
    pub(crate) fn begin_async_operation(
        &mut self,
        owner: InstanceId,
        callback: Option<&str>,
    ) -> Result<AsyncOperationHandle> {
        let instance = self.state.tree.require_mut(owner)?;
        if instance.active_operation.is_some() {
            return Err(ExecutorError::AsyncOperationAlreadyActive { instance: owner });
        }
        let operation = Uuid::new_v4();
        instance.active_operation = Some(operation);
        instance.operation_callback = callback.map(str::to_string);
        self.enter_instance_no_persist(owner)?;
        debug!(instance = %owner, operation = %operation, "async operation started");
        Ok(AsyncOperationHandle::new(
            owner,
            operation,
            self.operations_tx.clone(),
        ))
    }
}
