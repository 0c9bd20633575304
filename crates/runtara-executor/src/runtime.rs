// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable workflow runtime.
//!
//! [`WorkflowRuntime`] holds what every workflow instance shares (store, tracking
//! participants, extensions, configuration). [`WorkflowInstance`] drives one
//! [`ActivityExecutor`] on the caller's tokio runtime: it runs drain cycles, yields
//! between them, performs the I/O a suspended work item asks for and feeds the result
//! back, and applies the unhandled-exception policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_executor::runtime::{RunOutcome, WorkflowRuntime};
//! use runtara_executor::persistence::InMemoryInstanceStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = WorkflowRuntime::builder()
//!         .store(Arc::new(InMemoryInstanceStore::new()))
//!         .build()?;
//!
//!     let definition = Arc::new(WorkflowDefinition::new(my_root_activity())?);
//!     let mut instance = runtime.create(definition, Default::default())?;
//!     match instance.run().await? {
//!         RunOutcome::Completed(state) => println!("finished {state}"),
//!         RunOutcome::Idle => { /* waiting on bookmarks */ }
//!         other => println!("{other:?}"),
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::activity::WorkflowDefinition;
use crate::bookmark::{Bookmark, BookmarkInfo, BookmarkResumptionResult, BookmarkScope};
use crate::config::{ExecutorConfig, UnhandledExceptionAction};
use crate::error::{ActivityFault, ExecutorError, Result};
use crate::executor::{
    ActivityExecutor, DrainOutcome, ExecutorServices, OperationOutcome, PendingOperation,
};
use crate::extensions::Extensions;
use crate::instance::{ActivityInstanceState, InstanceInfo};
use crate::operation::OperationCompletion;
use crate::persistence::{InstanceStore, PersistedImage};
use crate::tracking::{TrackingParticipant, TrackingProfile, TrackingRecord};

/// Host callbacks for instance lifecycle events. All methods default to no-ops.
pub trait InstanceListener: Send + Sync {
    /// The workflow completed.
    fn on_completed(&self, _instance_id: Uuid, _state: ActivityInstanceState) {}

    /// A fault escaped every handler; the configured policy is applied afterwards.
    fn on_unhandled_exception(&self, _instance_id: Uuid, _fault: &ActivityFault, _source: &InstanceInfo) {}

    /// The workflow instance was aborted.
    fn on_aborted(&self, _instance_id: Uuid, _reason: &ActivityFault) {}

    /// Nothing left to run until a bookmark is resumed.
    fn on_idle(&self, _instance_id: Uuid, _bookmarks: &[BookmarkInfo]) {}
}

/// Builder for creating a [`WorkflowRuntime`].
#[derive(Default)]
pub struct WorkflowRuntimeBuilder {
    store: Option<Arc<dyn InstanceStore>>,
    participants: Vec<Arc<dyn TrackingParticipant>>,
    tracking_profile: Option<TrackingProfile>,
    extensions: Extensions,
    listener: Option<Arc<dyn InstanceListener>>,
    config: Option<ExecutorConfig>,
}

impl std::fmt::Debug for WorkflowRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("participants", &self.participants.len())
            .field("extensions", &self.extensions.len())
            .field("listener", &self.listener.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable store for images and correlation keys. Without one, persist requests
    /// succeed without writing anything.
    pub fn store(mut self, store: Arc<dyn InstanceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Add a tracking participant. Tracking is on once at least one is registered.
    pub fn tracking_participant(mut self, participant: Arc<dyn TrackingParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Restrict which records are produced.
    ///
    /// Default: [`TrackingProfile::all`]
    pub fn tracking_profile(mut self, profile: TrackingProfile) -> Self {
        self.tracking_profile = Some(profile);
        self
    }

    /// Register a host service reachable from activities.
    pub fn extension<T: Send + Sync + 'static>(mut self, service: Arc<T>) -> Self {
        self.extensions.insert(service);
        self
    }

    /// Lifecycle listener.
    pub fn listener(mut self, listener: Arc<dyn InstanceListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Executor configuration.
    ///
    /// Default: [`ExecutorConfig::default`]
    pub fn config(mut self, config: ExecutorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> anyhow::Result<WorkflowRuntime> {
        let config = self.config.unwrap_or_default();
        if config.max_work_items_per_cycle == 0 {
            anyhow::bail!("max_work_items_per_cycle must be greater than zero");
        }
        if config.transaction_timeout.is_zero() {
            anyhow::bail!("transaction_timeout must be greater than zero");
        }

        let mut services =
            ExecutorServices::new(config).with_extensions(Arc::new(self.extensions));
        if !self.participants.is_empty() {
            services = services.with_tracking(self.tracking_profile.unwrap_or_else(TrackingProfile::all));
        }

        Ok(WorkflowRuntime {
            shared: Arc::new(RuntimeShared {
                store: self.store,
                participants: self.participants,
                services,
                listener: self.listener,
            }),
        })
    }
}

struct RuntimeShared {
    store: Option<Arc<dyn InstanceStore>>,
    participants: Vec<Arc<dyn TrackingParticipant>>,
    services: ExecutorServices,
    listener: Option<Arc<dyn InstanceListener>>,
}

/// Shared services for workflow instances. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowRuntime {
    shared: Arc<RuntimeShared>,
}

impl std::fmt::Debug for WorkflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRuntime")
            .field("store", &self.shared.store.as_ref().map(|_| "..."))
            .field("participants", &self.shared.participants.len())
            .field("config", &self.shared.services.config)
            .finish()
    }
}

impl WorkflowRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> WorkflowRuntimeBuilder {
        WorkflowRuntimeBuilder::new()
    }

    /// Executor configuration.
    pub fn config(&self) -> &ExecutorConfig {
        &self.shared.services.config
    }

    /// The instance store, if any.
    pub fn store(&self) -> Option<&Arc<dyn InstanceStore>> {
        self.shared.store.as_ref()
    }

    /// Start a new workflow instance. Nothing runs until [`WorkflowInstance::run`].
    pub fn create(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: BTreeMap<String, Value>,
    ) -> Result<WorkflowInstance> {
        let mut executor =
            ActivityExecutor::new(Uuid::new_v4(), definition, self.shared.services.clone());
        executor.schedule_root(inputs)?;
        WorkflowInstance::new(executor, self.clone())
    }

    /// Load a persisted workflow instance from the store.
    pub async fn load(
        &self,
        instance_id: Uuid,
        definition: Arc<WorkflowDefinition>,
    ) -> Result<WorkflowInstance> {
        let store = self.shared.store.as_ref().ok_or_else(|| {
            ExecutorError::InvalidOperation("no instance store configured".to_string())
        })?;
        let image = store.load(instance_id).await?.ok_or_else(|| {
            ExecutorError::InvalidOperation(format!("no image stored for instance {}", instance_id))
        })?;
        self.restore(&image, definition)
    }

    /// Rebuild a workflow instance from an image.
    pub fn restore(
        &self,
        image: &PersistedImage,
        definition: Arc<WorkflowDefinition>,
    ) -> Result<WorkflowInstance> {
        let snapshot = image.to_snapshot()?;
        let executor =
            ActivityExecutor::from_snapshot(snapshot, definition, self.shared.services.clone())?;
        WorkflowInstance::new(executor, self.clone())
    }
}

/// Why [`WorkflowInstance::run`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The workflow completed in this state.
    Completed(ActivityInstanceState),
    /// Waiting for bookmarks to be resumed.
    Idle,
    /// Paused at a persistable point.
    Paused,
    /// Aborted; the instance cannot continue.
    Aborted(ActivityFault),
}

/// One running workflow instance.
pub struct WorkflowInstance {
    executor: ActivityExecutor,
    runtime: WorkflowRuntime,
    operations: mpsc::UnboundedReceiver<OperationCompletion>,
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("executor", &self.executor)
            .finish()
    }
}

impl WorkflowInstance {
    fn new(mut executor: ActivityExecutor, runtime: WorkflowRuntime) -> Result<Self> {
        let operations = executor.take_operation_receiver().ok_or_else(|| {
            ExecutorError::InvalidOperation("executor is already driven by another host".to_string())
        })?;
        Ok(Self {
            executor,
            runtime,
            operations,
        })
    }

    /// Workflow instance id.
    pub fn id(&self) -> Uuid {
        self.executor.instance_id()
    }

    /// The underlying executor.
    pub fn executor(&self) -> &ActivityExecutor {
        &self.executor
    }

    /// Named bookmarks, all of them or those of one scope.
    pub fn bookmarks(&self, scope: Option<BookmarkScope>) -> Vec<BookmarkInfo> {
        self.executor.bookmarks(scope)
    }

    /// Run until the workflow completes, goes idle, pauses or aborts.
    ///
    /// While an async operation is outstanding the instance is not idle; `run` waits
    /// for its completion. A handle dropped without an outcome completes it with a fault.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let instance_id = self.id();
        loop {
            self.apply_operation_completions();
            let mut outcome = self.executor.drain_cycle();
            while let DrainOutcome::Suspended(operation) = outcome {
                let result = self.perform(operation).await;
                outcome = self.executor.complete_pending_operation(result)?;
            }
            match outcome {
                DrainOutcome::Suspended(_) | DrainOutcome::Yielded => {
                    tokio::task::yield_now().await;
                }
                DrainOutcome::Idle => {
                    if let Some(state) = self.executor.execution_state() {
                        return self.on_completed(state).await;
                    }
                    if self.executor.has_active_operations() {
                        debug!(instance_id = %instance_id, "waiting for async operation");
                        if let Some(completion) = self.operations.recv().await {
                            self.apply_completion(completion);
                        }
                        continue;
                    }
                    if let Some(listener) = &self.runtime.shared.listener {
                        listener.on_idle(instance_id, &self.executor.bookmarks(None));
                    }
                    return Ok(RunOutcome::Idle);
                }
                DrainOutcome::Paused => {
                    info!(instance_id = %instance_id, "Workflow instance paused");
                    return Ok(RunOutcome::Paused);
                }
                DrainOutcome::UnhandledException { exception, source } => {
                    self.apply_unhandled_policy(exception, source)?;
                }
                DrainOutcome::AbortRequested(reason) => {
                    if let Some(listener) = &self.runtime.shared.listener {
                        listener.on_aborted(instance_id, &reason);
                    }
                    return Ok(RunOutcome::Aborted(reason));
                }
                DrainOutcome::Busy => return Err(ExecutorError::Busy),
            }
        }
    }

    fn apply_operation_completions(&mut self) {
        while let Ok(completion) = self.operations.try_recv() {
            self.apply_completion(completion);
        }
    }

    fn apply_completion(&mut self, completion: OperationCompletion) {
        if let Err(e) = self.executor.complete_operation(completion) {
            debug!(instance_id = %self.id(), error = %e, "async operation completion dropped");
        }
    }

    fn apply_unhandled_policy(&mut self, exception: ActivityFault, source: InstanceInfo) -> Result<()> {
        let action = self.runtime.config().unhandled_exception_action;
        if let Some(listener) = &self.runtime.shared.listener {
            listener.on_unhandled_exception(self.id(), &exception, &source);
        }
        info!(
            instance_id = %self.id(),
            action = action.as_str(),
            source = %source.display_name,
            "Applying unhandled exception policy"
        );
        match action {
            UnhandledExceptionAction::Terminate => self.executor.terminate(exception),
            UnhandledExceptionAction::Cancel => self.executor.cancel_root()?,
            UnhandledExceptionAction::Abort => self.executor.abort(exception),
        }
        Ok(())
    }

    async fn on_completed(&mut self, state: ActivityInstanceState) -> Result<RunOutcome> {
        if let Some(store) = &self.runtime.shared.store {
            let image = self.executor.persist_image()?;
            store.save(&image).await?;
        }
        if let Some(listener) = &self.runtime.shared.listener {
            listener.on_completed(self.id(), state);
        }
        Ok(RunOutcome::Completed(state))
    }

    /// Perform the I/O a suspended work item waits for.
    async fn perform(&self, operation: PendingOperation) -> OperationOutcome {
        let store = self.runtime.shared.store.as_deref();
        match operation {
            PendingOperation::Persist(image) => {
                let result = match store {
                    Some(store) => store.save(&image).await.map_err(ActivityFault::from),
                    None => Ok(()),
                };
                OperationOutcome::Persisted(result)
            }
            PendingOperation::CompleteTransaction(completion) => {
                OperationOutcome::TransactionCompleted(completion.run(store).await)
            }
            PendingOperation::UpdateKeys {
                instance_id,
                associate,
                disassociate,
            } => {
                let result = match store {
                    Some(store) => update_keys(store, instance_id, &associate, &disassociate).await,
                    None => Ok(()),
                };
                OperationOutcome::KeysUpdated(result)
            }
            PendingOperation::Track(records) => {
                OperationOutcome::Tracked(self.deliver_tracking(&records).await)
            }
        }
    }

    /// Each participant gets the batch in order; participants run concurrently.
    async fn deliver_tracking(&self, records: &[TrackingRecord]) -> std::result::Result<(), ActivityFault> {
        let participants = &self.runtime.shared.participants;
        let results = join_all(participants.iter().map(|p| p.track(records))).await;
        let mut first_error = None;
        for (participant, result) in participants.iter().zip(results) {
            if let Err(e) = result {
                warn!(
                    instance_id = %self.id(),
                    participant = participant.name(),
                    error = %e,
                    "tracking participant failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Resume a bookmark in the default scope. Call [`run`](Self::run) afterwards.
    pub fn resume_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        self.executor.try_resume_bookmark(bookmark, value)
    }

    /// Resume a bookmark in a scope. Call [`run`](Self::run) afterwards.
    pub fn resume_bookmark_in_scope(
        &mut self,
        bookmark: &Bookmark,
        scope: BookmarkScope,
        value: Value,
    ) -> BookmarkResumptionResult {
        self.executor
            .try_resume_bookmark_in_scope(bookmark, scope, value)
    }

    /// Request cancellation of the workflow. Call [`run`](Self::run) afterwards.
    pub fn cancel(&mut self) -> Result<()> {
        self.executor.cancel_root()
    }

    /// Terminate the workflow with `reason`.
    pub fn terminate(&mut self, reason: ActivityFault) {
        self.executor.terminate(reason);
    }

    /// Abort the workflow instance.
    pub fn abort(&mut self, reason: ActivityFault) {
        self.executor.abort(reason);
    }

    /// Pause at the next persistable point.
    pub fn pause_when_persistable(&mut self) {
        self.executor.pause_when_persistable();
    }

    /// Save an image to the store and return it.
    pub async fn persist(&self) -> Result<PersistedImage> {
        let image = self.executor.persist_image()?;
        if let Some(store) = &self.runtime.shared.store {
            store.save(&image).await?;
        }
        info!(instance_id = %self.id(), status = image.status.as_str(), "Workflow instance persisted");
        Ok(image)
    }
}

async fn update_keys(
    store: &dyn InstanceStore,
    instance_id: Uuid,
    associate: &[Uuid],
    disassociate: &[Uuid],
) -> std::result::Result<(), ActivityFault> {
    if !associate.is_empty() {
        store.associate_keys(instance_id, associate).await?;
    }
    if !disassociate.is_empty() {
        store.disassociate_keys(disassociate).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryInstanceStore;
    use crate::tracking::MemoryTrackingParticipant;
    use std::time::Duration;

    #[derive(Debug)]
    struct Noop;

    impl crate::activity::Activity for Noop {
        fn display_name(&self) -> &str {
            "noop"
        }

        fn execute(
            &self,
            _ctx: &mut crate::context::ActivityContext<'_>,
        ) -> std::result::Result<(), ActivityFault> {
            Ok(())
        }
    }

    #[test]
    fn test_builder_default() {
        let builder = WorkflowRuntimeBuilder::default();
        assert!(builder.store.is_none());
        assert!(builder.participants.is_empty());
        assert!(builder.config.is_none());
    }

    #[test]
    fn test_builder_store() {
        let builder = WorkflowRuntimeBuilder::new().store(Arc::new(InMemoryInstanceStore::new()));
        assert!(builder.store.is_some());
    }

    #[test]
    fn test_builder_tracking_enables_services() {
        let runtime = WorkflowRuntime::builder()
            .tracking_participant(Arc::new(MemoryTrackingParticipant::new()))
            .build()
            .unwrap();
        assert!(runtime.shared.services.tracking_enabled);

        let runtime = WorkflowRuntime::builder().build().unwrap();
        assert!(!runtime.shared.services.tracking_enabled);
    }

    #[test]
    fn test_builder_rejects_zero_batch() {
        let config = ExecutorConfig {
            max_work_items_per_cycle: 0,
            ..ExecutorConfig::default()
        };
        let err = WorkflowRuntime::builder().config(config).build().unwrap_err();
        assert!(err.to_string().contains("max_work_items_per_cycle"));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let config = ExecutorConfig {
            transaction_timeout: Duration::ZERO,
            ..ExecutorConfig::default()
        };
        assert!(WorkflowRuntime::builder().config(config).build().is_err());
    }

    #[test]
    fn test_builder_debug() {
        let builder = WorkflowRuntimeBuilder::new().store(Arc::new(InMemoryInstanceStore::new()));
        let debug_str = format!("{:?}", builder);
        assert!(debug_str.contains("WorkflowRuntimeBuilder"));
        // store is shown as "..." to avoid leaking details
        assert!(debug_str.contains("..."));
    }

    #[tokio::test]
    async fn test_load_without_store_fails() {
        let runtime = WorkflowRuntime::builder().build().unwrap();
        let definition = Arc::new(
            WorkflowDefinition::new(Arc::new(Noop)).unwrap(),
        );
        let err = runtime.load(Uuid::new_v4(), definition).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidOperation(_)));
    }
}
