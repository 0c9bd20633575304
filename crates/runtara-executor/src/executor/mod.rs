// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The activity executor.
//!
//! One [`ActivityExecutor`] runs one workflow instance. It owns the instance tree,
//! environments, bookmarks, the scheduler queue and all bookkeeping that has to be
//! persisted, and it is driven from the outside: the host calls
//! [`drain_cycle`](ActivityExecutor::drain_cycle) until it reports idle.
//!
//! Every work item goes through the same pipeline:
//!
//! ```text
//! release -> validity check -> execute -> workflow abort? -> key updates
//!         -> post-process -> fault propagation -> tracking -> runtime items -> dispose
//! ```
//!
//! Steps that need I/O (persisting, committing a transaction, associating correlation
//! keys, flushing tracking records) are not awaited here. The cycle returns
//! [`DrainOutcome::Suspended`] with the [`PendingOperation`], the host performs it and
//! feeds the result back through
//! [`complete_pending_operation`](ActivityExecutor::complete_pending_operation), which
//! resumes the pipeline where it stopped.

mod fault;
mod items;
mod lifecycle;
mod persist;
mod requests;
mod transaction;

pub use self::transaction::TransactionCompletion;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::activity::{ActivityId, ArgumentDirection, WorkflowDefinition};
use crate::bookmark::{
    Bookmark, BookmarkInfo, BookmarkManager, BookmarkResumptionResult, BookmarkScope,
    BookmarkScopeManager,
};
use crate::bookmark::scope::ScopeLookup;
use crate::config::ExecutorConfig;
use crate::environment::EnvironmentArena;
use crate::error::{ActivityFault, ExecutorError, Result};
use crate::extensions::Extensions;
use crate::instance::{
    ActivityInstance, ActivityInstanceState, InstanceId, InstanceInfo, InstanceTree,
};
use crate::operation::OperationCompletion;
use crate::persistence::PersistedImage;
use crate::scheduler::Scheduler;
use crate::tracking::{
    TrackingBuffer, TrackingEvent, TrackingProfile, TrackingRecord, WorkflowInstanceEvent,
};
use crate::transaction::TransactionStatus;
use crate::work_item::{WorkItem, WorkItemKind, WorkItemPool};

use self::transaction::RuntimeTransactionData;

pub(crate) type FaultResult<T = ()> = std::result::Result<T, ActivityFault>;

/// Handle through which an activity requests a transaction context and completes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionHandleId(u64);

impl fmt::Display for TransactionHandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txh{}", self.0)
    }
}

/// Services shared by every executor a runtime creates.
#[derive(Debug, Clone, Default)]
pub struct ExecutorServices {
    /// Tunables.
    pub config: ExecutorConfig,
    /// Host services reachable from activities.
    pub extensions: Arc<Extensions>,
    /// Which tracking records are produced.
    pub tracking: TrackingProfile,
    /// Whether anything consumes tracking records at all.
    pub tracking_enabled: bool,
}

impl ExecutorServices {
    /// Services with the given configuration, no extensions and tracking off.
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Attach host extensions.
    pub fn with_extensions(mut self, extensions: Arc<Extensions>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Turn tracking on with the given profile.
    pub fn with_tracking(mut self, profile: TrackingProfile) -> Self {
        self.tracking = profile;
        self.tracking_enabled = true;
        self
    }
}

/// I/O the executor needs before it can continue.
#[derive(Debug)]
pub enum PendingOperation {
    /// Save this image.
    Persist(PersistedImage),
    /// Persist, commit and wait for the ambient transaction. Run it with
    /// [`TransactionCompletion::run`].
    CompleteTransaction(TransactionCompletion),
    /// Update correlation key associations in the store.
    UpdateKeys {
        /// Workflow instance id.
        instance_id: Uuid,
        /// Keys to associate.
        associate: Vec<Uuid>,
        /// Keys to drop.
        disassociate: Vec<Uuid>,
    },
    /// Deliver tracking records to the participants.
    Track(Vec<TrackingRecord>),
}

impl PendingOperation {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Persist(_) => "persist",
            Self::CompleteTransaction(_) => "complete_transaction",
            Self::UpdateKeys { .. } => "update_keys",
            Self::Track(_) => "track",
        }
    }
}

/// Result of a [`PendingOperation`], fed back into the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    /// Result of [`PendingOperation::Persist`].
    Persisted(std::result::Result<(), ActivityFault>),
    /// Result of [`PendingOperation::CompleteTransaction`].
    TransactionCompleted(std::result::Result<TransactionStatus, ActivityFault>),
    /// Result of [`PendingOperation::UpdateKeys`].
    KeysUpdated(std::result::Result<(), ActivityFault>),
    /// Result of [`PendingOperation::Track`].
    Tracked(std::result::Result<(), ActivityFault>),
}

/// Why a drain cycle returned.
#[derive(Debug)]
pub enum DrainOutcome {
    /// Nothing left to run.
    Idle,
    /// The per-cycle budget was used up; call again.
    Yielded,
    /// A pause was requested (e.g. by pause-when-persistable).
    Paused,
    /// A work item is waiting for I/O.
    Suspended(PendingOperation),
    /// A fault escaped every handler.
    UnhandledException {
        /// The fault.
        exception: ActivityFault,
        /// Instance that raised it.
        source: InstanceInfo,
    },
    /// The workflow instance was aborted; the executor is unusable.
    AbortRequested(ActivityFault),
    /// Another cycle is running or an operation is outstanding.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PersistenceWaiter {
    pub(crate) instance: InstanceId,
    pub(crate) bookmark: Bookmark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TransactionContextWaiter {
    pub(crate) instance: InstanceId,
    pub(crate) handle: TransactionHandleId,
    pub(crate) requires: bool,
    pub(crate) callback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct TransactionHandleRecord {
    pub(crate) owner: InstanceId,
    pub(crate) abort_on_failure: bool,
}

/// Everything that goes into an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExecutorState {
    instance_id: Uuid,
    tree: InstanceTree,
    environments: EnvironmentArena,
    bookmarks: BookmarkManager,
    scopes: BookmarkScopeManager,
    scheduler: Scheduler,
    root: Option<InstanceId>,
    #[serde(default)]
    secondary_roots: BTreeSet<InstanceId>,
    #[serde(default)]
    host_properties: BTreeMap<String, Value>,
    no_persist_count: u32,
    #[serde(default)]
    persistence_waiters: VecDeque<PersistenceWaiter>,
    #[serde(default)]
    transaction_waiters: VecDeque<TransactionContextWaiter>,
    #[serde(default)]
    transaction_handles: BTreeMap<TransactionHandleId, TransactionHandleRecord>,
    next_transaction_handle: u64,
    #[serde(default)]
    main_root_complete: Vec<(InstanceId, Bookmark)>,
    root_state: Option<ActivityInstanceState>,
    #[serde(default)]
    root_outputs: BTreeMap<String, Value>,
    execution_state: Option<ActivityInstanceState>,
    completion_exception: Option<ActivityFault>,
    #[serde(default)]
    workflow_outputs: BTreeMap<String, Value>,
    pending_terminate: Option<ActivityFault>,
    tracking: TrackingBuffer,
}

impl ExecutorState {
    fn new(instance_id: Uuid) -> Self {
        Self {
            instance_id,
            tree: InstanceTree::new(),
            environments: EnvironmentArena::new(),
            bookmarks: BookmarkManager::new(),
            scopes: BookmarkScopeManager::new(),
            scheduler: Scheduler::new(),
            root: None,
            secondary_roots: BTreeSet::new(),
            host_properties: BTreeMap::new(),
            no_persist_count: 0,
            persistence_waiters: VecDeque::new(),
            transaction_waiters: VecDeque::new(),
            transaction_handles: BTreeMap::new(),
            next_transaction_handle: 0,
            main_root_complete: Vec::new(),
            root_state: None,
            root_outputs: BTreeMap::new(),
            execution_state: None,
            completion_exception: None,
            workflow_outputs: BTreeMap::new(),
            pending_terminate: None,
            tracking: TrackingBuffer::default(),
        }
    }

    pub(crate) fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub(crate) fn execution_state(&self) -> Option<ActivityInstanceState> {
        self.execution_state
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.tree.len()
    }

    pub(crate) fn queued_work_items(&self) -> usize {
        self.scheduler.len()
    }

    pub(crate) fn bookmark_names(&self) -> Vec<String> {
        self.bookmarks
            .iter()
            .filter_map(|(bookmark, _)| bookmark.name().map(str::to_string))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Execute,
    KeyUpdates,
    Tracking,
}

#[derive(Debug)]
struct InFlight {
    item: WorkItem,
    stage: Stage,
}

/// What the pipeline does after one step.
#[derive(Debug)]
enum Step {
    Continue,
    Suspend(PendingOperation),
    Unhandled {
        exception: ActivityFault,
        source: InstanceInfo,
    },
}

/// Runs one workflow instance.
pub struct ActivityExecutor {
    state: ExecutorState,
    definition: Arc<WorkflowDefinition>,
    services: ExecutorServices,
    pool: WorkItemPool,
    runtime_transaction: Option<RuntimeTransactionData>,
    in_flight: Option<InFlight>,
    abort_reason: Option<ActivityFault>,
    torn_down: bool,
    pause_when_persistable: bool,
    operations_tx: mpsc::UnboundedSender<OperationCompletion>,
    operations_rx: Option<mpsc::UnboundedReceiver<OperationCompletion>>,
}

impl fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("instance_id", &self.state.instance_id)
            .field("definition", &self.definition.identity())
            .field("instances", &self.state.tree.len())
            .field("queued", &self.state.scheduler.len())
            .field("no_persist_count", &self.state.no_persist_count)
            .field("execution_state", &self.state.execution_state)
            .field("aborted", &self.abort_reason.is_some())
            .finish()
    }
}

impl ActivityExecutor {
    /// Create an executor for a fresh workflow instance.
    pub fn new(
        instance_id: Uuid,
        definition: Arc<WorkflowDefinition>,
        services: ExecutorServices,
    ) -> Self {
        Self::with_state(ExecutorState::new(instance_id), definition, services)
    }

    fn with_state(
        state: ExecutorState,
        definition: Arc<WorkflowDefinition>,
        services: ExecutorServices,
    ) -> Self {
        let (operations_tx, operations_rx) = mpsc::unbounded_channel();
        Self {
            state,
            definition,
            services,
            pool: WorkItemPool::default(),
            runtime_transaction: None,
            in_flight: None,
            abort_reason: None,
            torn_down: false,
            pause_when_persistable: false,
            operations_tx,
            operations_rx: Some(operations_rx),
        }
    }

    // ---------------------------------------------------------------------
    // Host queries
    // ---------------------------------------------------------------------

    /// Workflow instance id.
    pub fn instance_id(&self) -> Uuid {
        self.state.instance_id
    }

    /// The definition being executed.
    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    /// Root instance, once scheduled.
    pub fn root(&self) -> Option<InstanceId> {
        self.state.root
    }

    /// Look up an instance.
    pub fn instance(&self, id: InstanceId) -> Option<&ActivityInstance> {
        self.state.tree.get(id)
    }

    /// Instances currently held in the arena.
    pub fn instances(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.state.tree.iter()
    }

    /// Final workflow state, `None` while running.
    pub fn execution_state(&self) -> Option<ActivityInstanceState> {
        self.state.execution_state
    }

    /// Whether the workflow completed.
    pub fn is_completed(&self) -> bool {
        self.state.execution_state.is_some()
    }

    /// Fault the workflow completed with (termination reason or escaped fault).
    pub fn completion_exception(&self) -> Option<&ActivityFault> {
        self.state.completion_exception.as_ref()
    }

    /// Root outputs, available once the workflow closed.
    pub fn workflow_outputs(&self) -> &BTreeMap<String, Value> {
        &self.state.workflow_outputs
    }

    /// Abort reason, once the instance was aborted.
    pub fn abort_reason(&self) -> Option<&ActivityFault> {
        self.abort_reason.as_ref()
    }

    /// Whether the queue is empty and no operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.state.scheduler.is_idle() && self.in_flight.is_none()
    }

    /// Number of queued work items.
    pub fn queued_work_items(&self) -> usize {
        self.state.scheduler.len()
    }

    /// Whether an image may be taken.
    pub fn is_persistable(&self) -> bool {
        self.state.no_persist_count == 0
    }

    /// Current no-persist nesting.
    pub fn no_persist_count(&self) -> u32 {
        self.state.no_persist_count
    }

    /// Whether a transaction is attached.
    pub fn has_runtime_transaction(&self) -> bool {
        self.runtime_transaction.is_some()
    }

    /// Whether any instance waits for an async operation.
    pub fn has_active_operations(&self) -> bool {
        self.state
            .tree
            .iter()
            .any(|instance| instance.active_operation.is_some())
    }

    /// Value of a location as seen from an instance's environment.
    pub fn location_value(&self, instance: InstanceId, name: &str) -> Option<&Value> {
        let env = self.state.tree.get(instance)?.environment;
        self.state.environments.lookup(env, name)
    }

    /// Host-level properties visible to every activity.
    pub fn set_host_property(&mut self, name: impl Into<String>, value: Value) {
        self.state.host_properties.insert(name.into(), value);
    }

    /// Receiver for async operation completions. Can be taken once.
    pub fn take_operation_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<OperationCompletion>> {
        self.operations_rx.take()
    }

    /// Tracking records produced since the last flush.
    pub fn take_tracking_records(&mut self) -> Vec<TrackingRecord> {
        self.state.tracking.take()
    }

    /// Named bookmarks, all of them or those of one scope.
    pub fn bookmarks(&self, scope: Option<BookmarkScope>) -> Vec<BookmarkInfo> {
        let owner_name = |owner: InstanceId| {
            self.state
                .tree
                .get(owner)
                .map(|i| i.display_name().to_string())
                .unwrap_or_default()
        };
        let default_scope = || {
            self.state
                .bookmarks
                .iter()
                .filter_map(|(bookmark, record)| {
                    bookmark.name().map(|name| BookmarkInfo {
                        name: name.to_string(),
                        owner: record.owner,
                        owner_display_name: owner_name(record.owner),
                        scope: Some(BookmarkScope::Default),
                    })
                })
                .collect::<Vec<_>>()
        };
        match scope {
            None => {
                let mut all = default_scope();
                all.extend(self.state.scopes.describe(None, &owner_name));
                all
            }
            Some(BookmarkScope::Default) => default_scope(),
            Some(BookmarkScope::Keyed(key)) => self.state.scopes.describe(Some(key), &owner_name),
        }
    }

    // ---------------------------------------------------------------------
    // Host commands
    // ---------------------------------------------------------------------

    /// Create the root instance and queue its first execution.
    pub fn schedule_root(&mut self, argument_overrides: BTreeMap<String, Value>) -> Result<InstanceId> {
        if self.state.root.is_some() {
            return Err(ExecutorError::InvalidOperation(
                "the root activity has already been scheduled".to_string(),
            ));
        }
        let root_activity = self.definition.root();
        let node = self.definition.node(root_activity)?;
        if let Some(unknown) = argument_overrides.keys().find(|name| {
            !node
                .arguments
                .iter()
                .any(|arg| &arg.name == *name && arg.direction != ArgumentDirection::Out)
        }) {
            return Err(ExecutorError::InvalidOperation(format!(
                "root activity has no input argument named '{}'",
                unknown
            )));
        }

        let id = self.create_instance(root_activity, None, None)?;
        self.state.root = Some(id);
        self.track(TrackingEvent::WorkflowInstance {
            state: WorkflowInstanceEvent::Started,
        });
        let item = self.new_work_item(id, WorkItemKind::ExecuteRoot { argument_overrides });
        self.state.scheduler.push(item);
        info!(
            instance_id = %self.state.instance_id,
            root = %id,
            definition = %self.definition.identity(),
            "Workflow root scheduled"
        );
        Ok(id)
    }

    /// Resume a bookmark in the default scope.
    pub fn try_resume_bookmark(&mut self, bookmark: &Bookmark, value: Value) -> BookmarkResumptionResult {
        if self.abort_reason.is_some() || self.is_completed() {
            return BookmarkResumptionResult::NotFound;
        }
        if self.in_flight.is_some() {
            return BookmarkResumptionResult::NotReady;
        }
        let Some(owner) = self.state.bookmarks.get(bookmark).map(|r| r.owner) else {
            debug!(bookmark = %bookmark, "bookmark not found");
            return BookmarkResumptionResult::NotFound;
        };
        if !self.is_ready_for_resumption(owner) {
            return BookmarkResumptionResult::NotReady;
        }
        let Some((record, removed)) = self.state.bookmarks.take_for_resume(bookmark) else {
            return BookmarkResumptionResult::NotFound;
        };
        self.schedule_bookmark_work(bookmark.clone(), record, removed, value, true);
        BookmarkResumptionResult::Success
    }

    /// Resume a bookmark in a scope.
    pub fn try_resume_bookmark_in_scope(
        &mut self,
        bookmark: &Bookmark,
        scope: BookmarkScope,
        value: Value,
    ) -> BookmarkResumptionResult {
        let key = match scope {
            BookmarkScope::Default => return self.try_resume_bookmark(bookmark, value),
            BookmarkScope::Keyed(key) => key,
        };
        if self.abort_reason.is_some() || self.is_completed() {
            return BookmarkResumptionResult::NotFound;
        }
        if self.in_flight.is_some() {
            return BookmarkResumptionResult::NotReady;
        }
        match self.state.scopes.locate(key, bookmark) {
            ScopeLookup::Found { scope, claim } => {
                let Some(owner) = self.state.scopes.get(scope, bookmark).map(|r| r.owner) else {
                    return BookmarkResumptionResult::NotFound;
                };
                if !self.is_ready_for_resumption(owner) {
                    return BookmarkResumptionResult::NotReady;
                }
                if let Some(key) = claim {
                    if let Err(e) = self.state.scopes.initialize(scope, key) {
                        debug!(scope = %scope, error = %e, "bookmark scope could not be claimed");
                        return BookmarkResumptionResult::NotReady;
                    }
                    debug!(scope = %scope, key = %key, "bookmark scope initialized by resumption");
                }
                let Some((record, removed)) = self.state.scopes.take_for_resume(scope, bookmark)
                else {
                    return BookmarkResumptionResult::NotFound;
                };
                self.schedule_bookmark_work(bookmark.clone(), record, removed, value, true);
                BookmarkResumptionResult::Success
            }
            ScopeLookup::Missing => {
                let outside_activity = self.state.bookmarks.has_bookmarks()
                    || !self.state.scheduler.is_idle()
                    || self.has_active_operations();
                if self.state.scopes.is_stable(key, outside_activity) {
                    BookmarkResumptionResult::NotFound
                } else {
                    BookmarkResumptionResult::NotReady
                }
            }
        }
    }

    /// Request cancellation of the root. Deferred while a transaction is attached.
    pub fn cancel_root(&mut self) -> Result<()> {
        let root = self.state.root.ok_or_else(|| {
            ExecutorError::InvalidOperation("the root activity has not been scheduled".to_string())
        })?;
        if let Some(rt) = self.runtime_transaction.as_mut() {
            debug!(root = %root, "root cancellation deferred until the transaction completes");
            rt.is_root_cancel_pending = true;
            return Ok(());
        }
        self.schedule_cancel(root, false);
        Ok(())
    }

    /// Queue the result of an async operation.
    pub fn complete_operation(&mut self, completion: OperationCompletion) -> Result<()> {
        let instance = self.state.tree.get(completion.instance).ok_or(
            ExecutorError::InstanceNotFound {
                instance: completion.instance,
            },
        )?;
        if instance.is_completed() || instance.active_operation != Some(completion.operation) {
            return Err(ExecutorError::InvalidOperation(format!(
                "operation {} is not active on instance {}",
                completion.operation, completion.instance
            )));
        }
        let callback = instance.operation_callback.clone();
        let item = self.new_work_item(
            completion.instance,
            WorkItemKind::CompleteAsyncOperation {
                operation: completion.operation,
                callback,
                result: completion.result,
            },
        );
        self.state.scheduler.enqueue(item);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Drain loop
    // ---------------------------------------------------------------------

    /// Run queued work items until idle, suspended, paused or out of budget.
    pub fn drain_cycle(&mut self) -> DrainOutcome {
        if let Some(reason) = &self.abort_reason {
            let reason = reason.clone();
            self.tear_down();
            return DrainOutcome::AbortRequested(reason);
        }
        if self.in_flight.is_some() || !self.state.scheduler.try_begin_drain() {
            return DrainOutcome::Busy;
        }
        let outcome = self.drain();
        self.state.scheduler.end_drain();
        if let DrainOutcome::AbortRequested(_) = outcome {
            self.tear_down();
        }
        outcome
    }

    fn drain(&mut self) -> DrainOutcome {
        let budget = self.services.config.max_work_items_per_cycle.max(1);
        let mut processed = 0usize;
        loop {
            if let Some(reason) = &self.abort_reason {
                return DrainOutcome::AbortRequested(reason.clone());
            }
            if self.state.scheduler.take_pause_request() {
                debug!(instance_id = %self.state.instance_id, "drain paused");
                return DrainOutcome::Paused;
            }
            if processed >= budget {
                return DrainOutcome::Yielded;
            }
            let Some(item) = self.state.scheduler.next() else {
                if self.on_scheduler_idle() {
                    continue;
                }
                return DrainOutcome::Idle;
            };
            processed += 1;
            match self.on_execute_work_item(item) {
                Step::Continue => {}
                Step::Suspend(operation) => return DrainOutcome::Suspended(operation),
                Step::Unhandled { exception, source } => {
                    return DrainOutcome::UnhandledException { exception, source };
                }
            }
        }
    }

    /// Work that only starts once the queue is empty. Returns `true` if something was queued.
    fn on_scheduler_idle(&mut self) -> bool {
        self.schedule_runtime_work_items();
        if !self.state.scheduler.is_idle() {
            return true;
        }
        if self.grant_transaction_context() {
            return true;
        }
        if let Some(reason) = self.state.pending_terminate.take() {
            self.terminate(reason);
            return !self.state.scheduler.is_idle();
        }
        false
    }

    /// Feed back the result of the operation returned with [`DrainOutcome::Suspended`].
    pub fn complete_pending_operation(&mut self, outcome: OperationOutcome) -> Result<DrainOutcome> {
        let Some(InFlight { mut item, stage }) = self.in_flight.take() else {
            return Err(ExecutorError::InvalidOperation(
                "no operation is pending".to_string(),
            ));
        };
        self.state.scheduler.set_suspended(false);
        let step = match (stage, outcome) {
            (Stage::Execute, outcome) => {
                self.finish_execute(&mut item, outcome);
                self.after_execute(item)
            }
            (Stage::KeyUpdates, OperationOutcome::KeysUpdated(result)) => match result {
                Ok(()) => self.complete_work_item(item),
                Err(fault) => {
                    warn!(instance_id = %self.state.instance_id, error = %fault, "correlation key update failed");
                    self.abort_workflow_instance(ActivityFault::workflow_aborted(
                        "correlation key update failed",
                        fault,
                    ));
                    self.dispose(item);
                    Step::Continue
                }
            },
            (Stage::Tracking, OperationOutcome::Tracked(result)) => match result {
                Ok(()) => self.after_tracking(item),
                Err(fault) => {
                    warn!(instance_id = %self.state.instance_id, error = %fault, "tracking participant failed");
                    self.abort_workflow_instance(ActivityFault::workflow_aborted(
                        "tracking failed",
                        fault,
                    ));
                    self.dispose(item);
                    Step::Continue
                }
            },
            (stage, outcome) => {
                let message = format!("outcome {:?} does not answer the pending {:?} step", outcome, stage);
                self.in_flight = Some(InFlight { item, stage });
                self.state.scheduler.set_suspended(true);
                return Err(ExecutorError::InvalidOperation(message));
            }
        };
        let outcome = match step {
            Step::Continue => match &self.abort_reason {
                Some(reason) => {
                    let reason = reason.clone();
                    self.tear_down();
                    DrainOutcome::AbortRequested(reason)
                }
                None => DrainOutcome::Yielded,
            },
            Step::Suspend(operation) => DrainOutcome::Suspended(operation),
            Step::Unhandled { exception, source } => {
                DrainOutcome::UnhandledException { exception, source }
            }
        };
        Ok(outcome)
    }

    // ---------------------------------------------------------------------
    // Work item pipeline
    // ---------------------------------------------------------------------

    fn on_execute_work_item(&mut self, mut item: WorkItem) -> Step {
        self.release(&mut item);
        if !self.is_valid(&item) {
            trace!(
                instance = %item.instance(),
                kind = item.kind_name(),
                "dropping work item for completed instance"
            );
            self.dispose(item);
            return Step::Continue;
        }
        trace!(instance = %item.instance(), kind = item.kind_name(), "executing work item");
        if !item.is_empty()
            && let Some(operation) = self.execute_item(&mut item)
        {
            return self.suspend(item, Stage::Execute, operation);
        }
        self.after_execute(item)
    }

    fn suspend(&mut self, item: WorkItem, stage: Stage, operation: PendingOperation) -> Step {
        debug!(
            instance = %item.instance(),
            kind = item.kind_name(),
            operation = operation.name(),
            "work item suspended"
        );
        self.in_flight = Some(InFlight { item, stage });
        self.state.scheduler.set_suspended(true);
        Step::Suspend(operation)
    }

    fn after_execute(&mut self, mut item: WorkItem) -> Step {
        if let Some(reason) = item.workflow_abort.take() {
            self.abort_workflow_instance(reason);
            self.dispose(item);
            return Step::Continue;
        }
        if self.state.scopes.has_keys_to_update() {
            let (associate, disassociate) = self.state.scopes.take_key_updates();
            let operation = PendingOperation::UpdateKeys {
                instance_id: self.state.instance_id,
                associate,
                disassociate,
            };
            return self.suspend(item, Stage::KeyUpdates, operation);
        }
        self.complete_work_item(item)
    }

    fn complete_work_item(&mut self, mut item: WorkItem) -> Step {
        self.post_process(&mut item);
        if item.exception_to_propagate.is_some() {
            self.propagate_exception(&mut item);
        }
        if self.services.tracking_enabled && self.state.tracking.has_pending() {
            let records = self.state.tracking.take();
            return self.suspend(item, Stage::Tracking, PendingOperation::Track(records));
        }
        self.after_tracking(item)
    }

    fn after_tracking(&mut self, mut item: WorkItem) -> Step {
        self.schedule_runtime_work_items();
        if let Some(exception) = item.exception_to_propagate.take() {
            self.exit_no_persist_for_propagation();
            let source = item
                .original_exception_source
                .take()
                .unwrap_or_else(|| self.info_or_placeholder(item.instance()));
            warn!(
                instance_id = %self.state.instance_id,
                source = %source.display_name,
                error = %exception,
                "Unhandled exception escaped the workflow"
            );
            self.track(TrackingEvent::WorkflowInstance {
                state: WorkflowInstanceEvent::UnhandledException,
            });
            self.dispose(item);
            return Step::Unhandled { exception, source };
        }
        self.dispose(item);
        Step::Continue
    }

    fn is_valid(&self, item: &WorkItem) -> bool {
        self.state
            .tree
            .get(item.instance())
            .is_some_and(|instance| !instance.is_completed())
    }

    pub(crate) fn new_work_item(&mut self, instance: InstanceId, kind: WorkItemKind) -> WorkItem {
        if let Some(target) = self.state.tree.get_mut(instance) {
            target.increment_busy();
        }
        self.pool.acquire(instance, kind)
    }

    fn release(&mut self, item: &mut WorkItem) {
        if item.is_released() {
            return;
        }
        item.mark_released();
        if let Some(instance) = self.state.tree.get_mut(item.instance()) {
            instance.decrement_busy();
        }
    }

    fn dispose(&mut self, mut item: WorkItem) {
        self.release(&mut item);
        if item.exit_no_persist_required {
            item.exit_no_persist_required = false;
            self.exit_no_persist();
        }
        self.sweep(item.instance());
        self.pool.release(item);
    }

    /// Drop a completed instance once nothing references it.
    fn sweep(&mut self, id: InstanceId) {
        let removable = self
            .state
            .tree
            .get(id)
            .is_some_and(|instance| instance.is_completed() && instance.busy_count() == 0);
        if removable {
            self.state.tree.remove(id);
            trace!(instance = %id, "instance removed from arena");
        }
    }

    /// Queue items the runtime owns: transaction completion and persistence waiters.
    fn schedule_runtime_work_items(&mut self) {
        if let Some(rt) = self.runtime_transaction.as_mut()
            && rt.should_schedule_completion
        {
            rt.should_schedule_completion = false;
            rt.completion_scheduled = true;
            let scope = rt.isolation_scope;
            let completion = rt.completion_bookmark.clone();
            let mut item = self.new_work_item(scope, WorkItemKind::CompleteTransaction { completion });
            item.exit_no_persist_required = true;
            self.state.scheduler.push(item);
            return;
        }
        if self.is_persistable() {
            while let Some(waiter) = self.state.persistence_waiters.pop_front() {
                let alive = self
                    .state
                    .tree
                    .get(waiter.instance)
                    .is_some_and(|i| !i.is_completed());
                if alive {
                    let item = self.new_work_item(
                        waiter.instance,
                        WorkItemKind::Persist {
                            bookmark: waiter.bookmark,
                        },
                    );
                    self.state.scheduler.push(item);
                    break;
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Shared helpers
    // ---------------------------------------------------------------------

    pub(crate) fn track(&mut self, event: TrackingEvent) {
        if self.services.tracking_enabled && self.services.tracking.is_enabled(event.kind()) {
            let instance_id = self.state.instance_id;
            self.state.tracking.push(instance_id, event);
        }
    }

    pub(crate) fn info_or_placeholder(&self, id: InstanceId) -> InstanceInfo {
        self.state
            .tree
            .get(id)
            .map(ActivityInstance::info)
            .unwrap_or_else(|| InstanceInfo {
                id,
                activity: ActivityId::ROOT,
                display_name: String::new(),
                state: ActivityInstanceState::Faulted,
            })
    }

    pub(crate) fn is_executing(&self, id: InstanceId) -> bool {
        self.state
            .tree
            .get(id)
            .is_some_and(|instance| !instance.is_completed())
    }

    /// An instance outside the isolation scope cannot run while a transaction is attached.
    fn is_ready_for_resumption(&self, owner: InstanceId) -> bool {
        match &self.runtime_transaction {
            Some(rt) => self.state.tree.is_in_subtree(owner, rt.isolation_scope),
            None => true,
        }
    }

    pub(crate) fn schedule_bookmark_work(
        &mut self,
        bookmark: Bookmark,
        record: crate::bookmark::BookmarkRecord,
        removed: bool,
        value: Value,
        external: bool,
    ) {
        if removed
            && record.is_blocking()
            && let Some(owner) = self.state.tree.get_mut(record.owner)
        {
            owner.blocking_bookmarks = owner.blocking_bookmarks.saturating_sub(1);
        }
        let owner = self.info_or_placeholder(record.owner);
        self.track(TrackingEvent::BookmarkResumption {
            bookmark: bookmark.to_string(),
            owner,
            payload: value.clone(),
        });
        debug!(bookmark = %bookmark, owner = %record.owner, "bookmark resumed");
        let item = self.new_work_item(
            record.owner,
            WorkItemKind::Bookmark {
                callback: record.callback,
                bookmark,
                value,
            },
        );
        if external {
            self.state.scheduler.enqueue(item);
        } else {
            self.state.scheduler.push(item);
        }
    }

    /// Resume an internal bookmark from inside the pipeline.
    pub(crate) fn resume_internal(&mut self, bookmark: &Bookmark, value: Value) -> bool {
        match self.state.bookmarks.take_for_resume(bookmark) {
            Some((record, removed)) => {
                self.schedule_bookmark_work(bookmark.clone(), record, removed, value, false);
                true
            }
            None => false,
        }
    }

    pub(crate) fn enter_no_persist(&mut self) {
        self.state.no_persist_count += 1;
    }

    pub(crate) fn exit_no_persist(&mut self) {
        debug_assert!(self.state.no_persist_count > 0, "no-persist underflow");
        self.state.no_persist_count = self.state.no_persist_count.saturating_sub(1);
        if self.state.no_persist_count == 0 && self.pause_when_persistable {
            self.pause_when_persistable = false;
            self.state.scheduler.request_pause();
        }
    }

    fn enter_no_persist_for_propagation(&mut self) {
        if !self.services.config.persist_exceptions {
            self.enter_no_persist();
        }
    }

    fn exit_no_persist_for_propagation(&mut self) {
        if !self.services.config.persist_exceptions {
            self.exit_no_persist();
        }
    }
}
