// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-executor integration tests.
//!
//! Provides a small catalog of activities and helpers to build runtimes around them.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};

use runtara_executor::activity::{Activity, ArgumentSpec, VariableSpec, WorkflowDefinition};
use runtara_executor::bookmark::Bookmark;
use runtara_executor::context::{ActivityContext, ChildCallbacks, FaultContext, TransactionContext};
use runtara_executor::error::{ActivityFault, FaultKind};
use runtara_executor::executor::TransactionHandleId;
use runtara_executor::instance::{ActivityInstanceState, CompletedInstance};
use runtara_executor::runtime::WorkflowRuntime;
use runtara_executor::transaction::{LocalTransaction, Transaction};

type ActivityResult = Result<(), ActivityFault>;

/// Install a tracing subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Runtime with default configuration and no store.
pub fn runtime() -> WorkflowRuntime {
    init_tracing();
    WorkflowRuntime::builder()
        .build()
        .expect("Failed to build runtime")
}

pub fn definition(root: Arc<dyn Activity>) -> Arc<WorkflowDefinition> {
    Arc::new(WorkflowDefinition::new(root).expect("Failed to build definition"))
}

/// Ordered log shared between activities and the test.
#[derive(Debug, Default)]
pub struct Journal(Mutex<Vec<String>>);

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ---------------------------------------------------------------------------
// Activity catalog
// ---------------------------------------------------------------------------

/// Runs its children one after another.
#[derive(Debug)]
pub struct Sequence {
    pub name: String,
    pub children: Vec<Arc<dyn Activity>>,
    pub arguments: Vec<ArgumentSpec>,
    pub variables: Vec<VariableSpec>,
}

impl Sequence {
    pub fn new(name: &str, children: Vec<Arc<dyn Activity>>) -> Self {
        Self {
            name: name.to_string(),
            children,
            arguments: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn with_variable(mut self, variable: VariableSpec) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_argument(mut self, argument: ArgumentSpec) -> Self {
        self.arguments.push(argument);
        self
    }

    fn schedule_at(&self, ctx: &mut ActivityContext<'_>, index: usize) -> ActivityResult {
        if let Some(child) = ctx.child_activities().get(index).copied() {
            ctx.set_private_state("index", json!(index))?;
            ctx.schedule_child(child, ChildCallbacks::none().on_completed("next"))?;
        }
        Ok(())
    }
}

impl Activity for Sequence {
    fn display_name(&self) -> &str {
        &self.name
    }

    fn children(&self) -> Vec<Arc<dyn Activity>> {
        self.children.clone()
    }

    fn arguments(&self) -> Vec<ArgumentSpec> {
        self.arguments.clone()
    }

    fn variables(&self) -> Vec<VariableSpec> {
        self.variables.clone()
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        self.schedule_at(ctx, 0)
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        child: &CompletedInstance,
    ) -> ActivityResult {
        if child.state() != ActivityInstanceState::Closed {
            return Ok(());
        }
        let index = ctx
            .private_state("index")
            .and_then(|v| v.as_u64())
            .unwrap_or_default() as usize;
        self.schedule_at(ctx, index + 1)
    }
}

/// Schedules every child at once.
#[derive(Debug)]
pub struct Parallel {
    pub children: Vec<Arc<dyn Activity>>,
}

impl Activity for Parallel {
    fn display_name(&self) -> &str {
        "parallel"
    }

    fn children(&self) -> Vec<Arc<dyn Activity>> {
        self.children.clone()
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        for child in ctx.child_activities() {
            ctx.schedule_child(child, ChildCallbacks::none())?;
        }
        Ok(())
    }
}

/// Appends a fixed message to the journal and returns it as its result.
#[derive(Debug)]
pub struct Record {
    pub message: String,
    pub journal: Arc<Journal>,
}

impl Record {
    pub fn new(message: &str, journal: &Arc<Journal>) -> Arc<dyn Activity> {
        Arc::new(Self {
            message: message.to_string(),
            journal: Arc::clone(journal),
        })
    }
}

impl Activity for Record {
    fn display_name(&self) -> &str {
        &self.message
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        self.journal.push(self.message.clone());
        ctx.set_result(json!(self.message))?;
        Ok(())
    }
}

/// Writes `name=<value>` for a location visible to it.
#[derive(Debug)]
pub struct Echo {
    pub location: String,
    pub journal: Arc<Journal>,
}

impl Echo {
    pub fn new(location: &str, journal: &Arc<Journal>) -> Arc<dyn Activity> {
        Arc::new(Self {
            location: location.to_string(),
            journal: Arc::clone(journal),
        })
    }
}

impl Activity for Echo {
    fn display_name(&self) -> &str {
        "echo"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let value = ctx.get_value(&self.location)?;
        self.journal.push(format!("{}={}", self.location, value));
        Ok(())
    }
}

/// Assigns a constant to a location visible to it.
#[derive(Debug)]
pub struct Assign {
    pub location: String,
    pub value: Value,
}

impl Activity for Assign {
    fn display_name(&self) -> &str {
        "assign"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.set_value(&self.location, self.value.clone())?;
        Ok(())
    }
}

/// Expression activity producing a constant.
#[derive(Debug)]
pub struct Constant(pub Value);

impl Activity for Constant {
    fn display_name(&self) -> &str {
        "constant"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.set_result(self.0.clone())?;
        Ok(())
    }
}

/// Waits on a named bookmark and records the resumption payload.
#[derive(Debug)]
pub struct WaitForBookmark {
    pub bookmark: String,
    pub journal: Arc<Journal>,
}

impl WaitForBookmark {
    pub fn new(bookmark: &str, journal: &Arc<Journal>) -> Arc<dyn Activity> {
        Arc::new(Self {
            bookmark: bookmark.to_string(),
            journal: Arc::clone(journal),
        })
    }
}

impl Activity for WaitForBookmark {
    fn display_name(&self) -> &str {
        &self.bookmark
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.create_bookmark(&self.bookmark, "resumed")?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        bookmark: &Bookmark,
        value: Value,
    ) -> ActivityResult {
        self.journal.push(format!("{}:{}", bookmark, value));
        ctx.set_result(value)?;
        Ok(())
    }
}

/// Fails as soon as it runs.
#[derive(Debug)]
pub struct Throw {
    pub message: String,
}

impl Throw {
    pub fn new(message: &str) -> Arc<dyn Activity> {
        Arc::new(Self {
            message: message.to_string(),
        })
    }
}

impl Activity for Throw {
    fn display_name(&self) -> &str {
        "throw"
    }

    fn execute(&self, _ctx: &mut ActivityContext<'_>) -> ActivityResult {
        Err(ActivityFault::new(self.message.clone()))
    }
}

/// Runs one child with a fault callback.
#[derive(Debug)]
pub struct TryCatch {
    pub body: Arc<dyn Activity>,
    pub handle: bool,
    pub rethrow: Option<String>,
    pub observe: Option<Arc<LocalTransaction>>,
    pub journal: Arc<Journal>,
}

impl TryCatch {
    pub fn handling(body: Arc<dyn Activity>, journal: &Arc<Journal>) -> Self {
        Self {
            body,
            handle: true,
            rethrow: None,
            observe: None,
            journal: Arc::clone(journal),
        }
    }

    pub fn declining(body: Arc<dyn Activity>, journal: &Arc<Journal>) -> Self {
        Self {
            handle: false,
            ..Self::handling(body, journal)
        }
    }

    pub fn rethrowing(body: Arc<dyn Activity>, message: &str, journal: &Arc<Journal>) -> Self {
        Self {
            rethrow: Some(message.to_string()),
            ..Self::handling(body, journal)
        }
    }

    pub fn observing(mut self, transaction: &Arc<LocalTransaction>) -> Self {
        self.observe = Some(Arc::clone(transaction));
        self
    }
}

impl Activity for TryCatch {
    fn display_name(&self) -> &str {
        "try"
    }

    fn children(&self) -> Vec<Arc<dyn Activity>> {
        vec![Arc::clone(&self.body)]
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let body = ctx.child_activities()[0];
        ctx.schedule_child(body, ChildCallbacks::none().on_faulted("caught"))?;
        Ok(())
    }

    fn on_child_faulted(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _callback: &str,
        fault: &mut FaultContext,
    ) -> ActivityResult {
        self.journal.push(format!("caught:{}", fault.fault().message));
        if let Some(transaction) = &self.observe {
            self.journal
                .push(format!("observed:{:?}", transaction.status()));
        }
        if let Some(message) = &self.rethrow {
            return Err(ActivityFault::new(message.clone()));
        }
        if self.handle {
            fault.handle();
        }
        Ok(())
    }
}

/// Attaches a transaction, runs its body inside it, then completes it.
#[derive(Debug)]
pub struct TransactionScope {
    pub body: Arc<dyn Activity>,
    pub transaction: Arc<LocalTransaction>,
    pub abort_on_failure: bool,
    pub journal: Arc<Journal>,
}

impl TransactionScope {
    fn handle(ctx: &ActivityContext<'_>) -> Result<TransactionHandleId, ActivityFault> {
        let value = ctx
            .private_state("handle")
            .ok_or_else(|| ActivityFault::new("transaction handle missing"))?;
        serde_json::from_value(value).map_err(|e| ActivityFault::new(e.to_string()))
    }
}

impl Activity for TransactionScope {
    fn display_name(&self) -> &str {
        "transaction-scope"
    }

    fn children(&self) -> Vec<Arc<dyn Activity>> {
        vec![Arc::clone(&self.body)]
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let handle = ctx.create_transaction_handle(self.abort_on_failure);
        ctx.set_private_state("handle", json!(handle))?;
        ctx.request_transaction_context(handle, false, "granted")?;
        Ok(())
    }

    fn on_transaction_context(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        transaction: &mut TransactionContext,
    ) -> ActivityResult {
        let attached: Arc<dyn Transaction> = self.transaction.clone();
        transaction.set_transaction(attached);
        self.journal.push("tx:attached");
        let body = ctx.child_activities()[0];
        ctx.schedule_child(body, ChildCallbacks::none().on_completed("body_done"))?;
        Ok(())
    }

    fn on_child_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        child: &CompletedInstance,
    ) -> ActivityResult {
        if child.state() == ActivityInstanceState::Closed {
            let handle = Self::handle(ctx)?;
            ctx.complete_transaction(handle, Some("completed"))?;
        }
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _bookmark: &Bookmark,
        value: Value,
    ) -> ActivityResult {
        self.journal
            .push(format!("tx:{}", value.as_str().unwrap_or_default()));
        Ok(())
    }
}

/// Asks for an image to be saved and records when that happened.
#[derive(Debug)]
pub struct PersistPoint {
    pub journal: Arc<Journal>,
}

impl Activity for PersistPoint {
    fn display_name(&self) -> &str {
        "persist"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.request_persist(Some("persisted"))?;
        Ok(())
    }

    fn on_bookmark_resumed(
        &self,
        _ctx: &mut ActivityContext<'_>,
        _callback: &str,
        _bookmark: &Bookmark,
        _value: Value,
    ) -> ActivityResult {
        self.journal.push("persisted");
        Ok(())
    }
}

/// Starts an async operation completed from a spawned task.
#[derive(Debug)]
pub struct AsyncCall {
    pub value: Value,
    pub journal: Arc<Journal>,
}

impl Activity for AsyncCall {
    fn display_name(&self) -> &str {
        "async-call"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let handle = ctx.begin_async_operation(Some("done"))?;
        let value = self.value.clone();
        tokio::spawn(async move {
            handle.succeed(value);
        });
        Ok(())
    }

    fn on_operation_completed(
        &self,
        ctx: &mut ActivityContext<'_>,
        _callback: &str,
        value: Value,
    ) -> ActivityResult {
        self.journal.push(format!("async:{}", value));
        ctx.set_result(value)?;
        Ok(())
    }
}

/// Starts its only child as a secondary root and finishes right away.
#[derive(Debug)]
pub struct Spawner {
    pub child: Arc<dyn Activity>,
    pub journal: Arc<Journal>,
}

impl Activity for Spawner {
    fn display_name(&self) -> &str {
        "spawner"
    }

    fn children(&self) -> Vec<Arc<dyn Activity>> {
        vec![Arc::clone(&self.child)]
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        let child = ctx.child_activities()[0];
        ctx.schedule_secondary_root(child, true)?;
        self.journal.push("spawned");
        Ok(())
    }
}

/// Schedules termination of the workflow instance.
#[derive(Debug)]
pub struct Terminator {
    pub message: String,
}

impl Activity for Terminator {
    fn display_name(&self) -> &str {
        "terminator"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> ActivityResult {
        ctx.terminate_workflow(ActivityFault::with_kind(
            FaultKind::Terminated,
            self.message.clone(),
        ));
        Ok(())
    }
}
