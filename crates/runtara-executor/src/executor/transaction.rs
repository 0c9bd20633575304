// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ambient transaction support.
//!
//! An activity holding a [`TransactionHandleId`] asks for a transaction context; the
//! request is granted once the executor is idle and persistable. The activity may then
//! attach a transaction, which makes its instance the isolation scope: no-persist is
//! held until the transaction completes, work outside the scope cannot be resumed, and
//! root cancellation is deferred. Completion commits (or signals a dependent clone),
//! waits for the outcome reported through a volatile enlistment, and only then writes
//! the image. A rolled-back transaction never leaves an image behind.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ActivityExecutor, FaultResult, PendingOperation, TransactionContextWaiter,
    TransactionHandleId, TransactionHandleRecord,
};
use crate::bookmark::{Bookmark, BookmarkOptions, BookmarkRecord};
use crate::context::TransactionContext;
use crate::error::{ActivityFault, ExecutorError, Result};
use crate::instance::InstanceId;
use crate::persistence::{InstanceStore, PersistedImage};
use crate::transaction::{
    EnlistmentNotification, PreparingEnlistment, Transaction, TransactionError,
    TransactionKind, TransactionStatus,
};
use crate::work_item::{WorkItem, WorkItemKind};

/// The transaction attached to the workflow instance. Never persisted.
#[derive(Debug)]
pub(crate) struct RuntimeTransactionData {
    pub(crate) handle: TransactionHandleId,
    pub(crate) original: Arc<dyn Transaction>,
    pub(crate) cloned: Arc<dyn Transaction>,
    pub(crate) isolation_scope: InstanceId,
    pub(crate) should_schedule_completion: bool,
    pub(crate) completion_scheduled: bool,
    pub(crate) is_root_cancel_pending: bool,
    pub(crate) completion_bookmark: Option<Bookmark>,
    pub(crate) outcome: Arc<TransactionOutcome>,
}

#[derive(Debug, Default)]
struct OutcomeState {
    status: Option<TransactionStatus>,
    has_prepared: bool,
    pending_prepare: Option<PreparingEnlistment>,
}

/// Outcome slot shared between the executor's enlistment and the completion task.
#[derive(Debug, Default)]
pub(crate) struct TransactionOutcome {
    state: Mutex<OutcomeState>,
    notify: Notify,
}

impl TransactionOutcome {
    fn lock(&self) -> MutexGuard<'_, OutcomeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completion started; vote to commit now or as soon as phase one asks.
    fn mark_prepared(&self) {
        let pending = {
            let mut state = self.lock();
            state.has_prepared = true;
            state.pending_prepare.take()
        };
        if let Some(enlistment) = pending {
            enlistment.prepared();
        }
    }

    fn prepare(&self, enlistment: PreparingEnlistment) {
        let mut state = self.lock();
        if state.has_prepared {
            drop(state);
            enlistment.prepared();
        } else {
            state.pending_prepare = Some(enlistment);
        }
    }

    fn set(&self, status: TransactionStatus) {
        self.lock().status = Some(status);
        self.notify.notify_one();
    }

    fn status(&self) -> Option<TransactionStatus> {
        self.lock().status
    }

    async fn wait(&self) -> TransactionStatus {
        loop {
            let status = self.status();
            if let Some(status) = status {
                return status;
            }
            self.notify.notified().await;
        }
    }
}

struct ExecutorEnlistment {
    outcome: Arc<TransactionOutcome>,
}

impl EnlistmentNotification for ExecutorEnlistment {
    fn prepare(&self, enlistment: PreparingEnlistment) {
        self.outcome.prepare(enlistment);
    }

    fn commit(&self) {
        self.outcome.set(TransactionStatus::Committed);
    }

    fn rollback(&self) {
        self.outcome.set(TransactionStatus::Aborted);
    }

    fn in_doubt(&self) {
        self.outcome.set(TransactionStatus::InDoubt);
    }
}

/// Work the host runs for [`PendingOperation::CompleteTransaction`].
#[derive(Debug)]
pub struct TransactionCompletion {
    image: Option<PersistedImage>,
    original: Arc<dyn Transaction>,
    cloned: Arc<dyn Transaction>,
    outcome: Arc<TransactionOutcome>,
    timeout: Duration,
}

impl TransactionCompletion {
    /// Id of the transaction being completed.
    pub fn transaction_id(&self) -> Uuid {
        self.original.id()
    }

    /// Image written once the transaction committed, absent when it already rolled back.
    pub fn image(&self) -> Option<&PersistedImage> {
        self.image.as_ref()
    }

    /// Commit (or complete the dependent clone), wait for the outcome and save the
    /// image if the transaction committed.
    pub async fn run(self, store: Option<&dyn InstanceStore>) -> std::result::Result<TransactionStatus, ActivityFault> {
        let id = self.original.id();
        let timeout = self.timeout;
        let work = async {
            self.outcome.mark_prepared();
            if self.original.status() == TransactionStatus::Active {
                self.cloned.complete();
                match self.original.kind() {
                    TransactionKind::Committable => {
                        self.original.commit().await?;
                    }
                    TransactionKind::Dependent => self.original.complete(),
                }
            }
            Ok::<_, TransactionError>(self.outcome.wait().await)
        };
        let status = match tokio::time::timeout(timeout, work).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(transaction = %id, ?timeout, "transaction outcome timed out");
                self.original.rollback(None);
                return Err(TransactionError::Timeout(timeout).into());
            }
        };
        debug!(transaction = %id, ?status, "transaction completed");
        if status != TransactionStatus::Committed {
            return Err(TransactionError::Failed { id, status }.into());
        }
        if let (Some(image), Some(store)) = (&self.image, store) {
            store
                .save(image)
                .await
                .map_err(|e| TransactionError::Persist(e.to_string()))?;
        }
        Ok(status)
    }
}

impl ActivityExecutor {
    /// Handle through which `owner` asks for and completes transaction contexts.
    pub(crate) fn create_transaction_handle(
        &mut self,
        owner: InstanceId,
        abort_on_failure: bool,
    ) -> TransactionHandleId {
        self.state.next_transaction_handle += 1;
        let handle = TransactionHandleId(self.state.next_transaction_handle);
        self.state.transaction_handles.insert(
            handle,
            TransactionHandleRecord {
                owner,
                abort_on_failure,
            },
        );
        handle
    }

    /// Queue a request for a transaction context, granted once the executor is idle.
    pub(crate) fn request_transaction_context(
        &mut self,
        requester: InstanceId,
        handle: TransactionHandleId,
        requires: bool,
        callback: &str,
    ) -> Result<()> {
        if !self.state.transaction_handles.contains_key(&handle) {
            return Err(ExecutorError::InvalidOperation(format!(
                "unknown transaction handle {}",
                handle
            )));
        }
        let instance = self.state.tree.require_mut(requester)?;
        if instance.waiting_for_transaction {
            return Err(ExecutorError::InvalidOperation(format!(
                "instance {} is already waiting for a transaction context",
                requester
            )));
        }
        instance.waiting_for_transaction = true;
        self.state.transaction_waiters.push_back(TransactionContextWaiter {
            instance: requester,
            handle,
            requires,
            callback: callback.to_string(),
        });
        debug!(instance = %requester, handle = %handle, requires, "transaction context requested");
        Ok(())
    }

    /// Hand the next waiter its context if possible. Returns `true` if an item was queued.
    ///
    /// A requester that requires an already attached transaction may run while the
    /// only no-persist block is the one held by that transaction.
    pub(super) fn grant_transaction_context(&mut self) -> bool {
        let Some(front) = self.state.transaction_waiters.front() else {
            return false;
        };
        let grantable = self.is_persistable()
            || (front.requires
                && self.runtime_transaction.is_some()
                && self.state.no_persist_count == 1);
        if !grantable {
            return false;
        }
        let Some(waiter) = self.state.transaction_waiters.pop_front() else {
            return false;
        };
        let Some(instance) = self
            .state
            .tree
            .get_mut(waiter.instance)
            .filter(|i| !i.is_completed())
        else {
            return !self.state.transaction_waiters.is_empty();
        };
        instance.waiting_for_transaction = false;
        let item = self.new_work_item(
            waiter.instance,
            WorkItemKind::TransactionContext {
                callback: waiter.callback,
                handle: waiter.handle,
            },
        );
        self.state.scheduler.push(item);
        true
    }

    pub(super) fn execute_transaction_context(
        &mut self,
        id: InstanceId,
        callback: &str,
        handle: TransactionHandleId,
    ) -> FaultResult {
        let current = self.current_transaction();
        let mut context = TransactionContext::new(handle, current);
        self.invoke(id, |activity, ctx| {
            activity.on_transaction_context(ctx, callback, &mut context)
        })?;
        if let Some(transaction) = context.take_transaction() {
            self.set_transaction(id, handle, transaction)?;
        }
        Ok(())
    }

    fn set_transaction(
        &mut self,
        scope: InstanceId,
        handle: TransactionHandleId,
        transaction: Arc<dyn Transaction>,
    ) -> FaultResult {
        if self.runtime_transaction.is_some() {
            return Err(ActivityFault::invalid_operation(
                "a transaction is already attached to this workflow instance",
            ));
        }
        if transaction.status() != TransactionStatus::Active {
            return Err(TransactionError::NotActive(transaction.id()).into());
        }
        let outcome = Arc::new(TransactionOutcome::default());
        transaction.enlist_volatile(Arc::new(ExecutorEnlistment {
            outcome: Arc::clone(&outcome),
        }))?;
        let cloned = transaction.clone_transaction();
        self.enter_no_persist();
        info!(
            instance_id = %self.state.instance_id,
            transaction = %transaction.id(),
            scope = %scope,
            "Transaction attached"
        );
        self.runtime_transaction = Some(RuntimeTransactionData {
            handle,
            original: transaction,
            cloned,
            isolation_scope: scope,
            should_schedule_completion: false,
            completion_scheduled: false,
            is_root_cancel_pending: false,
            completion_bookmark: None,
            outcome,
        });
        Ok(())
    }

    /// Dependent clone of the attached transaction.
    pub(crate) fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.runtime_transaction
            .as_ref()
            .map(|rt| Arc::clone(&rt.cloned))
    }

    /// Ask for the attached transaction to be completed once the queue drains.
    ///
    /// `callback` receives the final status. Without an attached transaction the
    /// callback is resumed right away with `committed`.
    pub(crate) fn request_transaction_completion(
        &mut self,
        owner: InstanceId,
        handle: TransactionHandleId,
        callback: Option<&str>,
    ) -> Result<()> {
        let attached = self
            .runtime_transaction
            .as_ref()
            .is_some_and(|rt| rt.handle == handle);
        if attached
            && self
                .runtime_transaction
                .as_ref()
                .is_some_and(|rt| rt.should_schedule_completion || rt.completion_scheduled)
        {
            return Err(ExecutorError::InvalidOperation(
                "transaction completion has already been requested".to_string(),
            ));
        }

        let bookmark = callback.map(|callback| {
            let bookmark = self.state.bookmarks.create_anonymous(BookmarkRecord {
                owner,
                callback: Some(callback.to_string()),
                options: BookmarkOptions::NONE,
            });
            if let Some(instance) = self.state.tree.get_mut(owner) {
                instance.blocking_bookmarks += 1;
            }
            bookmark
        });

        match self.runtime_transaction.as_mut() {
            Some(rt) if attached => {
                rt.completion_bookmark = bookmark;
                rt.should_schedule_completion = true;
                debug!(owner = %owner, handle = %handle, "transaction completion requested");
            }
            _ => {
                if let Some(bookmark) = bookmark {
                    self.resume_internal(&bookmark, json!(TransactionStatus::Committed));
                }
            }
        }
        Ok(())
    }

    /// Whether `id` is the isolation scope with a transaction still to complete. Marks
    /// the completion for scheduling when nobody asked for it yet.
    pub(super) fn is_completing_transaction(&mut self, id: InstanceId) -> bool {
        match self.runtime_transaction.as_mut() {
            Some(rt) if rt.isolation_scope == id => {
                if !rt.completion_scheduled {
                    rt.should_schedule_completion = true;
                }
                true
            }
            _ => false,
        }
    }

    /// Execute step of a complete-transaction item.
    pub(super) fn begin_transaction_completion(
        &mut self,
        item: &mut WorkItem,
    ) -> Option<PendingOperation> {
        let Some(rt) = self.runtime_transaction.as_ref() else {
            // Restored from the image written after the commit.
            if let WorkItemKind::CompleteTransaction {
                completion: Some(bookmark),
            } = item.kind()
            {
                let bookmark = bookmark.clone();
                self.resume_internal(&bookmark, json!(TransactionStatus::Committed));
            }
            return None;
        };
        let original = Arc::clone(&rt.original);
        let cloned = Arc::clone(&rt.cloned);
        let outcome = Arc::clone(&rt.outcome);

        let image = if original.status() == TransactionStatus::Aborted {
            None
        } else {
            match self.capture_image(Some(item)) {
                Ok(image) => Some(image),
                Err(e) => {
                    warn!(transaction = %original.id(), error = %e, "image for transaction could not be captured");
                    self.finish_transaction(item, Err(e.into()));
                    return None;
                }
            }
        };
        Some(PendingOperation::CompleteTransaction(TransactionCompletion {
            image,
            original,
            cloned,
            outcome,
            timeout: self.services.config.transaction_timeout,
        }))
    }

    /// Detach the transaction once its completion finished.
    pub(super) fn finish_transaction(
        &mut self,
        item: &mut WorkItem,
        result: std::result::Result<TransactionStatus, ActivityFault>,
    ) {
        let Some(rt) = self.runtime_transaction.take() else {
            return;
        };
        let abort_on_failure = self
            .state
            .transaction_handles
            .get(&rt.handle)
            .is_some_and(|h| h.abort_on_failure);
        let status = match result {
            Ok(TransactionStatus::Committed) => {
                info!(
                    instance_id = %self.state.instance_id,
                    transaction = %rt.original.id(),
                    "Transaction committed"
                );
                TransactionStatus::Committed
            }
            other => {
                let fault = match other {
                    Ok(status) => TransactionError::Failed {
                        id: rt.original.id(),
                        status,
                    }
                    .into(),
                    Err(fault) => fault,
                };
                warn!(
                    instance_id = %self.state.instance_id,
                    transaction = %rt.original.id(),
                    error = %fault,
                    "Transaction did not commit"
                );
                rt.original.rollback(Some(&fault));
                if abort_on_failure {
                    item.workflow_abort = Some(ActivityFault::workflow_aborted(
                        "transaction did not commit",
                        fault,
                    ));
                } else {
                    item.exception_to_propagate = Some(fault);
                }
                rt.original.status()
            }
        };
        if rt.is_root_cancel_pending
            && let Some(root) = self.state.root
        {
            self.schedule_cancel(root, true);
        }
        if let Some(bookmark) = rt.completion_bookmark {
            self.resume_internal(&bookmark, json!(status));
        }
    }

    /// Roll back and detach the transaction when its isolation scope is aborted.
    pub(super) fn terminate_special_execution_blocks(&mut self, id: InstanceId, reason: &ActivityFault) {
        if !self
            .runtime_transaction
            .as_ref()
            .is_some_and(|rt| rt.isolation_scope == id)
        {
            return;
        }
        let Some(rt) = self.runtime_transaction.take() else {
            return;
        };
        warn!(
            instance_id = %self.state.instance_id,
            transaction = %rt.original.id(),
            scope = %id,
            reason = %reason,
            "Rolling back transaction of aborted scope"
        );
        rt.original.rollback(Some(reason));
        if rt.is_root_cancel_pending
            && let Some(root) = self.state.root
        {
            self.schedule_cancel(root, true);
        }
        if !rt.completion_scheduled {
            self.exit_no_persist();
        }
        let abort_on_failure = self
            .state
            .transaction_handles
            .get(&rt.handle)
            .is_some_and(|h| h.abort_on_failure);
        if abort_on_failure {
            self.abort_workflow_instance(ActivityFault::workflow_aborted(
                "transaction scope faulted",
                reason.clone(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::LocalTransaction;

    #[tokio::test]
    async fn test_outcome_votes_after_mark_prepared() {
        let outcome = Arc::new(TransactionOutcome::default());
        let tx = LocalTransaction::new();
        tx.enlist_volatile(Arc::new(ExecutorEnlistment {
            outcome: Arc::clone(&outcome),
        }))
        .unwrap();

        let committer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.commit().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(outcome.status(), None);

        outcome.mark_prepared();
        let status = committer.await.unwrap().unwrap();
        assert_eq!(status, TransactionStatus::Committed);
        assert_eq!(outcome.wait().await, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn test_rollback_reaches_outcome() {
        let outcome = Arc::new(TransactionOutcome::default());
        let tx = LocalTransaction::new();
        tx.enlist_volatile(Arc::new(ExecutorEnlistment {
            outcome: Arc::clone(&outcome),
        }))
        .unwrap();
        tx.rollback(None);
        assert_eq!(outcome.wait().await, TransactionStatus::Aborted);
    }

    #[tokio::test]
    async fn test_completion_commits_committable_transaction() {
        let outcome = Arc::new(TransactionOutcome::default());
        let tx = Arc::new(LocalTransaction::new());
        tx.enlist_volatile(Arc::new(ExecutorEnlistment {
            outcome: Arc::clone(&outcome),
        }))
        .unwrap();
        let completion = TransactionCompletion {
            image: None,
            original: tx.clone(),
            cloned: tx.clone_transaction(),
            outcome,
            timeout: Duration::from_secs(5),
        };
        let status = completion.run(None).await.unwrap();
        assert_eq!(status, TransactionStatus::Committed);
        assert_eq!(tx.completed_clones(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependent_completion_times_out() {
        let outcome = Arc::new(TransactionOutcome::default());
        let root = LocalTransaction::new();
        let dependent = root.clone_transaction();
        dependent
            .enlist_volatile(Arc::new(ExecutorEnlistment {
                outcome: Arc::clone(&outcome),
            }))
            .unwrap();
        let completion = TransactionCompletion {
            image: None,
            original: Arc::clone(&dependent),
            cloned: dependent.clone_transaction(),
            outcome,
            timeout: Duration::from_millis(50),
        };
        let fault = completion.run(None).await.unwrap_err();
        assert_eq!(fault.kind, crate::error::FaultKind::Timeout);
        assert_eq!(root.status(), TransactionStatus::Aborted);
    }
}
