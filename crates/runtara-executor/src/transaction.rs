// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction abstraction consumed by the executor.
//!
//! The executor never commits work itself. It enlists volatilely in whatever
//! transaction an activity attaches, withholds its prepare vote until the scope asks
//! for completion, and then either commits (when it holds a committable transaction)
//! or signals completion of a dependent clone and waits for the outcome. The image of
//! the instance is written only after a commit.
//!
//! [`LocalTransaction`] is an in-process two-phase implementation used by hosts that
//! have no external transaction manager and by the test suite.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{ActivityFault, FaultKind};

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Not decided yet.
    Active,
    /// Committed.
    Committed,
    /// Rolled back.
    Aborted,
    /// Outcome unknown.
    InDoubt,
}

/// Whether the holder may commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    /// The holder owns the transaction and commits it.
    Committable,
    /// A clone; the holder can only signal completion.
    Dependent,
}

/// Transaction failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransactionError {
    /// The transaction is no longer active.
    #[error("transaction {0} is not active")]
    NotActive(Uuid),

    /// Commit was attempted through a dependent clone.
    #[error("transaction {0} is a dependent clone and cannot be committed")]
    NotCommittable(Uuid),

    /// The transaction ended without committing.
    #[error("transaction {id} ended {status:?}")]
    Failed {
        /// Transaction id.
        id: Uuid,
        /// Final status.
        status: TransactionStatus,
    },

    /// The outcome did not arrive in time.
    #[error("timed out after {0:?} waiting for the transaction outcome")]
    Timeout(Duration),

    /// The image could not be written after the commit.
    #[error("saving the committed image failed: {0}")]
    Persist(String),
}

impl From<TransactionError> for ActivityFault {
    fn from(err: TransactionError) -> Self {
        let kind = match err {
            TransactionError::Timeout(_) => FaultKind::Timeout,
            TransactionError::Persist(_) => FaultKind::Persistence,
            _ => FaultKind::Transaction,
        };
        ActivityFault::with_kind(kind, err.to_string())
    }
}

/// Vote handle given to an enlistment during phase one.
#[derive(Debug)]
pub struct PreparingEnlistment {
    vote: oneshot::Sender<bool>,
}

impl PreparingEnlistment {
    /// Vote to commit.
    pub fn prepared(self) {
        let _ = self.vote.send(true);
    }

    /// Vote to roll back.
    pub fn force_rollback(self) {
        let _ = self.vote.send(false);
    }
}

/// Two-phase notifications. Called from whatever task drives the commit.
pub trait EnlistmentNotification: Send + Sync {
    /// Phase one. The vote may be cast later, from another task.
    fn prepare(&self, enlistment: PreparingEnlistment);
    /// The transaction committed.
    fn commit(&self);
    /// The transaction rolled back.
    fn rollback(&self);
    /// The outcome is unknown.
    fn in_doubt(&self);
}

/// A transaction an activity can attach to the workflow.
#[async_trait]
pub trait Transaction: Send + Sync + fmt::Debug {
    /// Transaction id.
    fn id(&self) -> Uuid;

    /// Committable or dependent.
    fn kind(&self) -> TransactionKind;

    /// Current status.
    fn status(&self) -> TransactionStatus;

    /// A dependent clone safe to hand to other tasks.
    fn clone_transaction(&self) -> Arc<dyn Transaction>;

    /// Enlist a volatile participant.
    fn enlist_volatile(
        &self,
        enlistment: Arc<dyn EnlistmentNotification>,
    ) -> Result<(), TransactionError>;

    /// Run both phases. Only valid on a committable transaction.
    async fn commit(&self) -> Result<TransactionStatus, TransactionError>;

    /// Signal that a dependent clone's work is done.
    fn complete(&self);

    /// Roll back. No-op once decided.
    fn rollback(&self, reason: Option<&ActivityFault>);
}

struct LocalState {
    status: TransactionStatus,
    enlistments: Vec<Arc<dyn EnlistmentNotification>>,
    rollback_reason: Option<String>,
    completed_clones: u32,
}

struct LocalShared {
    id: Uuid,
    state: Mutex<LocalState>,
}

/// In-process two-phase transaction.
#[derive(Clone)]
pub struct LocalTransaction {
    shared: Arc<LocalShared>,
    kind: TransactionKind,
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("id", &self.shared.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl Default for LocalTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransaction {
    /// A new committable transaction.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LocalShared {
                id: Uuid::new_v4(),
                state: Mutex::new(LocalState {
                    status: TransactionStatus::Active,
                    enlistments: Vec::new(),
                    rollback_reason: None,
                    completed_clones: 0,
                }),
            }),
            kind: TransactionKind::Committable,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Message of the fault that caused a rollback, if any.
    pub fn rollback_reason(&self) -> Option<String> {
        self.lock().rollback_reason.clone()
    }

    /// Number of dependent clones that signalled completion.
    pub fn completed_clones(&self) -> u32 {
        self.lock().completed_clones
    }

    fn finish(&self, status: TransactionStatus) -> Vec<Arc<dyn EnlistmentNotification>> {
        let mut state = self.lock();
        if state.status != TransactionStatus::Active {
            return Vec::new();
        }
        state.status = status;
        state.enlistments.clone()
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    fn id(&self) -> Uuid {
        self.shared.id
    }

    fn kind(&self) -> TransactionKind {
        self.kind
    }

    fn status(&self) -> TransactionStatus {
        self.lock().status
    }

    fn clone_transaction(&self) -> Arc<dyn Transaction> {
        Arc::new(Self {
            shared: Arc::clone(&self.shared),
            kind: TransactionKind::Dependent,
        })
    }

    fn enlist_volatile(
        &self,
        enlistment: Arc<dyn EnlistmentNotification>,
    ) -> Result<(), TransactionError> {
        let mut state = self.lock();
        if state.status != TransactionStatus::Active {
            return Err(TransactionError::NotActive(self.shared.id));
        }
        state.enlistments.push(enlistment);
        Ok(())
    }

    async fn commit(&self) -> Result<TransactionStatus, TransactionError> {
        if self.kind == TransactionKind::Dependent {
            return Err(TransactionError::NotCommittable(self.shared.id));
        }
        let enlistments = {
            let state = self.lock();
            if state.status != TransactionStatus::Active {
                return Err(TransactionError::NotActive(self.shared.id));
            }
            state.enlistments.clone()
        };

        let mut all_prepared = true;
        for enlistment in &enlistments {
            let (vote, ballot) = oneshot::channel();
            enlistment.prepare(PreparingEnlistment { vote });
            if !matches!(ballot.await, Ok(true)) {
                all_prepared = false;
                break;
            }
        }

        let status = if all_prepared {
            TransactionStatus::Committed
        } else {
            TransactionStatus::Aborted
        };
        for enlistment in self.finish(status) {
            match status {
                TransactionStatus::Committed => enlistment.commit(),
                _ => enlistment.rollback(),
            }
        }
        tracing::debug!(transaction = %self.shared.id, ?status, "local transaction finished");
        Ok(self.status())
    }

    fn complete(&self) {
        if self.kind == TransactionKind::Dependent {
            self.lock().completed_clones += 1;
        }
    }

    fn rollback(&self, reason: Option<&ActivityFault>) {
        {
            let mut state = self.lock();
            if state.status == TransactionStatus::Active {
                state.rollback_reason = reason.map(|r| r.message.clone());
            }
        }
        for enlistment in self.finish(TransactionStatus::Aborted) {
            enlistment.rollback();
        }
    }
}
