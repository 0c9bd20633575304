// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Executor - Activity-Tree Execution Engine
//!
//! This crate runs suspendable workflows made of nested activities. One workflow
//! instance is a tree of activity instances driven by a single scheduler; an activity
//! never blocks, it schedules children, creates bookmarks or starts async operations
//! and is called back when they complete. At any point where the instance is
//! persistable its whole state can be captured as an image and resumed later, in
//! another process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Host                                      │
//! │        (resume bookmarks, cancel, terminate, persist, load)             │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  WorkflowRuntime / WorkflowInstance                     │
//! │      drain cycles, yield between batches, perform suspended I/O,        │
//! │                 apply the unhandled-exception policy                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ drain_cycle / complete_pending_operation     │ save / load / keys / track
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │   ActivityExecutor    │                    │ InstanceStore (memory,      │
//! │  scheduler, instance  │                    │   SQLite), tracking         │
//! │  tree, bookmarks,     │                    │   participants              │
//! │  environments         │                    └─────────────────────────────┘
//! └───────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │  Activity (user code) │
//! │  via ActivityContext  │
//! └───────────────────────┘
//! ```
//!
//! # Work Item Pipeline
//!
//! Each scheduled work item is processed in the same order:
//!
//! 1. **Release**: the owning instance stops counting the item as outstanding work
//! 2. **Validity check**: items bound to a completed instance are disposed
//! 3. **Execute**: the activity callback runs (may suspend on persist/commit I/O)
//! 4. **Workflow abort**: a requested abort stops the pipeline
//! 5. **Key updates**: bookmark scope key changes are flushed to the store
//! 6. **Post-process**: faulted instances are aborted, others re-evaluated and completed
//! 7. **Fault propagation**: faults travel to the nearest fault callback
//! 8. **Tracking**: buffered records are delivered to participants
//! 9. **Runtime items**: transaction completion and persistence waiters are scheduled
//! 10. **Dispose**: no-persist blocks the item held are released
//!
//! # Instance States
//!
//! ```text
//!                   ┌────────────┐
//!                   │ EXECUTING  │
//!                   └─────┬──────┘
//!          ┌──────────────┼──────────────┐
//!          ▼              ▼              ▼
//!    ┌──────────┐   ┌──────────┐   ┌──────────┐
//!    │  CLOSED  │   │ CANCELED │   │ FAULTED  │
//!    └──────────┘   └──────────┘   └──────────┘
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables by
//! [`ExecutorConfig::from_env`](config::ExecutorConfig::from_env):
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNTARA_EXECUTOR_MAX_BATCH` | No | `256` | Work items per drain cycle |
//! | `RUNTARA_EXECUTOR_TRANSACTION_TIMEOUT_MS` | No | `30000` | Transaction outcome timeout |
//! | `RUNTARA_EXECUTOR_PERSIST_EXCEPTIONS` | No | `false` | Allow persisting while a fault propagates |
//! | `RUNTARA_EXECUTOR_UNHANDLED_ACTION` | No | `terminate` | `terminate`, `cancel` or `abort` |

#![warn(missing_docs)]

/// Activity trait, argument and variable declarations, workflow definitions.
pub mod activity;

/// Bookmarks and bookmark scopes.
pub mod bookmark;

/// Executor configuration loaded from environment variables.
pub mod config;

/// The API activities call while they run.
pub mod context;

/// Location environments holding arguments and variables.
pub mod environment;

/// Error types with error code mapping.
pub mod error;

/// The activity executor.
pub mod executor;

/// Typed host services reachable from activities.
pub mod extensions;

/// Activity instances and the instance arena.
pub mod instance;

/// Host-provided async operations.
pub mod operation;

/// Instance stores for images and correlation keys.
pub mod persistence;

/// Embeddable runtime that drives executors.
pub mod runtime;

/// The work item queue.
pub mod scheduler;

/// Serializable executor images.
pub mod snapshot;

/// Tracking records and participants.
pub mod tracking;

/// Ambient transactions.
pub mod transaction;

/// Work items and their pool.
pub mod work_item;

pub use activity::{Activity, ActivityId, ArgumentSpec, Binding, VariableSpec, WorkflowDefinition};
pub use bookmark::{Bookmark, BookmarkOptions, BookmarkResumptionResult, BookmarkScope};
pub use config::ExecutorConfig;
pub use context::{ActivityContext, ChildCallbacks, FaultContext, TransactionContext};
pub use error::{ActivityFault, ExecutorError, FaultKind, Result};
pub use executor::{ActivityExecutor, DrainOutcome, ExecutorServices};
pub use instance::{ActivityInstanceState, InstanceId};
pub use runtime::{RunOutcome, WorkflowInstance, WorkflowRuntime};
