// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracking records and participants.
//!
//! The executor buffers records as it works and hands the buffer to the runtime after
//! each work item; the runtime delivers it to every participant before the drain loop
//! continues. Record numbers are monotonic per workflow instance and survive
//! persistence.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ActivityFault, FaultKind};
use crate::instance::InstanceInfo;

/// Workflow-level lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceEvent {
    /// The root was scheduled.
    Started,
    /// The executor was rebuilt from an image.
    Resumed,
    /// The workflow completed successfully.
    Closed,
    /// The workflow completed canceled.
    Canceled,
    /// The workflow completed faulted.
    Faulted,
    /// The workflow was terminated.
    Terminated,
    /// The workflow was aborted.
    Aborted,
    /// A fault escaped the root.
    UnhandledException,
}

/// Record category, used by [`TrackingProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingRecordKind {
    /// Workflow lifecycle.
    WorkflowInstance,
    /// A child was scheduled.
    ActivityScheduled,
    /// An instance reached a terminal state.
    ActivityState,
    /// A bookmark was resumed.
    BookmarkResumption,
    /// Cancellation was requested for an instance.
    CancelRequested,
    /// A fault was routed to a handler (or escaped).
    FaultPropagation,
}

/// Record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackingEvent {
    /// Workflow lifecycle.
    WorkflowInstance {
        /// What happened.
        state: WorkflowInstanceEvent,
    },
    /// A child was scheduled.
    ActivityScheduled {
        /// Scheduling instance, `None` for roots.
        parent: Option<InstanceInfo>,
        /// New instance.
        child: InstanceInfo,
    },
    /// An instance completed.
    ActivityState {
        /// The instance, with its final state.
        instance: InstanceInfo,
    },
    /// A bookmark was resumed.
    BookmarkResumption {
        /// Bookmark description.
        bookmark: String,
        /// Owner.
        owner: InstanceInfo,
        /// Resumption value.
        payload: Value,
    },
    /// Cancellation requested.
    CancelRequested {
        /// Target instance.
        instance: InstanceInfo,
    },
    /// Fault routing.
    FaultPropagation {
        /// Where the fault came from.
        source: InstanceInfo,
        /// Handler owner, `None` when the fault escaped.
        handler: Option<InstanceInfo>,
        /// The fault.
        fault: ActivityFault,
    },
}

impl TrackingEvent {
    /// Category of this event.
    pub fn kind(&self) -> TrackingRecordKind {
        match self {
            Self::WorkflowInstance { .. } => TrackingRecordKind::WorkflowInstance,
            Self::ActivityScheduled { .. } => TrackingRecordKind::ActivityScheduled,
            Self::ActivityState { .. } => TrackingRecordKind::ActivityState,
            Self::BookmarkResumption { .. } => TrackingRecordKind::BookmarkResumption,
            Self::CancelRequested { .. } => TrackingRecordKind::CancelRequested,
            Self::FaultPropagation { .. } => TrackingRecordKind::FaultPropagation,
        }
    }
}

/// One tracking record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    /// Monotonic per workflow instance.
    pub record_number: u64,
    /// Workflow instance id.
    pub instance_id: Uuid,
    /// When the record was produced.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub event: TrackingEvent,
}

/// Which record kinds are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingProfile {
    kinds: BTreeSet<TrackingRecordKind>,
}

impl Default for TrackingProfile {
    fn default() -> Self {
        Self::all()
    }
}

impl TrackingProfile {
    /// Every kind.
    pub fn all() -> Self {
        Self::only([
            TrackingRecordKind::WorkflowInstance,
            TrackingRecordKind::ActivityScheduled,
            TrackingRecordKind::ActivityState,
            TrackingRecordKind::BookmarkResumption,
            TrackingRecordKind::CancelRequested,
            TrackingRecordKind::FaultPropagation,
        ])
    }

    /// Nothing.
    pub fn none() -> Self {
        Self {
            kinds: BTreeSet::new(),
        }
    }

    /// Only the listed kinds.
    pub fn only(kinds: impl IntoIterator<Item = TrackingRecordKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
        }
    }

    /// Whether `kind` is produced.
    pub fn is_enabled(&self, kind: TrackingRecordKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Delivery failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackingError {
    /// A participant rejected the records.
    #[error("tracking participant '{participant}' failed: {reason}")]
    Participant {
        /// Participant name.
        participant: String,
        /// Failure description.
        reason: String,
    },
}

impl From<TrackingError> for ActivityFault {
    fn from(err: TrackingError) -> Self {
        ActivityFault::with_kind(FaultKind::Tracking, err.to_string())
    }
}

/// Receives tracking records in order.
#[async_trait]
pub trait TrackingParticipant: Send + Sync {
    /// Name used in error reports.
    fn name(&self) -> &str;

    /// Deliver a batch.
    async fn track(&self, records: &[TrackingRecord]) -> Result<(), TrackingError>;
}

/// Participant that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryTrackingParticipant {
    records: Mutex<Vec<TrackingRecord>>,
}

impl MemoryTrackingParticipant {
    /// Create an empty participant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn records(&self) -> Vec<TrackingRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<TrackingEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

#[async_trait]
impl TrackingParticipant for MemoryTrackingParticipant {
    fn name(&self) -> &str {
        "memory"
    }

    async fn track(&self, records: &[TrackingRecord]) -> Result<(), TrackingError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }
}

/// Executor-side record buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TrackingBuffer {
    next_record: u64,
    #[serde(skip)]
    pending: Vec<TrackingRecord>,
}

impl TrackingBuffer {
    pub(crate) fn push(&mut self, instance_id: Uuid, event: TrackingEvent) {
        self.pending.push(TrackingRecord {
            record_number: self.next_record,
            instance_id,
            timestamp: Utc::now(),
            event,
        });
        self.next_record += 1;
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<TrackingRecord> {
        std::mem::take(&mut self.pending)
    }
}
