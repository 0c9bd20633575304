// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for tracking record delivery.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::*;
use runtara_executor::bookmark::Bookmark;
use runtara_executor::error::FaultKind;
use runtara_executor::instance::ActivityInstanceState;
use runtara_executor::runtime::{RunOutcome, WorkflowRuntime};
use runtara_executor::tracking::{
    MemoryTrackingParticipant, TrackingError, TrackingEvent, TrackingParticipant, TrackingProfile,
    TrackingRecord, TrackingRecordKind, WorkflowInstanceEvent,
};

struct FailingParticipant;

#[async_trait]
impl TrackingParticipant for FailingParticipant {
    fn name(&self) -> &str {
        "failing"
    }

    async fn track(&self, _records: &[TrackingRecord]) -> Result<(), TrackingError> {
        Err(TrackingError::Participant {
            participant: "failing".to_string(),
            reason: "sink unavailable".to_string(),
        })
    }
}

fn workflow_events(participant: &MemoryTrackingParticipant) -> Vec<WorkflowInstanceEvent> {
    participant
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TrackingEvent::WorkflowInstance { state } => Some(state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_records_are_delivered_in_order() {
    init_tracing();
    let journal = Journal::new();
    let participant = Arc::new(MemoryTrackingParticipant::new());
    let runtime = WorkflowRuntime::builder()
        .tracking_participant(participant.clone())
        .build()
        .unwrap();
    let root = Arc::new(Sequence::new(
        "main",
        vec![Record::new("a", &journal), Record::new("b", &journal)],
    ));

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    let outcome = instance.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));

    let records = participant.records();
    assert!(!records.is_empty());
    assert!(records.windows(2).all(|w| w[0].record_number < w[1].record_number));
    assert!(records.iter().all(|r| r.instance_id == instance.id()));
    assert_eq!(
        workflow_events(&participant),
        vec![WorkflowInstanceEvent::Started, WorkflowInstanceEvent::Closed]
    );

    let closed: Vec<String> = participant
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TrackingEvent::ActivityState { instance } => Some(instance.display_name),
            _ => None,
        })
        .collect();
    assert_eq!(closed, vec!["a", "b", "main"]);
}

#[tokio::test]
async fn test_profile_filters_record_kinds() {
    init_tracing();
    let journal = Journal::new();
    let participant = Arc::new(MemoryTrackingParticipant::new());
    let runtime = WorkflowRuntime::builder()
        .tracking_participant(participant.clone())
        .tracking_profile(TrackingProfile::only([TrackingRecordKind::BookmarkResumption]))
        .build()
        .unwrap();
    let root = Arc::new(Sequence::new(
        "main",
        vec![WaitForBookmark::new("approve", &journal)],
    ));

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    instance.run().await.unwrap();
    assert!(participant.records().is_empty());

    instance.resume_bookmark(&Bookmark::named("approve"), json!(1));
    instance.run().await.unwrap();

    let events = participant.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        TrackingEvent::BookmarkResumption {
            bookmark, payload, ..
        } => {
            assert_eq!(bookmark, "approve");
            assert_eq!(payload, &json!(1));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_fault_propagation_is_tracked() {
    init_tracing();
    let journal = Journal::new();
    let participant = Arc::new(MemoryTrackingParticipant::new());
    let runtime = WorkflowRuntime::builder()
        .tracking_participant(participant.clone())
        .tracking_profile(TrackingProfile::only([TrackingRecordKind::FaultPropagation]))
        .build()
        .unwrap();
    let root = Arc::new(Sequence::new(
        "main",
        vec![Arc::new(TryCatch::handling(Throw::new("boom"), &journal))],
    ));

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    instance.run().await.unwrap();

    let events = participant.events();
    assert_eq!(events.len(), 1);
    match &events[0] {
        TrackingEvent::FaultPropagation {
            source,
            handler,
            fault,
        } => {
            assert_eq!(source.display_name, "throw");
            assert_eq!(handler.as_ref().map(|h| h.display_name.as_str()), Some("try"));
            assert_eq!(fault.message, "boom");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_record_numbers_continue_after_restore() {
    init_tracing();
    let journal = Journal::new();
    let participant = Arc::new(MemoryTrackingParticipant::new());
    let runtime = WorkflowRuntime::builder()
        .tracking_participant(participant.clone())
        .build()
        .unwrap();
    let definition = definition(Arc::new(Sequence::new(
        "main",
        vec![WaitForBookmark::new("approve", &journal)],
    )));

    let mut instance = runtime
        .create(Arc::clone(&definition), BTreeMap::new())
        .unwrap();
    instance.run().await.unwrap();
    let image = instance.persist().await.unwrap();
    let last_before = participant.records().last().unwrap().record_number;

    let mut restored = runtime.restore(&image, definition).unwrap();
    restored.resume_bookmark(&Bookmark::named("approve"), json!(null));
    restored.run().await.unwrap();

    let records = participant.records();
    let first_after = records
        .iter()
        .find(|r| {
            matches!(
                r.event,
                TrackingEvent::WorkflowInstance {
                    state: WorkflowInstanceEvent::Resumed
                }
            )
        })
        .unwrap();
    assert!(first_after.record_number > last_before);
}

#[tokio::test]
async fn test_participant_failure_aborts_workflow() {
    init_tracing();
    let journal = Journal::new();
    let runtime = WorkflowRuntime::builder()
        .tracking_participant(Arc::new(FailingParticipant))
        .build()
        .unwrap();
    let root = Arc::new(Sequence::new("main", vec![Record::new("a", &journal)]));

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    let outcome = instance.run().await.unwrap();

    match outcome {
        RunOutcome::Aborted(reason) => {
            assert_eq!(reason.kind, FaultKind::WorkflowAborted);
            assert_eq!(reason.root_cause().kind, FaultKind::Tracking);
        }
        other => panic!("expected abort, got {:?}", other),
    }
    assert!(!instance.executor().is_completed());
}

#[tokio::test]
async fn test_cancel_completes_deepest_instance_first() {
    init_tracing();
    let journal = Journal::new();
    let participant = Arc::new(MemoryTrackingParticipant::new());
    let runtime = WorkflowRuntime::builder()
        .tracking_participant(participant.clone())
        .tracking_profile(TrackingProfile::only([TrackingRecordKind::ActivityState]))
        .build()
        .unwrap();
    let root = Arc::new(Sequence::new(
        "main",
        vec![Arc::new(Sequence::new(
            "inner",
            vec![WaitForBookmark::new("approve", &journal)],
        ))],
    ));

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    assert_eq!(instance.run().await.unwrap(), RunOutcome::Idle);
    assert!(participant.records().is_empty());

    instance.cancel().unwrap();
    let outcome = instance.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Canceled));

    let completed: Vec<(String, ActivityInstanceState)> = participant
        .events()
        .into_iter()
        .filter_map(|event| match event {
            TrackingEvent::ActivityState { instance } => {
                Some((instance.display_name, instance.state))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        completed,
        vec![
            ("approve".to_string(), ActivityInstanceState::Canceled),
            ("inner".to_string(), ActivityInstanceState::Canceled),
            ("main".to_string(), ActivityInstanceState::Canceled),
        ]
    );
    assert!(instance.bookmarks(None).is_empty());
    assert!(journal.entries().is_empty());
}
