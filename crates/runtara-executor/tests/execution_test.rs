// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for scheduling, bookmarks, cancellation and data flow.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use runtara_executor::activity::{Activity, ArgumentSpec, Binding, VariableSpec};
use runtara_executor::bookmark::{Bookmark, BookmarkResumptionResult};
use runtara_executor::config::ExecutorConfig;
use runtara_executor::context::ActivityContext;
use runtara_executor::error::ActivityFault;
use runtara_executor::instance::ActivityInstanceState;
use runtara_executor::runtime::{RunOutcome, WorkflowRuntime};

#[tokio::test]
async fn test_sequence_runs_children_in_order() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            Record::new("first", &journal),
            Record::new("second", &journal),
            Record::new("third", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(journal.entries(), vec!["first", "second", "third"]);
    assert!(instance.executor().is_completed());
    assert_eq!(instance.executor().no_persist_count(), 0);
}

#[tokio::test]
async fn test_small_batches_yield_and_still_complete() {
    init_tracing();
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        (0..5)
            .map(|i| Record::new(&format!("step-{}", i), &journal))
            .collect(),
    ));
    let runtime = WorkflowRuntime::builder()
        .config(ExecutorConfig {
            max_work_items_per_cycle: 1,
            ..ExecutorConfig::default()
        })
        .build()
        .unwrap();

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(journal.entries().len(), 5);
}

#[tokio::test]
async fn test_bookmark_resumption_continues_workflow() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            WaitForBookmark::new("approve", &journal),
            Record::new("after", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    assert_eq!(instance.run().await.unwrap(), RunOutcome::Idle);

    let bookmarks = instance.bookmarks(None);
    assert_eq!(bookmarks.len(), 1);
    assert_eq!(bookmarks[0].name, "approve");
    assert_eq!(bookmarks[0].owner_display_name, "approve");

    let result = instance.resume_bookmark(&Bookmark::named("approve"), json!("yes"));
    assert_eq!(result, BookmarkResumptionResult::Success);

    let outcome = instance.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(journal.entries(), vec!["approve:\"yes\"", "after"]);
    assert!(instance.bookmarks(None).is_empty());
}

#[tokio::test]
async fn test_unknown_bookmark_is_not_found() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![WaitForBookmark::new("approve", &journal)],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    instance.run().await.unwrap();

    let result = instance.resume_bookmark(&Bookmark::named("reject"), json!(null));
    assert_eq!(result, BookmarkResumptionResult::NotFound);
    assert_eq!(instance.bookmarks(None).len(), 1);
}

#[tokio::test]
async fn test_bookmark_resumed_twice_is_not_found_the_second_time() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            WaitForBookmark::new("approve", &journal),
            WaitForBookmark::new("ship", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    instance.run().await.unwrap();

    let approve = Bookmark::named("approve");
    assert_eq!(
        instance.resume_bookmark(&approve, json!(1)),
        BookmarkResumptionResult::Success
    );
    assert_eq!(instance.run().await.unwrap(), RunOutcome::Idle);
    assert_eq!(
        instance.resume_bookmark(&approve, json!(2)),
        BookmarkResumptionResult::NotFound
    );
}

#[tokio::test]
async fn test_cancel_drops_outstanding_bookmarks() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            WaitForBookmark::new("never", &journal),
            Record::new("after", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    assert_eq!(instance.run().await.unwrap(), RunOutcome::Idle);

    instance.cancel().unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Canceled));
    assert!(journal.entries().is_empty());
    assert!(instance.bookmarks(None).is_empty());
    assert_eq!(
        instance.resume_bookmark(&Bookmark::named("never"), json!(null)),
        BookmarkResumptionResult::NotFound
    );
}

#[tokio::test]
async fn test_async_operation_completes_from_spawned_task() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            Arc::new(AsyncCall {
                value: json!(5),
                journal: Arc::clone(&journal),
            }),
            Record::new("after", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(journal.entries(), vec!["async:5", "after"]);
    assert!(!instance.executor().has_active_operations());
}

/// Hands its operation to a task that gives up without reporting.
#[derive(Debug)]
struct LostCall;

impl Activity for LostCall {
    fn display_name(&self) -> &str {
        "lost-call"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFault> {
        let handle = ctx.begin_async_operation(Some("done"))?;
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            drop(handle);
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_lost_async_operation_faults_instead_of_hanging() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![Arc::new(LostCall), Record::new("after", &journal)],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), instance.run())
        .await
        .expect("run waits forever on a dropped handle")
        .unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Faulted));
    assert!(journal.entries().is_empty());
    assert!(!instance.executor().has_active_operations());
}

#[tokio::test]
async fn test_root_arguments_variables_and_expressions() {
    let journal = Journal::new();
    let calc = Sequence::new("calc", vec![Echo::new("x", &journal), Echo::new("y", &journal)])
        .with_argument(ArgumentSpec::input(
            "x",
            Binding::Expression(Arc::new(Constant(json!(42)))),
        ))
        .with_variable(VariableSpec::computed("y", Arc::new(Constant(json!("z")))));
    let root = Arc::new(
        Sequence::new(
            "main",
            vec![Echo::new("greeting", &journal), Echo::new("count", &journal), Arc::new(calc)],
        )
        .with_argument(ArgumentSpec::input("greeting", Binding::Literal(json!("hi"))))
        .with_variable(VariableSpec::new("count", json!(1))),
    );

    let mut inputs = BTreeMap::new();
    inputs.insert("greeting".to_string(), json!("hello"));
    let mut instance = runtime().create(definition(root), inputs).unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(
        journal.entries(),
        vec!["greeting=\"hello\"", "count=1", "x=42", "y=\"z\""]
    );
}

#[tokio::test]
async fn test_unknown_root_input_is_rejected() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new("main", vec![Record::new("a", &journal)]));

    let mut inputs = BTreeMap::new();
    inputs.insert("missing".to_string(), json!(1));
    let err = runtime().create(definition(root), inputs).unwrap_err();
    assert_eq!(err.error_code(), "INVALID_OPERATION");
}

#[tokio::test]
async fn test_out_arguments_flow_to_parent_and_workflow_outputs() {
    let journal = Journal::new();
    let inner = Sequence::new(
        "inner",
        vec![Arc::new(Assign {
            location: "out".to_string(),
            value: json!(7),
        })],
    )
    .with_argument(ArgumentSpec::output_to("out", "total"));
    let root = Arc::new(
        Sequence::new(
            "main",
            vec![
                Arc::new(inner),
                Echo::new("total", &journal),
                Arc::new(Assign {
                    location: "answer".to_string(),
                    value: json!(42),
                }),
            ],
        )
        .with_variable(VariableSpec::new("total", json!(0)))
        .with_argument(ArgumentSpec::output("answer")),
    );

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(journal.entries(), vec!["total=7"]);
    assert_eq!(
        instance.executor().workflow_outputs().get("answer"),
        Some(&json!(42))
    );
}

#[tokio::test]
async fn test_secondary_root_keeps_workflow_open() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            Arc::new(Spawner {
                child: WaitForBookmark::new("side", &journal),
                journal: Arc::clone(&journal),
            }),
            Record::new("main-done", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    assert_eq!(instance.run().await.unwrap(), RunOutcome::Idle);
    assert_eq!(journal.entries(), vec!["spawned", "main-done"]);
    assert!(!instance.executor().is_completed());

    assert_eq!(
        instance.resume_bookmark(&Bookmark::named("side"), json!("go")),
        BookmarkResumptionResult::Success
    );
    let outcome = instance.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
}

#[tokio::test]
async fn test_terminate_from_activity_faults_workflow() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![
            Arc::new(Terminator {
                message: "stop here".to_string(),
            }),
            WaitForBookmark::new("never", &journal),
        ],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Faulted));
    let reason = instance.executor().completion_exception().unwrap();
    assert_eq!(reason.message, "stop here");
}

#[tokio::test]
async fn test_host_terminate_while_idle() {
    let journal = Journal::new();
    let root = Arc::new(Sequence::new(
        "main",
        vec![WaitForBookmark::new("never", &journal)],
    ));

    let mut instance = runtime()
        .create(definition(root), BTreeMap::new())
        .unwrap();
    assert_eq!(instance.run().await.unwrap(), RunOutcome::Idle);

    instance.terminate(runtara_executor::ActivityFault::new("operator"));
    let outcome = instance.run().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Faulted));
    assert!(instance.bookmarks(None).is_empty());
}

#[derive(Debug)]
struct Greeter {
    prefix: String,
}

/// Looks up the [`Greeter`] extension and journals a greeting.
#[derive(Debug)]
struct Greet {
    journal: Arc<Journal>,
}

impl Activity for Greet {
    fn display_name(&self) -> &str {
        "greet"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<(), ActivityFault> {
        let greeter = ctx
            .extension::<Greeter>()
            .ok_or_else(|| ActivityFault::new("greeter extension missing"))?;
        self.journal.push(format!("{} world", greeter.prefix));
        Ok(())
    }
}

#[tokio::test]
async fn test_activities_reach_host_extensions() {
    init_tracing();
    let journal = Journal::new();
    let runtime = WorkflowRuntime::builder()
        .extension(Arc::new(Greeter {
            prefix: "hello".to_string(),
        }))
        .build()
        .unwrap();
    let root = Arc::new(Greet {
        journal: Arc::clone(&journal),
    });

    let mut instance = runtime.create(definition(root), BTreeMap::new()).unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Closed));
    assert_eq!(journal.entries(), vec!["hello world"]);
}

#[tokio::test]
async fn test_missing_extension_faults_activity() {
    let journal = Journal::new();
    let root = Arc::new(Greet {
        journal: Arc::clone(&journal),
    });

    let mut instance = runtime().create(definition(root), BTreeMap::new()).unwrap();
    let outcome = instance.run().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed(ActivityInstanceState::Faulted));
    assert!(journal.entries().is_empty());
}
