//! Control-flow semantics: conditionals, loops, foreach, break/continue

use flowspell_engine::test_utils::{steps, DefinitionBuilder};
use flowspell_engine::WorkflowService;
use serde_json::json;
use std::collections::BTreeMap;

/// Spec scenario: a while loop with a conditional break stops at 3.
#[tokio::test]
async fn test_while_with_conditional_break() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("count_to_three")
        .default_state("counter", json!(0))
        .step(steps::while_loop(
            "loop",
            "state.counter < 10",
            20,
            vec![
                steps::increment("inc", "state.counter", json!(1)),
                steps::conditional(
                    "check",
                    "state.counter == 3",
                    vec![steps::break_step("stop")],
                    vec![],
                ),
            ],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("count_to_three", BTreeMap::new()).unwrap();

    // everything is server-internal: one call drives it to completion
    let batch = service
        .get_next_step(&started.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(batch.steps.is_empty());
    assert!(!batch.server_completed_steps.is_empty());

    let status = service.status(&started.workflow_id).await.unwrap();
    assert_eq!(status.status.as_str(), "completed");
    assert_eq!(status.state.state["counter"], json!(3));
}

/// An always-true condition terminates exactly at max_iterations with
/// MAX_ITERATIONS_EXCEEDED.
#[tokio::test]
async fn test_while_max_iterations_exceeded() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("runaway")
        .default_state("counter", json!(0))
        .step(steps::while_loop(
            "loop",
            "true",
            3,
            vec![steps::increment("inc", "state.counter", json!(1))],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("runaway", BTreeMap::new()).unwrap();

    let err = service.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(err.code(), "MAX_ITERATIONS_EXCEEDED");

    let status = service.status(&started.workflow_id).await.unwrap();
    assert_eq!(status.status.as_str(), "failed");
    // the body ran exactly max_iterations times
    assert_eq!(status.state.state["counter"], json!(3));

    // terminal error is repeated on subsequent calls
    let err = service.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(err.code(), "MAX_ITERATIONS_EXCEEDED");
}

#[tokio::test]
async fn test_foreach_binds_item_index_total() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("fanless")
        .default_state("files", json!(["a.ts", "b.ts", "c.ts"]))
        .default_state("seen", json!([]))
        .step(steps::foreach(
            "each",
            "{{ state.files }}",
            vec![flowspell_core::Step::new(
                "note",
                flowspell_core::StepKind::StateUpdate {
                    updates: vec![flowspell_core::UpdateOp::append(
                        "state.seen",
                        json!("{{ loop.index }}/{{ loop.total }}:{{ loop.item }}"),
                    )],
                },
            )],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("fanless", BTreeMap::new()).unwrap();

    service.get_next_step(&started.workflow_id).await.unwrap();
    let status = service.status(&started.workflow_id).await.unwrap();
    assert_eq!(status.status.as_str(), "completed");
    assert_eq!(
        status.state.state["seen"],
        json!(["0/3:a.ts", "1/3:b.ts", "2/3:c.ts"])
    );
}

#[tokio::test]
async fn test_foreach_empty_sequence_is_a_no_op() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("empty_each")
        .default_state("files", json!([]))
        .default_state("ran", json!(false))
        .step(steps::foreach(
            "each",
            "{{ state.files }}",
            vec![steps::set("mark", "state.ran", json!(true))],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("empty_each", BTreeMap::new()).unwrap();

    service.get_next_step(&started.workflow_id).await.unwrap();
    let status = service.status(&started.workflow_id).await.unwrap();
    assert_eq!(status.status.as_str(), "completed");
    assert_eq!(status.state.state["ran"], json!(false));
}

#[tokio::test]
async fn test_foreach_over_non_iterable_fails() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("bad_each")
        .default_state("files", json!(42))
        .step(steps::foreach(
            "each",
            "{{ state.files }}",
            vec![steps::message("m", "x")],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("bad_each", BTreeMap::new()).unwrap();

    let err = service.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(err.code(), "NON_ITERABLE");
}

#[tokio::test]
async fn test_continue_skips_to_next_iteration() {
    let service = WorkflowService::new();
    // collect only odd numbers: even indices hit `continue` before the append
    let definition = DefinitionBuilder::new("odds")
        .default_state("nums", json!([1, 2, 3, 4, 5]))
        .default_state("odds", json!([]))
        .step(steps::foreach(
            "each",
            "{{ state.nums }}",
            vec![
                steps::conditional(
                    "skip_even",
                    "item % 2 == 0",
                    vec![steps::continue_step("next")],
                    vec![],
                ),
                flowspell_core::Step::new(
                    "keep",
                    flowspell_core::StepKind::StateUpdate {
                        updates: vec![flowspell_core::UpdateOp::append(
                            "state.odds",
                            json!("{{ item }}"),
                        )],
                    },
                ),
            ],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("odds", BTreeMap::new()).unwrap();

    service.get_next_step(&started.workflow_id).await.unwrap();
    let status = service.status(&started.workflow_id).await.unwrap();
    assert_eq!(status.status.as_str(), "completed");
    assert_eq!(status.state.state["odds"], json!([1, 3, 5]));
}

#[tokio::test]
async fn test_break_outside_loop_is_a_runtime_error() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("stray_break")
        .step(steps::break_step("oops"))
        .build();
    service.register(definition).unwrap();
    let started = service.start("stray_break", BTreeMap::new()).unwrap();

    let err = service.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(err.code(), "BREAK_OUTSIDE_LOOP");
}

#[tokio::test]
async fn test_continue_outside_loop_is_a_runtime_error() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("stray_continue")
        .step(steps::continue_step("oops"))
        .build();
    service.register(definition).unwrap();
    let started = service.start("stray_continue", BTreeMap::new()).unwrap();

    let err = service.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(err.code(), "CONTINUE_OUTSIDE_LOOP");
}

/// Break inside a nested construct jumps to the innermost enclosing loop.
#[tokio::test]
async fn test_break_targets_innermost_loop() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("nested")
        .default_state("outer_runs", json!(0))
        .default_state("inner_runs", json!(0))
        .step(steps::foreach(
            "outer",
            "[1, 2]",
            vec![
                steps::increment("outer_inc", "state.outer_runs", json!(1)),
                steps::while_loop(
                    "inner",
                    "true",
                    10,
                    vec![
                        steps::increment("inner_inc", "state.inner_runs", json!(1)),
                        steps::break_step("stop_inner"),
                    ],
                ),
            ],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("nested", BTreeMap::new()).unwrap();

    service.get_next_step(&started.workflow_id).await.unwrap();
    let status = service.status(&started.workflow_id).await.unwrap();
    assert_eq!(status.status.as_str(), "completed");
    // the inner break never touches the outer foreach
    assert_eq!(status.state.state["outer_runs"], json!(2));
    assert_eq!(status.state.state["inner_runs"], json!(2));
}

#[tokio::test]
async fn test_condition_eval_error_fails_the_workflow() {
    let service = WorkflowService::new();
    let definition = DefinitionBuilder::new("bad_condition")
        .step(steps::conditional(
            "broken",
            "1 +++",
            vec![steps::message("m", "never")],
            vec![],
        ))
        .build();
    service.register(definition).unwrap();
    let started = service.start("bad_condition", BTreeMap::new()).unwrap();

    let err = service.get_next_step(&started.workflow_id).await.unwrap_err();
    assert_eq!(err.code(), "CONDITION_EVAL_ERROR");
}
