mod common;

use common::{assert_lifecycles_paired, count_of, first_of, memory_bus, parent_step_of};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use trellis::dag::{run_dag, DagConfig, DagRunner, NodeConfig, NodeInput, NodeState};
use trellis::events::EventSender;
use trellis::runnable::{NodeError, RunError, Runnable};

#[derive(Debug)]
struct Ctx {
    ctx_value: i64,
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or_else(|| panic!("not an integer: {value}"))
}

fn diamond() -> DagConfig<Ctx> {
    DagConfig::new("diamond", || Ctx { ctx_value: 5 })
        .add_node(
            "root",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                Ok(json!(input.context.ctx_value + 1))
            }),
        )
        .add_node(
            "intone",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                Ok(json!(int(input.parent("root").unwrap()) + 1))
            })
            .with_parent("root"),
        )
        .add_node(
            "inttwo",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                Ok(json!(int(input.parent("root").unwrap()) + 1))
            })
            .with_parent("root"),
        )
        .add_node(
            "collector",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                let one = int(input.parent("intone").unwrap());
                let two = int(input.parent("inttwo").unwrap());
                Ok(json!(one + two + int(&input.root_input)))
            })
            .with_parents(["intone", "inttwo"]),
        )
}

#[tokio::test]
async fn test_diamond_dag_output_and_events() {
    let (bus, sink) = memory_bus();
    let output = run_dag(diamond(), json!(10), bus.get_sender())
        .await
        .unwrap();
    assert_eq!(output, json!(24));

    bus.flush().await;
    let events = sink.snapshot();
    assert_eq!(count_of(&events, "dag:node_start"), 4);
    assert_eq!(count_of(&events, "dag:start"), 1);
    assert_eq!(count_of(&events, "dag:finish"), 1);
    assert_eq!(count_of(&events, "dag:node_error"), 0);
    assert_lifecycles_paired(&events);
    bus.stop_listener().await;
}

#[tokio::test]
async fn test_node_starts_link_to_workflow_step() {
    let (bus, sink) = memory_bus();
    run_dag(diamond(), json!(10), bus.get_sender())
        .await
        .unwrap();
    bus.flush().await;

    let events = sink.snapshot();
    let dag_start = first_of(&events, "dag:start");
    for event in events
        .iter()
        .filter(|event| event.event_type.as_str() == "dag:node_start")
    {
        assert_eq!(parent_step_of(event), Some(dag_start.step.clone()));
        assert_eq!(event.run_id, dag_start.run_id);
    }
    // Workflow-level ordering: dag:start first, dag:finish last.
    assert_eq!(events.first().unwrap().event_type.as_str(), "dag:start");
    assert_eq!(events.last().unwrap().event_type.as_str(), "dag:finish");
    bus.stop_listener().await;
}

#[tokio::test]
async fn test_empty_dag_is_rejected() {
    let dag = DagConfig::new("empty", || ());
    let err = run_dag(dag, json!(null), EventSender::disconnected())
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains("DAG has no nodes"),
        "unexpected message: {err}"
    );
}

fn two_leaves(fail_output_one: bool) -> DagConfig<Ctx> {
    let dag = DagConfig::new("fanout", || Ctx { ctx_value: 5 })
        .add_node(
            "root",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                Ok(json!(input.context.ctx_value + 1))
            }),
        )
        .add_node(
            "outputTwo",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                Ok(json!(int(input.parent("root").unwrap()) + 2))
            })
            .with_parent("root"),
        );
    if fail_output_one {
        dag.add_node(
            "outputOne",
            NodeConfig::new(|_input: NodeInput<Ctx>| async move {
                Err::<Value, _>(NodeError::msg("boom"))
            })
            .with_parent("root"),
        )
    } else {
        dag.add_node(
            "outputOne",
            NodeConfig::new(|input: NodeInput<Ctx>| async move {
                Ok(json!(int(input.parent("root").unwrap()) + 1))
            })
            .with_parent("root"),
        )
    }
}

#[tokio::test]
async fn test_multiple_leaves_collect_into_map() {
    let (bus, _sink) = memory_bus();
    let output = run_dag(two_leaves(false), json!(5), bus.get_sender())
        .await
        .unwrap();
    assert_eq!(output, json!({"outputOne": 7, "outputTwo": 8}));
    bus.stop_listener().await;
}

#[tokio::test]
async fn test_tolerate_failures_yields_partial_output() {
    let (bus, sink) = memory_bus();
    let output = run_dag(
        two_leaves(true).tolerate_failures(),
        json!(5),
        bus.get_sender(),
    )
    .await
    .unwrap();
    // The failed leaf contributes a null slot instead of sinking the run.
    assert_eq!(output, json!({"outputOne": null, "outputTwo": 8}));

    bus.flush().await;
    let events = sink.snapshot();
    assert_eq!(count_of(&events, "dag:node_error"), 1);
    assert_eq!(count_of(&events, "dag:finish"), 1);
    assert_eq!(count_of(&events, "dag:error"), 0);
    bus.stop_listener().await;
}

#[tokio::test]
async fn test_intolerant_failure_rejects_with_original_error() {
    let (bus, sink) = memory_bus();
    let err = run_dag(two_leaves(true), json!(5), bus.get_sender())
        .await
        .unwrap_err();
    match &err {
        RunError::NodeFailed { node, message } => {
            assert_eq!(node, "outputOne");
            assert_eq!(message, "boom");
        }
        other => panic!("expected NodeFailed, got {other:?}"),
    }

    bus.flush().await;
    let events = sink.snapshot();
    assert_eq!(count_of(&events, "dag:error"), 1);
    assert_eq!(count_of(&events, "dag:finish"), 0);
    bus.stop_listener().await;
}

#[tokio::test]
async fn test_first_error_cancels_all_other_nodes() {
    let dag = DagConfig::new("cascade", || ())
        .add_node(
            "bad",
            NodeConfig::new(|_input: NodeInput<()>| async move {
                sleep(Duration::from_millis(10)).await;
                Err::<Value, _>(NodeError::msg("exploded"))
            }),
        )
        .add_node(
            "slow",
            NodeConfig::new(|input: NodeInput<()>| async move {
                tokio::select! {
                    _ = input.cancel.cancelled() => Err(NodeError::Cancelled),
                    _ = sleep(Duration::from_secs(30)) => Ok(json!("too late")),
                }
            }),
        )
        .add_node(
            "downstream",
            NodeConfig::new(|_input: NodeInput<()>| async move { Ok(json!(1)) })
                .with_parent("bad"),
        );

    let runner = DagRunner::new(dag, json!(null)).unwrap();
    let err = runner.run().await.unwrap_err();
    assert!(err.to_string().contains("exploded"));

    // Quiescence: the failure cascaded and nothing is left mid-flight.
    assert_eq!(runner.node_state("bad"), Some(NodeState::Error));
    assert_eq!(runner.node_state("slow"), Some(NodeState::Cancelled));
    assert_eq!(runner.node_state("downstream"), Some(NodeState::Cancelled));
}

#[tokio::test]
async fn test_tolerated_parent_error_passes_null_input() {
    let dag = DagConfig::new("tolerant", || ())
        .add_node(
            "flaky",
            NodeConfig::new(|_input: NodeInput<()>| async move {
                Err::<Value, _>(NodeError::msg("nope"))
            }),
        )
        .add_node(
            "sturdy",
            NodeConfig::new(|input: NodeInput<()>| async move {
                assert_eq!(input.parent("flaky"), Some(&Value::Null));
                Ok(json!("ran anyway"))
            })
            .with_parent("flaky")
            .tolerate_parent_errors(),
        );

    let output = run_dag(
        dag.tolerate_failures(),
        json!(null),
        EventSender::disconnected(),
    )
    .await
    .unwrap();
    assert_eq!(output, json!("ran anyway"));
}

#[tokio::test]
async fn test_cancel_rejects_run() {
    let entered = Arc::new(tokio::sync::Notify::new());
    let entered_signal = entered.clone();
    let dag = DagConfig::new("cancellable", || ()).add_node(
        "stuck",
        NodeConfig::new(move |input: NodeInput<()>| {
            let entered = entered_signal.clone();
            async move {
                entered.notify_one();
                input.cancel.cancelled().await;
                Err::<Value, _>(NodeError::Cancelled)
            }
        }),
    );

    let runner = Arc::new(DagRunner::new(dag, json!(null)).unwrap());
    runner.clone().start();
    entered.notified().await;
    runner.cancel();
    let err = runner.finished().await.unwrap_err();
    assert!(matches!(err, RunError::Cancelled));
    assert_eq!(runner.node_state("stuck"), Some(NodeState::Cancelled));
}

#[tokio::test]
async fn test_manual_mode_waits_for_dispatch() {
    let dag = DagConfig::new("stepped", || ())
        .add_node(
            "first",
            NodeConfig::new(|_input: NodeInput<()>| async move { Ok(json!(1)) }),
        )
        .add_node(
            "second",
            NodeConfig::new(|input: NodeInput<()>| async move {
                Ok(json!(int(input.parent("first").unwrap()) + 1))
            })
            .with_parent("first"),
        );

    let runner = Arc::new(DagRunner::new(dag, json!(null)).unwrap().manual());
    runner.clone().start();

    let wait_for = |runner: Arc<DagRunner<()>>, node: &'static str, state: NodeState| async move {
        for _ in 0..200 {
            if runner.node_state(node) == Some(state) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("{node} never reached {state:?}");
    };

    wait_for(runner.clone(), "first", NodeState::Ready).await;
    // Dispatching an unready node is refused.
    assert!(!runner.dispatch("second"));
    assert!(runner.dispatch("first"));

    wait_for(runner.clone(), "second", NodeState::Ready).await;
    assert!(runner.dispatch("second"));

    let output = runner.finished().await.unwrap();
    assert_eq!(output, json!(2));
}

#[tokio::test]
async fn test_all_parents_errored_with_tolerance_still_runs() {
    let ran = Arc::new(AtomicUsize::new(0));
    let ran_probe = ran.clone();
    let dag = DagConfig::new("all-null", || ())
        .add_node(
            "a",
            NodeConfig::new(|_input: NodeInput<()>| async move {
                Err::<Value, _>(NodeError::msg("a failed"))
            }),
        )
        .add_node(
            "b",
            NodeConfig::new(|_input: NodeInput<()>| async move {
                Err::<Value, _>(NodeError::msg("b failed"))
            }),
        )
        .add_node(
            "join",
            NodeConfig::new(move |input: NodeInput<()>| {
                let ran = ran_probe.clone();
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(input.parent("a"), Some(&Value::Null));
                    assert_eq!(input.parent("b"), Some(&Value::Null));
                    Ok(json!("survived"))
                }
            })
            .with_parents(["a", "b"])
            .tolerate_parent_errors(),
        );

    let output = run_dag(
        dag.tolerate_failures(),
        json!(null),
        EventSender::disconnected(),
    )
    .await
    .unwrap();
    assert_eq!(output, json!("survived"));
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_single_leaf_output_passes_through_unwrapped() {
    let (bus, _sink) = memory_bus();
    let output = run_dag(diamond(), json!(0), bus.get_sender())
        .await
        .unwrap();
    // One leaf: the collector's value itself, not a one-key map.
    assert!(output.is_i64());
    bus.stop_listener().await;
}
