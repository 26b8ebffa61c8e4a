//! Integration tests for the engine's seed scenarios: an addition chain with
//! caching, streaming fan-out with and without the `stream` flag, a loop,
//! the final-invocation mix-in, and static rejection of an unresolvable
//! reference. Exercised through [`flowforge::facade::FlowForge`] the way a
//! real caller would use it, backed by `flowforge-testkit`'s fixture
//! actions plus a couple of counting actions local to this file.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use flowforge::action::{self, Action, ActionInputs, ActionOutputs};
use flowforge::facade::FlowForge;
use flowforge::registry::ActionRegistry;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CountingAddInputs {
    a: f64,
    b: f64,
}
impl ActionInputs for CountingAddInputs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CountingAddOutputs {
    result: f64,
}
impl ActionOutputs for CountingAddOutputs {
    fn default_output_field() -> Option<&'static str> {
        Some("result")
    }
}

/// Counts its own invocations, used to observe whether a cache hit actually
/// skipped calling the action a second time.
struct CountingAddAction {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Action for CountingAddAction {
    type Inputs = CountingAddInputs;
    type Outputs = CountingAddOutputs;

    fn name() -> &'static str {
        "counting_add"
    }

    async fn run(&self, inputs: Self::Inputs) -> flowforge::error::Result<Self::Outputs> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CountingAddOutputs { result: inputs.a + inputs.b })
    }
}

// E1: an addition chain, with the second run hitting the cache.
#[tokio::test]
async fn addition_chain_caches_across_runs() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ActionRegistry::new();
    registry.register(action::boxed(CountingAddAction { calls: calls.clone() }));

    let flow = r#"
flow:
  first:
    action: counting_add
    a: 1
    b: 2
  second:
    action: counting_add
    a: {var: first.result}
    b: 4
"#;
    let engine = FlowForge::from_text(flow, Arc::new(registry)).unwrap();

    let first = engine.run(Some("second.result")).await.unwrap();
    assert_eq!(first, json!(7.0));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let second = engine.run(Some("second.result")).await.unwrap();
    assert_eq!(second, json!(7.0));
    assert_eq!(calls.load(Ordering::SeqCst), 2, "second run should be served entirely from cache");
}

// E2: streaming fan-out — the sink re-invokes once per value its upstream
// streams, since its input declares `stream: true`.
#[tokio::test]
async fn streaming_dependency_reinvokes_per_partial_value() {
    let registry = flowforge_testkit::standard_registry();
    let flow = r#"
flow:
  double:
    action: double_add
    a: 1
    b: 2
  sink:
    action: add
    a: {var: double.result, stream: true}
    b: 1
"#;
    let engine = FlowForge::from_text(flow, Arc::new(registry)).unwrap();
    let values: Vec<_> = engine.stream(Some("sink.result")).collect().await;
    assert_eq!(values, vec![json!(4.0), json!(7.0)]);
}

// E3: the same flow without the `stream` flag only ever sees the upstream's
// final value.
#[tokio::test]
async fn non_streaming_dependency_only_sees_final_value() {
    let registry = flowforge_testkit::standard_registry();
    let flow = r#"
flow:
  double:
    action: double_add
    a: 1
    b: 2
  sink:
    action: add
    a: {var: double.result}
    b: 1
"#;
    let engine = FlowForge::from_text(flow, Arc::new(registry)).unwrap();
    let values: Vec<_> = engine.stream(Some("sink.result")).collect().await;
    assert_eq!(values, vec![json!(7.0)]);
}

// E4: a loop over a literal list, producing one result map per iteration in
// input order.
#[tokio::test]
async fn loop_produces_ordered_per_iteration_results() {
    let registry = flowforge_testkit::standard_registry();
    let flow = r#"
flow:
  it:
    for: x
    in: [0, 1, 2]
    flow:
      add:
        action: add
        a: {var: x}
        b: 3
"#;
    let engine = FlowForge::from_text(flow, Arc::new(registry)).unwrap();
    let result = engine.run(Some("it")).await.unwrap();
    assert_eq!(
        result,
        json!([
            {"add": {"result": 3.0}},
            {"add": {"result": 4.0}},
            {"add": {"result": 5.0}},
        ])
    );
}

// E5: an action that opts into the final-invocation mix-in sees `finished`
// go false for every streamed value and then once more, true, after its
// upstream's stream ends.
#[tokio::test]
async fn final_invocation_runs_once_after_upstream_stream_ends() {
    let mut registry = ActionRegistry::new();
    registry.register(action::boxed(flowforge_testkit::AddAction));
    registry.register(action::boxed(flowforge_testkit::DoubleAddAction));
    let (recorder, history) = flowforge_testkit::FinishedRecorderAction::new();
    registry.register(action::boxed(recorder));

    let flow = r#"
flow:
  source:
    action: double_add
    a: 1
    b: 2
  rec:
    action: finished_recorder
    value: {var: source.result, stream: true}
"#;
    let engine = FlowForge::from_text(flow, Arc::new(registry)).unwrap();
    let result = engine.run(Some("rec.finished")).await.unwrap();
    assert_eq!(result, json!(true));
    assert_eq!(*history.lock(), vec![false, false, true]);
}

// E6: a flow referencing an unresolvable identifier is rejected by the
// static checker before any action runs.
#[tokio::test]
async fn unresolvable_reference_is_rejected_before_execution() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ActionRegistry::new();
    registry.register(action::boxed(CountingAddAction { calls: calls.clone() }));

    let flow = r#"
flow:
  first:
    action: counting_add
    a: "{{ missing }}"
    b: 2
"#;
    let engine = FlowForge::from_text(flow, Arc::new(registry)).unwrap();

    let errors = flowforge::checker::check(
        &flowforge::flow::ActionConfig::from_yaml(flow).unwrap(),
        &HashSet::new(),
        "first.result",
    );
    assert_eq!(errors, vec![flowforge::checker::CheckError::UnknownDependency("missing".to_string())]);

    let result = engine.run(Some("first.result")).await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 0, "checker must reject the flow before the action ever runs");
}
