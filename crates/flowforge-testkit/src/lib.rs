//! Reference action fixtures used to exercise the engine end-to-end (spec
//! §8's seed scenarios E1–E5): a single-shot adder, a streaming variant
//! that emits a running total then its double, and a final-invocation
//! recorder.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use flowforge::action::{self, Action, ActionInputs, ActionOutputs, ExecutionShape};
use flowforge::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddInputs {
    pub a: f64,
    pub b: f64,
}
impl ActionInputs for AddInputs {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOutputs {
    pub result: f64,
}
impl ActionOutputs for AddOutputs {
    fn default_output_field() -> Option<&'static str> {
        Some("result")
    }
}

/// `add(a, b) -> { result: a + b }`, single-shot and cached (E1).
pub struct AddAction;

#[async_trait]
impl Action for AddAction {
    type Inputs = AddInputs;
    type Outputs = AddOutputs;

    fn name() -> &'static str {
        "add"
    }

    async fn run(&self, inputs: Self::Inputs) -> Result<Self::Outputs> {
        Ok(AddOutputs { result: inputs.a + inputs.b })
    }
}

/// `double_add(a, b)` streams `{result: a+b}` then `{result: (a+b)*2}` (E2/E3).
pub struct DoubleAddAction;

#[async_trait]
impl Action for DoubleAddAction {
    type Inputs = AddInputs;
    type Outputs = AddOutputs;

    fn name() -> &'static str {
        "double_add"
    }

    fn shape() -> ExecutionShape {
        ExecutionShape::Streaming
    }

    fn run_streaming(
        &self,
        inputs: Self::Inputs,
    ) -> Pin<Box<dyn Stream<Item = Result<Self::Outputs>> + Send + '_>> {
        let sum = inputs.a + inputs.b;
        action::stream_of(vec![Ok(AddOutputs { result: sum }), Ok(AddOutputs { result: sum * 2.0 })])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderInputs {
    pub value: serde_json::Value,
    #[serde(skip)]
    finished: bool,
}
impl ActionInputs for RecorderInputs {
    fn wants_final_invocation() -> bool {
        true
    }
    fn set_finished(&mut self, finished: bool) {
        self.finished = finished;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderOutputs {
    pub finished: bool,
}
impl ActionOutputs for RecorderOutputs {
    fn default_output_field() -> Option<&'static str> {
        Some("finished")
    }
}

/// Records the `finished` flag of every invocation it receives (E5). The
/// history is exposed through the `Arc<Mutex<Vec<bool>>>` returned
/// alongside the action, since the scheduler only ever sees the action
/// behind a type-erased `Arc<dyn DynAction>`.
pub struct FinishedRecorderAction {
    history: Arc<Mutex<Vec<bool>>>,
}

impl FinishedRecorderAction {
    pub fn new() -> (Self, Arc<Mutex<Vec<bool>>>) {
        let history = Arc::new(Mutex::new(Vec::new()));
        (Self { history: history.clone() }, history)
    }
}

#[async_trait]
impl Action for FinishedRecorderAction {
    type Inputs = RecorderInputs;
    type Outputs = RecorderOutputs;

    fn name() -> &'static str {
        "finished_recorder"
    }

    fn cache() -> bool {
        false
    }

    async fn run(&self, inputs: Self::Inputs) -> Result<Self::Outputs> {
        self.history.lock().push(inputs.finished);
        Ok(RecorderOutputs { finished: inputs.finished })
    }
}

/// Registers [`AddAction`], [`DoubleAddAction`] into a fresh registry; most
/// tests only need these two and can call this instead of repeating the
/// boilerplate.
pub fn standard_registry() -> flowforge::registry::ActionRegistry {
    let mut registry = flowforge::registry::ActionRegistry::new();
    registry.register(action::boxed(AddAction));
    registry.register(action::boxed(DoubleAddAction));
    registry
}
