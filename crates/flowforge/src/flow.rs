//! The flow graph data model (spec §3.1).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::Expression;

pub type ExecutableId = String;
pub type ActionName = String;
pub type VarName = String;

/// `{ for: VarName, in: Expression, flow: FlowConfig }`. The inner flow is a
/// nested DAG; the outer flow addresses it only by id.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Loop {
    #[serde(rename = "for")]
    pub for_var: VarName,
    #[serde(rename = "in")]
    pub iterable: Expression,
    pub flow: FlowConfig,
}

/// `{ action: ActionName, cache_key?: Expression, <input fields>: Expression }`.
/// Unknown keys besides `action`/`cache_key` are the action's declared inputs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionInvocation {
    pub action: ActionName,
    #[serde(default)]
    pub cache_key: Option<Expression>,
    #[serde(flatten)]
    pub inputs: HashMap<String, Expression>,
}

/// An action invocation or a loop: the unit the scheduler schedules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Executable {
    Loop(Loop),
    Action(ActionInvocation),
}

/// Mapping from executable id to executable; insertion order is preserved
/// (serde_yaml/serde_json's map-ordering analogue) so the "last entry is the
/// default output" rule has a well-defined meaning.
pub type FlowConfig = indexmap::IndexMap<ExecutableId, Executable>;

/// The root of a flow text document (spec §6.1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionConfig {
    #[serde(default)]
    pub default_model: HashMap<String, Expression>,
    #[serde(default = "default_action_timeout")]
    pub action_timeout: f64,
    pub flow: FlowConfig,
    #[serde(default)]
    pub default_output: Option<String>,
}

fn default_action_timeout() -> f64 {
    360.0
}

impl ActionConfig {
    /// `default_output`, when absent, is the id of the last entry of the
    /// top-level flow.
    pub fn resolved_default_output(&self) -> Option<String> {
        self.default_output
            .clone()
            .or_else(|| self.flow.keys().last().cloned())
    }

    pub fn from_yaml(text: &str) -> crate::error::Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }
}
