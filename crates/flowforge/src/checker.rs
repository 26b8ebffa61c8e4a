//! The static consistency checker (component G, spec §4.5). Walks a flow
//! from a requested target without executing anything, reporting every
//! unreachable dependency or unset variable it finds.

use std::collections::HashSet;

use tracing::error;

use crate::flow::{ActionConfig, Executable, ExecutableId, FlowConfig};
use crate::value::Expression;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    UnknownVariable(String),
    UnknownDependency(String),
}

impl std::fmt::Display for CheckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckError::UnknownVariable(id) => write!(f, "UnknownVariable {id}"),
            CheckError::UnknownDependency(id) => write!(f, "UnknownDependency {id}"),
        }
    }
}

/// Validates `config` against `target_output` and the currently-set
/// `variables`, returning every diagnostic found (empty means the flow is
/// sound to execute).
pub fn check(config: &ActionConfig, variables: &HashSet<String>, target_output: &str) -> Vec<CheckError> {
    let mut errors = Vec::new();
    let root = target_output.split('.').next().unwrap_or(target_output);

    if !config.flow.contains_key(root) {
        let err = CheckError::UnknownVariable(root.to_string());
        error!(target_output, "static checker: target root is not in the flow");
        errors.push(err);
        return errors;
    }

    let mut visited = HashSet::new();
    walk(&config.flow, root, variables, &mut visited, &mut errors);

    for expr in config.default_model.values() {
        validate_expression_deps(expr, &config.flow, variables, &mut errors);
    }

    errors
}

fn walk(
    flow: &FlowConfig,
    id: &str,
    variables: &HashSet<String>,
    visited: &mut HashSet<String>,
    errors: &mut Vec<CheckError>,
) {
    if !visited.insert(id.to_string()) {
        return;
    }
    let Some(executable) = flow.get(id) else {
        errors.push(CheckError::UnknownVariable(id.to_string()));
        return;
    };

    match executable {
        Executable::Action(action) => {
            if let Some(cache_key) = &action.cache_key {
                validate_expression_deps(cache_key, flow, variables, errors);
                for dep in dependency_roots(cache_key) {
                    if flow.contains_key(&dep) {
                        walk(flow, &dep, variables, visited, errors);
                    }
                }
            }
            for expr in action.inputs.values() {
                validate_expression_deps(expr, flow, variables, errors);
                for dep in dependency_roots(expr) {
                    if flow.contains_key(&dep) {
                        walk(flow, &dep, variables, visited, errors);
                    }
                }
            }
        }
        Executable::Loop(loop_) => {
            validate_expression_deps(&loop_.iterable, flow, variables, errors);
            for dep in dependency_roots(&loop_.iterable) {
                if flow.contains_key(&dep) {
                    walk(flow, &dep, variables, visited, errors);
                }
            }

            // The inner flow's own scope sees the outer flow's ids plus the
            // loop-bound variable, per spec §3.1's invariant.
            let mut inner_variables = variables.clone();
            inner_variables.insert(loop_.for_var.clone());
            let mut merged_flow = flow.clone();
            merged_flow.extend(loop_.flow.clone());

            for inner_id in loop_.flow.keys() {
                walk(&merged_flow, inner_id, &inner_variables, &mut HashSet::new(), errors);
            }
        }
    }
}

fn validate_expression_deps(
    expr: &Expression,
    flow: &FlowConfig,
    variables: &HashSet<String>,
    errors: &mut Vec<CheckError>,
) {
    let deps = match expr.dependencies() {
        Ok(deps) => deps,
        Err(_) => {
            // A malformed lambda body is reported as an invalid expression
            // at render time; the checker only validates reachability.
            return;
        }
    };
    for (id, _stream) in deps {
        if !flow.contains_key(&id) && !variables.contains(&id) {
            error!(id, "static checker: unknown dependency");
            errors.push(CheckError::UnknownDependency(id));
        }
    }
}

fn dependency_roots(expr: &Expression) -> HashSet<ExecutableId> {
    expr.dependencies()
        .map(|deps| deps.into_iter().map(|(id, _)| id).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ActionInvocation;
    use std::collections::HashMap;

    fn config_with(flow: FlowConfig) -> ActionConfig {
        ActionConfig {
            default_model: HashMap::new(),
            action_timeout: 360.0,
            flow,
            default_output: None,
        }
    }

    #[test]
    fn rejects_missing_variable() {
        let mut flow = FlowConfig::new();
        flow.insert(
            "first".to_string(),
            Executable::Action(ActionInvocation {
                action: "add".to_string(),
                cache_key: None,
                inputs: HashMap::from([(
                    "a".to_string(),
                    Expression::Text { text: "{{ missing }}".to_string(), stream: false },
                )]),
            }),
        );
        let config = config_with(flow);
        let errors = check(&config, &HashSet::new(), "first");
        assert_eq!(errors, vec![CheckError::UnknownDependency("missing".to_string())]);
    }

    #[test]
    fn accepts_chained_dependency() {
        let mut flow = FlowConfig::new();
        flow.insert(
            "first".to_string(),
            Executable::Action(ActionInvocation {
                action: "add".to_string(),
                cache_key: None,
                inputs: HashMap::new(),
            }),
        );
        flow.insert(
            "second".to_string(),
            Executable::Action(ActionInvocation {
                action: "add".to_string(),
                cache_key: None,
                inputs: HashMap::from([(
                    "a".to_string(),
                    Expression::Var { path: "first.result".to_string(), stream: false },
                )]),
            }),
        );
        let config = config_with(flow);
        let errors = check(&config, &HashSet::new(), "second.result");
        assert!(errors.is_empty());
    }
}
