//! Property-based coverage for the static checker's soundness guarantee
//! (an executable flow never fails at runtime with an `UnknownVariable` or
//! `UnknownDependency` the checker didn't already flag): for a randomly
//! generated chain of actions, each depending only on its immediate
//! predecessor, `check` must accept the chain; break the last link by
//! pointing it at an id that exists nowhere in the flow, and `check` must
//! reject it with exactly that id.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use flowforge::checker::{check, CheckError};
use flowforge::flow::{ActionConfig, ActionInvocation, Executable, FlowConfig};
use flowforge::value::Expression;

fn chain_ids() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-z]{3,8}", 2..6).prop_filter("ids must be unique", |ids| {
        let unique: HashSet<_> = ids.iter().collect();
        unique.len() == ids.len()
    })
}

fn action_depending_on(dep: Option<&str>) -> Executable {
    let mut inputs = HashMap::new();
    if let Some(dep) = dep {
        inputs.insert("a".to_string(), Expression::Var { path: format!("{dep}.result"), stream: false });
    }
    Executable::Action(ActionInvocation { action: "add".to_string(), cache_key: None, inputs })
}

fn config_with(flow: FlowConfig) -> ActionConfig {
    ActionConfig { default_model: HashMap::new(), action_timeout: 360.0, flow, default_output: None }
}

proptest! {
    #[test]
    fn well_formed_chains_always_check_clean(ids in chain_ids()) {
        let mut flow = FlowConfig::new();
        for (i, id) in ids.iter().enumerate() {
            let dep = if i == 0 { None } else { Some(ids[i - 1].as_str()) };
            flow.insert(id.clone(), action_depending_on(dep));
        }
        let config = config_with(flow);
        let errors = check(&config, &HashSet::new(), ids.last().unwrap());
        prop_assert!(errors.is_empty());
    }

    #[test]
    fn a_dangling_reference_is_always_caught(ids in chain_ids()) {
        let mut flow = FlowConfig::new();
        for (i, id) in ids.iter().enumerate() {
            let dep = if i == 0 { None } else { Some(ids[i - 1].as_str()) };
            flow.insert(id.clone(), action_depending_on(dep));
        }
        // Repoint the last link at an id that is in neither the flow nor the
        // variable set.
        let last = ids.last().unwrap().clone();
        flow.insert(last.clone(), action_depending_on(Some("__does_not_exist__")));

        let config = config_with(flow);
        let errors = check(&config, &HashSet::new(), &last);
        prop_assert_eq!(errors, vec![CheckError::UnknownDependency("__does_not_exist__".to_string())]);
    }
}
