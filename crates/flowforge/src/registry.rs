//! The action registry (component C): an explicit name → action-type map,
//! populated by the caller at startup rather than via implicit subclass
//! hooks (spec §9's "metaclass-registered actions" re-architecture note).

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::DynAction;
use crate::error::{Error, Result};

#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn DynAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an action under its descriptor's name. Panics on a true
    /// duplicate registration, matching the teacher's metaclass behavior of
    /// rejecting name collisions eagerly rather than silently overwriting.
    pub fn register(&mut self, action: Arc<dyn DynAction>) {
        let name = action.descriptor().name.to_string();
        if self.actions.insert(name.clone(), action).is_some() {
            panic!("action '{name}' is already registered");
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DynAction>> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownActionType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }
}
