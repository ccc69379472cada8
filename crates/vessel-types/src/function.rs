//! The unit of work submitted to the service.

use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentDefinition;
use crate::object::SerializedObject;

/// A serialized callable, an optional one-time setup callable, and the
/// environments it needs.
///
/// `setup_func` runs once per bridge lifetime; its result is passed as the
/// first argument to every `function` call made against that bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundFunction {
    pub function: SerializedObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_func: Option<SerializedObject>,
    #[serde(default)]
    pub environments: Vec<EnvironmentDefinition>,
}

impl BoundFunction {
    pub fn new(function: SerializedObject, environments: Vec<EnvironmentDefinition>) -> Self {
        Self {
            function,
            setup_func: None,
            environments,
        }
    }

    pub fn with_setup(mut self, setup: SerializedObject) -> Self {
        self.setup_func = Some(setup);
        self
    }

    /// Comma-joined environment kinds, for listings and spans.
    pub fn describe(&self) -> String {
        if self.environments.is_empty() {
            return format!("{} (no environment)", self.function.method);
        }
        let kinds: Vec<&str> = self.environments.iter().map(|e| e.kind()).collect();
        format!("{} on {}", self.function.method, kinds.join("+"))
    }
}
