//! Request and response lines spoken between clients and the front.
//!
//! One request per connection, as a single JSON line:
//!
//! ```text
//!   {"op":"run","bound":{..}}            → chunk* then chunk(is_complete) | error
//!   {"op":"submit","bound":{..}}         → submitted | error
//!   {"op":"set_metadata","task_id":1,..} → ack | error
//!   {"op":"list"}                        → tasks
//!   {"op":"cancel","task_id":1}          → ack | error
//! ```
//!
//! A client keeps its side of the connection open until the last response;
//! closing it early cancels a running session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vessel_types::{
    BoundFunction, EnvironmentDefinition, LogEntry, PartialResult, SerializedObject, TaskId,
    TaskInfo, VesselError,
};

/// An environment as sent by clients: a kind and a free-form JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub kind: String,
    #[serde(default)]
    pub configuration: serde_json::Map<String, serde_json::Value>,
}

/// A bound function as sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub function: SerializedObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_func: Option<SerializedObject>,
    #[serde(default)]
    pub environments: Vec<EnvironmentSpec>,
}

impl FunctionSpec {
    /// Convert JSON configurations into typed definitions.
    pub fn into_bound(self) -> Result<BoundFunction, VesselError> {
        let environments = self
            .environments
            .into_iter()
            .map(|env| EnvironmentDefinition::from_json(env.kind, env.configuration))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BoundFunction {
            function: self.function,
            setup_func: self.setup_func,
            environments,
        })
    }

    pub fn from_bound(bound: &BoundFunction) -> Self {
        Self {
            function: bound.function.clone(),
            setup_func: bound.setup_func.clone(),
            environments: bound
                .environments
                .iter()
                .map(|env| EnvironmentSpec {
                    kind: env.kind().to_string(),
                    configuration: env.configuration_json(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Run {
        bound: FunctionSpec,
    },
    Submit {
        bound: FunctionSpec,
    },
    SetMetadata {
        task_id: TaskId,
        metadata: BTreeMap<String, String>,
    },
    List,
    Cancel {
        task_id: TaskId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Chunk {
        chunk: PartialResult,
    },
    Submitted {
        task_id: TaskId,
    },
    Ack,
    Tasks {
        tasks: Vec<TaskInfo>,
    },
    Error {
        /// Stable kind name, e.g. `build_error`.
        kind: String,
        message: String,
        /// Build logs gathered before a build failure.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        logs: Vec<LogEntry>,
    },
}

impl Response {
    pub fn error(err: &VesselError) -> Self {
        Response::Error {
            kind: err.kind_name().to_string(),
            message: err.to_string(),
            logs: err.build_logs().to_vec(),
        }
    }
}
