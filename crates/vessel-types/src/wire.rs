//! Control-channel protocol between a bridge and its worker agent.
//!
//! Frames are newline-delimited JSON objects tagged by `type`.
//!
//! ```text
//!   bridge ──▶ agent   {"type":"run","function":{..},"setup":{..}}
//!   agent  ──▶ bridge  {"type":"log","entry":{..}}        (zero or more)
//!   agent  ──▶ bridge  {"type":"result","object":{..}}    (exactly one)
//!   agent  ──▶ bridge  {"type":"finished"}
//! ```

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::object::SerializedObject;

/// Request sent from the bridge to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Run `function`. `setup` is only present on the first run of a bridge.
    Run {
        function: SerializedObject,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        setup: Option<SerializedObject>,
    },
    /// Exit cleanly.
    Shutdown,
}

/// Event sent from the agent back to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Log { entry: LogEntry },
    Result { object: SerializedObject },
    /// End of one run. Always the last frame for a request.
    Finished,
}
