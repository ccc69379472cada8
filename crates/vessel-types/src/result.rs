//! Streamed chunks of a Run call.

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::object::SerializedObject;

/// One chunk of a streaming Run.
///
/// A Run emits zero or more non-terminal chunks carrying only logs, then
/// exactly one chunk with `is_complete` set and `result` present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SerializedObject>,
}

impl PartialResult {
    /// A non-terminal chunk.
    pub fn logs(logs: Vec<LogEntry>) -> Self {
        Self {
            logs,
            is_complete: false,
            result: None,
        }
    }

    /// The terminal chunk.
    pub fn complete(logs: Vec<LogEntry>, result: SerializedObject) -> Self {
        Self {
            logs,
            is_complete: true,
            result: Some(result),
        }
    }
}
