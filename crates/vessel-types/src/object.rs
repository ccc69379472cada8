//! Opaque serialized payloads identified by a codec tag.

use serde::{Deserialize, Serialize};

use crate::serde_b64;

/// Codec tag for JSON-encoded payloads.
pub const JSON_METHOD: &str = "json";

/// A payload plus the name of the codec that produced it.
///
/// The core never looks inside `payload`. A result with `raised` set is a
/// user-program failure: it is still a successful call at the protocol
/// level, and the caller decides what to do with the traceback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedObject {
    pub method: String,
    #[serde(with = "serde_b64")]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub raised: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl SerializedObject {
    pub fn new(method: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            method: method.into(),
            payload: payload.into(),
            raised: false,
            traceback: None,
        }
    }

    /// A payload describing an exception raised by the user program.
    pub fn raised(
        method: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        traceback: Option<String>,
    ) -> Self {
        Self {
            method: method.into(),
            payload: payload.into(),
            raised: true,
            traceback,
        }
    }

    /// Encode a JSON value with the `json` codec.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::new(JSON_METHOD, value.to_string().into_bytes())
    }

    /// Decode the payload when it was produced by the `json` codec.
    pub fn as_json(&self) -> Option<serde_json::Value> {
        if self.method != JSON_METHOD {
            return None;
        }
        serde_json::from_slice(&self.payload).ok()
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
