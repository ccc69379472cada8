//! Configuration values accepted by environment builders.

use serde::{Deserialize, Serialize};

use crate::error::VesselError;

/// A scalar or list value inside an environment configuration.
///
/// Mappings are deliberately not representable: builders take flat
/// keyword-style configuration, and nested objects are rejected at
/// conversion time with a `ConfigError` naming the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
}

impl ConfigValue {
    /// Convert a JSON value, rejecting objects.
    ///
    /// `key` is only used for the error message.
    pub fn from_json(key: &str, json: serde_json::Value) -> Result<Self, VesselError> {
        match json {
            serde_json::Value::Null => Ok(ConfigValue::Null),
            serde_json::Value::Bool(b) => Ok(ConfigValue::Bool(b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ConfigValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ConfigValue::Float(f))
                } else {
                    Err(VesselError::config(
                        key,
                        format!("unsupported number for '{}': {}", key, n),
                    ))
                }
            }
            serde_json::Value::String(s) => Ok(ConfigValue::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| ConfigValue::from_json(key, item))
                .collect::<Result<Vec<_>, _>>()
                .map(ConfigValue::List),
            serde_json::Value::Object(_) => Err(VesselError::config(
                key,
                format!("unsupported value type for '{}': mappings are not allowed", key),
            )),
        }
    }

    /// Convert back to JSON (used by the wire front).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(*b),
            ConfigValue::Int(i) => serde_json::Value::Number((*i).into()),
            ConfigValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ConfigValue::String(s) => serde_json::Value::String(s.clone()),
            ConfigValue::List(items) => {
                serde_json::Value::Array(items.iter().map(ConfigValue::to_json).collect())
            }
        }
    }

    /// Short type name used in validation errors and schemas.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Null => "null",
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Int(_) => "int",
            ConfigValue::Float(_) => "float",
            ConfigValue::String(_) => "string",
            ConfigValue::List(_) => "list",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Flatten a list of strings. A bare string counts as a one-element list.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        match self {
            ConfigValue::String(s) => Some(vec![s.clone()]),
            ConfigValue::List(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => None,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<bool> for ConfigValue {
    fn from(b: bool) -> Self {
        ConfigValue::Bool(b)
    }
}

impl From<i64> for ConfigValue {
    fn from(i: i64) -> Self {
        ConfigValue::Int(i)
    }
}

impl<T: Into<ConfigValue>> From<Vec<T>> for ConfigValue {
    fn from(items: Vec<T>) -> Self {
        ConfigValue::List(items.into_iter().map(Into::into).collect())
    }
}
