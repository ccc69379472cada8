//! Environment definitions and their content keys.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::VesselError;
use crate::value::ConfigValue;

/// Builder configuration: keyword → value, kept in stable key order.
pub type Configuration = BTreeMap<String, ConfigValue>;

/// A structured description of one runtime environment.
///
/// Immutable once constructed. A bound function carries an ordered
/// sequence of these; later definitions layer on top of earlier ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDefinition {
    kind: String,
    #[serde(default)]
    configuration: Configuration,
}

impl EnvironmentDefinition {
    /// Create a definition from already-converted configuration.
    pub fn new(kind: impl Into<String>, configuration: Configuration) -> Self {
        Self {
            kind: kind.into(),
            configuration,
        }
    }

    /// Create a definition from a JSON object, converting every value.
    ///
    /// Fails with `ConfigError` naming the first key whose value is not a
    /// scalar or a list of scalars.
    pub fn from_json(
        kind: impl Into<String>,
        configuration: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, VesselError> {
        let mut converted = Configuration::new();
        for (key, value) in configuration {
            let value = ConfigValue::from_json(&key, value)?;
            converted.insert(key, value);
        }
        Ok(Self::new(kind, converted))
    }

    /// Add one configuration entry (builder style, for tests and clients).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.configuration.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Render the configuration as a JSON object.
    pub fn configuration_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.configuration
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }
}

/// Deterministic digest of a sequence of environment definitions.
///
/// This is the cache identity for built environments (one definition)
/// and for warm bridges (the composed sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvironmentKey(pub [u8; 32]);

impl EnvironmentKey {
    /// Full lowercase hex rendering (64 characters).
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in &self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// Abbreviated form for logs and directory names.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }

    /// Parse the 64-character hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).ok()?;
            out[i] = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(out))
    }
}

impl std::fmt::Display for EnvironmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for EnvironmentKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EnvironmentKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EnvironmentKey::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid environment key: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_converts_configuration() {
        let map = json!({"requirements": ["pyjokes==0.6.0"], "python_version": "3.11"});
        let def = EnvironmentDefinition::from_json(
            "virtualenv",
            map.as_object().cloned().unwrap(),
        )
        .unwrap();
        assert_eq!(def.kind(), "virtualenv");
        assert_eq!(def.configuration().len(), 2);
        assert_eq!(
            def.configuration()["python_version"],
            ConfigValue::from("3.11")
        );
    }

    #[test]
    fn test_key_hex_roundtrip() {
        let key = EnvironmentKey([0xab; 32]);
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(EnvironmentKey::from_hex(&hex), Some(key));
        assert_eq!(key.short(), "abababababab");
        assert_eq!(EnvironmentKey::from_hex("zz"), None);
    }
}
