//! Builder parameter schemas and configuration validation.

use vessel_types::{ConfigValue, Configuration, VesselError};

/// Accepted value shapes for a builder parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Bool,
    Int,
    /// A list of strings. A bare string is accepted as a one-item list.
    List,
    Any,
}

impl ParamType {
    fn name(self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::List => "list",
            ParamType::Any => "any",
        }
    }

    fn accepts(self, value: &ConfigValue) -> bool {
        match (self, value) {
            (ParamType::Any, _) => true,
            // Explicit nulls mean "not set".
            (_, ConfigValue::Null) => true,
            (ParamType::String, ConfigValue::String(_)) => true,
            (ParamType::Bool, ConfigValue::Bool(_)) => true,
            (ParamType::Int, ConfigValue::Int(_)) => true,
            (ParamType::List, ConfigValue::String(_)) => true,
            (ParamType::List, ConfigValue::List(items)) => {
                items.iter().all(|item| matches!(item, ConfigValue::String(_)))
            }
            _ => false,
        }
    }
}

/// Schema for one configuration key.
#[derive(Debug, Clone)]
pub struct ParamSchema {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub description: String,
}

impl ParamSchema {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            required: false,
            description: description.into(),
        }
    }
}

/// Schema describing a builder's configuration.
#[derive(Debug, Clone)]
pub struct BuilderSchema {
    pub kind: String,
    pub description: String,
    pub params: Vec<ParamSchema>,
}

impl BuilderSchema {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamSchema) -> Self {
        self.params.push(param);
        self
    }

    /// Check keys, required params and value types.
    pub fn validate(&self, configuration: &Configuration) -> Result<(), VesselError> {
        for (key, value) in configuration {
            let Some(param) = self.params.iter().find(|p| &p.name == key) else {
                return Err(VesselError::unexpected_key(key));
            };
            if !param.param_type.accepts(value) {
                return Err(VesselError::config(
                    key.clone(),
                    format!(
                        "'{}' expects a {} value, got {}",
                        key,
                        param.param_type.name(),
                        value.type_name()
                    ),
                ));
            }
        }
        for param in self.params.iter().filter(|p| p.required) {
            match configuration.get(&param.name) {
                None | Some(ConfigValue::Null) => {
                    return Err(VesselError::config(
                        param.name.clone(),
                        format!("missing required argument '{}'", param.name),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Typed accessors over a validated configuration.
pub(crate) fn string_param(configuration: &Configuration, key: &str) -> Option<String> {
    configuration
        .get(key)
        .and_then(ConfigValue::as_str)
        .map(String::from)
}

pub(crate) fn list_param(configuration: &Configuration, key: &str) -> Vec<String> {
    configuration
        .get(key)
        .and_then(ConfigValue::as_string_list)
        .unwrap_or_default()
}
