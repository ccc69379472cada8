//! The `local` kind: run on the service's own runtime.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use vessel_types::{Configuration, VesselError};

use super::schema::{list_param, string_param};
use super::{BuildLogs, BuildRequest, BuilderSchema, EnvironmentBuilder, ParamSchema, ParamType};
use crate::handle::RuntimeHandle;

pub struct LocalBuilder;

fn parse_env(configuration: &Configuration) -> Result<BTreeMap<String, String>, VesselError> {
    let mut env = BTreeMap::new();
    for pair in list_param(configuration, "env") {
        match pair.split_once('=') {
            Some((name, value)) if !name.is_empty() => {
                env.insert(name.to_string(), value.to_string());
            }
            _ => {
                return Err(VesselError::config(
                    "env",
                    format!("env entries must look like KEY=VALUE, got '{pair}'"),
                ));
            }
        }
    }
    Ok(env)
}

#[async_trait]
impl EnvironmentBuilder for LocalBuilder {
    fn kind(&self) -> &str {
        "local"
    }

    fn schema(&self) -> BuilderSchema {
        BuilderSchema::new("local", "Run on the service's own runtime")
            .param(ParamSchema::optional(
                "env",
                ParamType::List,
                "Extra environment variables as KEY=VALUE",
            ))
            .param(ParamSchema::optional(
                "working_dir",
                ParamType::String,
                "Working directory for the worker",
            ))
    }

    fn validate(&self, configuration: &Configuration) -> Result<(), VesselError> {
        self.schema().validate(configuration)?;
        parse_env(configuration).map(|_| ())
    }

    async fn build(&self, request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
        logs.trace("Using the service's own runtime").await;
        let mut handle = RuntimeHandle::new(request.key, "local");
        handle.env = parse_env(&request.configuration)?;
        handle.working_dir = string_param(&request.configuration, "working_dir").map(PathBuf::from);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vessel_types::EnvironmentKey;

    use crate::config::Settings;
    use crate::multiplex::LogSink;

    #[tokio::test]
    async fn test_local_build() {
        let mut configuration = Configuration::new();
        configuration.insert("env".into(), vec!["GREETING=hi=there"].into());
        configuration.insert("working_dir".into(), "/tmp".into());
        LocalBuilder.validate(&configuration).unwrap();

        let logs = BuildLogs::new(LogSink::discard());
        let handle = LocalBuilder
            .build(
                BuildRequest {
                    key: EnvironmentKey([7; 32]),
                    configuration,
                    settings: Arc::new(Settings::default()),
                },
                &logs,
            )
            .await
            .unwrap();
        assert_eq!(handle.env.get("GREETING").map(String::as_str), Some("hi=there"));
        assert_eq!(handle.working_dir, Some(PathBuf::from("/tmp")));
        assert!(handle.bin_dirs.is_empty());
        assert_eq!(logs.collected().len(), 1);
    }

    #[test]
    fn test_malformed_env_rejected() {
        let mut configuration = Configuration::new();
        configuration.insert("env".into(), vec!["NOEQUALS"].into());
        let err = LocalBuilder.validate(&configuration).unwrap_err();
        assert!(matches!(err, VesselError::Config { ref key, .. } if key == "env"));
    }
}
