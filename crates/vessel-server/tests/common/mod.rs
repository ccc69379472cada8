//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use vessel_kernel::builders::{BuilderSchema, ParamSchema, ParamType};
use vessel_kernel::{BuildLogs, BuildRequest, BuilderRegistry, EnvironmentBuilder, RuntimeHandle, Settings};
use vessel_types::{
    Configuration, EnvironmentDefinition, LogEntry, LogLevel, LogSource, SerializedObject,
    VesselError,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A fresh cache directory under the system temp dir.
pub fn temp_cache(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "vessel-test-{}-{}-{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ))
}

/// Settings that launch the real agent binary.
pub fn settings(tag: &str) -> Settings {
    Settings::default()
        .with_cache_dir(temp_cache(tag))
        .with_agent_program(env!("CARGO_BIN_EXE_vessel-agent"))
}

pub fn shell(script: &str) -> SerializedObject {
    SerializedObject::new("shell", script.as_bytes().to_vec())
}

pub fn local() -> EnvironmentDefinition {
    EnvironmentDefinition::new("local", Configuration::new())
}

pub fn local_with_env(pairs: &[&str]) -> EnvironmentDefinition {
    local().with(
        "env",
        pairs.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
    )
}

pub fn user_messages(logs: &[LogEntry]) -> Vec<String> {
    logs.iter()
        .filter(|e| e.source == LogSource::User)
        .map(|e| e.message.clone())
        .collect()
}

/// Fails like pip does for an unparsable requirement, slowly enough for
/// concurrent runs to join the same build.
pub struct FailingBuilder;

#[async_trait]
impl EnvironmentBuilder for FailingBuilder {
    fn kind(&self) -> &str {
        "failing"
    }

    fn schema(&self) -> BuilderSchema {
        BuilderSchema::new("failing", "Always fails").param(ParamSchema::optional(
            "requirements",
            ParamType::List,
            "Requirements",
        ))
    }

    async fn build(&self, _request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
        logs.emit(LogEntry::build_stdout("Collecting $$$$")).await;
        logs.emit(LogEntry::build_stderr("ERROR: Invalid requirement: '$$$$'"))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err(logs.failure("pip exited with exit status: 1"))
    }
}

/// Succeeds slowly and counts how often it ran.
pub struct CountingBuilder {
    pub builds: Arc<AtomicUsize>,
}

#[async_trait]
impl EnvironmentBuilder for CountingBuilder {
    fn kind(&self) -> &str {
        "counting"
    }

    fn schema(&self) -> BuilderSchema {
        BuilderSchema::new("counting", "Counts builds")
    }

    async fn build(&self, request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        logs.emit(LogEntry::new(LogSource::Build, LogLevel::Trace, "building"))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(RuntimeHandle::new(request.key, "counting"))
    }
}

pub fn test_registry(builds: Arc<AtomicUsize>) -> BuilderRegistry {
    let mut registry = BuilderRegistry::with_defaults();
    registry.register(FailingBuilder);
    registry.register(CountingBuilder { builds });
    registry
}
