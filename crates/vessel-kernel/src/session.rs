//! Execution sessions: one Run call from validation to terminal result.
//!
//! ```text
//!   Created ──▶ Building ──▶ Leasing ──▶ Running ──▶ Finalized
//!                  │            │           │
//!                  └────────────┴───────────┴──────▶ Failed
//! ```
//!
//! Every definition is resolved and validated before anything is built, so
//! a bad configuration never starts a build or a worker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::instrument;

use vessel_types::{
    BoundFunction, ConfigValue, EnvironmentDefinition, EnvironmentKey, LogEntry, LogLevel,
    SerializedObject, VesselError,
};

use crate::bridge::Bridge;
use crate::builders::{BuildLogs, BuildRequest, BuilderRegistry, EnvironmentBuilder};
use crate::cache::EnvironmentCache;
use crate::config::Settings;
use crate::handle::{LaunchSpec, RuntimeHandle};
use crate::key::{composed_key, definition_key};
use crate::multiplex::LogSink;
use crate::pool::BridgePool;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state behind every session: settings, builders, cache and pool.
pub struct Runtime {
    pub settings: Arc<Settings>,
    pub registry: Arc<BuilderRegistry>,
    pub cache: EnvironmentCache,
    pub pool: BridgePool<Bridge>,
}

impl Runtime {
    pub fn new(settings: Settings, registry: BuilderRegistry) -> Self {
        let pool = BridgePool::new(settings.bridge_slots);
        Self {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            cache: EnvironmentCache::new(),
            pool,
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Building,
    Leasing,
    Running,
    Finalized,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Failed)
    }
}

struct PlannedEnvironment {
    definition: EnvironmentDefinition,
    key: EnvironmentKey,
    builder: Arc<dyn EnvironmentBuilder>,
}

struct Plan {
    environments: Vec<PlannedEnvironment>,
    composed: EnvironmentKey,
}

/// Drives one bound function through build, lease and run.
pub struct ExecutionSession {
    id: u64,
    runtime: Arc<Runtime>,
    sink: LogSink,
    state: SessionState,
}

impl ExecutionSession {
    pub fn new(runtime: Arc<Runtime>, sink: LogSink) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            runtime,
            sink,
            state: SessionState::Created,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(session = self.id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    /// Run `bound` to completion. Logs go to the session's sink as they
    /// happen; the return value is the terminal outcome.
    #[instrument(level = "info", skip_all, fields(session = self.id, function = %bound.describe()))]
    pub async fn run(&mut self, bound: &BoundFunction) -> Result<SerializedObject, VesselError> {
        if self.state != SessionState::Created {
            return Err(VesselError::InvariantViolation(format!(
                "session {} already ran",
                self.id
            )));
        }
        let outcome = self.drive(bound).await;
        match &outcome {
            Ok(_) => self.transition(SessionState::Finalized),
            Err(err) => {
                tracing::info!(session = self.id, kind = err.kind_name(), "session failed: {}", err);
                self.transition(SessionState::Failed);
            }
        }
        outcome
    }

    async fn drive(&mut self, bound: &BoundFunction) -> Result<SerializedObject, VesselError> {
        self.transition(SessionState::Building);
        let plan = self.plan(&bound.environments)?;
        let handles = self.build_all(&plan).await?;
        let launch = LaunchSpec::compose(&handles)?;

        self.transition(SessionState::Leasing);
        let settings = self.runtime.settings.clone();
        let composed = plan.composed;
        let mut lease = self
            .runtime
            .pool
            .lease(composed, move || async move {
                Bridge::spawn(composed, &launch, &settings).await
            })
            .await?;

        let reused = lease.reused();
        let bridge = lease.bridge()?;
        let message = if reused {
            format!("Reusing worker {}", bridge.pid())
        } else {
            format!("Started worker {}", bridge.pid())
        };
        self.sink.emit(LogEntry::bridge(LogLevel::Trace, message)).await;

        self.transition(SessionState::Running);
        let outcome = bridge
            .run(&bound.function, bound.setup_func.as_ref(), &self.sink)
            .await;
        // A request rejected before it was written leaves the worker usable.
        if outcome.is_err() && bridge.is_broken() {
            lease.discard();
        }
        outcome
    }

    /// Resolve, validate and key every definition. Nothing is built here.
    fn plan(&self, definitions: &[EnvironmentDefinition]) -> Result<Plan, VesselError> {
        let mut environments = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let builder = self.runtime.registry.resolve(definition.kind())?;
            builder.validate(definition.configuration())?;
            environments.push(PlannedEnvironment {
                key: definition_key(definition)?,
                definition: definition.clone(),
                builder,
            });
        }
        check_conflicts(definitions)?;
        Ok(Plan {
            environments,
            composed: composed_key(definitions)?,
        })
    }

    async fn build_all(&self, plan: &Plan) -> Result<Vec<Arc<RuntimeHandle>>, VesselError> {
        let mut handles = Vec::with_capacity(plan.environments.len());
        for planned in &plan.environments {
            let builder = planned.builder.clone();
            let request = BuildRequest {
                key: planned.key,
                configuration: planned.definition.configuration().clone(),
                settings: self.runtime.settings.clone(),
            };
            let logs = BuildLogs::new(self.sink.clone());
            let started = Arc::new(AtomicBool::new(false));
            let acquired = {
                let logs = logs.clone();
                let started = started.clone();
                self.runtime
                    .cache
                    .acquire(planned.key, move || {
                        started.store(true, Ordering::SeqCst);
                        async move {
                            builder.build(request, &logs).await.map_err(|err| match err {
                                VesselError::Build { .. } | VesselError::Config { .. } => err,
                                other => logs.failure(other.to_string()),
                            })
                        }
                    })
                    .await
            };
            logs.flush().await;
            match acquired {
                Ok(handle) => handles.push(handle),
                // This session already streamed every line of its own build.
                Err(VesselError::Build { reason, .. }) if started.load(Ordering::SeqCst) => {
                    return Err(VesselError::build(reason, Vec::new()));
                }
                Err(err) => return Err(err),
            }
        }
        Ok(handles)
    }
}

/// Scalar settings must agree across definitions. Lists are additive,
/// except that `KEY=VALUE` entries under `env` may not reassign a variable.
fn check_conflicts(definitions: &[EnvironmentDefinition]) -> Result<(), VesselError> {
    let mut seen: BTreeMap<&str, (&ConfigValue, &str)> = BTreeMap::new();
    let mut assigned: BTreeMap<&str, &str> = BTreeMap::new();
    for definition in definitions {
        for (key, value) in definition.configuration() {
            if key == "env" {
                check_env_assignments(value, &mut assigned)?;
            }
            if matches!(value, ConfigValue::List(_) | ConfigValue::Null) {
                continue;
            }
            match seen.get(key.as_str()) {
                Some((existing, kind)) if *existing != value => {
                    return Err(VesselError::config(
                        key.clone(),
                        format!(
                            "conflicting values for '{}': {} on {} and {} on {}",
                            key,
                            existing.to_json(),
                            kind,
                            value.to_json(),
                            definition.kind()
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    seen.insert(key.as_str(), (value, definition.kind()));
                }
            }
        }
    }
    Ok(())
}

fn check_env_assignments<'a>(
    value: &'a ConfigValue,
    assigned: &mut BTreeMap<&'a str, &'a str>,
) -> Result<(), VesselError> {
    let entries: Vec<&ConfigValue> = match value {
        ConfigValue::List(items) => items.iter().collect(),
        ConfigValue::String(_) => vec![value],
        _ => return Ok(()),
    };
    for entry in entries {
        let Some((name, val)) = entry.as_str().and_then(|e| e.split_once('=')) else {
            continue;
        };
        match assigned.get(name) {
            Some(existing) if *existing != val => {
                return Err(VesselError::config(
                    name,
                    format!(
                        "environment variable '{name}' is set to conflicting values ('{existing}' and '{val}')"
                    ),
                ));
            }
            Some(_) => {}
            None => {
                assigned.insert(name, val);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use vessel_types::Configuration;

    use crate::builders::{BuilderSchema, ParamSchema, ParamType};

    struct CountingBuilder {
        builds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EnvironmentBuilder for CountingBuilder {
        fn kind(&self) -> &str {
            "counting"
        }

        fn schema(&self) -> BuilderSchema {
            BuilderSchema::new("counting", "Counts builds")
                .param(ParamSchema::optional("version", ParamType::String, "Version"))
                .param(ParamSchema::optional("extras", ParamType::List, "Extras"))
        }

        async fn build(&self, request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            logs.trace("counting").await;
            Ok(RuntimeHandle::new(request.key, "counting"))
        }
    }

    /// Builds handles shaped like virtualenvs, without touching the disk.
    struct LayeredBuilder;

    #[async_trait]
    impl EnvironmentBuilder for LayeredBuilder {
        fn kind(&self) -> &str {
            "layered"
        }

        fn schema(&self) -> BuilderSchema {
            BuilderSchema::new("layered", "Virtualenv-shaped handles")
                .param(ParamSchema::optional("requirements", ParamType::List, "Requirements"))
        }

        async fn build(&self, request: BuildRequest, _logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
            let root = request
                .settings
                .cache_dir
                .join("virtualenv")
                .join(request.key.to_hex());
            Ok(RuntimeHandle::new(request.key, "layered")
                .with_root(root.clone())
                .with_bin_dir(root.join("bin"))
                .with_library_dirs([root.join("lib/python3.12/site-packages")])
                .with_layer_env("VIRTUAL_ENV", root.to_string_lossy()))
        }
    }

    /// Fails slowly after two lines, so concurrent sessions join it.
    struct FailingBuilder;

    #[async_trait]
    impl EnvironmentBuilder for FailingBuilder {
        fn kind(&self) -> &str {
            "failing"
        }

        fn schema(&self) -> BuilderSchema {
            BuilderSchema::new("failing", "Always fails")
        }

        async fn build(&self, _request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError> {
            logs.emit(LogEntry::build_stdout("Collecting $$$$")).await;
            logs.emit(LogEntry::build_stderr("ERROR: Invalid requirement: '$$$$'"))
                .await;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            Err(logs.failure("pip exited with exit status: 1"))
        }
    }

    fn runtime(builds: Arc<AtomicUsize>) -> Arc<Runtime> {
        let mut registry = BuilderRegistry::with_defaults();
        registry.register(CountingBuilder { builds });
        registry.register(LayeredBuilder);
        registry.register(FailingBuilder);
        let settings = Settings::default()
            .with_cache_dir(std::env::temp_dir().join("vessel-session-tests"))
            .with_agent_program("/nonexistent/vessel-agent");
        Arc::new(Runtime::new(settings, registry))
    }

    fn bound(environments: Vec<EnvironmentDefinition>) -> BoundFunction {
        BoundFunction::new(SerializedObject::new("echo", b"hi".to_vec()), environments)
    }

    #[tokio::test]
    async fn test_unknown_kind_fails_before_building() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut session = ExecutionSession::new(runtime(builds.clone()), LogSink::discard());
        let err = session
            .run(&bound(vec![
                EnvironmentDefinition::new("counting", Configuration::new()),
                EnvironmentDefinition::new("docker", Configuration::new()),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, VesselError::UnknownEnvironmentKind(_)));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_invalid_parameter_fails_before_building() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut session = ExecutionSession::new(runtime(builds.clone()), LogSink::discard());
        let err = session
            .run(&bound(vec![
                EnvironmentDefinition::new("counting", Configuration::new()),
                EnvironmentDefinition::new("virtualenv", Configuration::new())
                    .with("packages", vec!["numpy"]),
            ]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unexpected keyword argument 'packages'");
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_conflicting_scalars_rejected() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut session = ExecutionSession::new(runtime(builds.clone()), LogSink::discard());
        let err = session
            .run(&bound(vec![
                EnvironmentDefinition::new("counting", Configuration::new()).with("version", "1"),
                EnvironmentDefinition::new("counting", Configuration::new()).with("version", "2"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, VesselError::Config { ref key, .. } if key == "version"));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_lists_are_additive() {
        check_conflicts(&[
            EnvironmentDefinition::new("counting", Configuration::new()).with("extras", vec!["a"]),
            EnvironmentDefinition::new("counting", Configuration::new()).with("extras", vec!["b"]),
        ])
        .unwrap();
    }

    #[tokio::test]
    async fn test_missing_agent_is_bridge_failure_after_build() {
        let builds = Arc::new(AtomicUsize::new(0));
        let rt = runtime(builds.clone());
        let mut session = ExecutionSession::new(rt.clone(), LogSink::discard());
        let err = session
            .run(&bound(vec![EnvironmentDefinition::new(
                "counting",
                Configuration::new(),
            )]))
            .await
            .unwrap_err();
        assert!(matches!(err, VesselError::BridgeFailure(_)));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(rt.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_layered_virtualenvs_reach_the_worker() {
        let builds = Arc::new(AtomicUsize::new(0));
        let rt = runtime(builds);
        let mut session = ExecutionSession::new(rt.clone(), LogSink::discard());
        let err = session
            .run(&bound(vec![
                EnvironmentDefinition::new("layered", Configuration::new())
                    .with("requirements", vec!["numpy"]),
                EnvironmentDefinition::new("layered", Configuration::new())
                    .with("requirements", vec!["pandas"]),
            ]))
            .await
            .unwrap_err();
        // Composition succeeded; only the missing agent binary stopped it.
        assert!(matches!(err, VesselError::BridgeFailure(_)), "{err:?}");
        assert_eq!(rt.cache.len(), 2);
    }

    #[tokio::test]
    async fn test_conflicting_env_assignments_fail_before_building() {
        let builds = Arc::new(AtomicUsize::new(0));
        let rt = runtime(builds.clone());
        let mut session = ExecutionSession::new(rt.clone(), LogSink::discard());
        let err = session
            .run(&bound(vec![
                EnvironmentDefinition::new("counting", Configuration::new()),
                EnvironmentDefinition::new("local", Configuration::new())
                    .with("env", vec!["MODE=fast", "SHARED=1"]),
                EnvironmentDefinition::new("local", Configuration::new())
                    .with("env", vec!["SHARED=1", "MODE=slow"]),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, VesselError::Config { ref key, .. } if key == "MODE"));
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert!(rt.cache.is_empty());

        check_conflicts(&[
            EnvironmentDefinition::new("local", Configuration::new()).with("env", vec!["A=1"]),
            EnvironmentDefinition::new("local", Configuration::new()).with("env", vec!["A=1", "B=2"]),
        ])
        .unwrap();
    }

    #[tokio::test]
    async fn test_build_lines_reach_each_caller_once() {
        let rt = runtime(Arc::new(AtomicUsize::new(0)));
        let failing = || bound(vec![EnvironmentDefinition::new("failing", Configuration::new())]);

        let runs: Vec<_> = (0..3)
            .map(|_| {
                let rt = rt.clone();
                let bound = failing();
                tokio::spawn(async move {
                    let (sink, stream) = crate::multiplex::channel(
                        crate::multiplex::DEFAULT_CAPACITY,
                        tokio_util::sync::CancellationToken::new(),
                    );
                    let reader = tokio::spawn(stream.drain());
                    let mut session = ExecutionSession::new(rt, sink.clone());
                    let result = session.run(&bound).await;
                    sink.finish(result).await.unwrap();
                    reader.await.unwrap()
                })
            })
            .collect();

        let mut with_attached_logs = 0;
        for run in runs {
            let outcome = run.await.unwrap();
            let err = outcome.result.unwrap_err();
            assert!(matches!(err, VesselError::Build { .. }));
            if !err.build_logs().is_empty() {
                with_attached_logs += 1;
            }
            let seen = outcome
                .logs
                .iter()
                .chain(err.build_logs())
                .filter(|e| e.message.contains("Invalid requirement"))
                .count();
            assert_eq!(seen, 1);
        }
        // Exactly one session started the build and streamed it live.
        assert_eq!(with_attached_logs, 2);
    }

    #[tokio::test]
    async fn test_session_runs_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let mut session = ExecutionSession::new(runtime(builds), LogSink::discard());
        let _ = session.run(&bound(vec![])).await;
        let err = session.run(&bound(vec![])).await.unwrap_err();
        assert!(matches!(err, VesselError::InvariantViolation(_)));
    }
}
