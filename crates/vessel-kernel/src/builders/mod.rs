//! Environment builders.
//!
//! Every environment kind is an [`EnvironmentBuilder`] registered by name.
//!
//! ```text
//! BuilderRegistry
//! ├── local       (the service's own runtime)
//! ├── virtualenv  (python -m venv + pip)
//! └── conda       (conda create --prefix)
//! ```

mod conda;
mod local;
mod schema;
mod virtualenv;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use vessel_types::{Configuration, EnvironmentKey, LogEntry, LogLevel, VesselError};

use crate::config::Settings;
use crate::handle::RuntimeHandle;
use crate::multiplex::LogSink;
use crate::process::OutputLines;

pub use conda::CondaBuilder;
pub use local::LocalBuilder;
pub use schema::{BuilderSchema, ParamSchema, ParamType};
pub use virtualenv::VirtualenvBuilder;

/// File written into an environment root once it is fully built.
pub const READY_MARKER: &str = ".vessel-ready";

/// Input to a single build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub key: EnvironmentKey,
    pub configuration: Configuration,
    pub settings: Arc<Settings>,
}

enum Forward {
    Entry(LogEntry),
    Flush(oneshot::Sender<()>),
}

/// Build log collector.
///
/// Entries are kept so a failure can carry everything emitted so far, and
/// queued without bound for the session that started the build, so a slow
/// reader on that session never stalls the build.
#[derive(Clone, Debug)]
pub struct BuildLogs {
    live: mpsc::UnboundedSender<Forward>,
    history: Arc<Mutex<Vec<LogEntry>>>,
}

impl BuildLogs {
    pub fn new(sink: LogSink) -> Self {
        let (live, mut queue) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                match message {
                    Forward::Entry(entry) => sink.emit(entry).await,
                    Forward::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self {
            live,
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn emit(&self, entry: LogEntry) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        let _ = self.live.send(Forward::Entry(entry));
    }

    pub async fn trace(&self, message: impl Into<String>) {
        self.emit(LogEntry::build_trace(message)).await;
    }

    /// Wait until every entry emitted so far has reached the session.
    pub async fn flush(&self) {
        let (done, delivered) = oneshot::channel();
        if self.live.send(Forward::Flush(done)).is_ok() {
            let _ = delivered.await;
        }
    }

    pub fn collected(&self) -> Vec<LogEntry> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// A build error carrying every entry collected so far.
    pub fn failure(&self, reason: impl Into<String>) -> VesselError {
        VesselError::build(reason, self.collected())
    }
}

/// Something that can turn a validated configuration into a runtime.
#[async_trait]
pub trait EnvironmentBuilder: Send + Sync {
    /// The environment kind this builder handles.
    fn kind(&self) -> &str;

    fn schema(&self) -> BuilderSchema;

    /// Reject bad configuration before anything is built.
    fn validate(&self, configuration: &Configuration) -> Result<(), VesselError> {
        self.schema().validate(configuration)
    }

    /// Build the environment. Build-tool output goes to `logs`.
    async fn build(&self, request: BuildRequest, logs: &BuildLogs) -> Result<RuntimeHandle, VesselError>;
}

/// Builders by kind.
#[derive(Clone)]
pub struct BuilderRegistry {
    builders: HashMap<String, Arc<dyn EnvironmentBuilder>>,
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for BuilderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuilderRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl BuilderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// `local`, `virtualenv` and `conda`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(LocalBuilder);
        registry.register(VirtualenvBuilder);
        registry.register(CondaBuilder);
        registry
    }

    /// Register a builder, replacing any previous one of the same kind.
    pub fn register(&mut self, builder: impl EnvironmentBuilder + 'static) {
        self.builders
            .insert(builder.kind().to_string(), Arc::new(builder));
    }

    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn EnvironmentBuilder>, VesselError> {
        self.builders
            .get(kind)
            .cloned()
            .ok_or_else(|| VesselError::UnknownEnvironmentKind(kind.to_string()))
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.builders.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn schemas(&self) -> Vec<BuilderSchema> {
        self.kinds()
            .iter()
            .filter_map(|kind| self.builders.get(kind))
            .map(|builder| builder.schema())
            .collect()
    }
}

/// Run a build tool, streaming its output as BUILD logs.
pub(crate) async fn run_logged(
    mut cmd: Command,
    logs: &BuildLogs,
    what: &str,
) -> Result<(), VesselError> {
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    tracing::debug!(tool = what, "starting build step");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            logs.emit(LogEntry::build_stderr(format!("{what}: {e}"))).await;
            return Err(logs.failure(format!("failed to start {what}: {e}")));
        }
    };

    let mut lines = OutputLines::new(child.stdout.take(), child.stderr.take());
    while let Some((level, line)) = lines.next().await {
        let entry = match level {
            LogLevel::Stderr => LogEntry::build_stderr(line),
            _ => LogEntry::build_stdout(line),
        };
        logs.emit(entry).await;
    }

    let status = child
        .wait()
        .await
        .map_err(|e| logs.failure(format!("{what}: failed to wait: {e}")))?;
    if !status.success() {
        return Err(logs.failure(format!("{what} exited with {status}")));
    }
    Ok(())
}

/// Digest of everything outside the definition that changes what a build
/// installs. Stored in the ready marker.
pub(crate) fn build_fingerprint(key: &EnvironmentKey, settings: &Settings, tool: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.0);
    hasher.update(tool.as_bytes());
    hasher.update([0]);
    hasher.update([u8::from(settings.inherit_from_local)]);
    if !settings.inherit_from_local {
        for requirement in &settings.agent_requirements {
            hasher.update(requirement.as_bytes());
            hasher.update([0]);
        }
    }
    EnvironmentKey(hasher.finalize().into()).to_hex()
}

/// Fingerprint recorded by a completed build, if `root` has one.
pub(crate) async fn ready_fingerprint(root: &Path) -> Option<String> {
    tokio::fs::read_to_string(root.join(READY_MARKER))
        .await
        .ok()
        .map(|content| content.trim().to_string())
}

pub(crate) async fn mark_ready(root: &Path, fingerprint: &str, logs: &BuildLogs) -> Result<(), VesselError> {
    tokio::fs::write(root.join(READY_MARKER), fingerprint)
        .await
        .map_err(|e| logs.failure(format!("failed to mark environment ready: {e}")))
}

/// `lib/python*/site-packages` directories under an environment root.
pub(crate) async fn site_packages(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(root.join("lib")).await else {
        return dirs;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !entry.file_name().to_string_lossy().starts_with("python") {
            continue;
        }
        let candidate = entry.path().join("site-packages");
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            dirs.push(candidate);
        }
    }
    dirs.sort();
    dirs
}

/// Remove a half-built environment so it is never mistaken for a cached one.
pub(crate) async fn remove_partial(root: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("failed to remove partial environment {}: {}", root.display(), e);
        }
    }
}
