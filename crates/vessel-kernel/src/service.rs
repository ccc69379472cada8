//! The service facade: Run, Submit, SetMetadata, List and Cancel.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vessel_types::{BoundFunction, TaskId, TaskInfo, VesselError};

use crate::builders::BuilderRegistry;
use crate::config::Settings;
use crate::multiplex::{self, RunStream};
use crate::session::{ExecutionSession, Runtime};
use crate::tasks::{TaskManager, TaskRecord};

/// Entry point for every caller-facing operation.
#[derive(Debug, Clone)]
pub struct Service {
    runtime: Arc<Runtime>,
    tasks: Arc<TaskManager>,
}

impl Service {
    /// A service with the default builders.
    pub fn new(settings: Settings) -> Self {
        Self::with_registry(settings, BuilderRegistry::with_defaults())
    }

    pub fn with_registry(settings: Settings, registry: BuilderRegistry) -> Self {
        Self {
            runtime: Arc::new(Runtime::new(settings, registry)),
            tasks: Arc::new(TaskManager::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn settings(&self) -> &Settings {
        &self.runtime.settings
    }

    /// Start a session and stream its logs and result.
    ///
    /// Dropping the returned stream cancels the session.
    pub fn run(&self, bound: BoundFunction) -> RunStream {
        start_session(self.runtime.clone(), bound, CancellationToken::new())
    }

    /// Run `bound` in the background and return its task id immediately.
    ///
    /// Logs are moved into the task's bounded tail chunk by chunk.
    pub async fn submit(&self, bound: BoundFunction) -> TaskId {
        let (id, cancel) = self.tasks.create(bound.clone()).await;
        let runtime = self.runtime.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            if !tasks.start(id).await {
                return;
            }
            let mut run = start_session(runtime, bound, cancel);
            let result = loop {
                match run.next().await {
                    Some(Ok(chunk)) => {
                        tasks.append_logs(id, chunk.logs).await;
                        if chunk.is_complete {
                            break chunk.result.ok_or_else(|| {
                                VesselError::InvariantViolation(
                                    "terminal chunk carried no result".to_string(),
                                )
                            });
                        }
                    }
                    Some(Err(err)) => break Err(err),
                    None => {
                        break Err(VesselError::InvariantViolation(
                            "session ended without a terminal result".to_string(),
                        ));
                    }
                }
            };
            tasks.finish(id, result).await;
        });
        id
    }

    pub async fn set_metadata(
        &self,
        id: TaskId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), VesselError> {
        self.tasks.set_metadata(id, metadata).await
    }

    pub async fn list(&self) -> Vec<TaskInfo> {
        self.tasks.list().await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<(), VesselError> {
        self.tasks.cancel(id).await
    }

    /// Full record of a task, including its result and log tail.
    pub async fn task(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.get(id).await
    }

    /// Wait for a task to reach a terminal state.
    pub async fn wait(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.wait(id).await
    }

    /// Retire every warm bridge.
    pub fn shutdown(&self) {
        self.runtime.pool.clear();
    }
}

fn start_session(runtime: Arc<Runtime>, bound: BoundFunction, cancel: CancellationToken) -> RunStream {
    let (sink, stream) = multiplex::channel(multiplex::DEFAULT_CAPACITY, cancel.clone());
    tokio::spawn(async move {
        let mut session = ExecutionSession::new(runtime, sink.clone());
        let session_id = session.id();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(session = session_id, "session cancelled");
                Err(VesselError::Cancelled)
            }
            outcome = session.run(&bound) => outcome,
        };
        if let Err(err) = sink.finish(outcome).await {
            tracing::error!("{}", err);
        }
    });
    stream
}
