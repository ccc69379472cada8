//! Registry of background tasks started with Submit.
//!
//! Status moves `PENDING → RUNNING → DONE | FAILED | CANCELLED`. Terminal
//! states never change again, so a late result for a cancelled task is
//! dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use vessel_types::{
    BoundFunction, LogEntry, SerializedObject, TaskId, TaskInfo, TaskStatus, VesselError,
};

/// Most recent log entries kept per task.
pub const MAX_TASK_LOGS: usize = 1000;

/// Everything known about a submitted task.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub bound_function: BoundFunction,
    pub status: TaskStatus,
    pub metadata: BTreeMap<String, String>,
    pub result: Option<SerializedObject>,
    pub error: Option<String>,
    /// Tail of the task's logs, oldest first.
    pub logs: VecDeque<LogEntry>,
}

impl TaskRecord {
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            description: self.bound_function.describe(),
            status: self.status,
            metadata: self.metadata.clone(),
            error: self.error.clone(),
        }
    }
}

struct Task {
    record: TaskRecord,
    cancel: CancellationToken,
    status: watch::Sender<TaskStatus>,
}

impl Task {
    fn set_status(&mut self, status: TaskStatus) {
        self.record.status = status;
        self.status.send_replace(status);
    }
}

/// Tracks submitted tasks by id.
pub struct TaskManager {
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TaskId, Task>>>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new `PENDING` task.
    pub async fn create(&self, bound_function: BoundFunction) -> (TaskId, CancellationToken) {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        let (status, _) = watch::channel(TaskStatus::Pending);
        let task = Task {
            record: TaskRecord {
                id,
                bound_function,
                status: TaskStatus::Pending,
                metadata: BTreeMap::new(),
                result: None,
                error: None,
                logs: VecDeque::new(),
            },
            cancel: cancel.clone(),
            status,
        };
        self.tasks.lock().await.insert(id, task);
        tracing::debug!(task = %id, "task created");
        (id, cancel)
    }

    /// `PENDING → RUNNING`. Returns false if the task is gone or was
    /// cancelled before it started.
    pub async fn start(&self, id: TaskId) -> bool {
        let mut tasks = self.tasks.lock().await;
        match tasks.get_mut(&id) {
            Some(task) if task.record.status == TaskStatus::Pending => {
                task.set_status(TaskStatus::Running);
                true
            }
            _ => false,
        }
    }

    /// Append log entries to the task's bounded tail as they arrive.
    pub async fn append_logs(&self, id: TaskId, logs: Vec<LogEntry>) {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        for entry in logs {
            if task.record.logs.len() == MAX_TASK_LOGS {
                task.record.logs.pop_front();
            }
            task.record.logs.push_back(entry);
        }
    }

    /// Record the session result. Ignored if the task is already terminal.
    pub async fn finish(&self, id: TaskId, result: Result<SerializedObject, VesselError>) {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        if task.record.status.is_terminal() {
            tracing::debug!(task = %id, status = %task.record.status, "late outcome dropped");
            return;
        }
        let status = match result {
            Ok(result) => {
                task.record.result = Some(result);
                TaskStatus::Done
            }
            Err(VesselError::Cancelled) => TaskStatus::Cancelled,
            Err(err) => {
                task.record.error = Some(err.to_string());
                TaskStatus::Failed
            }
        };
        task.set_status(status);
        tracing::debug!(task = %id, %status, "task finished");
    }

    /// Merge `metadata` into the task's metadata.
    pub async fn set_metadata(
        &self,
        id: TaskId,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), VesselError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| VesselError::NotFound(format!("task {id}")))?;
        task.record.metadata.extend(metadata);
        Ok(())
    }

    /// Request cancellation. Terminal tasks are left alone.
    pub async fn cancel(&self, id: TaskId) -> Result<(), VesselError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| VesselError::NotFound(format!("task {id}")))?;
        if task.record.status.is_terminal() {
            return Ok(());
        }
        task.cancel.cancel();
        task.set_status(TaskStatus::Cancelled);
        tracing::debug!(task = %id, "task cancelled");
        Ok(())
    }

    /// All tasks, ordered by id.
    pub async fn list(&self) -> Vec<TaskInfo> {
        let tasks = self.tasks.lock().await;
        let mut infos: Vec<TaskInfo> = tasks.values().map(|t| t.record.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub async fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.lock().await.get(&id).map(|t| t.record.clone())
    }

    /// Wait until the task is terminal and return its record.
    pub async fn wait(&self, id: TaskId) -> Option<TaskRecord> {
        let mut status = {
            let tasks = self.tasks.lock().await;
            tasks.get(&id)?.status.subscribe()
        };
        // The sender lives in the registry; an error means it was removed.
        let _ = status.wait_for(|s| s.is_terminal()).await;
        self.get(id).await
    }

    /// Remove terminal tasks. Returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| !task.record.status.is_terminal());
        before - tasks.len()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
