//! Task store - the single source of truth for run and task state.
//!
//! Every mutation takes the table's write lock for its whole duration, so a
//! reader never observes a half-applied transition. Persistent stores write
//! a JSON snapshot of the table on lifecycle changes before releasing the
//! lock, keeping snapshot order identical to mutation order. Progress
//! updates only reach disk with the next lifecycle change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use phsp_core::{CoreError, ParameterPoint, RunId, SweepRun, SweepStatus, Task, TaskId};

use crate::error::EngineError;

/// Serialized form of the store.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TaskTable {
    pub runs: BTreeMap<RunId, SweepRun>,
    pub tasks: BTreeMap<TaskId, Task>,
}

/// Durable table of sweep runs and their tasks.
#[derive(Debug, Default)]
pub struct TaskStore {
    table: RwLock<TaskTable>,
    snapshot_path: Option<PathBuf>,
}

impl TaskStore {
    /// Store without persistence.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store that snapshots itself to `path` after every lifecycle change.
    pub async fn persistent(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(Self {
            table: RwLock::new(TaskTable::default()),
            snapshot_path: Some(path),
        })
    }

    /// Restore a table from a snapshot for inspection. The result does not
    /// write back to `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let table: TaskTable = serde_json::from_str(&content)?;
        Ok(Self {
            table: RwLock::new(table),
            snapshot_path: None,
        })
    }

    /// Where snapshots are written, if anywhere.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    // ---- runs --------------------------------------------------------------

    /// Create a pending run writing into `output_dir`.
    pub async fn create_run(&self, output_dir: impl Into<PathBuf>) -> SweepRun {
        let run = SweepRun::new(output_dir);
        let mut table = self.table.write().await;
        table.runs.insert(run.id.clone(), run.clone());
        self.persist(&table).await;
        run
    }

    /// Get a run by ID.
    pub async fn get_run(&self, run_id: &RunId) -> Result<SweepRun, CoreError> {
        self.table
            .read()
            .await
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))
    }

    /// All runs, oldest first.
    pub async fn runs(&self) -> Vec<SweepRun> {
        let mut runs: Vec<SweepRun> = self.table.read().await.runs.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    /// Apply a run-level status transition.
    pub async fn set_run_status(
        &self,
        run_id: &RunId,
        status: SweepStatus,
    ) -> Result<(), CoreError> {
        let mut table = self.table.write().await;
        let run = table
            .runs
            .get_mut(run_id)
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;
        run.transition(status)?;
        debug!(run_id = %run_id, status = %status, "Run status updated");
        self.persist(&table).await;
        Ok(())
    }

    /// Remove a finished run and all its tasks.
    pub async fn discard_run(&self, run_id: &RunId) -> Result<(), CoreError> {
        let mut table = self.table.write().await;
        let run = table
            .runs
            .get(run_id)
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;
        if run.status.is_active() {
            return Err(CoreError::transition(run.status, "DISCARDED"));
        }
        if let Some(run) = table.runs.remove(run_id) {
            for task_id in &run.task_ids {
                table.tasks.remove(task_id);
            }
        }
        self.persist(&table).await;
        Ok(())
    }

    // ---- tasks -------------------------------------------------------------

    /// Create a queued task owned by `run_id`.
    pub async fn create_task(
        &self,
        run_id: &RunId,
        model: impl Into<PathBuf>,
        params: ParameterPoint,
    ) -> Result<TaskId, CoreError> {
        let mut table = self.table.write().await;
        let run = table
            .runs
            .get_mut(run_id)
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;
        let task = Task::new(run_id.clone(), model, params);
        let task_id = task.id.clone();
        run.task_ids.push(task_id.clone());
        table.tasks.insert(task_id.clone(), task);
        self.persist(&table).await;
        Ok(task_id)
    }

    /// Get a task by ID.
    pub async fn get(&self, task_id: &TaskId) -> Result<Task, CoreError> {
        self.table
            .read()
            .await
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    /// Tasks of a run in creation order.
    pub async fn tasks_for_run(&self, run_id: &RunId) -> Result<Vec<Task>, CoreError> {
        let table = self.table.read().await;
        let run = table
            .runs
            .get(run_id)
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;
        Ok(run
            .task_ids
            .iter()
            .filter_map(|id| table.tasks.get(id).cloned())
            .collect())
    }

    /// `Queued -> Started`.
    pub async fn mark_started(&self, task_id: &TaskId) -> Result<(), CoreError> {
        self.mutate(task_id, true, Task::start).await
    }

    /// Record progress; the task must be `Started`. Not snapshotted on its own.
    pub async fn set_progress(&self, task_id: &TaskId, progress: u8) -> Result<(), CoreError> {
        self.mutate(task_id, false, |task| task.set_progress(progress)).await
    }

    /// Move to the terminal state (`Cancelled` if cancellation was requested).
    pub async fn mark_finished(&self, task_id: &TaskId, success: bool) -> Result<(), CoreError> {
        self.mutate(task_id, true, |task| task.finish(success)).await
    }

    /// Set the cancelled flag; idempotent, no-op on terminal tasks.
    pub async fn request_cancel(&self, task_id: &TaskId) -> Result<(), CoreError> {
        let mut table = self.table.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if task.request_cancel() {
            debug!(task_id = %task_id, status = %task.status, "Cancellation requested");
            self.persist(&table).await;
        }
        Ok(())
    }

    /// Record the task's log file.
    pub async fn set_log_path(
        &self,
        task_id: &TaskId,
        path: impl Into<PathBuf>,
    ) -> Result<(), CoreError> {
        let path = path.into();
        self.mutate(task_id, true, move |task| {
            task.log_path = Some(path);
            Ok(())
        })
        .await
    }

    pub async fn is_cancelled(&self, task_id: &TaskId) -> Result<bool, CoreError> {
        self.read(task_id, |t| t.cancelled).await
    }

    /// True while the task owns a live process.
    pub async fn is_started(&self, task_id: &TaskId) -> Result<bool, CoreError> {
        self.read(task_id, |t| t.status.is_running()).await
    }

    /// True once the task reached `Finished` or `Cancelled`.
    pub async fn is_finished(&self, task_id: &TaskId) -> Result<bool, CoreError> {
        self.read(task_id, |t| t.status.is_terminal()).await
    }

    pub async fn get_progress(&self, task_id: &TaskId) -> Result<u8, CoreError> {
        self.read(task_id, |t| t.progress).await
    }

    async fn read<T>(&self, task_id: &TaskId, f: impl FnOnce(&Task) -> T) -> Result<T, CoreError> {
        let table = self.table.read().await;
        table
            .tasks
            .get(task_id)
            .map(f)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    async fn mutate<T>(
        &self,
        task_id: &TaskId,
        snapshot: bool,
        f: impl FnOnce(&mut Task) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let mut table = self.table.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        let out = f(task)?;
        if snapshot {
            self.persist(&table).await;
        }
        Ok(out)
    }

    async fn persist(&self, table: &TaskTable) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let bytes = match serde_json::to_vec_pretty(table) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to serialize task table");
                return;
            }
        };
        let tmp = path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to write task table snapshot");
        }
    }
}
