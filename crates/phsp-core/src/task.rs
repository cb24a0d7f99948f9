//! Task and SweepRun records.
//!
//! Transitions live on the records themselves so every writer (the task
//! store, tests, snapshot tooling) applies the same rules.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, ParameterPoint, RunId, SweepStatus, TaskId, TaskStatus};

/// Upper bound of a task's progress value.
pub const MAX_PROGRESS: u8 = 100;

/// One (model, parameter point) unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Sweep run owning this task.
    pub run_id: RunId,

    /// Model file reference. Never parsed by the engine.
    pub model: PathBuf,

    /// Target parameter vector.
    pub params: ParameterPoint,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Progress in `[0, 100]`.
    pub progress: u8,

    /// Cancellation flag. Once set it never clears.
    pub cancelled: bool,

    /// Whether the process succeeded. `None` until terminal.
    pub succeeded: Option<bool>,

    /// When the task record was created.
    pub created_at: DateTime<Utc>,

    /// When the process was launched.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-task log file, once the process produced output.
    pub log_path: Option<PathBuf>,
}

impl Task {
    /// Create a new queued task.
    pub fn new(run_id: RunId, model: impl Into<PathBuf>, params: ParameterPoint) -> Self {
        Self {
            id: TaskId::generate(),
            run_id,
            model: model.into(),
            params,
            status: TaskStatus::Queued,
            progress: 0,
            cancelled: false,
            succeeded: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            log_path: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// `Queued -> Started`, or straight to `Cancelling` when cancellation
    /// raced the launch.
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != TaskStatus::Queued {
            return Err(CoreError::transition(self.status, TaskStatus::Started));
        }
        self.status = if self.cancelled {
            TaskStatus::Cancelling
        } else {
            TaskStatus::Started
        };
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Record progress. Only legal while `Started`.
    pub fn set_progress(&mut self, progress: u8) -> Result<(), CoreError> {
        if progress > MAX_PROGRESS {
            return Err(CoreError::InvalidInput(format!(
                "progress {} exceeds {}",
                progress, MAX_PROGRESS
            )));
        }
        if self.status != TaskStatus::Started {
            return Err(CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: format!("{} ({}%)", TaskStatus::Started, progress),
            });
        }
        self.progress = progress;
        Ok(())
    }

    /// Set the cancelled flag. Returns true if anything changed.
    ///
    /// Terminal tasks are left untouched; `Started` moves to `Cancelling`.
    pub fn request_cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let mut changed = !self.cancelled;
        self.cancelled = true;
        if self.status == TaskStatus::Started {
            self.status = TaskStatus::Cancelling;
            changed = true;
        }
        changed
    }

    /// Move to the terminal state, `Cancelled` if cancellation was requested.
    pub fn finish(&mut self, success: bool) -> Result<(), CoreError> {
        let next = if self.cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Finished
        };
        if self.status.is_terminal() {
            return Err(CoreError::transition(self.status, next));
        }
        self.status = next;
        self.succeeded = Some(success);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// One invocation of "run simulation" over a sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRun {
    /// Unique run identifier.
    pub id: RunId,

    /// Owned tasks in configuration order.
    pub task_ids: Vec<TaskId>,

    /// Overall status.
    pub status: SweepStatus,

    /// Run-level directory holding per-task logs.
    pub output_dir: PathBuf,

    /// Run-level log file.
    pub log_path: PathBuf,

    /// When the run was requested.
    pub created_at: DateTime<Utc>,

    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl SweepRun {
    /// Create a pending run writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let id = RunId::generate();
        let output_dir = output_dir.into().join(id.as_str());
        let log_path = output_dir.join("run.log");
        Self {
            id,
            task_ids: Vec::new(),
            status: SweepStatus::Pending,
            output_dir,
            log_path,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a run-level transition.
    pub fn transition(&mut self, next: SweepStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::transition(self.status, next));
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Log file path for one of this run's tasks.
    pub fn task_log_path(&self, task_id: &TaskId) -> PathBuf {
        self.output_dir.join(format!("{}.log", task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued() -> Task {
        Task::new(RunId::new("r"), "model.phml", ParameterPoint::new())
    }

    #[test]
    fn test_progress_rejected_when_queued() {
        let mut task = queued();
        let err = task.set_progress(10).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut task = queued();
        task.start().unwrap();
        assert!(task.started_at.is_some());
        assert!(task.start().is_err());
    }

    #[test]
    fn test_progress_out_of_range() {
        let mut task = queued();
        task.start().unwrap();
        assert!(matches!(
            task.set_progress(101),
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cancel_is_monotonic() {
        let mut task = queued();
        task.start().unwrap();
        task.set_progress(40).unwrap();

        assert!(task.request_cancel());
        assert_eq!(task.status, TaskStatus::Cancelling);
        assert!(!task.request_cancel());
        assert!(task.set_progress(50).is_err());
        assert!(task.cancelled);

        task.finish(true).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.cancelled);
        assert_eq!(task.progress, 40);
    }

    #[test]
    fn test_cancel_queued_only_sets_flag() {
        let mut task = queued();
        assert!(task.request_cancel());
        assert_eq!(task.status, TaskStatus::Queued);
        task.finish(false).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_start_after_cancel_goes_to_cancelling() {
        let mut task = queued();
        task.request_cancel();
        task.start().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelling);
        task.finish(true).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_finished_is_terminal() {
        let mut task = queued();
        task.start().unwrap();
        task.set_progress(100).unwrap();
        task.finish(true).unwrap();

        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.succeeded, Some(true));
        assert!(!task.request_cancel());
        assert!(!task.cancelled);
        assert!(task.set_progress(100).is_err());
        assert!(task.finish(false).is_err());
    }

    #[test]
    fn test_run_transitions() {
        let mut run = SweepRun::new("/tmp/out");
        assert!(run.log_path.ends_with("run.log"));
        assert!(run.transition(SweepStatus::Completed).is_err());
        run.transition(SweepStatus::Running).unwrap();
        run.transition(SweepStatus::Failed).unwrap();
        assert!(run.finished_at.is_some());
        assert!(run.transition(SweepStatus::Cancelled).is_err());
    }
}
