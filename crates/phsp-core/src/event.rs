//! Lifecycle and progress events published to sweep subscribers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{RunId, TaskId};
use crate::{ParameterPoint, SweepStatus, TaskStatus};

/// Event types a subscriber can register for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Run accepted, before any task launches.
    RunStarted,
    /// Every task reached a terminal outcome.
    RunExited,
    /// A task's progress or cancellation state changed.
    Progress,
}

/// Progress snapshot of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Model reference, so multi-model subscribers can filter.
    pub model: PathBuf,
    /// Parameter point of the task.
    pub params: ParameterPoint,
    pub progress: u8,
    /// True while the task is cancelled but its process has not exited.
    pub cancelling: bool,
    pub status: TaskStatus,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SweepEvent {
    RunStarted {
        run_id: RunId,
        task_count: usize,
        timestamp_ms: i64,
    },
    Progress(ProgressEvent),
    RunExited {
        run_id: RunId,
        status: SweepStatus,
        /// Tail of the failing task's log for `Failed` runs.
        diagnostic: Option<String>,
        timestamp_ms: i64,
    },
}

impl SweepEvent {
    /// Create a RunStarted event.
    pub fn run_started(run_id: RunId, task_count: usize) -> Self {
        Self::RunStarted {
            run_id,
            task_count,
            timestamp_ms: now_ms(),
        }
    }

    /// Create a RunExited event.
    pub fn run_exited(run_id: RunId, status: SweepStatus, diagnostic: Option<String>) -> Self {
        Self::RunExited {
            run_id,
            status,
            diagnostic,
            timestamp_ms: now_ms(),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunStarted { .. } => EventKind::RunStarted,
            Self::Progress(_) => EventKind::Progress,
            Self::RunExited { .. } => EventKind::RunExited,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. } | Self::RunExited { run_id, .. } => run_id,
            Self::Progress(p) => &p.run_id,
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
