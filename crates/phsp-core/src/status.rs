//! Status enums for Tasks and SweepRuns.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a single simulation task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, process not launched yet.
    #[default]
    Queued,
    /// Process launched and running.
    Started,
    /// Cancellation requested while the process is still running.
    Cancelling,
    /// Task ended after a cancellation request.
    Cancelled,
    /// Task ended without cancellation (successfully or not).
    Finished,
}

impl TaskStatus {
    /// Returns true if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished)
    }

    /// Returns true while the task owns a live process.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Started | Self::Cancelling)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// Overall status of a SweepRun.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SweepStatus {
    /// Run created, tasks not dispatched yet.
    #[default]
    Pending,
    /// Tasks are being dispatched or executing.
    Running,
    /// Every task finished successfully without cancellation.
    Completed,
    /// At least one task failed and none was cancelled.
    Failed,
    /// At least one task was cancelled.
    Cancelled,
}

impl SweepStatus {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the run is still active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is a legal run transition.
    pub fn can_transition_to(&self, next: SweepStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}
