//! Engine-level errors.

use thiserror::Error;

use phsp_core::CoreError;

use crate::runner::RunnerError;

/// Errors surfaced by the engine to collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Domain rule violated (unknown task, invalid transition, bad input).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Process runner failure.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The run's driver went away without producing a report.
    #[error("Run {0} aborted before reporting")]
    RunAborted(String),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}
