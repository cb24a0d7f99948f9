//! Core domain errors.

use thiserror::Error;

/// Core domain errors for PHSP sweeps.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Run not found.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Build an `InvalidTransition` from any two displayable states.
    pub fn transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
