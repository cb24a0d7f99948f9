//! PHSP Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Async runtimes
//! - Process management
//! - File I/O
//!
//! Tasks, sweep runs, sweep configuration and the events published about
//! them all live here so collaborators (UI, CLI) can depend on the types
//! without pulling in the engine.

pub mod error;
pub mod event;
pub mod ids;
pub mod status;
pub mod sweep;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use event::{EventKind, ProgressEvent, SweepEvent};
pub use ids::{RunId, TaskId};
pub use status::{SweepStatus, TaskStatus};
pub use sweep::{ModelSweep, ParameterAxis, ParameterPoint, SweepConfig, SweepEntry, SweepFile};
pub use task::{SweepRun, Task, MAX_PROGRESS};
