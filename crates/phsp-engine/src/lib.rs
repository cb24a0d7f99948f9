//! PHSP Sweep Engine
//!
//! Executes parameter sweeps of simulation models as external processes
//! and tracks their progress:
//! - `store`: shared task table, the single source of truth
//! - `runner`: launches one simulator process per task
//! - `orchestrator`: runs a sweep to one aggregate outcome
//! - `monitor`: polls the store and publishes progress events
//! - `fanout`: typed publish/subscribe for lifecycle events

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fanout;
pub mod monitor;
pub mod orchestrator;
pub mod runner;
pub mod store;

// Re-export commonly used types
pub use config::{EngineConfig, SimulatorCommand};
pub use error::EngineError;
pub use fanout::{handler_fn, EventBus, EventHandler};
pub use monitor::ProgressMonitor;
pub use orchestrator::{
    aggregate_status, Orchestrator, RunHandle, SweepReport, TaskOutcome, TaskReport,
};
pub use runner::{ExitResult, ProcessHandle, ProcessRunner, RunnerError};
pub use store::TaskStore;
