//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// External simulation executable and its fixed leading arguments.
///
/// Each task runs `<program> <args...> <model> <name=value...>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorCommand {
    /// Executable name (PATH lookup) or full path.
    pub program: PathBuf,

    /// Arguments placed before the model reference.
    pub args: Vec<String>,
}

impl SimulatorCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Builder method to append a leading argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl Default for SimulatorCommand {
    fn default() -> Self {
        Self::new("flint-exec")
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Simulation executable.
    pub simulator: SimulatorCommand,

    /// Maximum number of simulation processes alive at once.
    pub max_concurrent_tasks: usize,

    /// Progress monitor polling cadence.
    pub poll_interval: Duration,

    /// Capacity of the event fan-out queue.
    pub event_buffer: usize,

    /// Lines of the failing task's log reported as diagnostic.
    pub log_tail_lines: usize,

    /// How long to wait for a process's output to drain after it exits.
    pub drain_timeout: Duration,

    /// Write a JSON snapshot of the task table under the output directory.
    pub persist_tasks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            simulator: SimulatorCommand::default(),
            max_concurrent_tasks: 4,
            poll_interval: Duration::from_millis(200),
            event_buffer: 1024,
            log_tail_lines: 50,
            drain_timeout: Duration::from_secs(2),
            persist_tasks: true,
        }
    }
}

impl EngineConfig {
    /// Create a config running the given simulator with default settings.
    pub fn new(simulator: SimulatorCommand) -> Self {
        Self {
            simulator,
            ..Self::default()
        }
    }

    /// Set the worker pool size (at least one).
    pub fn with_max_concurrent_tasks(mut self, n: usize) -> Self {
        self.max_concurrent_tasks = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the fan-out queue capacity (at least one).
    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn with_log_tail_lines(mut self, lines: usize) -> Self {
        self.log_tail_lines = lines;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_persist_tasks(mut self, persist: bool) -> Self {
        self.persist_tasks = persist;
        self
    }
}
