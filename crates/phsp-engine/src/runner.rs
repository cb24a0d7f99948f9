//! Process runner: one external simulation process per task.
//!
//! The simulator is invoked as `<program> <args...> <model> <name=value...>`
//! and reports progress by printing `PROGRESS <n>` lines on stdout. Every
//! stdout/stderr line is appended to the task's log file.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use phsp_core::{CoreError, Task, TaskId, MAX_PROGRESS};

use crate::config::SimulatorCommand;
use crate::store::TaskStore;

/// Prefix of a progress report line on the simulator's stdout.
pub const PROGRESS_PREFIX: &str = "PROGRESS";

/// Errors raised by the process runner itself.
///
/// A nonzero exit code is not an error; it is reported through [`ExitResult`].
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The simulator could not be spawned.
    #[error("Failed to launch '{program}': {source}")]
    LaunchError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Task store rejected a transition.
    #[error(transparent)]
    Store(#[from] CoreError),
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitResult {
    /// Exit code; `None` when killed by a signal or never reaped.
    pub code: Option<i32>,
    /// Whether the kill switch was fired before the process was reaped.
    pub cancelled: bool,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Ties a task to its OS process. Consumed by [`ProcessRunner::wait`].
#[derive(Debug)]
pub struct ProcessHandle {
    task_id: TaskId,
    pid: Option<u32>,
    log_path: Option<PathBuf>,
    kill: CancellationToken,
    exited: CancellationToken,
    supervisor: JoinHandle<std::io::Result<ExitStatus>>,
    output: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// OS process id, if the process was still alive when queried at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Log file, or `None` if it could not be opened.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Resolves once the process has been reaped. Does not consume the
    /// handle, so callers can still [`ProcessRunner::cancel`] while waiting.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }
}

/// Launches and supervises simulation processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    store: Arc<TaskStore>,
    simulator: SimulatorCommand,
    drain_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(
        store: Arc<TaskStore>,
        simulator: SimulatorCommand,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            store,
            simulator,
            drain_timeout,
        }
    }

    /// Launch the simulator for `task`, writing output to `log_path`.
    ///
    /// On unix the process leads its own process group, so a cancel also
    /// reaches anything it spawned. On success the task moves
    /// `Queued -> Started`.
    pub async fn start(&self, task: &Task, log_path: &Path) -> Result<ProcessHandle, RunnerError> {
        let program = self.simulator.program.display().to_string();
        info!(
            task_id = %task.id,
            program = %program,
            model = %task.model.display(),
            params = %task.params,
            "Launching simulation"
        );

        let log = match open_log(log_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    path = %log_path.display(),
                    error = %e,
                    "Cannot open task log, output will not be captured"
                );
                None
            }
        };

        let mut cmd = Command::new(&self.simulator.program);
        cmd.args(&self.simulator.args)
            .arg(&task.model)
            .args(task.params.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let (stderr, log) = match log {
            Some(file) => match stderr_sink(&file).await {
                Ok(stdio) => (stdio, Some(file)),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Cannot share task log with stderr");
                    (Stdio::null(), Some(file))
                }
            },
            None => (Stdio::null(), None),
        };
        cmd.stderr(stderr);
        let captured = log.is_some();
        debug!(task_id = %task.id, "Full command: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|source| {
            error!(
                task_id = %task.id,
                program = %program,
                error = %source,
                "Failed to spawn simulator"
            );
            RunnerError::LaunchError {
                program: program.clone(),
                source,
            }
        })?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let kill = CancellationToken::new();
        let exited = CancellationToken::new();

        if let Err(e) = self.store.mark_started(&task.id).await {
            warn!(task_id = %task.id, error = %e, "Task rejected start, killing orphaned process");
            kill_process_group(&mut child, &task.id);
            return Err(e.into());
        }
        info!(task_id = %task.id, pid = ?pid, "Simulation process started");

        let output = tokio::spawn(pump_output(
            self.store.clone(),
            task.id.clone(),
            stdout,
            log,
        ));

        let supervisor_kill = kill.clone();
        let supervisor_exited = exited.clone();
        let supervisor_task = task.id.clone();
        let supervisor = tokio::spawn(async move {
            // Fires on every exit path, including abort.
            let _exited = supervisor_exited.drop_guard();
            tokio::select! {
                status = child.wait() => status,
                _ = supervisor_kill.cancelled() => {
                    info!(task_id = %supervisor_task, "Killing simulation process group");
                    kill_process_group(&mut child, &supervisor_task);
                    child.wait().await
                }
            }
        });

        Ok(ProcessHandle {
            task_id: task.id.clone(),
            pid,
            log_path: captured.then(|| log_path.to_path_buf()),
            kill,
            exited,
            supervisor,
            output,
        })
    }

    /// Ask the process to terminate. Non-blocking; task status is untouched.
    pub fn cancel(&self, handle: &ProcessHandle) {
        if !handle.kill.is_cancelled() {
            info!(task_id = %handle.task_id, pid = ?handle.pid, "Cancel requested for process");
            handle.kill.cancel();
        }
    }

    /// Wait for the process to exit and its output to drain.
    ///
    /// Never fails for nonzero exits; records the log path on the task.
    pub async fn wait(&self, handle: ProcessHandle) -> ExitResult {
        let ProcessHandle {
            task_id,
            log_path,
            kill,
            supervisor,
            mut output,
            ..
        } = handle;

        let code = match supervisor.await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                error!(task_id = %task_id, error = %e, "Failed to reap simulation process");
                None
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Process supervisor panicked");
                None
            }
        };

        if tokio::time::timeout(self.drain_timeout, &mut output).await.is_err() {
            warn!(task_id = %task_id, "Output did not drain in time, abandoning reader");
            output.abort();
        }

        if let Some(path) = log_path {
            if let Err(e) = self.store.set_log_path(&task_id, path).await {
                warn!(task_id = %task_id, error = %e, "Failed to record log path");
            }
        }

        let result = ExitResult {
            code,
            cancelled: kill.is_cancelled(),
        };
        info!(
            task_id = %task_id,
            exit_code = ?result.code,
            cancelled = result.cancelled,
            "Simulation process exited"
        );
        result
    }
}

/// Parse a `PROGRESS <n>` line.
pub fn parse_progress(line: &str) -> Option<u8> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let value = rest.trim_start_matches(':').trim().parse::<u8>().ok()?;
    (value <= MAX_PROGRESS).then_some(value)
}

async fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

async fn stderr_sink(file: &File) -> std::io::Result<Stdio> {
    let clone = file.try_clone().await?;
    Ok(Stdio::from(clone.into_std().await))
}

/// SIGKILL the process group led by `child`; falls back to the child alone.
#[cfg(unix)]
fn kill_process_group(child: &mut Child, task_id: &TaskId) {
    if let Some(pid) = child.id() {
        // The child was spawned with process_group(0): its pid is the pgid.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            return;
        }
        let e = std::io::Error::last_os_error();
        debug!(task_id = %task_id, pid, error = %e, "killpg failed, killing child only");
    }
    if let Err(e) = child.start_kill() {
        // Already exited between the two branches.
        debug!(task_id = %task_id, error = %e, "start_kill failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child, task_id: &TaskId) {
    if let Err(e) = child.start_kill() {
        debug!(task_id = %task_id, error = %e, "start_kill failed");
    }
}

/// Copy stdout into the log and forward progress reports to the store.
///
/// Lines are handled as raw bytes: the log receives them unchanged and
/// progress is parsed from a lossy decode. The pipe is always drained to
/// EOF so the simulator never writes into a closed pipe.
async fn pump_output(
    store: Arc<TaskStore>,
    task_id: TaskId,
    stdout: Option<ChildStdout>,
    mut log: Option<File>,
) {
    let Some(stdout) = stdout else {
        warn!(task_id = %task_id, "No stdout handle, progress will not be tracked");
        return;
    };

    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    let mut last_progress = 0u8;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(
                    task_id = %task_id,
                    error = %e,
                    "Error reading simulator stdout, discarding the rest"
                );
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!(task_id = %task_id, error = %e, "Drain of simulator stdout failed");
                }
                break;
            }
        }
        if !line.ends_with(b"\n") {
            line.push(b'\n');
        }

        if let Some(file) = log.as_mut() {
            if let Err(e) = file.write_all(&line).await {
                warn!(task_id = %task_id, error = %e, "Task log write failed, dropping log");
                log = None;
            }
        }

        let Some(progress) = parse_progress(&String::from_utf8_lossy(&line)) else {
            continue;
        };
        if progress <= last_progress {
            continue;
        }
        match store.set_progress(&task_id, progress).await {
            Ok(()) => {
                last_progress = progress;
                debug!(task_id = %task_id, progress, "Progress updated");
            }
            Err(e) => {
                // Typically the task moved to Cancelling.
                debug!(task_id = %task_id, progress, error = %e, "Progress update rejected");
            }
        }
    }

    if let Some(mut file) = log {
        if let Err(e) = file.flush().await {
            warn!(task_id = %task_id, error = %e, "Failed to flush task log");
        }
    }
}
