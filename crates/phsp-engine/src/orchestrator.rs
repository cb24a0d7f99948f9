//! Simulation orchestrator - turns a sweep configuration into supervised
//! processes and a single aggregate outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use phsp_core::{
    CoreError, EventKind, ParameterPoint, RunId, SweepConfig, SweepEvent, SweepRun, SweepStatus,
    Task, TaskId, TaskStatus,
};

use crate::config::EngineConfig;
use crate::diagnostics::tail_or_empty;
use crate::error::EngineError;
use crate::fanout::{EventBus, EventHandler};
use crate::monitor::ProgressMonitor;
use crate::runner::{ExitResult, ProcessHandle, ProcessRunner};
use crate::store::TaskStore;

/// File name of the task table snapshot inside a state directory.
pub const SNAPSHOT_FILE: &str = "tasks.json";

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Exit code 0, no cancellation.
    Succeeded,
    /// Nonzero exit or killed, no cancellation.
    Failed { code: Option<i32> },
    /// The simulator could not be started.
    LaunchFailed { message: String },
    /// Cancellation was requested before the process exited.
    Cancelled,
}

impl TaskOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::LaunchFailed { .. })
    }
}

/// Per-task line of a [`SweepReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub model: PathBuf,
    pub params: ParameterPoint,
    pub outcome: TaskOutcome,
    pub log_path: Option<PathBuf>,
}

/// Final result of a sweep run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub run_id: RunId,
    pub status: SweepStatus,
    /// Tasks in configuration order.
    pub tasks: Vec<TaskReport>,
    /// Tail of the first failing task's log; only set for `Failed` runs.
    pub diagnostic: Option<String>,
}

/// Cancelled beats failed beats completed.
pub fn aggregate_status<'a>(outcomes: impl IntoIterator<Item = &'a TaskOutcome>) -> SweepStatus {
    let mut status = SweepStatus::Completed;
    for outcome in outcomes {
        match outcome {
            TaskOutcome::Cancelled => return SweepStatus::Cancelled,
            o if o.is_failure() => status = SweepStatus::Failed,
            _ => {}
        }
    }
    status
}

/// Caller-side handle of a started sweep run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    task_ids: Vec<TaskId>,
    cancel: CancellationToken,
    task_tokens: Arc<HashMap<TaskId, CancellationToken>>,
    report: watch::Receiver<Option<SweepReport>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Owned tasks in configuration order.
    pub fn task_ids(&self) -> &[TaskId] {
        &self.task_ids
    }

    /// Whether whole-run cancellation was requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Final report, if the run already exited.
    pub fn try_report(&self) -> Option<SweepReport> {
        self.report.borrow().clone()
    }

    /// Wait for the run to exit. Resolves after `RunExited` was delivered
    /// to every subscriber.
    pub async fn wait(&self) -> Result<SweepReport, EngineError> {
        let mut rx = self.report.clone();
        let report = match rx.wait_for(Option::is_some).await {
            Ok(report) => report.clone(),
            Err(_) => None,
        };
        report.ok_or_else(|| EngineError::RunAborted(self.run_id.to_string()))
    }
}

/// Runs sweeps: creates task records, drives the process runner, monitors
/// progress and publishes lifecycle events.
#[derive(Debug)]
pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<TaskStore>,
    runner: ProcessRunner,
    bus: Arc<EventBus>,
}

impl Orchestrator {
    /// Orchestrator with an in-memory task store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(TaskStore::in_memory()))
    }

    /// Orchestrator whose task table is snapshotted to
    /// `<state_dir>/tasks.json` when `persist_tasks` is enabled.
    pub async fn open(config: EngineConfig, state_dir: &Path) -> Result<Self, EngineError> {
        let store = if config.persist_tasks {
            TaskStore::persistent(state_dir.join(SNAPSHOT_FILE)).await?
        } else {
            TaskStore::in_memory()
        };
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: EngineConfig, store: Arc<TaskStore>) -> Self {
        let runner = ProcessRunner::new(
            store.clone(),
            config.simulator.clone(),
            config.drain_timeout,
        );
        let bus = Arc::new(EventBus::new(config.event_buffer));
        Self {
            config,
            store,
            runner,
            bus,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared task store, for one-off reads by collaborators.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Register a handler. Register before [`Orchestrator::run`] to see the
    /// run's `RunStarted` event.
    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.bus.subscribe(kind, handler).await;
    }

    /// Start a sweep. Returns once `RunStarted` has been delivered; tasks run
    /// in the background.
    pub async fn run(&self, sweep: SweepConfig) -> Result<RunHandle, EngineError> {
        sweep.validate()?;

        let run = self.store.create_run(&sweep.output_dir).await;
        let mut tasks = Vec::with_capacity(sweep.len());
        for entry in &sweep.entries {
            let task_id = self
                .store
                .create_task(&run.id, entry.model.clone(), entry.params.clone())
                .await?;
            tasks.push(self.store.get(&task_id).await?);
        }
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();

        info!(
            run_id = %run.id,
            tasks = tasks.len(),
            output_dir = %run.output_dir.display(),
            "Starting sweep run"
        );

        let cancel = CancellationToken::new();
        let task_tokens: HashMap<TaskId, CancellationToken> = task_ids
            .iter()
            .map(|id| (id.clone(), cancel.child_token()))
            .collect();
        let task_tokens = Arc::new(task_tokens);
        let (report_tx, report_rx) = watch::channel(None);

        self.bus
            .publish(SweepEvent::run_started(run.id.clone(), tasks.len()))
            .await;
        self.bus.flush().await;
        self.store.set_run_status(&run.id, SweepStatus::Running).await?;

        let driver = Driver {
            config: self.config.clone(),
            store: self.store.clone(),
            runner: self.runner.clone(),
            bus: self.bus.clone(),
        };
        tokio::spawn(driver.drive(run.clone(), tasks, task_tokens.clone(), report_tx));

        Ok(RunHandle {
            run_id: run.id,
            task_ids,
            cancel,
            task_tokens,
            report: report_rx,
        })
    }

    /// Cancel every task of the run. Returns immediately; wait on the handle
    /// for the final state.
    pub async fn cancel_all(&self, handle: &RunHandle) {
        // Token first: queued tasks must not launch past this point.
        handle.cancel.cancel();
        info!(run_id = %handle.run_id, "Cancelling sweep run");
        for task_id in &handle.task_ids {
            if let Err(e) = self.store.request_cancel(task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to flag task as cancelled");
            }
        }
    }

    /// Cancel a single task of the run.
    pub async fn cancel_task(
        &self,
        handle: &RunHandle,
        task_id: &TaskId,
    ) -> Result<(), EngineError> {
        let token = handle
            .task_tokens
            .get(task_id)
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        token.cancel();
        info!(run_id = %handle.run_id, task_id = %task_id, "Cancelling task");
        self.store.request_cancel(task_id).await?;
        Ok(())
    }

    // ---- query surface ------------------------------------------------------

    pub async fn task(&self, task_id: &TaskId) -> Result<Task, EngineError> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn tasks(&self, run_id: &RunId) -> Result<Vec<Task>, EngineError> {
        Ok(self.store.tasks_for_run(run_id).await?)
    }

    pub async fn run_status(&self, run_id: &RunId) -> Result<SweepStatus, EngineError> {
        Ok(self.store.get_run(run_id).await?.status)
    }

    pub async fn get_progress(&self, task_id: &TaskId) -> Result<u8, EngineError> {
        Ok(self.store.get_progress(task_id).await?)
    }

    pub async fn is_finished(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        Ok(self.store.is_finished(task_id).await?)
    }

    pub async fn is_cancelled(&self, task_id: &TaskId) -> Result<bool, EngineError> {
        Ok(self.store.is_cancelled(task_id).await?)
    }
}

/// Everything a background run needs, detached from the orchestrator.
#[derive(Clone)]
struct Driver {
    config: EngineConfig,
    store: Arc<TaskStore>,
    runner: ProcessRunner,
    bus: Arc<EventBus>,
}

impl Driver {
    async fn drive(
        self,
        run: SweepRun,
        tasks: Vec<Task>,
        tokens: Arc<HashMap<TaskId, CancellationToken>>,
        report_tx: watch::Sender<Option<SweepReport>>,
    ) {
        let run_log = run.log_path.clone();
        let started = format!("run {} started with {} tasks", run.id, tasks.len());
        append_run_log(&run_log, &started).await;

        let monitor = ProgressMonitor::spawn(
            self.store.clone(),
            self.bus.clone(),
            run.id.clone(),
            self.config.poll_interval,
        );
        let pool = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));

        let mut reports: Vec<TaskReport> = tasks
            .iter()
            .map(|task| TaskReport {
                task_id: task.id.clone(),
                model: task.model.clone(),
                params: task.params.clone(),
                outcome: TaskOutcome::LaunchFailed {
                    message: "task supervisor aborted".to_string(),
                },
                log_path: None,
            })
            .collect();

        let mut set = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let token = tokens
                .get(&task.id)
                .cloned()
                .unwrap_or_else(CancellationToken::new);
            let log_path = run.task_log_path(&task.id);
            let driver = self.clone();
            let pool = pool.clone();
            set.spawn(async move {
                let report = driver.run_task(task, log_path, token, pool).await;
                (index, report)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, report)) => {
                    let line = format!(
                        "task {} ({}) -> {:?}",
                        report.task_id,
                        report.model.display(),
                        report.outcome
                    );
                    append_run_log(&run_log, &line).await;
                    reports[index] = report;
                }
                Err(e) => error!(run_id = %run.id, error = %e, "Task supervisor failed"),
            }
        }

        let status = aggregate_status(reports.iter().map(|r| &r.outcome));
        let diagnostic = if status == SweepStatus::Failed {
            Some(self.diagnostic(&reports).await)
        } else {
            None
        };

        monitor.stop().await;

        if let Err(e) = self.store.set_run_status(&run.id, status).await {
            error!(run_id = %run.id, error = %e, "Failed to record run status");
        }
        append_run_log(&run_log, &format!("run {} exited: {}", run.id, status)).await;
        info!(run_id = %run.id, status = %status, "Sweep run exited");

        self.bus
            .publish(SweepEvent::run_exited(run.id.clone(), status, diagnostic.clone()))
            .await;
        self.bus.flush().await;

        let report = SweepReport {
            run_id: run.id,
            status,
            tasks: reports,
            diagnostic,
        };
        // Receivers may all be gone; the run is over either way.
        let _ = report_tx.send(Some(report));
    }

    /// Execute one task to a terminal state. Never fails; every error is
    /// folded into the outcome.
    async fn run_task(
        self,
        task: Task,
        log_path: PathBuf,
        token: CancellationToken,
        pool: Arc<Semaphore>,
    ) -> TaskReport {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            permit = pool.acquire_owned() => permit.ok(),
        };

        let exit = match permit {
            Some(_permit) if !token.is_cancelled() => {
                match self.runner.start(&task, &log_path).await {
                    Ok(handle) => Ok(self.supervise(handle, &token).await),
                    Err(e) => Err(e.to_string()),
                }
            }
            _ => Err(String::new()),
        };

        // A cancel observed before the exit is processed wins.
        if token.is_cancelled() {
            if let Err(e) = self.store.request_cancel(&task.id).await {
                warn!(task_id = %task.id, error = %e, "Failed to flag task as cancelled");
            }
        }
        let success = matches!(&exit, Ok(result) if result.success());
        if let Err(e) = self.store.mark_finished(&task.id, success).await {
            error!(task_id = %task.id, error = %e, "Failed to record task outcome");
        }

        let record = self.store.get(&task.id).await.ok();
        let cancelled = record
            .as_ref()
            .map(|t| t.status == TaskStatus::Cancelled)
            .unwrap_or(token.is_cancelled());
        let outcome = match exit {
            _ if cancelled => TaskOutcome::Cancelled,
            Ok(result) if result.success() => TaskOutcome::Succeeded,
            Ok(result) => TaskOutcome::Failed { code: result.code },
            Err(message) => TaskOutcome::LaunchFailed { message },
        };
        info!(task_id = %task.id, outcome = ?outcome, "Task reached terminal state");

        TaskReport {
            task_id: task.id,
            model: task.model,
            params: task.params,
            outcome,
            log_path: record.and_then(|t| t.log_path),
        }
    }

    /// Wait for the process, killing it through the runner once `token`
    /// fires.
    async fn supervise(&self, handle: ProcessHandle, token: &CancellationToken) -> ExitResult {
        tokio::select! {
            biased;
            _ = handle.exited() => {}
            _ = token.cancelled() => self.runner.cancel(&handle),
        }
        self.runner.wait(handle).await
    }

    /// Diagnostic text for the first failing task in configuration order.
    async fn diagnostic(&self, reports: &[TaskReport]) -> String {
        let Some(failed) = reports.iter().find(|r| r.outcome.is_failure()) else {
            return String::new();
        };
        match &failed.outcome {
            TaskOutcome::LaunchFailed { message } => message.clone(),
            _ => tail_or_empty(failed.log_path.as_deref(), self.config.log_tail_lines).await,
        }
    }
}

/// Append a line to the run-level log; failures only warn.
async fn append_run_log(path: &Path, line: &str) {
    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let stamped = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), line);
        file.write_all(stamped.as_bytes()).await
    }
    .await;
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write run log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorCommand;
    use crate::diagnostics::tail_log;
    use crate::fanout::handler_fn;
    use phsp_core::{ProgressEvent, SweepEntry};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_aggregate_precedence() {
        use TaskOutcome::*;
        assert_eq!(aggregate_status(&[] as &[TaskOutcome]), SweepStatus::Completed);
        assert_eq!(aggregate_status(&[Succeeded, Succeeded]), SweepStatus::Completed);
        assert_eq!(
            aggregate_status(&[Succeeded, Failed { code: Some(1) }]),
            SweepStatus::Failed
        );
        assert_eq!(
            aggregate_status(&[
                LaunchFailed {
                    message: "x".into()
                },
                Succeeded
            ]),
            SweepStatus::Failed
        );
        assert_eq!(
            aggregate_status(&[Failed { code: None }, Cancelled]),
            SweepStatus::Cancelled
        );
    }

    /// Simulator running `script` through `sh -c`; `$1` is the model.
    fn shell(script: &str) -> EngineConfig {
        EngineConfig::new(
            SimulatorCommand::new("sh")
                .with_arg("-c")
                .with_arg(script)
                .with_arg("sim"),
        )
        .with_poll_interval(Duration::from_millis(10))
        .with_log_tail_lines(20)
        .with_persist_tasks(false)
    }

    fn sweep(dir: &Path, models: &[&str]) -> SweepConfig {
        let mut config = SweepConfig::new(dir);
        for model in models {
            config
                .entries
                .push(SweepEntry::new(*model, ParameterPoint::new().with("k", 1.0)));
        }
        config
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SweepEvent>>,
    }

    impl Recorder {
        async fn attach(orchestrator: &Orchestrator) -> Arc<Self> {
            let recorder = Arc::new(Self::default());
            for kind in [EventKind::RunStarted, EventKind::Progress, EventKind::RunExited] {
                let sink = recorder.clone();
                orchestrator
                    .subscribe(
                        kind,
                        handler_fn(move |e| sink.events.lock().unwrap().push(e.clone())),
                    )
                    .await;
            }
            recorder
        }

        fn events(&self) -> Vec<SweepEvent> {
            self.events.lock().unwrap().clone()
        }

        fn progress_for(&self, task_id: &TaskId) -> Vec<ProgressEvent> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SweepEvent::Progress(p) if &p.task_id == task_id => Some(p),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_empty_sweep_completes() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(shell("exit 0"));
        let recorder = Recorder::attach(&orchestrator).await;

        let handle = orchestrator.run(SweepConfig::new(dir.path())).await.unwrap();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Completed);
        assert!(report.tasks.is_empty());
        assert_eq!(recorder.events().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let orchestrator = Orchestrator::new(shell("exit 0"));
        let bad = SweepConfig::new("/tmp/out").with_entry("", ParameterPoint::new());
        assert!(matches!(
            orchestrator.run(bad).await,
            Err(EngineError::Core(CoreError::InvalidInput(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("launched");
        let script = format!("touch '{}'; echo PROGRESS 100", marker.display());
        let orchestrator = Orchestrator::new(shell(&script));
        let recorder = Recorder::attach(&orchestrator).await;

        let handle = orchestrator
            .run(sweep(dir.path(), &["a.phml", "b.phml"]))
            .await
            .unwrap();
        orchestrator.cancel_all(&handle).await;
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Cancelled);
        assert!(report
            .tasks
            .iter()
            .all(|t| t.outcome == TaskOutcome::Cancelled));
        for task_id in handle.task_ids() {
            let task = orchestrator.task(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert!(task.started_at.is_none());
            assert!(orchestrator.is_cancelled(task_id).await.unwrap());
        }
        assert!(!marker.exists(), "no process may be launched");

        let exits = recorder
            .events()
            .into_iter()
            .filter(|e| e.kind() == EventKind::RunExited)
            .count();
        assert_eq!(exits, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_two_models_complete() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(shell(
            "echo PROGRESS 25; echo PROGRESS 50; echo PROGRESS 75; echo PROGRESS 100; exit 0",
        ));
        let recorder = Recorder::attach(&orchestrator).await;

        let handle = orchestrator
            .run(sweep(dir.path(), &["a.phml", "b.phml"]))
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Completed);
        assert_eq!(report.diagnostic, None);
        assert_eq!(
            orchestrator.run_status(handle.run_id()).await.unwrap(),
            SweepStatus::Completed
        );

        for task_id in handle.task_ids() {
            let task = orchestrator.task(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Finished);
            assert_eq!(task.progress, 100);
            assert_eq!(task.succeeded, Some(true));
            assert!(task.log_path.is_some());

            let progress: Vec<u8> = recorder
                .progress_for(task_id)
                .iter()
                .map(|p| p.progress)
                .collect();
            assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{:?}", progress);
            assert_eq!(progress.last(), Some(&100));
        }

        let events = recorder.events();
        assert_eq!(events.first().map(SweepEvent::kind), Some(EventKind::RunStarted));
        assert_eq!(events.last().map(SweepEvent::kind), Some(EventKind::RunExited));
        assert_eq!(
            events
                .iter()
                .filter(|e| e.kind() == EventKind::RunExited)
                .count(),
            1
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_model_reports_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
            echo PROGRESS 10
            if [ "$1" = "bad.phml" ]; then
                echo "integrator diverged at t=3.5" >&2
                echo "aborting $1"
                exit 2
            fi
            echo PROGRESS 100
        "#;
        let orchestrator = Orchestrator::new(shell(script));
        let recorder = Recorder::attach(&orchestrator).await;

        let handle = orchestrator
            .run(sweep(dir.path(), &["good.phml", "bad.phml"]))
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Failed);
        assert_eq!(report.tasks[0].outcome, TaskOutcome::Succeeded);
        assert_eq!(report.tasks[1].outcome, TaskOutcome::Failed { code: Some(2) });

        let log_path = report.tasks[1].log_path.clone().expect("log recorded");
        let expected = tail_log(&log_path, 20).await.unwrap();
        assert!(expected.contains("integrator diverged"));
        assert_eq!(report.diagnostic.as_deref(), Some(expected.as_str()));

        let bad = orchestrator.task(&report.tasks[1].task_id).await.unwrap();
        assert_eq!(bad.status, TaskStatus::Finished);
        assert_eq!(bad.succeeded, Some(false));

        match recorder.events().last() {
            Some(SweepEvent::RunExited {
                status, diagnostic, ..
            }) => {
                assert_eq!(*status, SweepStatus::Failed);
                assert_eq!(diagnostic.as_deref(), Some(expected.as_str()));
            }
            other => panic!("expected RunExited last, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_all_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(shell("echo PROGRESS 40; exec sleep 30"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.subscribe(EventKind::Progress, Arc::new(tx)).await;

        let handle = orchestrator
            .run(sweep(dir.path(), &["a.phml", "b.phml"]))
            .await
            .unwrap();

        let mut at_forty = std::collections::HashSet::new();
        while at_forty.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("progress in time")
                .expect("bus alive");
            if let SweepEvent::Progress(p) = event {
                if p.progress == 40 {
                    at_forty.insert(p.task_id);
                }
            }
        }

        orchestrator.cancel_all(&handle).await;
        let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("cancelled run exits quickly")
            .unwrap();

        assert_eq!(report.status, SweepStatus::Cancelled);
        for task_id in handle.task_ids() {
            let task = orchestrator.task(task_id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert_eq!(task.progress, 40);
            assert!(task.cancelled);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_single_task() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
            echo PROGRESS 40
            if [ "$1" = "slow.phml" ]; then exec sleep 30; fi
            echo PROGRESS 100
        "#;
        let orchestrator = Orchestrator::new(shell(script));
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.subscribe(EventKind::Progress, Arc::new(tx)).await;

        let handle = orchestrator
            .run(sweep(dir.path(), &["fast.phml", "slow.phml"]))
            .await
            .unwrap();
        let slow = handle.task_ids()[1].clone();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("progress in time")
                .expect("bus alive");
            if matches!(&event, SweepEvent::Progress(p) if p.task_id == slow && p.progress == 40) {
                break;
            }
        }
        orchestrator.cancel_task(&handle, &slow).await.unwrap();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Cancelled);
        assert_eq!(report.tasks[0].outcome, TaskOutcome::Succeeded);
        assert_eq!(report.tasks[1].outcome, TaskOutcome::Cancelled);
        assert!(!handle.is_cancel_requested());

        let unknown = orchestrator.cancel_task(&handle, &TaskId::new("nope")).await;
        assert!(matches!(
            unknown,
            Err(EngineError::Core(CoreError::TaskNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_missing_simulator_fails_with_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(SimulatorCommand::new(dir.path().join("absent-sim")))
            .with_poll_interval(Duration::from_millis(10))
            .with_persist_tasks(false);
        let orchestrator = Orchestrator::new(config);

        let handle = orchestrator
            .run(sweep(dir.path(), &["a.phml"]))
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Failed);
        assert!(matches!(
            report.tasks[0].outcome,
            TaskOutcome::LaunchFailed { .. }
        ));
        let diagnostic = report.diagnostic.unwrap();
        assert!(diagnostic.contains("absent-sim"), "{}", diagnostic);
        let task = orchestrator.task(&report.tasks[0].task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_persists_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell("echo PROGRESS 100").with_persist_tasks(true);
        let orchestrator = Orchestrator::open(config, dir.path()).await.unwrap();

        let handle = orchestrator
            .run(sweep(dir.path(), &["a.phml"]))
            .await
            .unwrap();
        handle.wait().await.unwrap();

        let restored = TaskStore::load(dir.path().join(SNAPSHOT_FILE)).await.unwrap();
        let run = restored.get_run(handle.run_id()).await.unwrap();
        assert_eq!(run.status, SweepStatus::Completed);
        assert!(run.log_path.exists());
        let task = restored.get(&handle.task_ids()[0]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_without_log_has_empty_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        // Output directory below a regular file: no log can be created.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let orchestrator = Orchestrator::new(shell("echo PROGRESS 60; exit 4"));

        let handle = orchestrator
            .run(sweep(&blocker.join("out"), &["a.phml"]))
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, SweepStatus::Failed);
        assert_eq!(report.tasks[0].outcome, TaskOutcome::Failed { code: Some(4) });
        assert_eq!(report.tasks[0].log_path, None);
        assert_eq!(report.diagnostic.as_deref(), Some(""));

        let task = orchestrator.task(&report.tasks[0].task_id).await.unwrap();
        assert_eq!(task.progress, 60);
        assert_eq!(task.status, TaskStatus::Finished);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_all_reaches_simulator_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("child-finished");
        let script = format!(
            "echo PROGRESS 40; (sleep 2; touch '{}'); echo PROGRESS 100",
            marker.display()
        );
        let orchestrator = Orchestrator::new(shell(&script));
        let (tx, mut rx) = mpsc::unbounded_channel();
        orchestrator.subscribe(EventKind::Progress, Arc::new(tx)).await;

        let handle = orchestrator
            .run(sweep(dir.path(), &["a.phml"]))
            .await
            .unwrap();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("progress in time")
                .expect("bus alive");
            if matches!(&event, SweepEvent::Progress(p) if p.progress == 40) {
                break;
            }
        }

        orchestrator.cancel_all(&handle).await;
        let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
            .await
            .expect("cancelled run exits quickly")
            .unwrap();
        assert_eq!(report.status, SweepStatus::Cancelled);
        assert_eq!(report.tasks[0].outcome, TaskOutcome::Cancelled);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "simulator child outlived the cancel");
    }
}
