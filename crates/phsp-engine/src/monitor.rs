//! Background poller turning task store changes into progress events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use phsp_core::{ProgressEvent, RunId, SweepEvent, Task, TaskId, TaskStatus};

use crate::fanout::EventBus;
use crate::store::TaskStore;

/// What a subscriber last saw for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Seen {
    progress: u8,
    status: TaskStatus,
}

/// Polling loop scoped to one sweep run. Stopped by the orchestrator.
#[derive(Debug)]
pub struct ProgressMonitor {
    run_id: RunId,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressMonitor {
    /// Start polling `run_id` every `interval`.
    pub fn spawn(
        store: Arc<TaskStore>,
        bus: Arc<EventBus>,
        run_id: RunId,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            store,
            bus,
            run_id.clone(),
            interval,
            stop.clone(),
        ));
        info!(
            run_id = %run_id,
            interval_ms = interval.as_millis() as u64,
            "Progress monitor started"
        );
        Self {
            run_id,
            stop,
            handle,
        }
    }

    /// Run one final poll, publish what changed, and end the loop.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            warn!(run_id = %self.run_id, error = %e, "Progress monitor ended abnormally");
        }
        info!(run_id = %self.run_id, "Progress monitor stopped");
    }
}

async fn poll_loop(
    store: Arc<TaskStore>,
    bus: Arc<EventBus>,
    run_id: RunId,
    period: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut seen: HashMap<TaskId, Seen> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                poll_once(&store, &bus, &run_id, &mut seen).await;
                break;
            }
            _ = interval.tick() => {
                poll_once(&store, &bus, &run_id, &mut seen).await;
            }
        }
    }
}

/// Publish a progress event for every task whose snapshot changed.
///
/// Queued tasks are skipped. A task that turned terminal is published once
/// more with its final values and then never again, since terminal records
/// do not change.
async fn poll_once(
    store: &TaskStore,
    bus: &EventBus,
    run_id: &RunId,
    seen: &mut HashMap<TaskId, Seen>,
) {
    let tasks = match store.tasks_for_run(run_id).await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "Progress poll failed");
            return;
        }
    };

    for task in tasks {
        if task.status == TaskStatus::Queued {
            continue;
        }
        let now = Seen {
            progress: task.progress,
            status: task.status,
        };
        if seen.get(&task.id) == Some(&now) {
            continue;
        }
        debug!(
            task_id = %task.id,
            progress = now.progress,
            status = %now.status,
            "Progress changed"
        );
        seen.insert(task.id.clone(), now);
        bus.publish(SweepEvent::Progress(progress_event(task))).await;
    }
}

fn progress_event(task: Task) -> ProgressEvent {
    ProgressEvent {
        run_id: task.run_id,
        task_id: task.id,
        model: task.model,
        params: task.params,
        progress: task.progress,
        cancelling: task.status == TaskStatus::Cancelling,
        status: task.status,
    }
}
