//! Single-runner task scheduler.
//!
//! The scheduler owns no queue of its own. It watches the [`TaskStore`] and,
//! whenever nothing is running, admits one task and hands it to the
//! [`Pipeline`]. When a run ends it finalizes the task and immediately tries
//! the next one, so queued work drains without an external driving loop.

use crate::pipeline::{Pipeline, PipelineError, PipelineProgress};
use crate::planner::{resolve_workflow_plan_with, PlanError, SourceShape};
use crate::store::TaskStore;
use crate::task::{Task, TaskParams, TaskStatus};
use crate::tools::ToolError;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for task submission
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to probe {path}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: ToolError,
    },

    #[error("Workflow rejected: {0}")]
    Plan(#[from] PlanError),
}

/// The admitted task and the token that cancels its run.
struct ActiveRun {
    task_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    current: Option<ActiveRun>,
}

/// Admits tasks from a store one at a time.
pub struct Scheduler {
    store: Arc<TaskStore>,
    pipeline: Arc<Pipeline>,
    state: Mutex<SchedulerState>,
    /// Bumped whenever `state` changes, for [`Scheduler::wait_idle`].
    activity: watch::Sender<u64>,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, pipeline: Arc<Pipeline>) -> Arc<Self> {
        let (activity, _) = watch::channel(0);
        Arc::new(Self {
            store,
            pipeline,
            state: Mutex::new(SchedulerState::default()),
            activity,
        })
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.activity.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Spawns the background loops: one admits work whenever the store
    /// changes, the other copies pipeline progress onto the running task.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let revisions = self.store.subscribe();
        tokio::spawn(watch_store(weak, revisions));

        let progress = self.pipeline.subscribe();
        tokio::spawn(consume_progress(self.store.clone(), progress));

        self.admit_next();
    }

    /// Adds a task to the store.
    ///
    /// Workflow tasks are probed and planned first; a plan that cannot be
    /// resolved rejects the task before anything is queued.
    pub async fn enqueue(&self, task: Task) -> Result<String, SchedulerError> {
        if let TaskParams::Workflow(workflow) = &task.params {
            let probe_cancel = CancellationToken::new();
            let info = self
                .pipeline
                .tools()
                .codec
                .probe(&task.input_path, &probe_cancel)
                .await
                .map_err(|source| SchedulerError::Probe {
                    path: task.input_path.clone(),
                    source,
                })?;
            let source = SourceShape {
                width: info.width,
                height: info.height,
                fps: info.fps,
                frame_count: info.frame_count,
            };
            let plan = resolve_workflow_plan_with(self.pipeline.catalog(), &source, workflow)?;
            debug!(input = %task.input_path.display(), order = %plan.order, "Workflow accepted");
        }

        info!(task_id = %task.id, kind = %task.kind(), input = %task.input_path.display(), "Task queued");
        Ok(self.store.add_task(task))
    }

    /// Admits the next task if nothing is running.
    ///
    /// A task already marked Processing (resumed) goes first; otherwise the
    /// most recently added Pending task is taken. Returns the admitted id.
    pub fn admit_next(self: &Arc<Self>) -> Option<String> {
        let mut state = self.lock_state();
        if state.running {
            return None;
        }

        let task = self.store.modify(|tasks| {
            let index = tasks
                .iter()
                .position(|t| t.status == TaskStatus::Processing)
                .or_else(|| tasks.iter().rposition(|t| t.status == TaskStatus::Pending))?;
            let task = &mut tasks[index];
            task.begin();
            Some(task.clone())
        })?;

        let cancel = CancellationToken::new();
        state.running = true;
        state.current = Some(ActiveRun {
            task_id: task.id.clone(),
            cancel: cancel.clone(),
        });
        drop(state);
        self.touch();

        info!(task_id = %task.id, kind = %task.kind(), "Task admitted");
        let id = task.id.clone();
        tokio::spawn(self.clone().run_task(task, cancel));
        Some(id)
    }

    async fn run_task(self: Arc<Self>, task: Task, cancel: CancellationToken) {
        let result = self.pipeline.start_with_token(&task, cancel).await;
        self.finish(&task.id, result);

        {
            let mut state = self.lock_state();
            state.running = false;
            state.current = None;
        }
        self.touch();
        self.admit_next();
    }

    /// Writes the terminal status for a finished run.
    ///
    /// The run's last event is applied first; the progress consumer may not
    /// have seen it yet and drops it once the task is terminal.
    fn finish(&self, task_id: &str, result: Result<(), PipelineError>) {
        let latest = self.pipeline.last_progress();
        self.store.update_task(task_id, |task| {
            catch_up(task, latest.as_ref());
            if task.status == TaskStatus::Cancelled {
                // A cancel request already settled the outcome.
                return;
            }
            match &result {
                Ok(()) => task.complete(),
                Err(e) if e.is_cancelled() => task.cancel(),
                Err(e) => task.fail(&e.to_string()),
            }
        });
        match self.store.get_task(task_id) {
            Some(task) => info!(task_id, status = %task.status, "Task finalized"),
            None => warn!(task_id, "Finished task was removed from the store"),
        }
    }

    /// Cancels one task. Returns false when it is unknown or already terminal.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let latest = self.pipeline.last_progress();
        let cancelled = self.store.modify(|tasks| {
            match tasks.iter_mut().find(|t| t.id == task_id) {
                Some(task) if !task.is_terminal() => {
                    catch_up(task, latest.as_ref());
                    task.cancel();
                    true
                }
                _ => false,
            }
        });
        if !cancelled {
            return false;
        }

        info!(task_id, "Task cancelled");
        let state = self.lock_state();
        if let Some(run) = state.current.as_ref().filter(|run| run.task_id == task_id) {
            run.cancel.cancel();
        }
        true
    }

    /// Cancels every pending and processing task. Returns how many changed.
    pub fn cancel_all(&self) -> usize {
        let latest = self.pipeline.last_progress();
        let count = self.store.modify(|tasks| {
            let mut count = 0;
            for task in tasks.iter_mut().filter(|t| t.is_active()) {
                catch_up(task, latest.as_ref());
                task.cancel();
                count += 1;
            }
            count
        });
        if count > 0 {
            info!(count, "Cancelled all active tasks");
            let state = self.lock_state();
            if let Some(run) = state.current.as_ref() {
                run.cancel.cancel();
            }
        }
        count
    }

    /// Id of the task the pipeline is currently running.
    pub fn current_task(&self) -> Option<String> {
        self.lock_state().current.as_ref().map(|run| run.task_id.clone())
    }

    fn is_idle(&self) -> bool {
        !self.lock_state().running && !self.store.list_tasks().iter().any(Task::is_active)
    }

    /// Resolves once nothing is running and no task is waiting.
    pub async fn wait_idle(&self) {
        let mut revisions = self.store.subscribe();
        let mut activity = self.activity.subscribe();
        loop {
            if self.is_idle() {
                return;
            }
            tokio::select! {
                changed = revisions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = activity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Applies the pipeline's latest event to `task` when it belongs to it.
/// Only a task still Processing accepts it.
fn catch_up(task: &mut Task, latest: Option<&PipelineProgress>) {
    if let Some(event) = latest.filter(|event| event.task_id == task.id) {
        apply_event(task, event);
    }
}

fn apply_event(task: &mut Task, event: &PipelineProgress) {
    task.apply_progress(
        event.stage,
        event.progress,
        event.current_frame,
        event.total_frames,
        event.eta_secs,
        &event.message,
    );
}

async fn watch_store(scheduler: Weak<Scheduler>, mut revisions: watch::Receiver<u64>) {
    while revisions.changed().await.is_ok() {
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        scheduler.admit_next();
    }
}

async fn consume_progress(store: Arc<TaskStore>, mut progress: broadcast::Receiver<PipelineProgress>) {
    loop {
        match progress.recv().await {
            Ok(event) => {
                store.update_task(&event.task_id, |task| apply_event(task, &event));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
