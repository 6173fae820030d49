//! Per-task processing pipeline.
//!
//! A run walks `Extract -> Process (one or more steps) -> Encode -> Done`
//! inside a private temporary directory, publishing progress events on a
//! broadcast channel. Only one run may be in flight per pipeline.

use crate::frames::{resolve_frame_sequence, FrameSequenceError};
use crate::params::{InterpolateParams, ModelCatalog, UpscaleParams};
use crate::planner::{resolve_workflow_plan_with, PlanError, SourceShape, WorkflowPlan, WorkflowStep};
use crate::task::{current_timestamp_ms, Task, TaskParams, TaskStage};
use crate::tools::{EncodeJob, EncodeTarget, ToolError, Tools, VideoInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the progress broadcast channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Error type for pipeline runs
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Processing cancelled")]
    Cancelled,

    /// Tool failures display the tool's own diagnostic text.
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    FrameSequence(#[from] FrameSequenceError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Failed to prepare working directory: {0}")]
    Workspace(#[source] std::io::Error),
}

impl PipelineError {
    /// True when the run stopped because it was cancelled, not because it failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Tool(ToolError::Cancelled)
        )
    }
}

/// A progress update for the task a pipeline is running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineProgress {
    pub task_id: String,
    pub stage: TaskStage,
    /// Overall progress, 0-100, non-decreasing within a run.
    pub progress: f64,
    pub current_frame: u64,
    pub total_frames: u64,
    pub eta_secs: u64,
    pub message: String,
}

/// Linear ETA extrapolation: `round(elapsed * (100 / progress - 1))`, 0 when
/// nothing has been done yet.
pub fn calculate_eta(elapsed_secs: f64, progress: f64) -> u64 {
    if !(progress > 0.0) || !elapsed_secs.is_finite() {
        return 0;
    }
    let progress = progress.min(100.0);
    let remaining = (elapsed_secs.max(0.0) * (100.0 / progress - 1.0)).round();
    if remaining > 0.0 {
        remaining as u64
    } else {
        0
    }
}

/// A slice of the overall 0-100 range assigned to one stage or step.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Band {
    start: f64,
    span: f64,
}

impl Band {
    const fn new(start: f64, span: f64) -> Self {
        Self { start, span }
    }

    /// Maps `current / total` into the band. An unknown total counts as 1.
    fn overall(self, current: u64, total: u64) -> f64 {
        let total = total.max(1) as f64;
        let ratio = (current as f64 / total).clamp(0.0, 1.0);
        self.start + ratio * self.span
    }
}

/// Stage weights for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StageBands {
    extract: Band,
    process: Band,
    encode: Band,
}

impl StageBands {
    /// 25 / 60 / 15 for single-operation tasks.
    const SIMPLE: Self = Self {
        extract: Band::new(0.0, 25.0),
        process: Band::new(25.0, 60.0),
        encode: Band::new(85.0, 15.0),
    };

    /// 20 / 70 / 10 for workflows, leaving room for several process steps.
    const WORKFLOW: Self = Self {
        extract: Band::new(0.0, 20.0),
        process: Band::new(20.0, 70.0),
        encode: Band::new(90.0, 10.0),
    };

    /// The process sub-band for step `index` of `count`.
    fn process_step(&self, index: usize, count: usize) -> Band {
        let count = count.max(1) as f64;
        let span = self.process.span / count;
        Band::new(self.process.start + span * index as f64, span)
    }
}

/// Publishes progress events for one run, keeping them monotonic.
struct ProgressReporter<'a> {
    task_id: String,
    tx: broadcast::Sender<PipelineProgress>,
    latest: &'a Mutex<Option<PipelineProgress>>,
    started: Instant,
    last: f64,
}

impl<'a> ProgressReporter<'a> {
    fn new(
        task_id: &str,
        tx: broadcast::Sender<PipelineProgress>,
        latest: &'a Mutex<Option<PipelineProgress>>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            tx,
            latest,
            started: Instant::now(),
            last: 0.0,
        }
    }

    fn emit(&mut self, stage: TaskStage, progress: f64, current: u64, total: u64, message: &str) {
        let progress = progress.clamp(0.0, 100.0).max(self.last);
        self.last = progress;
        let eta_secs = calculate_eta(self.started.elapsed().as_secs_f64(), progress);
        let event = PipelineProgress {
            task_id: self.task_id.clone(),
            stage,
            progress,
            current_frame: current,
            total_frames: total,
            eta_secs,
            message: message.to_string(),
        };
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.clone());
        // No subscribers is fine; progress is advisory.
        let _ = self.tx.send(event);
    }

    fn emit_band(&mut self, stage: TaskStage, band: Band, current: u64, total: u64, message: &str) {
        self.emit(stage, band.overall(current, total), current, total, message);
    }
}

/// The per-run scratch directories. Dropping it removes everything.
struct Workspace {
    root: TempDir,
}

impl Workspace {
    fn create(temp_root: &Path, task_id: &str, with_mid: bool) -> std::io::Result<Self> {
        std::fs::create_dir_all(temp_root)?;
        let root = tempfile::Builder::new()
            .prefix(&format!("vidboost-{}-{}-", task_id, current_timestamp_ms()))
            .tempdir_in(temp_root)?;
        let workspace = Self { root };
        std::fs::create_dir_all(workspace.frames_in())?;
        std::fs::create_dir_all(workspace.frames_out())?;
        if with_mid {
            std::fs::create_dir_all(workspace.frames_mid())?;
        }
        Ok(workspace)
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn frames_in(&self) -> PathBuf {
        self.path().join("frames_in")
    }

    fn frames_out(&self) -> PathBuf {
        self.path().join("frames_out")
    }

    fn frames_mid(&self) -> PathBuf {
        self.path().join("frames_mid")
    }

    fn cleanup(self, task_id: &str) {
        let path = self.path().to_path_buf();
        if let Err(e) = self.root.close() {
            warn!(task_id, path = %path.display(), error = %e, "Failed to remove working directory");
        } else {
            debug!(task_id, path = %path.display(), "Removed working directory");
        }
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Interpolation settings for a step that runs on already-upscaled frames:
/// thread overrides go back to auto and UHD mode is forced.
fn interpolate_after_upscale(params: &InterpolateParams) -> InterpolateParams {
    let mut custom_args = Vec::with_capacity(params.custom_args.len());
    let mut args = params.custom_args.iter();
    while let Some(arg) = args.next() {
        if arg.trim() == "-j" {
            args.next();
            continue;
        }
        custom_args.push(arg.clone());
    }
    InterpolateParams {
        thread_spec: None,
        uhd: true,
        custom_args,
        ..params.clone()
    }
}

/// What the process stage runs for a task.
enum Operation<'a> {
    Upscale(&'a UpscaleParams),
    Interpolate(&'a InterpolateParams),
    Workflow(WorkflowPlan),
}

fn source_shape(info: &VideoInfo) -> SourceShape {
    SourceShape {
        width: info.width,
        height: info.height,
        fps: info.fps,
        frame_count: info.frame_count,
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs tasks through the external tools, one at a time.
pub struct Pipeline {
    tools: Tools,
    catalog: ModelCatalog,
    temp_root: PathBuf,
    running: AtomicBool,
    active: Mutex<Option<CancellationToken>>,
    latest: Mutex<Option<PipelineProgress>>,
    progress_tx: broadcast::Sender<PipelineProgress>,
}

impl Pipeline {
    /// Creates a pipeline whose runs live under `temp_root`.
    pub fn new(tools: Tools, temp_root: impl Into<PathBuf>) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            tools,
            catalog: ModelCatalog::builtin(),
            temp_root: temp_root.into(),
            running: AtomicBool::new(false),
            active: Mutex::new(None),
            latest: Mutex::new(None),
            progress_tx,
        }
    }

    /// Replaces the model catalog used to resolve workflow plans.
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    /// Subscribes to progress events of every subsequent run.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineProgress> {
        self.progress_tx.subscribe()
    }

    /// The most recent event of the current or last run.
    ///
    /// Kept after the run ends so a caller settling the task's final state
    /// sees what subscribers may not have received yet.
    pub fn last_progress(&self) -> Option<PipelineProgress> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cancels the active run, killing its current tool process.
    pub fn cancel(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = active.as_ref() {
            token.cancel();
        }
    }

    /// Runs `task` to completion.
    pub async fn start(&self, task: &Task) -> Result<(), PipelineError> {
        self.start_with_token(task, CancellationToken::new()).await
    }

    /// Runs `task` under a caller-owned cancellation token.
    ///
    /// Cancelling `cancel` has the same effect as [`Pipeline::cancel`]; a
    /// token that is already cancelled stops the run before any tool starts.
    pub async fn start_with_token(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(PipelineError::AlreadyRunning)?;
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(cancel.clone());
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let with_mid = matches!(task.params, TaskParams::Workflow(_));
        let result = match Workspace::create(&self.temp_root, &task.id, with_mid) {
            Ok(workspace) => {
                info!(
                    task_id = %task.id,
                    kind = %task.kind(),
                    input = %task.input_path.display(),
                    workdir = %workspace.path().display(),
                    "Starting task"
                );
                let result = self.run_stages(task, &workspace, &cancel).await;
                workspace.cleanup(&task.id);
                result
            }
            Err(e) => Err(PipelineError::Workspace(e)),
        };

        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
        match &result {
            Ok(()) => info!(task_id = %task.id, output = %task.output_path.display(), "Task finished"),
            Err(e) if e.is_cancelled() => info!(task_id = %task.id, "Task cancelled"),
            Err(e) => warn!(task_id = %task.id, error = %e, "Task failed"),
        }
        result
    }

    async fn run_stages(
        &self,
        task: &Task,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        check_cancelled(cancel)?;
        let mut reporter = ProgressReporter::new(&task.id, self.progress_tx.clone(), &self.latest);

        let info = self.tools.codec.probe(&task.input_path, cancel).await?;
        let total_frames = info.frame_count.max(1);
        debug!(
            task_id = %task.id,
            width = info.width,
            height = info.height,
            fps = info.fps,
            frames = info.frame_count,
            "Probed source"
        );

        let operation = match &task.params {
            TaskParams::Upscale(params) => Operation::Upscale(params),
            TaskParams::Interpolate(params) => Operation::Interpolate(params),
            TaskParams::Workflow(workflow) => {
                let plan = resolve_workflow_plan_with(&self.catalog, &source_shape(&info), workflow)?;
                info!(task_id = %task.id, order = %plan.order, steps = plan.steps.len(), "Resolved workflow");
                Operation::Workflow(plan)
            }
        };
        let bands = match operation {
            Operation::Workflow(_) => StageBands::WORKFLOW,
            _ => StageBands::SIMPLE,
        };

        // Extract
        let frames_in = workspace.frames_in();
        let message = "Extracting source frames";
        reporter.emit(TaskStage::Extract, 0.0, 0, total_frames, message);
        {
            let mut on_progress = |current: u64, total: u64| {
                reporter.emit_band(TaskStage::Extract, bands.extract, current, total, message)
            };
            self.tools
                .codec
                .extract_frames(&task.input_path, &frames_in, total_frames, &mut on_progress, cancel)
                .await?;
        }
        check_cancelled(cancel)?;

        // Process
        let frames_out = workspace.frames_out();
        match &operation {
            Operation::Upscale(params) => {
                let message = "Upscaling frames";
                reporter.emit_band(TaskStage::Process, bands.process, 0, total_frames, message);
                let mut on_progress = |current: u64, total: u64| {
                    reporter.emit_band(TaskStage::Process, bands.process, current, total, message)
                };
                self.tools
                    .upscaler
                    .run(&frames_in, &frames_out, params, &mut on_progress, cancel)
                    .await?;
            }
            Operation::Interpolate(params) => {
                let message = "Interpolating frames";
                reporter.emit_band(TaskStage::Process, bands.process, 0, total_frames, message);
                let mut on_progress = |current: u64, total: u64| {
                    reporter.emit_band(TaskStage::Process, bands.process, current, total, message)
                };
                self.tools
                    .interpolator
                    .run(&frames_in, &frames_out, params, &mut on_progress, cancel)
                    .await?;
            }
            Operation::Workflow(plan) => {
                self.run_workflow_steps(plan, &bands, workspace, total_frames, &mut reporter, cancel)
                    .await?;
            }
        }
        check_cancelled(cancel)?;

        // Encode
        let sequence = resolve_frame_sequence(&frames_out)?;
        let source_fps = if info.fps > 0.0 { info.fps } else { 30.0 };
        let (fps, target) = match &operation {
            Operation::Upscale(_) => (source_fps, EncodeTarget::default()),
            Operation::Interpolate(params) => {
                (source_fps * f64::from(params.multiplier.factor()), EncodeTarget::default())
            }
            Operation::Workflow(plan) => (
                plan.sequence_fps,
                EncodeTarget {
                    width: plan.output_width,
                    height: plan.output_height,
                    fps: Some(plan.output_fps),
                },
            ),
        };
        let job = EncodeJob {
            sequence,
            output_path: task.output_path.clone(),
            fps,
            audio_source: Some(task.input_path.clone()),
            settings: task.encode_settings.clone(),
            target,
        };
        let message = "Encoding output video";
        reporter.emit_band(TaskStage::Encode, bands.encode, 0, job.sequence.frame_count, message);
        {
            let mut on_progress = |current: u64, total: u64| {
                reporter.emit_band(TaskStage::Encode, bands.encode, current, total, message)
            };
            self.tools.codec.encode(&job, &mut on_progress, cancel).await?;
        }
        check_cancelled(cancel)?;

        let frames = job.sequence.frame_count;
        reporter.emit(TaskStage::Done, 100.0, frames, frames, "Processing complete");
        Ok(())
    }

    async fn run_workflow_steps(
        &self,
        plan: &WorkflowPlan,
        bands: &StageBands,
        workspace: &Workspace,
        total_frames: u64,
        reporter: &mut ProgressReporter<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let frames_in = workspace.frames_in();
        let frames_mid = workspace.frames_mid();
        let frames_out = workspace.frames_out();
        let count = plan.steps.len();

        for (index, step) in plan.steps.iter().enumerate() {
            let in_dir = if index == 0 { &frames_in } else { &frames_mid };
            let out_dir = if index + 1 == count { &frames_out } else { &frames_mid };
            let band = bands.process_step(index, count);
            let after_upscale = index > 0 && plan.steps[index - 1] == WorkflowStep::Upscale;

            match step {
                WorkflowStep::Upscale => {
                    let message = format!("Upscaling frames (step {}/{})", index + 1, count);
                    reporter.emit_band(TaskStage::Process, band, 0, total_frames, &message);
                    let mut on_progress = |current: u64, total: u64| {
                        reporter.emit_band(TaskStage::Process, band, current, total, &message)
                    };
                    self.tools
                        .upscaler
                        .run(in_dir, out_dir, &plan.upscale, &mut on_progress, cancel)
                        .await?;
                }
                WorkflowStep::Interpolate => {
                    let params = if after_upscale {
                        interpolate_after_upscale(&plan.interpolate)
                    } else {
                        plan.interpolate.clone()
                    };
                    let message = format!("Interpolating frames (step {}/{})", index + 1, count);
                    reporter.emit_band(TaskStage::Process, band, 0, total_frames, &message);
                    let mut on_progress = |current: u64, total: u64| {
                        reporter.emit_band(TaskStage::Process, band, current, total, &message)
                    };
                    self.tools
                        .interpolator
                        .run(in_dir, out_dir, &params, &mut on_progress, cancel)
                        .await?;
                }
            }
            check_cancelled(cancel)?;
        }
        Ok(())
    }
}
