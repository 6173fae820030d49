//! Task model for queued enhancement work.
//!
//! A task carries its immutable request (input, output, parameters) together
//! with the mutable progress fields the scheduler writes while it runs.

use crate::params::{EncodeSettings, InterpolateParams, UpscaleParams};
use crate::planner::WorkflowParams;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be admitted.
    Pending,
    /// Currently owned by the pipeline.
    Processing,
    Completed,
    Error,
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Pipeline stage a running task is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    /// Dumping source frames to images.
    Extract,
    /// Running the upscale and/or interpolation tools.
    Process,
    /// Muxing the processed frames back into a video.
    Encode,
    Done,
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStage::Extract => write!(f, "extract"),
            TaskStage::Process => write!(f, "process"),
            TaskStage::Encode => write!(f, "encode"),
            TaskStage::Done => write!(f, "done"),
        }
    }
}

/// Operation kind of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Upscale,
    Interpolate,
    Workflow,
}

impl TaskKind {
    /// Suffix appended to the input stem when deriving the output name.
    pub fn output_suffix(self) -> &'static str {
        match self {
            TaskKind::Upscale => "upscaled",
            TaskKind::Interpolate => "interpolated",
            TaskKind::Workflow => "enhanced",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Upscale => write!(f, "upscale"),
            TaskKind::Interpolate => write!(f, "interpolate"),
            TaskKind::Workflow => write!(f, "workflow"),
        }
    }
}

/// Operation-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParams {
    Upscale(UpscaleParams),
    Interpolate(InterpolateParams),
    Workflow(WorkflowParams),
}

impl TaskParams {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParams::Upscale(_) => TaskKind::Upscale,
            TaskParams::Interpolate(_) => TaskKind::Interpolate,
            TaskParams::Workflow(_) => TaskKind::Workflow,
        }
    }
}

/// A unit of enhancement work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task identifier (UUID).
    pub id: String,
    pub input_path: PathBuf,
    /// Derived at creation from the input name and operation kind.
    pub output_path: PathBuf,
    pub encode_settings: EncodeSettings,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub stage: Option<TaskStage>,
    /// Overall progress, 0-100.
    pub progress: f64,
    pub current_frame: u64,
    /// 0 means unknown.
    pub total_frames: u64,
    /// Estimated seconds remaining.
    pub eta_secs: u64,
    pub stage_message: String,
    /// Failure detail, present only when status is Error.
    pub error: Option<String>,
    /// Unix timestamp (milliseconds) when the task was created.
    pub created_at: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl Task {
    /// Creates a pending task.
    ///
    /// # Arguments
    /// * `input_path` - Source video
    /// * `params` - Operation and its parameters
    /// * `encode_settings` - Encoder used for the final mux
    /// * `output_dir` - Directory for the result; the input's directory when None
    pub fn new(
        input_path: impl Into<PathBuf>,
        params: TaskParams,
        encode_settings: EncodeSettings,
        output_dir: Option<&Path>,
    ) -> Self {
        let input_path = input_path.into();
        let output_path = derive_output_path(&input_path, params.kind().output_suffix(), output_dir);
        Self {
            id: Uuid::new_v4().to_string(),
            input_path,
            output_path,
            encode_settings,
            params,
            status: TaskStatus::Pending,
            stage: None,
            progress: 0.0,
            current_frame: 0,
            total_frames: 0,
            eta_secs: 0,
            stage_message: String::new(),
            error: None,
            created_at: current_timestamp_ms(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.params.kind()
    }

    /// Check if the task reached Completed, Error or Cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    /// Check if the task is pending or processing.
    pub fn is_active(&self) -> bool {
        matches!(self.status, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// Resets the run fields when the scheduler admits the task.
    pub fn begin(&mut self) {
        self.status = TaskStatus::Processing;
        self.start_time = Some(current_timestamp_ms());
        self.end_time = None;
        self.stage = None;
        self.progress = 0.0;
        self.current_frame = 0;
        self.total_frames = 0;
        self.eta_secs = 0;
        self.stage_message.clear();
        self.error = None;
    }

    /// Writes a pipeline progress event onto the task.
    ///
    /// Events arriving after the task left Processing are dropped so that
    /// terminal tasks stay frozen.
    pub fn apply_progress(
        &mut self,
        stage: TaskStage,
        progress: f64,
        current_frame: u64,
        total_frames: u64,
        eta_secs: u64,
        message: &str,
    ) -> bool {
        if self.status != TaskStatus::Processing {
            return false;
        }
        self.stage = Some(stage);
        self.progress = progress.clamp(0.0, 100.0);
        self.current_frame = current_frame;
        self.total_frames = total_frames;
        self.eta_secs = eta_secs;
        self.stage_message = message.to_string();
        true
    }

    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.stage = Some(TaskStage::Done);
        self.stage_message = "Processing complete".to_string();
        self.progress = 100.0;
        self.eta_secs = 0;
        self.error = None;
        self.end_time = Some(current_timestamp_ms());
    }

    /// Marks the task failed, keeping its last progress fields.
    pub fn fail(&mut self, reason: &str) {
        self.status = TaskStatus::Error;
        self.stage = None;
        self.stage_message = "Failed".to_string();
        self.error = Some(reason.to_string());
        self.end_time = Some(current_timestamp_ms());
    }

    /// Marks the task cancelled, freezing its progress fields.
    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.stage = None;
        self.stage_message = "Cancelled".to_string();
        self.error = None;
        self.eta_secs = 0;
        self.end_time = Some(current_timestamp_ms());
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Builds `{stem}-{suffix}.mp4`, next to the input unless `output_dir` is set.
pub fn derive_output_path(input: &Path, suffix: &str, output_dir: Option<&Path>) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => input.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    dir.join(format!("{}-{}.mp4", stem, suffix))
}
