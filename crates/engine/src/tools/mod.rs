//! External tool adapters.
//!
//! The pipeline only talks to the traits in this module. Concrete adapters
//! wrap ffmpeg/ffprobe, waifu2x-ncnn-vulkan and rife-ncnn-vulkan.

pub mod ffmpeg;
pub mod interpolator;
pub mod process;
pub mod upscaler;

pub use ffmpeg::Ffmpeg;
pub use interpolator::Rife;
pub use upscaler::Waifu2x;

use crate::advisor::{CapabilityAdvisor, VramAdvisor};
use crate::frames::FrameSequenceInfo;
use crate::params::{EncodeSettings, InterpolateParams, UpscaleParams};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use vidboost_config::{GpuConfig, ToolsConfig};

/// Progress callback receiving `(current, total)` frame counts.
pub type ProgressFn<'a> = &'a mut (dyn FnMut(u64, u64) + Send);

/// Error type for external tool runs.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Non-zero exit. Displays the captured stderr verbatim when there is any.
    #[error("{}", failure_text(.tool, .status, .stderr))]
    ExecutionFailure {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Tool run was cancelled")]
    Cancelled,

    #[error("No video stream found in {0}")]
    NoVideoStream(PathBuf),

    #[error("Failed to parse {tool} output: {message}")]
    Parse { tool: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn failure_text(tool: &str, status: &str, stderr: &str) -> String {
    if stderr.trim().is_empty() {
        format!("{} failed with {}", tool, status)
    } else {
        stderr.to_string()
    }
}

/// Metadata of a source video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_secs: f64,
    /// 0 when the container does not say and the duration is unknown.
    pub frame_count: u64,
    pub video_codec: String,
    pub audio_codec: Option<String>,
    /// Bits per second, 0 when unknown.
    pub bitrate: u64,
    pub file_size_bytes: u64,
}

/// Optional size and rate conversion applied during encode.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncodeTarget {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
}

/// Everything the codec tool needs to mux a frame sequence.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub sequence: FrameSequenceInfo,
    pub output_path: PathBuf,
    /// Rate the frame sequence is read at.
    pub fps: f64,
    /// Source whose non-video streams, metadata and chapters are carried over.
    pub audio_source: Option<PathBuf>,
    pub settings: EncodeSettings,
    pub target: EncodeTarget,
}

/// Video container/codec tool.
#[async_trait]
pub trait CodecTool: Send + Sync {
    /// Reads dimensions, rate and frame count of `path`.
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<VideoInfo, ToolError>;

    /// Dumps every frame of `input` into `out_dir` as `frame_%08d.png`.
    async fn extract_frames(
        &self,
        input: &Path,
        out_dir: &Path,
        total_frames: u64,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    /// Muxes a frame sequence into the output container.
    async fn encode(
        &self,
        job: &EncodeJob,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;
}

/// Super-resolution tool.
#[async_trait]
pub trait UpscaleTool: Send + Sync {
    async fn run(
        &self,
        in_dir: &Path,
        out_dir: &Path,
        params: &UpscaleParams,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;
}

/// Frame interpolation tool.
#[async_trait]
pub trait InterpolateTool: Send + Sync {
    async fn run(
        &self,
        in_dir: &Path,
        out_dir: &Path,
        params: &InterpolateParams,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;
}

/// The set of adapters a pipeline drives.
#[derive(Clone)]
pub struct Tools {
    pub codec: Arc<dyn CodecTool>,
    pub upscaler: Arc<dyn UpscaleTool>,
    pub interpolator: Arc<dyn InterpolateTool>,
}

impl Tools {
    /// Native adapters for the configured binaries, sharing one advisor.
    pub fn from_config(tools: &ToolsConfig, gpu: &GpuConfig) -> Self {
        let advisor: Arc<dyn CapabilityAdvisor> = Arc::new(VramAdvisor::from_config(gpu));
        Self {
            codec: Arc::new(Ffmpeg::new(&tools.ffmpeg, &tools.ffprobe)),
            upscaler: Arc::new(Waifu2x::new(
                &tools.upscaler,
                tools.model_root.clone(),
                advisor.clone(),
            )),
            interpolator: Arc::new(Rife::new(
                &tools.interpolator,
                tools.model_root.clone(),
                advisor,
            )),
        }
    }
}

/// True when `custom_args` already carries `flag`.
pub(crate) fn has_arg(custom_args: &[String], flag: &str) -> bool {
    custom_args.iter().any(|arg| arg.trim() == flag)
}

/// `-g <id>` when a device is pinned.
pub(crate) fn gpu_args(gpu: Option<u32>) -> Vec<String> {
    match gpu {
        Some(id) => vec!["-g".to_string(), id.to_string()],
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_failure_shows_stderr_verbatim() {
        let err = ToolError::ExecutionFailure {
            tool: "ffmpeg".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "Invalid data found when processing input".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid data found when processing input");

        let err = ToolError::ExecutionFailure {
            tool: "ffmpeg".to_string(),
            status: "exit status: 1".to_string(),
            stderr: "  ".to_string(),
        };
        assert_eq!(err.to_string(), "ffmpeg failed with exit status: 1");
    }

    #[test]
    fn test_has_arg_and_gpu_args() {
        let args = vec!["-x".to_string(), " -j ".to_string(), "2:2:2".to_string()];
        assert!(has_arg(&args, "-j"));
        assert!(!has_arg(&args, "-u"));
        assert_eq!(gpu_args(Some(1)), vec!["-g", "1"]);
        assert!(gpu_args(None).is_empty());
    }
}
