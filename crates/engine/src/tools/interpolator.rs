//! rife-ncnn-vulkan adapter.

use super::process::run_tool;
use super::upscaler::{model_path, NcnnProgress, OUTPUT_POLL_INTERVAL};
use super::{gpu_args, has_arg, InterpolateTool, ProgressFn, ToolError};
use crate::advisor::{interpolate_fallback, CapabilityAdvisor};
use crate::frames::count_frames;
use crate::params::{InterpolateParams, ThreadSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Frames rife produces for `input_frames` at `multiplier`.
pub fn expected_output_frames(input_frames: u64, multiplier: u32) -> u64 {
    if input_frames > 1 {
        (input_frames - 1) * u64::from(multiplier) + 1
    } else {
        input_frames
    }
}

/// Builds the rife-ncnn-vulkan argument list.
pub fn build_interpolate_args(
    in_dir: &Path,
    out_dir: &Path,
    model_path: &Path,
    params: &InterpolateParams,
    target_frames: u64,
    recommended: ThreadSpec,
) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        in_dir.to_string_lossy().into_owned(),
        "-o".to_string(),
        out_dir.to_string_lossy().into_owned(),
        "-m".to_string(),
        model_path.to_string_lossy().into_owned(),
    ];
    args.extend(gpu_args(params.gpu));
    args.push("-n".to_string());
    args.push(target_frames.max(1).to_string());
    args.push("-f".to_string());
    args.push("frame_%08d.png".to_string());
    if !has_arg(&params.custom_args, "-j") {
        args.push("-j".to_string());
        args.push(params.thread_spec.unwrap_or(recommended).to_string());
    }
    args.extend(params.custom_args.iter().cloned());
    if params.uhd {
        args.push("-u".to_string());
    }
    args
}

/// rife-ncnn-vulkan binary plus the advisor used for auto settings.
#[derive(Clone)]
pub struct Rife {
    binary: PathBuf,
    model_root: Option<PathBuf>,
    advisor: Arc<dyn CapabilityAdvisor>,
}

impl Rife {
    pub fn new(
        binary: impl Into<PathBuf>,
        model_root: Option<PathBuf>,
        advisor: Arc<dyn CapabilityAdvisor>,
    ) -> Self {
        Self {
            binary: binary.into(),
            model_root,
            advisor,
        }
    }
}

#[async_trait]
impl InterpolateTool for Rife {
    async fn run(
        &self,
        in_dir: &Path,
        out_dir: &Path,
        params: &InterpolateParams,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        tokio::fs::create_dir_all(out_dir).await?;

        let recommended = self
            .advisor
            .recommend_interpolate(params.gpu, params.uhd)
            .unwrap_or_else(|| interpolate_fallback(params.uhd));
        let model = model_path(self.model_root.as_deref(), "rife-ncnn-vulkan", &params.model);
        let input_frames = count_frames(in_dir);
        let target_frames = expected_output_frames(input_frames, params.multiplier.factor());
        let args = build_interpolate_args(in_dir, out_dir, &model, params, target_frames, recommended);
        info!(
            multiplier = params.multiplier.factor(),
            model = %params.model,
            uhd = params.uhd,
            input_frames,
            target_frames,
            "Interpolating frames"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        let mut sink = NcnnProgress::new(target_frames, false, out_dir, on_progress);
        run_tool(
            "rife-ncnn-vulkan",
            cmd,
            &mut sink,
            Some(OUTPUT_POLL_INTERVAL),
            cancel,
        )
        .await?;
        sink.finish();
        Ok(())
    }
}
