//! waifu2x-ncnn-vulkan adapter.

use super::process::{run_tool, LineSink, OutputStream};
use super::{gpu_args, has_arg, ProgressFn, ToolError, UpscaleTool};
use crate::advisor::{CapabilityAdvisor, NcnnRecommendation, UPSCALE_FALLBACK};
use crate::frames::count_frames;
use crate::params::UpscaleParams;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid regex"));
static FRACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*/\s*(\d+)").expect("valid regex"));

/// Interval for counting finished frames in the output directory.
pub(crate) const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(1200);

/// A progress reading from an ncnn tool line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcnnReading {
    /// Whole percent, 0-100.
    Percent(u64),
    Fraction { current: u64, total: u64 },
}

/// Parses `12.5%` or `3/120` style progress.
pub fn parse_ncnn_progress(line: &str, allow_fraction: bool) -> Option<NcnnReading> {
    if let Some(caps) = PERCENT_RE.captures(line) {
        let value: f64 = caps[1].parse().ok()?;
        return Some(NcnnReading::Percent(value.round().clamp(0.0, 100.0) as u64));
    }
    if !allow_fraction {
        return None;
    }
    let caps = FRACTION_RE.captures(line)?;
    let current: u64 = caps[1].parse().ok()?;
    let total: u64 = caps[2].parse().ok()?;
    if total == 0 {
        return None;
    }
    Some(NcnnReading::Fraction {
        current: current.min(total),
        total,
    })
}

/// Turns ncnn output lines and output-directory counts into monotonic
/// `(current, expected)` progress.
pub(crate) struct NcnnProgress<'a> {
    expected: u64,
    last: u64,
    allow_fraction: bool,
    out_dir: PathBuf,
    on_progress: ProgressFn<'a>,
}

impl<'a> NcnnProgress<'a> {
    pub(crate) fn new(
        expected: u64,
        allow_fraction: bool,
        out_dir: &Path,
        on_progress: ProgressFn<'a>,
    ) -> Self {
        Self {
            expected: if expected > 0 { expected } else { 100 },
            last: 0,
            allow_fraction,
            out_dir: out_dir.to_path_buf(),
            on_progress,
        }
    }

    fn report(&mut self, current: u64) {
        let current = current.min(self.expected);
        if current > self.last {
            self.last = current;
            (self.on_progress)(current, self.expected);
        }
    }

    /// Reports completion.
    pub(crate) fn finish(&mut self) {
        self.last = self.expected;
        (self.on_progress)(self.expected, self.expected);
    }
}

impl LineSink for NcnnProgress<'_> {
    fn on_line(&mut self, _stream: OutputStream, line: &str) {
        match parse_ncnn_progress(line, self.allow_fraction) {
            Some(NcnnReading::Percent(p)) => {
                let current = (p as f64 / 100.0 * self.expected as f64).round() as u64;
                self.report(current);
            }
            Some(NcnnReading::Fraction { current, total }) => {
                let current = (current as f64 / total as f64 * self.expected as f64).round() as u64;
                self.report(current);
            }
            None => {}
        }
    }

    fn on_tick(&mut self) {
        let done = count_frames(&self.out_dir);
        self.report(done);
    }
}

/// Resolves a model name against the optional model root.
pub(crate) fn model_path(model_root: Option<&Path>, tool_dir: &str, model: &str) -> PathBuf {
    match model_root {
        Some(root) => {
            let nested = root.join(tool_dir).join(model);
            if nested.exists() {
                nested
            } else {
                root.join(model)
            }
        }
        None => PathBuf::from(model),
    }
}

/// Builds the waifu2x-ncnn-vulkan argument list.
///
/// Tile size 0 and a missing thread spec take the recommendation; `-j` is
/// left out when the custom args already carry one.
pub fn build_upscale_args(
    in_dir: &Path,
    out_dir: &Path,
    model_path: &Path,
    params: &UpscaleParams,
    recommendation: NcnnRecommendation,
) -> Vec<String> {
    let tile_size = if params.tile_size > 0 {
        params.tile_size
    } else {
        recommendation.tile_size
    };
    let thread_spec = params.thread_spec.unwrap_or(recommendation.thread_spec);

    let mut args = vec![
        "-i".to_string(),
        in_dir.to_string_lossy().into_owned(),
        "-o".to_string(),
        out_dir.to_string_lossy().into_owned(),
        "-n".to_string(),
        params.denoise_level.to_string(),
        "-s".to_string(),
        params.scale.factor().to_string(),
        "-t".to_string(),
        tile_size.to_string(),
        "-m".to_string(),
        model_path.to_string_lossy().into_owned(),
        "-f".to_string(),
        params.format.as_str().to_string(),
    ];
    args.extend(gpu_args(params.gpu));
    if !has_arg(&params.custom_args, "-j") {
        args.push("-j".to_string());
        args.push(thread_spec.to_string());
    }
    args.extend(params.custom_args.iter().cloned());
    args
}

/// waifu2x-ncnn-vulkan binary plus the advisor used for auto settings.
#[derive(Clone)]
pub struct Waifu2x {
    binary: PathBuf,
    model_root: Option<PathBuf>,
    advisor: Arc<dyn CapabilityAdvisor>,
}

impl Waifu2x {
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
impl UpscaleTool for Waifu2x {
    async fn run(
        &self,
        in_dir: &Path,
        out_dir: &Path,
        params: &UpscaleParams,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        tokio::fs::create_dir_all(out_dir).await?;

        let recommendation = self
            .advisor
            .recommend_upscale(params.gpu)
            .unwrap_or(UPSCALE_FALLBACK);
        let model = model_path(self.model_root.as_deref(), "waifu2x-ncnn-vulkan", &params.model);
        let args = build_upscale_args(in_dir, out_dir, &model, params, recommendation);
        let input_frames = count_frames(in_dir);
        info!(
            scale = params.scale.factor(),
            model = %params.model,
            frames = input_frames,
            "Upscaling frames"
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        let mut sink = NcnnProgress::new(input_frames, true, out_dir, on_progress);
        run_tool(
            "waifu2x-ncnn-vulkan",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ImageFormat, ThreadSpec, UpscaleScale};
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ncnn_progress() {
        assert_eq!(parse_ncnn_progress("12.60%", true), Some(NcnnReading::Percent(13)));
        assert_eq!(parse_ncnn_progress("150%", true), Some(NcnnReading::Percent(100)));
        assert_eq!(
            parse_ncnn_progress("3 / 12", true),
            Some(NcnnReading::Fraction { current: 3, total: 12 })
        );
        assert_eq!(parse_ncnn_progress("3/12", false), None);
        assert_eq!(parse_ncnn_progress("5/0", true), None);
        assert_eq!(parse_ncnn_progress("[0 NVIDIA GeForce]", true), None);
    }

    #[test]
    fn test_progress_is_normalized_and_monotonic() {
        let mut seen = Vec::new();
        let mut record = |c: u64, t: u64| seen.push((c, t));
        let dir = TempDir::new().unwrap();
        {
            let mut sink = NcnnProgress::new(200, true, dir.path(), &mut record);
            sink.on_line(OutputStream::Stderr, "10.00%");
            sink.on_line(OutputStream::Stderr, "5.00%");
            sink.on_line(OutputStream::Stderr, "10.00%");
            sink.on_line(OutputStream::Stderr, "1/2");
            sink.finish();
        }
        assert_eq!(seen, vec![(20, 200), (100, 200), (200, 200)]);
    }

    #[test]
    fn test_progress_polls_output_dir() {
        let mut seen = Vec::new();
        let mut record = |c: u64, t: u64| seen.push((c, t));
        let dir = TempDir::new().unwrap();
        for n in 1..=3 {
            File::create(dir.path().join(format!("frame_{:08}.png", n))).unwrap();
        }
        {
            let mut sink = NcnnProgress::new(10, true, dir.path(), &mut record);
            sink.on_tick();
            sink.on_tick();
        }
        assert_eq!(seen, vec![(3, 10)]);
    }

    #[test]
    fn test_unknown_frame_count_uses_percent_scale() {
        let mut seen = Vec::new();
        let mut record = |c: u64, t: u64| seen.push((c, t));
        let dir = TempDir::new().unwrap();
        {
            let mut sink = NcnnProgress::new(0, false, dir.path(), &mut record);
            sink.on_line(OutputStream::Stdout, "42%");
        }
        assert_eq!(seen, vec![(42, 100)]);
    }

    #[test]
    fn test_upscale_args_with_recommendation() {
        let params = UpscaleParams::default();
        let args = build_upscale_args(
            Path::new("/w/in"),
            Path::new("/w/out"),
            Path::new("models-cunet"),
            &params,
            NcnnRecommendation {
                tile_size: 320,
                thread_spec: ThreadSpec::new(2, 5, 2),
            },
        );
        assert_eq!(
            args,
            vec![
                "-i", "/w/in", "-o", "/w/out", "-n", "1", "-s", "2", "-t", "320", "-m",
                "models-cunet", "-f", "png", "-j", "2:5:2"
            ]
        );
    }

    #[test]
    fn test_upscale_args_with_pinned_values() {
        let params = UpscaleParams {
            scale: UpscaleScale::X4,
            denoise_level: 3,
            tile_size: 200,
            thread_spec: Some(ThreadSpec::new(1, 1, 1)),
            gpu: Some(1),
            model: "models-upconv_7_photo".to_string(),
            format: ImageFormat::Webp,
            custom_args: vec!["-x".to_string()],
        };
        let args = build_upscale_args(
            Path::new("in"),
            Path::new("out"),
            Path::new("m"),
            &params,
            UPSCALE_FALLBACK,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-n 3 -s 4 -t 200"));
        assert!(joined.contains("-f webp -g 1 -j 1:1:1 -x"));
    }

    #[test]
    fn test_custom_thread_flag_wins() {
        let params = UpscaleParams {
            custom_args: vec!["-j".to_string(), "4:4:4".to_string()],
            ..UpscaleParams::default()
        };
        let args = build_upscale_args(
            Path::new("in"),
            Path::new("out"),
            Path::new("m"),
            &params,
            UPSCALE_FALLBACK,
        );
        assert_eq!(args.iter().filter(|a| *a == "-j").count(), 1);
        assert_eq!(args.last().map(String::as_str), Some("4:4:4"));
    }

    #[test]
    fn test_model_path_resolution() {
        assert_eq!(model_path(None, "waifu2x-ncnn-vulkan", "models-cunet"), PathBuf::from("models-cunet"));

        let root = TempDir::new().unwrap();
        assert_eq!(
            model_path(Some(root.path()), "waifu2x-ncnn-vulkan", "models-cunet"),
            root.path().join("models-cunet")
        );
        std::fs::create_dir_all(root.path().join("waifu2x-ncnn-vulkan/models-cunet")).unwrap();
        assert_eq!(
            model_path(Some(root.path()), "waifu2x-ncnn-vulkan", "models-cunet"),
            root.path().join("waifu2x-ncnn-vulkan/models-cunet")
        );
    }
}
