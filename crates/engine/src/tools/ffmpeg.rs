//! ffmpeg / ffprobe adapter.
//!
//! Probes source metadata, dumps frames to numbered PNGs and muxes a
//! processed frame sequence back into a container while carrying over the
//! source's audio, subtitles, metadata and chapters.

use super::process::{capture_output, run_tool, LineSink, OutputStream};
use super::{CodecTool, EncodeJob, EncodeTarget, ProgressFn, ToolError, VideoInfo};
use crate::params::EncodeSettings;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").expect("valid regex"));

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub nb_frames: Option<String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub default: u8,
        #[serde(default)]
        pub forced: u8,
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        pub size: Option<String>,
    }
}

use ffprobe_json::Stream;

/// ffmpeg/ffprobe binaries.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    async fn probe_json(
        &self,
        path: &Path,
        with_format: bool,
        cancel: &CancellationToken,
    ) -> Result<ffprobe_json::FfprobeOutput, ToolError> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-print_format", "json", "-show_streams"]);
        if with_format {
            cmd.arg("-show_format");
        }
        cmd.arg(path);

        let stdout = capture_output("ffprobe", cmd, cancel).await?;
        serde_json::from_str(&stdout).map_err(|e| ToolError::Parse {
            tool: "ffprobe".to_string(),
            message: e.to_string(),
        })
    }

    /// Streams of `path` ordered by index.
    async fn probe_streams(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<Stream>, ToolError> {
        let output = self.probe_json(path, false, cancel).await?;
        let mut streams: Vec<Stream> = output
            .streams
            .unwrap_or_default()
            .into_iter()
            .filter(|s| s.index.is_some())
            .collect();
        streams.sort_by_key(|s| s.index);
        Ok(streams)
    }
}

/// Parses `num/den` or plain decimal frame rates. Returns 0 when unusable.
pub fn parse_frame_rate(text: Option<&str>) -> f64 {
    let Some(text) = text.map(str::trim) else {
        return 0.0;
    };
    if text.is_empty() || text == "0/0" {
        return 0.0;
    }
    let value = match text.split_once('/') {
        Some((num, den)) => match (num.parse::<f64>(), den.parse::<f64>()) {
            (Ok(num), Ok(den)) if den != 0.0 => num / den,
            _ => 0.0,
        },
        None => text.parse::<f64>().unwrap_or(0.0),
    };
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

/// Parses ffprobe JSON output into a VideoInfo.
pub fn parse_video_info(path: &Path, json_str: &str) -> Result<VideoInfo, ToolError> {
    let output: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ToolError::Parse {
            tool: "ffprobe".to_string(),
            message: e.to_string(),
        })?;
    video_info_from(path, output)
}

fn video_info_from(path: &Path, output: ffprobe_json::FfprobeOutput) -> Result<VideoInfo, ToolError> {
    let streams = output.streams.unwrap_or_default();
    let video = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ToolError::NoVideoStream(path.to_path_buf()))?;
    let audio_codec = streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .and_then(|s| s.codec_name.clone());

    let fps = parse_frame_rate(
        video
            .avg_frame_rate
            .as_deref()
            .or(video.r_frame_rate.as_deref()),
    );
    let fps = if fps > 0.0 {
        fps
    } else {
        parse_frame_rate(video.r_frame_rate.as_deref())
    };

    let format = output.format;
    let parse_num = |value: Option<&String>| value.and_then(|v| v.parse::<f64>().ok());
    let duration_secs = parse_num(format.as_ref().and_then(|f| f.duration.as_ref()))
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(0.0);
    let bitrate = parse_num(format.as_ref().and_then(|f| f.bit_rate.as_ref())).unwrap_or(0.0);
    let file_size = parse_num(format.as_ref().and_then(|f| f.size.as_ref())).unwrap_or(0.0);

    let declared_frames = video
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    let frame_count = if declared_frames > 0 {
        declared_frames
    } else if fps > 0.0 && duration_secs > 0.0 {
        ((fps * duration_secs).round() as u64).max(1)
    } else {
        0
    };

    Ok(VideoInfo {
        path: path.to_path_buf(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        fps,
        duration_secs,
        frame_count,
        video_codec: video
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        audio_codec,
        bitrate: bitrate.max(0.0) as u64,
        file_size_bytes: file_size.max(0.0) as u64,
    })
}

/// Extracts the frame number from an ffmpeg progress line.
pub fn parse_frame_line(line: &str) -> Option<u64> {
    FRAME_RE
        .captures(line)
        .and_then(|caps| caps[1].parse::<u64>().ok())
}

/// Rounds a positive dimension up to the next even value.
fn even_dimension(value: u32) -> Option<u32> {
    match value {
        0 => None,
        v if v % 2 == 0 => Some(v),
        v => Some(v + 1),
    }
}

fn disposition_flags(stream: &Stream) -> &'static str {
    let disposition = stream.disposition.clone().unwrap_or_default();
    match (disposition.default == 1, disposition.forced == 1) {
        (true, true) => "default+forced",
        (true, false) => "default",
        (false, true) => "forced",
        (false, false) => "0",
    }
}

/// Builds the argument list for extracting every frame of `input`.
pub fn build_extract_args(input: &Path, out_dir: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vsync".to_string(),
        "0".to_string(),
        out_dir.join("frame_%08d.png").to_string_lossy().into_owned(),
    ]
}

/// Builds the ffmpeg argument list for muxing a frame sequence.
///
/// # Arguments
/// * `job` - Sequence, output, rate, encoder and optional conversion target
/// * `source_streams` - Streams of `job.audio_source`, ordered by index
///
/// # Returns
/// The complete argument list, ending with the output path.
pub(crate) fn build_encode_args(job: &EncodeJob, source_streams: &[Stream]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".to_string(),
        "-framerate".to_string(),
        format_fps(job.fps),
        "-start_number".to_string(),
        job.sequence.start_number.to_string(),
        "-i".to_string(),
        job.sequence.input_pattern.to_string_lossy().into_owned(),
    ];
    let mut video_out = 0usize;

    if let Some(audio_source) = &job.audio_source {
        args.push("-i".to_string());
        args.push(audio_source.to_string_lossy().into_owned());

        let is_video = |s: &&Stream| s.codec_type.as_deref() == Some("video");
        let main_video = source_streams
            .iter()
            .filter(is_video)
            .find(|s| s.disposition.as_ref().map(|d| d.attached_pic) != Some(1))
            .or_else(|| source_streams.iter().find(is_video))
            .and_then(|s| s.index);

        match main_video {
            Some(main_index) => {
                let (mut videos, mut audios, mut subtitles) = (0usize, 0usize, 0usize);
                for stream in source_streams {
                    let Some(index) = stream.index else {
                        continue;
                    };
                    if index == main_index {
                        args.push("-map".to_string());
                        args.push("0:v:0".to_string());
                        video_out = videos;
                    } else {
                        args.push("-map".to_string());
                        args.push(format!("1:{}", index));
                    }

                    match stream.codec_type.as_deref() {
                        Some("video") => videos += 1,
                        Some("audio") => {
                            args.push(format!("-disposition:a:{}", audios));
                            args.push(disposition_flags(stream).to_string());
                            audios += 1;
                        }
                        Some("subtitle") => {
                            args.push(format!("-disposition:s:{}", subtitles));
                            args.push(disposition_flags(stream).to_string());
                            subtitles += 1;
                        }
                        _ => {}
                    }
                }
            }
            None => {
                args.extend(["-map", "0:v:0", "-map", "1"].map(String::from));
            }
        }

        args.extend(["-map_metadata", "1", "-map_chapters", "1", "-copy_unknown"].map(String::from));
    }

    let encoder = job.settings.video_encoder();
    args.push("-c".to_string());
    args.push("copy".to_string());
    args.push(format!("-c:v:{}", video_out));
    args.push(encoder.to_string());
    args.push(format!("-pix_fmt:v:{}", video_out));
    args.push("yuv420p".to_string());

    let filters = build_filters(&job.target, job.fps);
    if !filters.is_empty() {
        args.push(format!("-vf:v:{}", video_out));
        args.push(filters.join(","));
    }

    args.extend(rate_control_args(&job.settings, video_out));
    args.push(job.output_path.to_string_lossy().into_owned());
    args
}

fn build_filters(target: &EncodeTarget, sequence_fps: f64) -> Vec<String> {
    let mut filters = Vec::new();
    if let (Some(w), Some(h)) = (
        target.width.and_then(even_dimension),
        target.height.and_then(even_dimension),
    ) {
        filters.push(format!("scale=w={}:h={}:flags=lanczos", w, h));
    }
    if let Some(fps) = target.fps.filter(|f| f.is_finite() && *f > 0.0) {
        if (fps - sequence_fps).abs() > 0.001 {
            filters.push(format!("fps={}", format_fps(fps)));
        }
    }
    filters
}

fn rate_control_args(settings: &EncodeSettings, video_out: usize) -> Vec<String> {
    let pairs: &[(&str, &str)] = if settings.use_hardware_encoding {
        &[("preset", "p5"), ("rc", "vbr"), ("cq", "21")]
    } else if settings.video_encoder() == "libx264" {
        &[("preset", "medium"), ("crf", "18")]
    } else {
        &[("preset", "medium"), ("crf", "23")]
    };
    pairs
        .iter()
        .flat_map(|(key, value)| [format!("-{}:v:{}", key, video_out), value.to_string()])
        .collect()
}

/// Formats a rate without trailing zeros (`60`, `29.97`).
fn format_fps(fps: f64) -> String {
    let text = format!("{:.6}", fps);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Forwards ffmpeg `frame=` lines as progress.
struct FrameProgress<'a> {
    total: u64,
    on_progress: ProgressFn<'a>,
}

impl LineSink for FrameProgress<'_> {
    fn on_line(&mut self, stream: OutputStream, line: &str) {
        if stream != OutputStream::Stderr {
            return;
        }
        if let Some(frame) = parse_frame_line(line) {
            let total = if self.total > 0 { self.total } else { frame };
            (self.on_progress)(frame.min(total), total);
        }
    }
}

#[async_trait]
impl CodecTool for Ffmpeg {
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<VideoInfo, ToolError> {
        let output = self.probe_json(path, true, cancel).await?;
        let info = video_info_from(path, output)?;
        debug!(
            path = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.fps,
            frames = info.frame_count,
            "Probed source"
        );
        Ok(info)
    }

    async fn extract_frames(
        &self,
        input: &Path,
        out_dir: &Path,
        total_frames: u64,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        tokio::fs::create_dir_all(out_dir).await?;
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(build_extract_args(input, out_dir));

        let mut sink = FrameProgress {
            total: total_frames,
            on_progress,
        };
        run_tool("ffmpeg", cmd, &mut sink, None, cancel).await
    }

    async fn encode(
        &self,
        job: &EncodeJob,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        if let Some(parent) = job.output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source_streams = match &job.audio_source {
            Some(source) => self.probe_streams(source, cancel).await?,
            None => Vec::new(),
        };
        let args = build_encode_args(job, &source_streams);
        info!(
            output = %job.output_path.display(),
            encoder = job.settings.video_encoder(),
            frames = job.sequence.frame_count,
            "Encoding frame sequence"
        );

        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(&args);
        let total = job.sequence.frame_count;
        let mut sink = FrameProgress {
            total,
            on_progress: &mut *on_progress,
        };
        run_tool("ffmpeg", cmd, &mut sink, None, cancel).await?;
        if total > 0 {
            on_progress(total, total);
        }
        Ok(())
    }
}
