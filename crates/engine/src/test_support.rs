//! Scripted tool adapters for pipeline and scheduler tests.

use crate::params::{InterpolateParams, UpscaleParams};
use crate::tools::interpolator::expected_output_frames;
use crate::tools::{
    CodecTool, EncodeJob, InterpolateTool, ProgressFn, ToolError, Tools, UpscaleTool, VideoInfo,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A step a fake tool can be told to fail or block in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeStep {
    Probe,
    Extract,
    Upscale,
    Interpolate,
    Encode,
}

#[derive(Debug, Clone)]
pub struct DirRun {
    pub in_dir: PathBuf,
    pub out_dir: PathBuf,
}

#[derive(Default)]
struct Recorded {
    extracts: usize,
    upscales: Vec<DirRun>,
    interpolates: Vec<(DirRun, InterpolateParams)>,
    encodes: Vec<EncodeJob>,
}

/// Shared script and call log of a [`FakeTools`] set.
pub struct FakeState {
    frames: u64,
    fail: Option<FakeStep>,
    block: Option<FakeStep>,
    blocked: Notify,
    recorded: Mutex<Recorded>,
}

impl FakeState {
    fn record<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut recorded = self.recorded.lock().unwrap();
        f(&mut recorded)
    }

    /// Waits until a run reaches the blocking step.
    pub async fn wait_blocked(&self) {
        self.blocked.notified().await;
    }

    pub fn extract_count(&self) -> usize {
        self.record(|r| r.extracts)
    }

    pub fn upscale_runs(&self) -> Vec<DirRun> {
        self.record(|r| r.upscales.clone())
    }

    pub fn interpolate_runs(&self) -> Vec<DirRun> {
        self.record(|r| r.interpolates.iter().map(|(run, _)| run.clone()).collect())
    }

    pub fn last_interpolate_params(&self) -> Option<InterpolateParams> {
        self.record(|r| r.interpolates.last().map(|(_, p)| p.clone()))
    }

    pub fn encode_count(&self) -> usize {
        self.record(|r| r.encodes.len())
    }

    pub fn last_encode(&self) -> Option<EncodeJob> {
        self.record(|r| r.encodes.last().cloned())
    }

    /// Fails or blocks according to the script. Returns Ok when the step
    /// should proceed normally.
    async fn gate(&self, step: FakeStep, cancel: &CancellationToken) -> Result<(), ToolError> {
        if self.fail == Some(step) {
            return Err(ToolError::ExecutionFailure {
                tool: format!("fake-{:?}", step).to_lowercase(),
                status: "exit status: 1".to_string(),
                stderr: format!("fake {} failure", format!("{:?}", step).to_lowercase()),
            });
        }
        if self.block == Some(step) {
            self.blocked.notify_one();
            cancel.cancelled().await;
            return Err(ToolError::Cancelled);
        }
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }
        Ok(())
    }
}

/// Builder for a scripted set of adapters over a 64x36 @ 30 fps source.
pub struct FakeTools {
    state: Arc<FakeState>,
}

impl FakeTools {
    pub fn new(frames: u64) -> Self {
        Self {
            state: Arc::new(FakeState {
                frames,
                fail: None,
                block: None,
                blocked: Notify::new(),
                recorded: Mutex::new(Recorded::default()),
            }),
        }
    }

    fn edit(mut self, f: impl FnOnce(&mut FakeState)) -> Self {
        let state = Arc::get_mut(&mut self.state).expect("fake state not shared yet");
        f(state);
        self
    }

    pub fn failing(self, step: FakeStep) -> Self {
        self.edit(|s| s.fail = Some(step))
    }

    pub fn blocking(self, step: FakeStep) -> Self {
        self.edit(|s| s.block = Some(step))
    }

    pub fn state(&self) -> Arc<FakeState> {
        self.state.clone()
    }

    pub fn tools(&self) -> Tools {
        Tools {
            codec: Arc::new(FakeCodec(self.state.clone())),
            upscaler: Arc::new(FakeUpscaler(self.state.clone())),
            interpolator: Arc::new(FakeInterpolator(self.state.clone())),
        }
    }
}

fn frame_name(index: u64) -> String {
    format!("frame_{:08}.png", index)
}

fn write_frames(dir: &Path, count: u64, on_progress: ProgressFn<'_>) -> Result<(), ToolError> {
    std::fs::create_dir_all(dir)?;
    for index in 1..=count {
        std::fs::write(dir.join(frame_name(index)), b"frame")?;
        on_progress(index, count);
    }
    Ok(())
}

fn frame_files(dir: &Path) -> Result<u64, ToolError> {
    let count = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("frame_"))
        .count();
    Ok(count as u64)
}

struct FakeCodec(Arc<FakeState>);

#[async_trait]
impl CodecTool for FakeCodec {
    async fn probe(&self, path: &Path, cancel: &CancellationToken) -> Result<VideoInfo, ToolError> {
        self.0.gate(FakeStep::Probe, cancel).await?;
        Ok(VideoInfo {
            path: path.to_path_buf(),
            width: 64,
            height: 36,
            fps: 30.0,
            duration_secs: self.0.frames as f64 / 30.0,
            frame_count: self.0.frames,
            video_codec: "h264".to_string(),
            audio_codec: Some("aac".to_string()),
            bitrate: 1_000_000,
            file_size_bytes: 1024,
        })
    }

    async fn extract_frames(
        &self,
        _input: &Path,
        out_dir: &Path,
        _total_frames: u64,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        self.0.record(|r| r.extracts += 1);
        self.0.gate(FakeStep::Extract, cancel).await?;
        write_frames(out_dir, self.0.frames, on_progress)
    }

    async fn encode(
        &self,
        job: &EncodeJob,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        // Encoding gets halfway before a scripted failure or block.
        let total = job.sequence.frame_count;
        let halfway = total / 2;
        for frame in 1..=halfway {
            on_progress(frame, total);
        }
        self.0.gate(FakeStep::Encode, cancel).await?;
        for frame in halfway + 1..=total {
            on_progress(frame, total);
        }
        std::fs::write(&job.output_path, b"video")?;
        self.0.record(|r| r.encodes.push(job.clone()));
        Ok(())
    }
}

struct FakeUpscaler(Arc<FakeState>);

#[async_trait]
impl UpscaleTool for FakeUpscaler {
    async fn run(
        &self,
        in_dir: &Path,
        out_dir: &Path,
        _params: &UpscaleParams,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        self.0.record(|r| {
            r.upscales.push(DirRun {
                in_dir: in_dir.to_path_buf(),
                out_dir: out_dir.to_path_buf(),
            })
        });
        self.0.gate(FakeStep::Upscale, cancel).await?;
        let count = frame_files(in_dir)?;
        clear_frames(out_dir)?;
        write_frames(out_dir, count, on_progress)
    }
}

struct FakeInterpolator(Arc<FakeState>);

#[async_trait]
impl InterpolateTool for FakeInterpolator {
    async fn run(
        &self,
        in_dir: &Path,
        out_dir: &Path,
        params: &InterpolateParams,
        on_progress: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        self.0.record(|r| {
            r.interpolates.push((
                DirRun {
                    in_dir: in_dir.to_path_buf(),
                    out_dir: out_dir.to_path_buf(),
                },
                params.clone(),
            ))
        });
        self.0.gate(FakeStep::Interpolate, cancel).await?;
        let count = expected_output_frames(frame_files(in_dir)?, params.multiplier.factor());
        clear_frames(out_dir)?;
        write_frames(out_dir, count, on_progress)
    }
}

/// Drops whatever an earlier step left in `dir`.
fn clear_frames(dir: &Path) -> Result<(), ToolError> {
    if dir.exists() {
        for entry in std::fs::read_dir(dir)? {
            std::fs::remove_file(entry?.path())?;
        }
    }
    Ok(())
}
