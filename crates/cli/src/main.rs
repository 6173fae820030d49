//! CLI entry point for vidboost
//!
//! Probes sources, previews workflow plans and runs enhancement tasks through
//! the single-runner queue.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vidboost::config::{Config, InterpolateConfig, UpscaleConfig, WorkflowConfig};
use vidboost::{
    describe_auto_choice, resolve_workflow_plan, run_startup_checks, EncodeSettings,
    InterpolateParams, Pipeline, PipelineProgress, RequiredTools, Scheduler, SourceShape, Task,
    TaskParams, TaskStage, TaskStatus, TaskStore, Tools, UpscaleParams, WorkflowParams,
};

/// Config file read when `--config` is not given. May be absent.
const DEFAULT_CONFIG_PATH: &str = "vidboost.toml";

const DEFAULT_LOG_FILTER: &str = "vidboost=info,vidboost_cli=info";

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// vidboost - Upscale and interpolate videos with ncnn-vulkan tools
#[derive(Parser, Debug)]
#[command(name = "vidboost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults to ./vidboost.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Skip the external tool checks
    #[arg(long, global = true)]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print source video metadata
    Probe { input: PathBuf },

    /// Resolve a workflow plan without running it
    Plan {
        input: PathBuf,
        #[command(flatten)]
        workflow: WorkflowArgs,
        #[command(flatten)]
        upscale: UpscaleArgs,
        #[command(flatten)]
        interpolate: InterpolateArgs,
    },

    /// Upscale videos with waifu2x
    Upscale {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        upscale: UpscaleArgs,
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Raise frame rate with rife
    Interpolate {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        interpolate: InterpolateArgs,
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Upscale and interpolate in one pass
    Workflow {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[command(flatten)]
        workflow: WorkflowArgs,
        #[command(flatten)]
        upscale: UpscaleArgs,
        #[command(flatten)]
        interpolate: InterpolateArgs,
        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args, Debug, Default)]
struct UpscaleArgs {
    /// Upscale factor (2, 3 or 4)
    #[arg(long)]
    scale: Option<u32>,

    /// Denoise level (0-3)
    #[arg(long)]
    denoise: Option<u32>,

    /// waifu2x model directory name
    #[arg(long)]
    upscale_model: Option<String>,

    /// Tile size, 0 for auto
    #[arg(long)]
    tile_size: Option<u32>,

    /// waifu2x thread spec (load:proc:save), empty for auto
    #[arg(long)]
    upscale_threads: Option<String>,

    /// GPU id for waifu2x, -1 for auto
    #[arg(long, allow_negative_numbers = true)]
    upscale_gpu: Option<i32>,

    /// Output image format (png, jpg, webp)
    #[arg(long)]
    format: Option<String>,
}

impl UpscaleArgs {
    fn apply(&self, cfg: &mut UpscaleConfig) {
        if let Some(scale) = self.scale {
            cfg.scale = scale;
        }
        if let Some(denoise) = self.denoise {
            cfg.denoise_level = denoise;
        }
        if let Some(model) = &self.upscale_model {
            cfg.model = model.clone();
        }
        if let Some(tile_size) = self.tile_size {
            cfg.tile_size = tile_size;
        }
        if let Some(threads) = &self.upscale_threads {
            cfg.thread_spec = threads.clone();
        }
        if let Some(gpu) = self.upscale_gpu {
            cfg.gpu_id = gpu;
        }
        if let Some(format) = &self.format {
            cfg.format = format.clone();
        }
    }
}

#[derive(Args, Debug, Default)]
struct InterpolateArgs {
    /// Frame multiplier (2, 3, 4 or 8)
    #[arg(long)]
    multiplier: Option<u32>,

    /// rife model directory name
    #[arg(long)]
    interpolate_model: Option<String>,

    /// GPU id for rife, -1 for auto
    #[arg(long, allow_negative_numbers = true)]
    interpolate_gpu: Option<i32>,

    /// Enable rife UHD mode
    #[arg(long)]
    uhd: bool,

    /// rife thread spec (load:proc:save), empty for auto
    #[arg(long)]
    interpolate_threads: Option<String>,
}

impl InterpolateArgs {
    fn apply(&self, cfg: &mut InterpolateConfig) {
        if let Some(multiplier) = self.multiplier {
            cfg.multiplier = multiplier;
        }
        if let Some(model) = &self.interpolate_model {
            cfg.model = model.clone();
        }
        if let Some(gpu) = self.interpolate_gpu {
            cfg.gpu_id = gpu;
        }
        if self.uhd {
            cfg.uhd = true;
        }
        if let Some(threads) = &self.interpolate_threads {
            cfg.thread_spec = threads.clone();
        }
    }
}

#[derive(Args, Debug, Default)]
struct WorkflowArgs {
    /// Step order (auto, upscale-first, interpolate-first)
    #[arg(long)]
    order: Option<String>,

    /// Output sizing (ratio, target)
    #[arg(long)]
    output_mode: Option<String>,

    /// Target width in target mode
    #[arg(long)]
    target_width: Option<u32>,

    /// Target height in target mode
    #[arg(long)]
    target_height: Option<u32>,

    /// Target frame rate in target mode
    #[arg(long)]
    target_fps: Option<f64>,
}

impl WorkflowArgs {
    fn apply(&self, cfg: &mut WorkflowConfig) {
        if let Some(order) = &self.order {
            cfg.order = order.clone();
        }
        if let Some(mode) = &self.output_mode {
            cfg.output_mode = mode.clone();
        }
        if let Some(width) = self.target_width {
            cfg.target_width = width;
        }
        if let Some(height) = self.target_height {
            cfg.target_height = height;
        }
        if let Some(fps) = self.target_fps {
            cfg.target_fps = fps;
        }
    }
}

#[derive(Args, Debug, Default)]
struct OutputArgs {
    /// Directory for finished videos (defaults to each input's directory)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Use the hardware encoder (true/false)
    #[arg(long)]
    hardware_encoding: Option<bool>,
}

fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> CliResult<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(DEFAULT_CONFIG_PATH)?,
    };
    Ok(config)
}

fn workflow_params(config: &Config) -> CliResult<WorkflowParams> {
    let upscale = UpscaleParams::try_from(&config.upscale)?;
    let interpolate = InterpolateParams::try_from(&config.interpolate)?;
    Ok(WorkflowParams::from_config(&config.workflow, upscale, interpolate)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn probe(config: &Config, input: &Path, as_json: bool) -> CliResult<ExitCode> {
    let tools = Tools::from_config(&config.tools, &config.gpu);
    let info = tools.codec.probe(input, &CancellationToken::new()).await?;
    if as_json {
        print_json(&info)?;
    } else {
        println!("{}", input.display());
        println!("  {}x{} @ {:.3} fps, {} frames", info.width, info.height, info.fps, info.frame_count);
        println!("  duration {:.2}s, video {}", info.duration_secs, info.video_codec);
        match &info.audio_codec {
            Some(codec) => println!("  audio {}", codec),
            None => println!("  no audio"),
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn plan(config: &Config, input: &Path, as_json: bool) -> CliResult<ExitCode> {
    let tools = Tools::from_config(&config.tools, &config.gpu);
    let info = tools.codec.probe(input, &CancellationToken::new()).await?;
    let source = SourceShape {
        width: info.width,
        height: info.height,
        fps: info.fps,
        frame_count: info.frame_count,
    };
    let workflow = workflow_params(config)?;
    let plan = resolve_workflow_plan(&source, &workflow)?;
    let choice = describe_auto_choice(&source, &workflow)?;

    if as_json {
        print_json(&serde_json::json!({
            "source": source,
            "plan": plan,
            "explanation": choice.message,
        }))?;
    } else {
        let steps: Vec<String> = plan
            .steps
            .iter()
            .map(|s| format!("{:?}", s).to_lowercase())
            .collect();
        println!("Steps: {}", steps.join(" -> "));
        println!(
            "Upscale: {}x with {}",
            plan.upscale.scale.factor(),
            plan.upscale.model
        );
        if plan.should_interpolate {
            println!(
                "Interpolate: {}x with {}",
                plan.interpolate.multiplier.factor(),
                plan.interpolate.model
            );
        }
        println!(
            "Frames at {:.3} fps, output at {:.3} fps",
            plan.sequence_fps, plan.output_fps
        );
        if let (Some(width), Some(height)) = (plan.output_width, plan.output_height) {
            println!("Output size: {}x{}", width, height);
        }
        println!("{}", choice.message);
    }
    Ok(ExitCode::SUCCESS)
}

/// Logs pipeline progress, once per stage and every ten percent.
async fn log_progress(mut rx: broadcast::Receiver<PipelineProgress>) {
    let mut last: Option<(String, TaskStage, u64)> = None;
    loop {
        match rx.recv().await {
            Ok(event) => {
                let key = (event.task_id.clone(), event.stage, (event.progress / 10.0) as u64);
                if last.as_ref() == Some(&key) {
                    continue;
                }
                info!(
                    task_id = %event.task_id,
                    stage = %event.stage,
                    progress = format!("{:.1}%", event.progress),
                    frame = event.current_frame,
                    total = event.total_frames,
                    eta_secs = event.eta_secs,
                    "{}",
                    event.message
                );
                last = Some(key);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_queue(
    config: &Config,
    inputs: &[PathBuf],
    params: TaskParams,
    output: &OutputArgs,
    as_json: bool,
) -> CliResult<ExitCode> {
    let mut encode = EncodeSettings::try_from(&config.encode)?;
    if let Some(hardware) = output.hardware_encoding {
        encode.use_hardware_encoding = hardware;
    }
    let output_dir = output.output_dir.clone().or_else(|| config.paths.output_dir.clone());
    let temp_root = config
        .paths
        .temp_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("vidboost"));

    let tools = Tools::from_config(&config.tools, &config.gpu);
    let pipeline = Arc::new(Pipeline::new(tools, temp_root));
    let scheduler = Scheduler::new(Arc::new(TaskStore::new()), pipeline.clone());
    tokio::spawn(log_progress(pipeline.subscribe()));

    let mut rejected = 0usize;
    for input in inputs {
        let task = Task::new(input, params.clone(), encode.clone(), output_dir.as_deref());
        if let Err(e) = scheduler.enqueue(task).await {
            error!(input = %input.display(), error = %e, "Task rejected");
            rejected += 1;
        }
    }

    scheduler.start();
    tokio::select! {
        _ = scheduler.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling all tasks");
            scheduler.cancel_all();
            scheduler.wait_idle().await;
        }
    }

    let tasks = scheduler.store().list_tasks();
    if as_json {
        print_json(&tasks)?;
    }
    let mut failed = rejected;
    for task in &tasks {
        match task.status {
            TaskStatus::Completed => {
                info!(task_id = %task.id, output = %task.output_path.display(), "Completed")
            }
            TaskStatus::Error => {
                failed += 1;
                error!(
                    task_id = %task.id,
                    input = %task.input_path.display(),
                    error = task.error.as_deref().unwrap_or(""),
                    "Failed"
                );
            }
            status => info!(task_id = %task.id, %status, "Finished"),
        }
    }

    Ok(if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn run(cli: Cli) -> CliResult<ExitCode> {
    let mut config = load_config(cli.config.as_deref())?;

    let required = match &cli.command {
        Command::Probe { .. } | Command::Plan { .. } => RequiredTools::default(),
        Command::Upscale { .. } => RequiredTools {
            upscaler: true,
            interpolator: false,
        },
        Command::Interpolate { .. } => RequiredTools {
            upscaler: false,
            interpolator: true,
        },
        Command::Workflow { .. } => RequiredTools {
            upscaler: true,
            interpolator: true,
        },
    };
    if cli.skip_checks {
        warn!("Skipping startup checks (--skip-checks enabled)");
    } else {
        run_startup_checks(&config.tools, required)?;
    }

    match &cli.command {
        Command::Probe { input } => probe(&config, input, cli.json).await,
        Command::Plan {
            input,
            workflow,
            upscale,
            interpolate,
        } => {
            workflow.apply(&mut config.workflow);
            upscale.apply(&mut config.upscale);
            interpolate.apply(&mut config.interpolate);
            plan(&config, input, cli.json).await
        }
        Command::Upscale {
            inputs,
            upscale,
            output,
        } => {
            upscale.apply(&mut config.upscale);
            let params = TaskParams::Upscale(UpscaleParams::try_from(&config.upscale)?);
            run_queue(&config, inputs, params, output, cli.json).await
        }
        Command::Interpolate {
            inputs,
            interpolate,
            output,
        } => {
            interpolate.apply(&mut config.interpolate);
            let params = TaskParams::Interpolate(InterpolateParams::try_from(&config.interpolate)?);
            run_queue(&config, inputs, params, output, cli.json).await
        }
        Command::Workflow {
            inputs,
            workflow,
            upscale,
            interpolate,
            output,
        } => {
            workflow.apply(&mut config.workflow);
            upscale.apply(&mut config.upscale);
            interpolate.apply(&mut config.interpolate);
            let params = TaskParams::Workflow(workflow_params(&config)?);
            run_queue(&config, inputs, params, output, cli.json).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
