//! vidboost engine
//!
//! Orchestrates video enhancement jobs: frames are extracted with ffmpeg,
//! upscaled with waifu2x-ncnn-vulkan and/or interpolated with
//! rife-ncnn-vulkan, then muxed back with the source's audio and metadata.
//! Tasks are queued in a [`TaskStore`] and run one at a time by the
//! [`Scheduler`].

pub mod advisor;
pub mod frames;
pub mod params;
pub mod pipeline;
pub mod planner;
pub mod scheduler;
pub mod startup;
pub mod store;
pub mod task;
pub mod tools;

#[cfg(test)]
mod test_support;

pub use advisor::{CapabilityAdvisor, NcnnRecommendation, VramAdvisor};
pub use frames::{resolve_frame_sequence, FrameSequenceError, FrameSequenceInfo};
pub use params::{
    EncodeSettings, ImageFormat, InterpolateParams, ModelCatalog, Multiplier, ParamError,
    ThreadSpec, UpscaleParams, UpscaleScale,
};
pub use pipeline::{calculate_eta, Pipeline, PipelineError, PipelineProgress};
pub use planner::{
    describe_auto_choice, estimate_order_cost, resolve_workflow_plan, resolve_workflow_plan_with,
    OrderStrategy, OutputMode, PlanError, SourceShape, WorkflowParams, WorkflowPlan,
};
pub use scheduler::{Scheduler, SchedulerError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, RequiredTools, StartupError};
pub use store::TaskStore;
pub use task::{Task, TaskKind, TaskParams, TaskStage, TaskStatus};
pub use tools::{CodecTool, InterpolateTool, ToolError, Tools, UpscaleTool, VideoInfo};
pub use vidboost_config as config;
pub use vidboost_config::Config;
