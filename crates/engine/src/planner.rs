//! Workflow planning.
//!
//! Turns a combined upscale + interpolate request into an ordered list of
//! steps with concrete per-step parameters and final encode targets. Nothing
//! here spawns a process, so planning failures reject a task before it is
//! admitted.

use crate::params::{
    InterpolateParams, ModelCatalog, Multiplier, ParamError, UpscaleParams, UpscaleScale,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use vidboost_config::WorkflowConfig;

const UPSCALE_WORK_WEIGHT: f64 = 1.0;
const INTERPOLATE_WORK_WEIGHT: f64 = 0.72;

/// Single-pass factors considered when resolving a target resolution.
const TARGET_SCALE_OPTIONS: [u32; 2] = [2, 4];
const MULTIPLIER_OPTIONS: [u32; 4] = [2, 3, 4, 8];

const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_FRAME_COUNT: u64 = 300;

#[derive(Debug, Error, PartialEq)]
pub enum PlanError {
    #[error("Target resolution {width}x{height} exceeds single-pass upscale capability (max 4x)")]
    InfeasibleResolution { width: u32, height: u32 },

    #[error("Target FPS {fps} exceeds interpolation capability (max 8x)")]
    InfeasibleFps { fps: f64 },

    #[error("Model {model} does not support {scale}x upscale and no fallback model does")]
    UnsupportedModelScale { model: String, scale: u32 },
}

impl PlanError {
    /// True for both infeasible-target variants.
    pub fn is_infeasible_target(&self) -> bool {
        matches!(
            self,
            PlanError::InfeasibleResolution { .. } | PlanError::InfeasibleFps { .. }
        )
    }
}

/// How a combined workflow picks its step order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStrategy {
    Auto,
    UpscaleFirst,
    InterpolateFirst,
}

impl FromStr for OrderStrategy {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(OrderStrategy::Auto),
            "upscale-first" => Ok(OrderStrategy::UpscaleFirst),
            "interpolate-first" => Ok(OrderStrategy::InterpolateFirst),
            other => Err(ParamError::Choice {
                field: "order",
                value: other.to_string(),
            }),
        }
    }
}

/// Whether the output is described by ratios or by explicit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Ratio,
    Target,
}

impl FromStr for OutputMode {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ratio" => Ok(OutputMode::Ratio),
            "target" => Ok(OutputMode::Target),
            other => Err(ParamError::Choice {
                field: "output_mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Parameters of a combined workflow task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    pub order: OrderStrategy,
    pub output_mode: OutputMode,
    /// 0 means twice the source width.
    pub target_width: u32,
    /// 0 means twice the source height.
    pub target_height: u32,
    pub target_fps: f64,
    pub upscale: UpscaleParams,
    pub interpolate: InterpolateParams,
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self {
            order: OrderStrategy::Auto,
            output_mode: OutputMode::Ratio,
            target_width: 0,
            target_height: 0,
            target_fps: DEFAULT_FPS,
            upscale: UpscaleParams::default(),
            interpolate: InterpolateParams::default(),
        }
    }
}

impl WorkflowParams {
    /// Builds workflow parameters from the `[workflow]` section and the
    /// already converted per-tool parameter sets.
    pub fn from_config(
        cfg: &WorkflowConfig,
        upscale: UpscaleParams,
        interpolate: InterpolateParams,
    ) -> Result<Self, ParamError> {
        Ok(Self {
            order: cfg.order.parse()?,
            output_mode: cfg.output_mode.parse()?,
            target_width: cfg.target_width,
            target_height: cfg.target_height,
            target_fps: cfg.target_fps,
            upscale,
            interpolate,
        })
    }
}

/// Shape of the source video, as far as planning is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceShape {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
}

impl SourceShape {
    /// Replaces unusable values with the planning defaults.
    fn normalized(self) -> Self {
        Self {
            width: if self.width > 0 { self.width } else { DEFAULT_WIDTH },
            height: if self.height > 0 { self.height } else { DEFAULT_HEIGHT },
            fps: normalize_fps(self.fps),
            frame_count: if self.frame_count > 0 {
                self.frame_count
            } else {
                DEFAULT_FRAME_COUNT
            },
        }
    }
}

fn normalize_fps(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        DEFAULT_FPS
    }
}

/// Resolved execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowOrder {
    UpscaleFirst,
    InterpolateFirst,
}

impl fmt::Display for WorkflowOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowOrder::UpscaleFirst => write!(f, "upscale then interpolate"),
            WorkflowOrder::InterpolateFirst => write!(f, "interpolate then upscale"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStep {
    Upscale,
    Interpolate,
}

/// A fully resolved workflow. Recomputed for every run, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowPlan {
    pub order: WorkflowOrder,
    pub upscale: UpscaleParams,
    pub interpolate: InterpolateParams,
    pub should_interpolate: bool,
    /// FPS of the processed frame sequence handed to the encoder.
    pub sequence_fps: f64,
    pub output_fps: f64,
    /// Explicit encode size; None when it equals the natural upscaled size.
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
    pub steps: Vec<WorkflowStep>,
}

/// Relative cost of the two step orders. Only the ratio is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderEstimate {
    pub interpolate_first_cost: f64,
    pub upscale_first_cost: f64,
}

/// Estimates the relative work of both step orders.
pub fn estimate_order_cost(
    source: &SourceShape,
    upscale: &UpscaleParams,
    interpolate: &InterpolateParams,
) -> OrderEstimate {
    let source = source.normalized();
    let source_pixels = f64::from(source.width) * f64::from(source.height);
    let frames = source.frame_count as f64;
    let scale_area = f64::from(upscale.scale.factor()).powi(2);
    let multiplier = f64::from(interpolate.multiplier.factor());

    let interpolate_first_cost = source_pixels * frames * INTERPOLATE_WORK_WEIGHT
        + source_pixels * scale_area * frames * multiplier * UPSCALE_WORK_WEIGHT;
    let upscale_first_cost = source_pixels * scale_area * frames * UPSCALE_WORK_WEIGHT
        + source_pixels * scale_area * frames * INTERPOLATE_WORK_WEIGHT;

    OrderEstimate {
        interpolate_first_cost,
        upscale_first_cost,
    }
}

/// Resolves a workflow against the built-in model catalog.
pub fn resolve_workflow_plan(
    source: &SourceShape,
    workflow: &WorkflowParams,
) -> Result<WorkflowPlan, PlanError> {
    resolve_workflow_plan_with(&ModelCatalog::builtin(), source, workflow)
}

/// Resolves a workflow into steps and encode targets.
///
/// # Arguments
/// * `catalog` - Models and the scales they support
/// * `source` - Probed source shape; zero fields fall back to defaults
/// * `workflow` - Requested order, output mode and base parameters
///
/// # Returns
/// The plan, or a `PlanError` when the target cannot be reached in one pass
/// or no model covers the required scale.
pub fn resolve_workflow_plan_with(
    catalog: &ModelCatalog,
    source: &SourceShape,
    workflow: &WorkflowParams,
) -> Result<WorkflowPlan, PlanError> {
    let source = source.normalized();
    let mut upscale = workflow.upscale.clone();
    let mut interpolate = workflow.interpolate.clone();
    let mut should_interpolate = true;
    let mut sequence_fps = source.fps * f64::from(interpolate.multiplier.factor());
    let mut output_fps = sequence_fps;
    let mut output_width = None;
    let mut output_height = None;

    if workflow.output_mode == OutputMode::Target {
        let target_width = target_dimension(workflow.target_width, source.width);
        let target_height = target_dimension(workflow.target_height, source.height);
        let (Some(target_width), Some(target_height)) = (target_width, target_height) else {
            return Err(PlanError::InfeasibleResolution {
                width: target_width.unwrap_or(u32::MAX),
                height: target_height.unwrap_or(u32::MAX),
            });
        };
        let target_fps = normalize_fps(workflow.target_fps);
        let ratio = (f64::from(target_width) / f64::from(source.width))
            .max(f64::from(target_height) / f64::from(source.height));

        let model_scales: Vec<u32> = catalog
            .upscale_scales(&upscale.model)
            .into_iter()
            .filter(|s| TARGET_SCALE_OPTIONS.contains(s))
            .collect();

        match smallest_covering(&model_scales, ratio) {
            Some(scale) => upscale.scale = scale_from_factor(scale)?,
            None => {
                let scale = smallest_covering(&TARGET_SCALE_OPTIONS, ratio).ok_or(
                    PlanError::InfeasibleResolution {
                        width: target_width,
                        height: target_height,
                    },
                )?;
                let fallback = catalog.fallback_upscale_model(scale).ok_or_else(|| {
                    PlanError::UnsupportedModelScale {
                        model: upscale.model.clone(),
                        scale,
                    }
                })?;
                upscale.model = fallback.to_string();
                upscale.scale = scale_from_factor(scale)?;
            }
        }

        let factor = u64::from(upscale.scale.factor());
        let natural_width = u64::from(source.width) * factor;
        let natural_height = u64::from(source.height) * factor;
        if u64::from(target_width) != natural_width || u64::from(target_height) != natural_height {
            output_width = Some(target_width);
            output_height = Some(target_height);
        }

        if target_fps <= source.fps {
            should_interpolate = false;
            sequence_fps = source.fps;
        } else {
            let multiplier = smallest_covering(&MULTIPLIER_OPTIONS, target_fps / source.fps)
                .ok_or(PlanError::InfeasibleFps { fps: target_fps })?;
            interpolate.multiplier = Multiplier::try_from(multiplier)
                .map_err(|_| PlanError::InfeasibleFps { fps: target_fps })?;
            sequence_fps = source.fps * f64::from(multiplier);
        }
        output_fps = target_fps;
    }

    let scale = upscale.scale.factor();
    if !catalog.upscale_scales(&upscale.model).contains(&scale) {
        let fallback = catalog.fallback_upscale_model(scale).ok_or_else(|| {
            PlanError::UnsupportedModelScale {
                model: upscale.model.clone(),
                scale,
            }
        })?;
        upscale.model = fallback.to_string();
    }

    let order = resolve_order(
        workflow.order,
        &source,
        &upscale,
        &interpolate,
        should_interpolate,
    );
    let steps = match (should_interpolate, order) {
        (false, _) => vec![WorkflowStep::Upscale],
        (true, WorkflowOrder::UpscaleFirst) => vec![WorkflowStep::Upscale, WorkflowStep::Interpolate],
        (true, WorkflowOrder::InterpolateFirst) => {
            vec![WorkflowStep::Interpolate, WorkflowStep::Upscale]
        }
    };

    Ok(WorkflowPlan {
        order,
        upscale,
        interpolate,
        should_interpolate,
        sequence_fps,
        output_fps,
        output_width,
        output_height,
        steps,
    })
}

fn resolve_order(
    strategy: OrderStrategy,
    source: &SourceShape,
    upscale: &UpscaleParams,
    interpolate: &InterpolateParams,
    should_interpolate: bool,
) -> WorkflowOrder {
    if !should_interpolate {
        return WorkflowOrder::UpscaleFirst;
    }
    match strategy {
        OrderStrategy::UpscaleFirst => WorkflowOrder::UpscaleFirst,
        OrderStrategy::InterpolateFirst => WorkflowOrder::InterpolateFirst,
        OrderStrategy::Auto => {
            let estimate = estimate_order_cost(source, upscale, interpolate);
            if estimate.upscale_first_cost <= estimate.interpolate_first_cost {
                WorkflowOrder::UpscaleFirst
            } else {
                WorkflowOrder::InterpolateFirst
            }
        }
    }
}

/// The resolved order of a workflow and a one-line explanation of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoChoice {
    pub order: WorkflowOrder,
    pub message: String,
}

/// Explains which order the planner picks and why.
pub fn describe_auto_choice(
    source: &SourceShape,
    workflow: &WorkflowParams,
) -> Result<AutoChoice, PlanError> {
    let plan = resolve_workflow_plan(source, workflow)?;

    let message = if workflow.order != OrderStrategy::Auto {
        format!("Fixed order: {}", plan.order)
    } else if !plan.should_interpolate {
        "Auto suggestion: upscale only, because target FPS is not higher than source FPS"
            .to_string()
    } else {
        let estimate = estimate_order_cost(source, &plan.upscale, &plan.interpolate);
        let slower = estimate
            .interpolate_first_cost
            .max(estimate.upscale_first_cost);
        let faster = estimate
            .interpolate_first_cost
            .min(estimate.upscale_first_cost);
        let gain = if slower > 0.0 {
            ((slower - faster) / slower * 100.0).round().max(0.0)
        } else {
            0.0
        };
        format!(
            "Auto suggestion: {} with about {}% speed advantage",
            plan.order, gain
        )
    };

    Ok(AutoChoice {
        order: plan.order,
        message,
    })
}

/// The requested dimension, or twice the source one when unset. None when
/// the doubled size does not fit a `u32`.
fn target_dimension(requested: u32, source: u32) -> Option<u32> {
    if requested > 0 {
        Some(requested)
    } else {
        source.checked_mul(2)
    }
}

/// Smallest option that is at least `ratio`. `options` must be ascending.
fn smallest_covering(options: &[u32], ratio: f64) -> Option<u32> {
    options.iter().copied().find(|&o| f64::from(o) >= ratio)
}

fn scale_from_factor(factor: u32) -> Result<UpscaleScale, PlanError> {
    UpscaleScale::try_from(factor).map_err(|_| PlanError::UnsupportedModelScale {
        model: String::new(),
        scale: factor,
    })
}
