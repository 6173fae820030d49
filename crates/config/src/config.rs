//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// External tool binaries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    /// Super-resolution tool (waifu2x-ncnn-vulkan compatible)
    #[serde(default = "default_upscaler")]
    pub upscaler: PathBuf,
    /// Frame interpolation tool (rife-ncnn-vulkan compatible)
    #[serde(default = "default_interpolator")]
    pub interpolator: PathBuf,
    /// Directory holding model folders; model names are passed verbatim when unset
    #[serde(default)]
    pub model_root: Option<PathBuf>,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_upscaler() -> PathBuf {
    PathBuf::from("waifu2x-ncnn-vulkan")
}

fn default_interpolator() -> PathBuf {
    PathBuf::from("rife-ncnn-vulkan")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            upscaler: default_upscaler(),
            interpolator: default_interpolator(),
            model_root: None,
        }
    }
}

/// Working and output locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PathsConfig {
    /// Root for per-task scratch directories (system temp dir if None)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Where finished videos go (next to the input if None)
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// GPU hints used for runtime recommendations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GpuConfig {
    /// Dedicated video memory in MiB (unknown if None)
    #[serde(default)]
    pub vram_mb: Option<u32>,
    /// Number of logical cores (auto-detected if None)
    #[serde(default)]
    pub logical_cores: Option<u32>,
}

/// Final encode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    #[serde(default = "default_use_hardware_encoding")]
    pub use_hardware_encoding: bool,
    #[serde(default = "default_software_encoder")]
    pub software_encoder: String,
    #[serde(default = "default_hardware_encoder")]
    pub hardware_encoder: String,
}

fn default_use_hardware_encoding() -> bool {
    true
}

fn default_software_encoder() -> String {
    "libx264".to_string()
}

fn default_hardware_encoder() -> String {
    "h264_nvenc".to_string()
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            use_hardware_encoding: default_use_hardware_encoding(),
            software_encoder: default_software_encoder(),
            hardware_encoder: default_hardware_encoder(),
        }
    }
}

/// Super-resolution defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpscaleConfig {
    #[serde(default = "default_upscale_model")]
    pub model: String,
    #[serde(default = "default_scale")]
    pub scale: u32,
    #[serde(default = "default_denoise_level")]
    pub denoise_level: u32,
    /// Tile size (0 = recommended)
    #[serde(default)]
    pub tile_size: u32,
    /// `load:proc:save` (empty = recommended)
    #[serde(default)]
    pub thread_spec: String,
    /// GPU index (-1 = auto)
    #[serde(default = "default_gpu_id")]
    pub gpu_id: i32,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub custom_args: Vec<String>,
}

fn default_upscale_model() -> String {
    "models-cunet".to_string()
}

fn default_scale() -> u32 {
    2
}

fn default_denoise_level() -> u32 {
    1
}

fn default_gpu_id() -> i32 {
    -1
}

fn default_format() -> String {
    "png".to_string()
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            model: default_upscale_model(),
            scale: default_scale(),
            denoise_level: default_denoise_level(),
            tile_size: 0,
            thread_spec: String::new(),
            gpu_id: default_gpu_id(),
            format: default_format(),
            custom_args: Vec::new(),
        }
    }
}

/// Frame interpolation defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterpolateConfig {
    #[serde(default = "default_interpolate_model")]
    pub model: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_gpu_id")]
    pub gpu_id: i32,
    #[serde(default)]
    pub uhd: bool,
    #[serde(default = "default_interpolate_thread_spec")]
    pub thread_spec: String,
    #[serde(default)]
    pub custom_args: Vec<String>,
}

fn default_interpolate_model() -> String {
    "rife-v4.6".to_string()
}

fn default_multiplier() -> u32 {
    2
}

fn default_interpolate_thread_spec() -> String {
    "4:8:4".to_string()
}

impl Default for InterpolateConfig {
    fn default() -> Self {
        Self {
            model: default_interpolate_model(),
            multiplier: default_multiplier(),
            gpu_id: default_gpu_id(),
            uhd: false,
            thread_spec: default_interpolate_thread_spec(),
            custom_args: Vec::new(),
        }
    }
}

/// Combined workflow defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    /// `auto`, `upscale-first` or `interpolate-first`
    #[serde(default = "default_order")]
    pub order: String,
    /// `ratio` or `target`
    #[serde(default = "default_output_mode")]
    pub output_mode: String,
    #[serde(default)]
    pub target_width: u32,
    #[serde(default)]
    pub target_height: u32,
    #[serde(default)]
    pub target_fps: f64,
}

fn default_order() -> String {
    "auto".to_string()
}

fn default_output_mode() -> String {
    "ratio".to_string()
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            order: default_order(),
            output_mode: default_output_mode(),
            target_width: 0,
            target_height: 0,
            target_fps: 0.0,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub upscale: UpscaleConfig,
    #[serde(default)]
    pub interpolate: InterpolateConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDBOOST_FFMPEG -> tools.ffmpeg
    /// - VIDBOOST_FFPROBE -> tools.ffprobe
    /// - VIDBOOST_UPSCALER -> tools.upscaler
    /// - VIDBOOST_INTERPOLATOR -> tools.interpolator
    /// - VIDBOOST_MODEL_ROOT -> tools.model_root
    /// - VIDBOOST_TEMP_DIR -> paths.temp_dir
    /// - VIDBOOST_OUTPUT_DIR -> paths.output_dir
    /// - VIDBOOST_GPU_VRAM_MB -> gpu.vram_mb
    /// - VIDBOOST_HARDWARE_ENCODING -> encode.use_hardware_encoding
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = non_empty_var("VIDBOOST_FFMPEG") {
            self.tools.ffmpeg = PathBuf::from(path);
        }
        if let Some(path) = non_empty_var("VIDBOOST_FFPROBE") {
            self.tools.ffprobe = PathBuf::from(path);
        }
        if let Some(path) = non_empty_var("VIDBOOST_UPSCALER") {
            self.tools.upscaler = PathBuf::from(path);
        }
        if let Some(path) = non_empty_var("VIDBOOST_INTERPOLATOR") {
            self.tools.interpolator = PathBuf::from(path);
        }
        if let Some(path) = non_empty_var("VIDBOOST_MODEL_ROOT") {
            self.tools.model_root = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_var("VIDBOOST_TEMP_DIR") {
            self.paths.temp_dir = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_var("VIDBOOST_OUTPUT_DIR") {
            self.paths.output_dir = Some(PathBuf::from(path));
        }

        if let Ok(val) = env::var("VIDBOOST_GPU_VRAM_MB") {
            if let Ok(vram) = val.parse::<u32>() {
                self.gpu.vram_mb = Some(vram);
            }
        }

        if let Ok(val) = env::var("VIDBOOST_HARDWARE_ENCODING") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encode.use_hardware_encoding = true,
                "false" | "0" | "no" => self.encode.use_hardware_encoding = false,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env_vars() {
        for key in [
            "VIDBOOST_FFMPEG",
            "VIDBOOST_FFPROBE",
            "VIDBOOST_UPSCALER",
            "VIDBOOST_INTERPOLATOR",
            "VIDBOOST_MODEL_ROOT",
            "VIDBOOST_TEMP_DIR",
            "VIDBOOST_OUTPUT_DIR",
            "VIDBOOST_GPU_VRAM_MB",
            "VIDBOOST_HARDWARE_ENCODING",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_config_parses_all_sections(
            vram in proptest::option::of(1u32..65536),
            scale in 2u32..5,
            multiplier in prop_oneof![Just(2u32), Just(3), Just(4), Just(8)],
            uhd in proptest::bool::ANY,
            hw in proptest::bool::ANY,
            target_width in 0u32..8000,
        ) {
            let toml_str = format!(
                r#"
[gpu]
{}

[encode]
use_hardware_encoding = {}

[upscale]
scale = {}

[interpolate]
multiplier = {}
uhd = {}

[workflow]
output_mode = "target"
target_width = {}
"#,
                vram.map(|v| format!("vram_mb = {}", v)).unwrap_or_default(),
                hw,
                scale,
                multiplier,
                uhd,
                target_width,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.gpu.vram_mb, vram);
            prop_assert_eq!(config.encode.use_hardware_encoding, hw);
            prop_assert_eq!(config.upscale.scale, scale);
            prop_assert_eq!(config.interpolate.multiplier, multiplier);
            prop_assert_eq!(config.interpolate.uhd, uhd);
            prop_assert_eq!(config.workflow.output_mode.as_str(), "target");
            prop_assert_eq!(config.workflow.target_width, target_width);
            // untouched sections keep their defaults
            prop_assert_eq!(&config.tools, &ToolsConfig::default());
        }

        #[test]
        fn prop_env_overrides_vram(
            initial in proptest::option::of(1u32..32768),
            override_vram in 1u32..65536,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[gpu]\n{}\n",
                initial.map(|v| format!("vram_mb = {}", v)).unwrap_or_default()
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("VIDBOOST_GPU_VRAM_MB", override_vram.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.gpu.vram_mb, Some(override_vram));
        }

        #[test]
        fn prop_env_overrides_hardware_encoding(
            initial in proptest::bool::ANY,
            override_hw in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encode]\nuse_hardware_encoding = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("VIDBOOST_HARDWARE_ENCODING", override_hw.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encode.use_hardware_encoding, override_hw);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
        assert_eq!(config.tools.upscaler, PathBuf::from("waifu2x-ncnn-vulkan"));
        assert_eq!(config.tools.model_root, None);
        assert_eq!(config.paths, PathsConfig::default());
        assert_eq!(config.upscale.model, "models-cunet");
        assert_eq!(config.upscale.scale, 2);
        assert_eq!(config.upscale.denoise_level, 1);
        assert_eq!(config.upscale.gpu_id, -1);
        assert_eq!(config.interpolate.model, "rife-v4.6");
        assert_eq!(config.interpolate.thread_spec, "4:8:4");
        assert_eq!(config.workflow.order, "auto");
        assert_eq!(config.workflow.output_mode, "ratio");
        assert!(config.encode.use_hardware_encoding);
    }

    #[test]
    fn test_tool_path_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("VIDBOOST_FFMPEG", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("VIDBOOST_MODEL_ROOT", "/opt/models");
        env::set_var("VIDBOOST_UPSCALER", "   ");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.tools.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.tools.model_root, Some(PathBuf::from("/opt/models")));
        // blank values are ignored
        assert_eq!(config.tools.upscaler, PathBuf::from("waifu2x-ncnn-vulkan"));
    }

    #[test]
    fn test_invalid_hardware_flag_is_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("VIDBOOST_HARDWARE_ENCODING", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.encode.use_hardware_encoding);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/vidboost/config.toml")
            .expect("missing file falls back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_missing_file_is_error() {
        let result = Config::load("/nonexistent/vidboost/config.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::parse_toml("[upscale]\nscale = \"big\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
