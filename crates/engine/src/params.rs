//! Typed parameter sets for the external tools and the built-in model catalog.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use vidboost_config::{EncodeConfig, InterpolateConfig, UpscaleConfig};

/// Error for parameter values that the tools cannot accept.
#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("Unsupported upscale factor: {0} (expected 2, 3 or 4)")]
    Scale(u32),

    #[error("Unsupported interpolation multiplier: {0} (expected 2, 3, 4 or 8)")]
    Multiplier(u32),

    #[error("Denoise level must be 0-3, got {0}")]
    DenoiseLevel(u32),

    #[error("Unknown image format: {0}")]
    Format(String),

    #[error("Unknown encoder: {0}")]
    Encoder(String),

    #[error("Invalid thread spec '{0}' (expected load:proc:save)")]
    ThreadSpec(String),

    #[error("Unknown {field} value: {value}")]
    Choice { field: &'static str, value: String },
}

/// Thread counts for the load, process and save stages of the ncnn tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSpec {
    pub load: u32,
    pub proc: u32,
    pub save: u32,
}

impl ThreadSpec {
    pub const fn new(load: u32, proc: u32, save: u32) -> Self {
        Self { load, proc, save }
    }

    /// Parses an optional spec where an empty string means "use the recommendation".
    pub fn parse_optional(text: &str) -> Result<Option<Self>, ParamError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }
}

impl FromStr for ThreadSpec {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 3 {
            return Err(ParamError::ThreadSpec(s.to_string()));
        }
        let mut values = [0u32; 3];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .trim()
                .parse()
                .map_err(|_| ParamError::ThreadSpec(s.to_string()))?;
        }
        if values.iter().any(|v| *v == 0) {
            return Err(ParamError::ThreadSpec(s.to_string()));
        }
        Ok(Self::new(values[0], values[1], values[2]))
    }
}

impl fmt::Display for ThreadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.load, self.proc, self.save)
    }
}

impl Serialize for ThreadSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ThreadSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Upscale factor accepted by the super-resolution tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum UpscaleScale {
    X2,
    X3,
    X4,
}

impl UpscaleScale {
    pub fn factor(self) -> u32 {
        match self {
            UpscaleScale::X2 => 2,
            UpscaleScale::X3 => 3,
            UpscaleScale::X4 => 4,
        }
    }
}

impl TryFrom<u32> for UpscaleScale {
    type Error = ParamError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(UpscaleScale::X2),
            3 => Ok(UpscaleScale::X3),
            4 => Ok(UpscaleScale::X4),
            other => Err(ParamError::Scale(other)),
        }
    }
}

impl From<UpscaleScale> for u32 {
    fn from(scale: UpscaleScale) -> Self {
        scale.factor()
    }
}

/// Frame-count multiplier accepted by the interpolation tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Multiplier {
    X2,
    X3,
    X4,
    X8,
}

impl Multiplier {
    pub fn factor(self) -> u32 {
        match self {
            Multiplier::X2 => 2,
            Multiplier::X3 => 3,
            Multiplier::X4 => 4,
            Multiplier::X8 => 8,
        }
    }
}

impl TryFrom<u32> for Multiplier {
    type Error = ParamError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Multiplier::X2),
            3 => Ok(Multiplier::X3),
            4 => Ok(Multiplier::X4),
            8 => Ok(Multiplier::X8),
            other => Err(ParamError::Multiplier(other)),
        }
    }
}

impl From<Multiplier> for u32 {
    fn from(multiplier: Multiplier) -> Self {
        multiplier.factor()
    }
}

/// Image format written by the super-resolution tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpg,
    Webp,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpg => "jpg",
            ImageFormat::Webp => "webp",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpg),
            "webp" => Ok(ImageFormat::Webp),
            _ => Err(ParamError::Format(s.to_string())),
        }
    }
}

/// Parameters for one super-resolution pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpscaleParams {
    pub scale: UpscaleScale,
    pub denoise_level: u8,
    /// 0 means "use the advisor's recommendation"
    pub tile_size: u32,
    /// None means "use the advisor's recommendation"
    pub thread_spec: Option<ThreadSpec>,
    /// None means the tool picks the device
    pub gpu: Option<u32>,
    pub model: String,
    pub format: ImageFormat,
    pub custom_args: Vec<String>,
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            scale: UpscaleScale::X2,
            denoise_level: 1,
            tile_size: 0,
            thread_spec: None,
            gpu: None,
            model: "models-cunet".to_string(),
            format: ImageFormat::Png,
            custom_args: Vec::new(),
        }
    }
}

impl TryFrom<&UpscaleConfig> for UpscaleParams {
    type Error = ParamError;

    fn try_from(cfg: &UpscaleConfig) -> Result<Self, Self::Error> {
        if cfg.denoise_level > 3 {
            return Err(ParamError::DenoiseLevel(cfg.denoise_level));
        }
        Ok(Self {
            scale: UpscaleScale::try_from(cfg.scale)?,
            denoise_level: cfg.denoise_level as u8,
            tile_size: cfg.tile_size,
            thread_spec: ThreadSpec::parse_optional(&cfg.thread_spec)?,
            gpu: gpu_from_config(cfg.gpu_id),
            model: cfg.model.trim().to_string(),
            format: cfg.format.parse()?,
            custom_args: cfg.custom_args.clone(),
        })
    }
}

/// Parameters for one interpolation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpolateParams {
    pub multiplier: Multiplier,
    pub model: String,
    pub gpu: Option<u32>,
    pub uhd: bool,
    pub thread_spec: Option<ThreadSpec>,
    pub custom_args: Vec<String>,
}

impl Default for InterpolateParams {
    fn default() -> Self {
        Self {
            multiplier: Multiplier::X2,
            model: "rife-v4.6".to_string(),
            gpu: None,
            uhd: false,
            thread_spec: Some(ThreadSpec::new(4, 8, 4)),
            custom_args: Vec::new(),
        }
    }
}

impl TryFrom<&InterpolateConfig> for InterpolateParams {
    type Error = ParamError;

    fn try_from(cfg: &InterpolateConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            multiplier: Multiplier::try_from(cfg.multiplier)?,
            model: cfg.model.trim().to_string(),
            gpu: gpu_from_config(cfg.gpu_id),
            uhd: cfg.uhd,
            thread_spec: ThreadSpec::parse_optional(&cfg.thread_spec)?,
            custom_args: cfg.custom_args.clone(),
        })
    }
}

/// Negative GPU ids mean "auto".
fn gpu_from_config(gpu_id: i32) -> Option<u32> {
    u32::try_from(gpu_id).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoftwareEncoder {
    Libx264,
    Libx265,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareEncoder {
    H264Nvenc,
    HevcNvenc,
}

/// Video encoder selection for the final mux.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    pub use_hardware_encoding: bool,
    pub software_encoder: SoftwareEncoder,
    pub hardware_encoder: HardwareEncoder,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            use_hardware_encoding: true,
            software_encoder: SoftwareEncoder::Libx264,
            hardware_encoder: HardwareEncoder::H264Nvenc,
        }
    }
}

impl EncodeSettings {
    /// ffmpeg codec name of the encoder that will actually run.
    pub fn video_encoder(&self) -> &'static str {
        if self.use_hardware_encoding {
            match self.hardware_encoder {
                HardwareEncoder::H264Nvenc => "h264_nvenc",
                HardwareEncoder::HevcNvenc => "hevc_nvenc",
            }
        } else {
            match self.software_encoder {
                SoftwareEncoder::Libx264 => "libx264",
                SoftwareEncoder::Libx265 => "libx265",
            }
        }
    }
}

impl TryFrom<&EncodeConfig> for EncodeSettings {
    type Error = ParamError;

    fn try_from(cfg: &EncodeConfig) -> Result<Self, Self::Error> {
        let software_encoder = match cfg.software_encoder.trim() {
            "libx264" => SoftwareEncoder::Libx264,
            "libx265" => SoftwareEncoder::Libx265,
            other => return Err(ParamError::Encoder(other.to_string())),
        };
        let hardware_encoder = match cfg.hardware_encoder.trim() {
            "h264_nvenc" => HardwareEncoder::H264Nvenc,
            "hevc_nvenc" => HardwareEncoder::HevcNvenc,
            other => return Err(ParamError::Encoder(other.to_string())),
        };
        Ok(Self {
            use_hardware_encoding: cfg.use_hardware_encoding,
            software_encoder,
            hardware_encoder,
        })
    }
}

/// A super-resolution model and the factors it was trained for.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleModel {
    pub name: String,
    pub supported_scales: Vec<u32>,
}

/// An interpolation model and the multipliers it handles.
#[derive(Debug, Clone, PartialEq)]
pub struct InterpolateModel {
    pub name: String,
    pub supported_multipliers: Vec<u32>,
}

/// Models known to the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCatalog {
    pub upscale: Vec<UpscaleModel>,
    pub interpolate: Vec<InterpolateModel>,
}

/// Scales assumed for upscale models missing from the catalog.
const UNKNOWN_MODEL_SCALES: [u32; 2] = [2, 4];

impl ModelCatalog {
    /// The models bundled with the ncnn tool builds.
    pub fn builtin() -> Self {
        let upscale = [
            ("models-cunet", vec![2]),
            ("models-upconv_7_anime_style_art_rgb", vec![2, 3, 4]),
            ("models-upconv_7_photo", vec![2, 3, 4]),
        ]
        .into_iter()
        .map(|(name, supported_scales)| UpscaleModel {
            name: name.to_string(),
            supported_scales,
        })
        .collect();

        let interpolate = [
            ("rife-v4.6", vec![2, 3, 4, 8]),
            ("rife-v4", vec![2, 3, 4]),
            ("rife-v3.1", vec![2, 3, 4, 8]),
            ("rife-v3.0", vec![2, 3, 4, 8]),
            ("rife-v2.4", vec![2, 3, 4, 8]),
            ("rife-v2.3", vec![2, 3, 4, 8]),
            ("rife-v2", vec![2, 3, 4, 8]),
            ("rife", vec![2, 3, 4, 8]),
            ("rife-anime", vec![2, 3, 4, 8]),
            ("rife-HD", vec![2, 3, 4, 8]),
            ("rife-UHD", vec![2, 4, 8]),
        ]
        .into_iter()
        .map(|(name, supported_multipliers)| InterpolateModel {
            name: name.to_string(),
            supported_multipliers,
        })
        .collect();

        Self {
            upscale,
            interpolate,
        }
    }

    /// Supported scales for `model`, ascending.
    pub fn upscale_scales(&self, model: &str) -> Vec<u32> {
        let mut scales = self
            .upscale
            .iter()
            .find(|m| m.name == model)
            .map(|m| m.supported_scales.clone())
            .unwrap_or_else(|| UNKNOWN_MODEL_SCALES.to_vec());
        scales.sort_unstable();
        scales
    }

    /// First catalog model able to run at `scale`.
    pub fn fallback_upscale_model(&self, scale: u32) -> Option<&str> {
        self.upscale
            .iter()
            .find(|m| m.supported_scales.contains(&scale))
            .map(|m| m.name.as_str())
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_thread_spec_display_parses_back(load in 1u32..64, proc in 1u32..64, save in 1u32..64) {
            let spec = ThreadSpec::new(load, proc, save);
            let text = spec.to_string();
            prop_assert_eq!(text.parse::<ThreadSpec>(), Ok(spec));
        }

        #[test]
        fn prop_scale_conversion_accepts_only_tool_factors(value in 0u32..16) {
            let parsed = UpscaleScale::try_from(value);
            prop_assert_eq!(parsed.is_ok(), matches!(value, 2..=4));
        }
    }

    #[test]
    fn test_thread_spec_rejects_malformed() {
        assert!("4:8".parse::<ThreadSpec>().is_err());
        assert!("a:b:c".parse::<ThreadSpec>().is_err());
        assert!("0:2:2".parse::<ThreadSpec>().is_err());
        assert!("1:2:3:4".parse::<ThreadSpec>().is_err());
        assert_eq!(ThreadSpec::parse_optional("  "), Ok(None));
        assert_eq!(
            ThreadSpec::parse_optional(" 2:4:2 "),
            Ok(Some(ThreadSpec::new(2, 4, 2)))
        );
    }

    #[test]
    fn test_params_from_default_config() {
        let upscale = UpscaleParams::try_from(&UpscaleConfig::default()).unwrap();
        assert_eq!(upscale, UpscaleParams::default());

        let interpolate = InterpolateParams::try_from(&InterpolateConfig::default()).unwrap();
        assert_eq!(interpolate, InterpolateParams::default());

        let encode = EncodeSettings::try_from(&EncodeConfig::default()).unwrap();
        assert_eq!(encode, EncodeSettings::default());
    }

    #[test]
    fn test_params_from_config_rejects_bad_values() {
        let cfg = UpscaleConfig {
            denoise_level: 4,
            ..UpscaleConfig::default()
        };
        assert_eq!(UpscaleParams::try_from(&cfg), Err(ParamError::DenoiseLevel(4)));

        let cfg = InterpolateConfig {
            multiplier: 5,
            ..InterpolateConfig::default()
        };
        assert_eq!(InterpolateParams::try_from(&cfg), Err(ParamError::Multiplier(5)));

        let cfg = EncodeConfig {
            software_encoder: "libvpx".to_string(),
            ..EncodeConfig::default()
        };
        assert!(matches!(EncodeSettings::try_from(&cfg), Err(ParamError::Encoder(_))));
    }

    #[test]
    fn test_gpu_id_mapping() {
        let cfg = UpscaleConfig {
            gpu_id: 1,
            ..UpscaleConfig::default()
        };
        assert_eq!(UpscaleParams::try_from(&cfg).unwrap().gpu, Some(1));
        assert_eq!(UpscaleParams::default().gpu, None);
    }

    #[test]
    fn test_video_encoder_selection() {
        let mut settings = EncodeSettings::default();
        assert_eq!(settings.video_encoder(), "h264_nvenc");
        settings.hardware_encoder = HardwareEncoder::HevcNvenc;
        assert_eq!(settings.video_encoder(), "hevc_nvenc");
        settings.use_hardware_encoding = false;
        assert_eq!(settings.video_encoder(), "libx264");
        settings.software_encoder = SoftwareEncoder::Libx265;
        assert_eq!(settings.video_encoder(), "libx265");
    }

    #[test]
    fn test_catalog_lookups() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(catalog.upscale_scales("models-cunet"), vec![2]);
        assert_eq!(catalog.upscale_scales("models-upconv_7_photo"), vec![2, 3, 4]);
        assert_eq!(catalog.upscale_scales("some-custom-model"), vec![2, 4]);
        assert_eq!(catalog.fallback_upscale_model(2), Some("models-cunet"));
        assert_eq!(
            catalog.fallback_upscale_model(4),
            Some("models-upconv_7_anime_style_art_rgb")
        );
        assert_eq!(catalog.fallback_upscale_model(8), None);
    }

    #[test]
    fn test_serde_shapes() {
        let params = UpscaleParams {
            thread_spec: Some(ThreadSpec::new(1, 2, 2)),
            ..UpscaleParams::default()
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["scale"], 2);
        assert_eq!(json["thread_spec"], "1:2:2");
        assert_eq!(json["format"], "png");

        let bad: Result<UpscaleParams, _> =
            serde_json::from_value(serde_json::json!({"scale": 5}));
        assert!(bad.is_err());
    }
}
