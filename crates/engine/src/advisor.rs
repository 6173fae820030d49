//! GPU capability heuristics.
//!
//! Recommendations are only used when the user left tile size or thread
//! spec on "auto". They never affect correctness.

use crate::params::ThreadSpec;

/// Tile size and thread spec for the super-resolution tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcnnRecommendation {
    pub tile_size: u32,
    pub thread_spec: ThreadSpec,
}

/// Used when no advisor answer is available.
pub const UPSCALE_FALLBACK: NcnnRecommendation = NcnnRecommendation {
    tile_size: 256,
    thread_spec: ThreadSpec::new(1, 2, 2),
};

/// Interpolation thread spec used when no advisor answer is available.
pub fn interpolate_fallback(uhd: bool) -> ThreadSpec {
    if uhd {
        ThreadSpec::new(2, 3, 2)
    } else {
        ThreadSpec::new(3, 6, 4)
    }
}

/// Source of runtime recommendations for the ncnn tools.
pub trait CapabilityAdvisor: Send + Sync {
    /// Recommendation for the upscaler on `gpu` (None = auto-selected device).
    fn recommend_upscale(&self, gpu: Option<u32>) -> Option<NcnnRecommendation>;

    /// Thread spec for the interpolator on `gpu`.
    fn recommend_interpolate(&self, gpu: Option<u32>, uhd: bool) -> Option<ThreadSpec>;
}

/// Advisor driven by a configured VRAM size and the host's logical cores.
#[derive(Debug, Clone)]
pub struct VramAdvisor {
    vram_mb: Option<u32>,
    logical_cores: u32,
}

impl VramAdvisor {
    /// # Arguments
    /// * `vram_mb` - VRAM of the target device; None or 0 when unknown
    /// * `logical_cores` - Host logical cores; detected when None
    pub fn new(vram_mb: Option<u32>, logical_cores: Option<u32>) -> Self {
        let logical_cores = logical_cores
            .filter(|c| *c > 0)
            .unwrap_or_else(|| num_cpus::get() as u32);
        Self {
            vram_mb: vram_mb.filter(|v| *v > 0),
            logical_cores,
        }
    }

    pub fn from_config(gpu: &vidboost_config::GpuConfig) -> Self {
        Self::new(gpu.vram_mb, gpu.logical_cores)
    }

    pub fn ncnn_recommendation(&self) -> NcnnRecommendation {
        let (tile_size, thread_spec) = match self.vram_mb {
            None => (256, ThreadSpec::new(1, 2, 2)),
            Some(v) if v >= 16384 => (512, ThreadSpec::new(2, 8, 2)),
            Some(v) if v >= 12288 => (384, ThreadSpec::new(2, 6, 2)),
            Some(v) if v >= 8192 => (320, ThreadSpec::new(2, 5, 2)),
            Some(v) if v >= 6144 => (256, ThreadSpec::new(2, 4, 2)),
            Some(v) if v >= 4096 => (192, ThreadSpec::new(1, 3, 2)),
            Some(_) => (128, ThreadSpec::new(1, 2, 2)),
        };
        NcnnRecommendation {
            tile_size,
            thread_spec,
        }
    }

    pub fn rife_recommendation(&self, uhd: bool) -> ThreadSpec {
        let proc_threads = if uhd {
            match self.vram_mb {
                Some(v) if v >= 12288 => 4,
                _ => 3,
            }
        } else {
            match self.vram_mb {
                None => 6,
                Some(v) if v >= 16384 => 8,
                Some(v) if v >= 12288 => 7,
                Some(v) if v >= 8192 => 6,
                Some(v) if v >= 6144 => 5,
                Some(v) if v >= 4096 => 4,
                Some(_) => 3,
            }
        };

        let reserved = if uhd { 4 } else { 2 };
        let max_proc = self.logical_cores.saturating_sub(reserved).max(2);
        let proc = proc_threads.clamp(2, max_proc);

        let (load_div, save_div) = if uhd { (2.0, 2.0) } else { (1.8, 1.6) };
        let load = ((f64::from(proc) / load_div).ceil() as u32).clamp(1, 6);
        let save = ((f64::from(proc) / save_div).ceil() as u32).clamp(2, 8);

        ThreadSpec::new(load, proc, save)
    }
}

impl CapabilityAdvisor for VramAdvisor {
    fn recommend_upscale(&self, _gpu: Option<u32>) -> Option<NcnnRecommendation> {
        Some(self.ncnn_recommendation())
    }

    fn recommend_interpolate(&self, _gpu: Option<u32>, uhd: bool) -> Option<ThreadSpec> {
        Some(self.rife_recommendation(uhd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ncnn_tiers() {
        let cases = [
            (None, 256, "1:2:2"),
            (Some(0), 256, "1:2:2"),
            (Some(2048), 128, "1:2:2"),
            (Some(4096), 192, "1:3:2"),
            (Some(6144), 256, "2:4:2"),
            (Some(8192), 320, "2:5:2"),
            (Some(12288), 384, "2:6:2"),
            (Some(24576), 512, "2:8:2"),
        ];
        for (vram, tile, spec) in cases {
            let rec = VramAdvisor::new(vram, Some(16)).ncnn_recommendation();
            assert_eq!(rec.tile_size, tile, "vram {:?}", vram);
            assert_eq!(rec.thread_spec.to_string(), spec, "vram {:?}", vram);
        }
    }

    #[test]
    fn test_rife_tiers_with_plenty_of_cores() {
        let advisor = VramAdvisor::new(Some(16384), Some(32));
        assert_eq!(advisor.rife_recommendation(false), ThreadSpec::new(5, 8, 5));
        assert_eq!(advisor.rife_recommendation(true), ThreadSpec::new(2, 4, 2));

        let advisor = VramAdvisor::new(None, Some(32));
        assert_eq!(advisor.rife_recommendation(false), ThreadSpec::new(4, 6, 4));
        assert_eq!(advisor.rife_recommendation(true), ThreadSpec::new(2, 3, 2));
    }

    #[test]
    fn test_rife_clamped_by_cores() {
        let advisor = VramAdvisor::new(Some(16384), Some(4));
        // 4 cores leave 2 proc threads
        assert_eq!(advisor.rife_recommendation(false), ThreadSpec::new(2, 2, 2));

        let advisor = VramAdvisor::new(Some(16384), Some(1));
        assert_eq!(advisor.rife_recommendation(true).proc, 2);
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(UPSCALE_FALLBACK.tile_size, 256);
        assert_eq!(interpolate_fallback(true).to_string(), "2:3:2");
        assert_eq!(interpolate_fallback(false).to_string(), "3:6:4");
    }

    #[test]
    fn test_detects_cores_when_unset() {
        let advisor = VramAdvisor::new(None, None);
        assert!(advisor.logical_cores >= 1);
    }

    proptest! {
        #[test]
        fn prop_rife_spec_within_bounds(vram in proptest::option::of(0u32..40000), cores in 1u32..128, uhd in any::<bool>()) {
            let spec = VramAdvisor::new(vram, Some(cores)).rife_recommendation(uhd);
            prop_assert!(spec.proc >= 2);
            prop_assert!((1..=6).contains(&spec.load));
            prop_assert!((2..=8).contains(&spec.save));
        }
    }
}
