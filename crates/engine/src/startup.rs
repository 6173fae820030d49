//! Preflight checks for the external tools.
//!
//! Verifies before any task runs that:
//! - ffmpeg and ffprobe start and report a version
//! - the upscaler and/or interpolator binaries can be spawned when the
//!   requested operation needs them

use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{info, warn};
use vidboost_config::ToolsConfig;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} is not available at {path}: {reason}")]
    ToolUnavailable {
        tool: &'static str,
        path: String,
        reason: String,
    },

    #[error("{tool} -version failed with {status}")]
    VersionCheckFailed { tool: &'static str, status: String },
}

/// Which of the frame-processing tools an operation needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequiredTools {
    pub upscaler: bool,
    pub interpolator: bool,
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
///
/// Git snapshot builds ("N-112233-g...") carry no major version and yield None.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let lower = version_line.to_lowercase();
    let version_part = lower.split("ffmpeg version").nth(1)?.split_whitespace().next()?;
    let version_str = version_part.trim_start_matches('n');

    version_str.split(['.', '-']).next()?.parse().ok()
}

fn unavailable(tool: &'static str, path: &Path, reason: impl ToString) -> StartupError {
    StartupError::ToolUnavailable {
        tool,
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Runs `<path> -version` and returns the first line of its output.
fn version_banner(tool: &'static str, path: &Path) -> Result<String, StartupError> {
    let output = Command::new(path)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| unavailable(tool, path, e))?;

    if !output.status.success() {
        return Err(StartupError::VersionCheckFailed {
            tool,
            status: output.status.to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Checks that ffmpeg runs and returns its major version when it can be read.
pub fn check_ffmpeg(path: &Path) -> Result<Option<u32>, StartupError> {
    let banner = version_banner("ffmpeg", path)?;
    let major = parse_ffmpeg_version(&banner);
    match major {
        Some(major) => info!(path = %path.display(), major, "Found ffmpeg"),
        None => warn!(
            path = %path.display(),
            banner = banner.lines().next().unwrap_or("(empty)"),
            "Could not parse ffmpeg version"
        ),
    }
    Ok(major)
}

pub fn check_ffprobe(path: &Path) -> Result<(), StartupError> {
    version_banner("ffprobe", path)?;
    Ok(())
}

/// Checks that a binary can be spawned at all.
///
/// The ncnn tools print usage and exit non-zero when run without input, so
/// only a failure to start counts.
pub fn check_spawnable(tool: &'static str, path: &Path) -> Result<(), StartupError> {
    Command::new(path)
        .arg("-h")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| unavailable(tool, path, e))?;
    info!(tool, path = %path.display(), "Found tool");
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. ffmpeg version
/// 2. ffprobe
/// 3. upscaler, when required
/// 4. interpolator, when required
pub fn run_startup_checks(tools: &ToolsConfig, required: RequiredTools) -> Result<(), StartupError> {
    check_ffmpeg(&tools.ffmpeg)?;
    check_ffprobe(&tools.ffprobe)?;
    if required.upscaler {
        check_spawnable("waifu2x-ncnn-vulkan", &tools.upscaler)?;
    }
    if required.interpolator {
        check_spawnable("rife-ncnn-vulkan", &tools.interpolator)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_ffmpeg_version_formats() {
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 7.1 Copyright (c) 2000-2024"),
            Some(7)
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version n6.1.1-3-gabc1234 Copyright"),
            Some(6)
        );
        assert_eq!(
            parse_ffmpeg_version("ffmpeg version 5.1.4-0+deb12u1 Copyright"),
            Some(5)
        );
        assert_eq!(parse_ffmpeg_version("ffmpeg version N-112233-gdeadbee"), None);
        assert_eq!(parse_ffmpeg_version("ffprobe version 7.0"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let path = Path::new("/nonexistent/vidboost/ffmpeg");
        let err = check_ffmpeg(path).unwrap_err();
        assert!(matches!(err, StartupError::ToolUnavailable { tool: "ffmpeg", .. }));

        let err = check_spawnable("rife-ncnn-vulkan", path).unwrap_err();
        assert!(err.to_string().starts_with("rife-ncnn-vulkan is not available at"));
    }

    #[cfg(unix)]
    #[test]
    fn test_checks_against_scripted_tools() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let write_script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };
        let ffmpeg = write_script("ffmpeg", "echo 'ffmpeg version 7.1 Copyright'");
        let ffprobe = write_script("ffprobe", "echo 'ffprobe version 7.1'");
        let broken = write_script("broken", "exit 3");
        let usage = write_script("waifu2x", "echo usage >&2; exit 255");

        assert_eq!(check_ffmpeg(&ffmpeg).unwrap(), Some(7));
        assert!(check_ffprobe(&ffprobe).is_ok());
        assert!(matches!(
            check_ffprobe(&broken),
            Err(StartupError::VersionCheckFailed { tool: "ffprobe", .. })
        ));
        assert!(check_spawnable("waifu2x-ncnn-vulkan", &usage).is_ok());

        let tools = ToolsConfig {
            ffmpeg,
            ffprobe,
            upscaler: usage,
            interpolator: dir.path().join("missing"),
            model_root: None,
        };
        let upscale_only = RequiredTools {
            upscaler: true,
            interpolator: false,
        };
        assert!(run_startup_checks(&tools, upscale_only).is_ok());
        let both = RequiredTools {
            upscaler: true,
            interpolator: true,
        };
        assert!(run_startup_checks(&tools, both).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers\nbuilt with gcc 13",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&output), Some(major));
        }
    }
}
