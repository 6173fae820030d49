//! Frame-sequence validation.
//!
//! Before encoding, the processed frame directory is checked for an unbroken
//! run of `frame_NNNNNNNN.<ext>` images so that a partially written output
//! cannot silently produce a truncated video.

use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use walkdir::WalkDir;

/// Matches zero-padded 8-digit frame names with a recognized image extension.
static FRAME_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^frame_(\d{8})\.(png|jpg|jpeg|webp)$").expect("valid regex")
});

#[derive(Debug, Error)]
pub enum FrameSequenceError {
    #[error("No frame sequence found in {0}")]
    NoSequenceFound(PathBuf),

    #[error("Frame sequence in {dir} does not start a contiguous run at {start}")]
    NonContiguousSequence { dir: PathBuf, start: u64 },

    #[error("Failed to read frame directory: {0}")]
    Io(#[from] std::io::Error),
}

/// The contiguous frame range the encoder should read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequenceInfo {
    /// Lowercase extension without the dot.
    pub extension: String,
    pub start_number: u64,
    pub frame_count: u64,
    /// `dir/frame_%08d.<ext>`, as the codec tool expects it.
    pub input_pattern: PathBuf,
}

/// Finds the contiguous frame sequence in `dir`.
///
/// Files are grouped by extension and the largest group wins (ties go to the
/// extension seen first in sorted name order). The run is counted from the
/// lowest frame number; anything after the first gap is ignored.
///
/// # Arguments
/// * `dir` - Directory holding the frame images (not searched recursively)
///
/// # Returns
/// The chosen extension, start number, run length and encoder input pattern.
pub fn resolve_frame_sequence(dir: &Path) -> Result<FrameSequenceInfo, FrameSequenceError> {
    let mut buckets: Vec<(String, BTreeSet<u64>)> = Vec::new();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| std::io::Error::other("directory walk failed"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(caps) = FRAME_NAME_RE.captures(name) else {
            continue;
        };
        let Ok(number) = caps[1].parse::<u64>() else {
            continue;
        };
        let extension = caps[2].to_lowercase();
        match buckets.iter_mut().find(|(ext, _)| *ext == extension) {
            Some((_, frames)) => {
                frames.insert(number);
            }
            None => buckets.push((extension, BTreeSet::from([number]))),
        }
    }

    // max_by_key keeps the last maximum, so walk in reverse to prefer the first-seen bucket
    let (extension, frames) = buckets
        .into_iter()
        .rev()
        .max_by_key(|(_, frames)| frames.len())
        .ok_or_else(|| FrameSequenceError::NoSequenceFound(dir.to_path_buf()))?;

    let start_number = *frames
        .first()
        .ok_or_else(|| FrameSequenceError::NoSequenceFound(dir.to_path_buf()))?;
    let frame_count = contiguous_run(&frames, start_number);
    if frame_count == 0 {
        return Err(FrameSequenceError::NonContiguousSequence {
            dir: dir.to_path_buf(),
            start: start_number,
        });
    }

    Ok(FrameSequenceInfo {
        input_pattern: dir.join(format!("frame_%08d.{}", extension)),
        extension,
        start_number,
        frame_count,
    })
}

/// Length of the run of consecutive numbers beginning at `start`.
fn contiguous_run(frames: &BTreeSet<u64>, start: u64) -> u64 {
    let mut expected = start;
    let mut count = 0;
    for &frame in frames.range(start..) {
        if frame != expected {
            break;
        }
        count += 1;
        expected += 1;
    }
    count
}

/// Counts files in `dir` that look like frames. Used for progress polling.
pub fn count_frames(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map(|name| FRAME_NAME_RE.is_match(name))
                .unwrap_or(false)
        })
        .count() as u64
}
