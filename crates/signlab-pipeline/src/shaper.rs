//! Fixed-length sequence shaping and flattening into `[T, 1629]` feature rows.
//!
//! The flatten order (pose, left hand, right hand, face; x, y, z per point)
//! is the contract between stored datasets, trained weights, and live
//! inference requests.

use signlab_core::{Frame, LandmarkGroup, Result, SignLabError, FEATURE_WIDTH};

use crate::normalize::normalize_frame;

/// Truncate or pad a sequence to exactly `target_length` frames.
///
/// Longer sequences keep their first frames; shorter ones repeat the last
/// frame.
pub fn shape_sequence(mut frames: Vec<Frame>, target_length: usize) -> Result<Vec<Frame>> {
    if target_length == 0 {
        return Err(SignLabError::InvalidSequence(
            "target length must be at least 1".to_string(),
        ));
    }
    let Some(last) = frames.last().cloned() else {
        return Err(SignLabError::InvalidSequence(
            "cannot shape an empty frame sequence".to_string(),
        ));
    };

    let original = frames.len();
    if original > target_length {
        tracing::debug!(from = original, to = target_length, "Trimming sequence");
        frames.truncate(target_length);
    } else if original < target_length {
        tracing::debug!(from = original, to = target_length, "Padding sequence");
        frames.resize(target_length, last);
    }
    Ok(frames)
}

/// Normalize every frame, then shape the sequence to `target_length`.
///
/// Shared by dataset construction and inference so both see identical input.
pub fn preprocess_sequence(frames: &[Frame], target_length: usize) -> Result<Vec<Frame>> {
    if frames.is_empty() {
        return Err(SignLabError::InvalidSequence(
            "no frames in sequence".to_string(),
        ));
    }
    let normalized: Vec<Frame> = frames.iter().map(normalize_frame).collect();
    shape_sequence(normalized, target_length)
}

/// Append one frame's 1629 features to `out`.
pub fn flatten_frame(frame: &Frame, out: &mut Vec<f32>) -> Result<()> {
    for group in LandmarkGroup::ALL {
        let points = frame.group(group);
        if points.len() != group.expected_points() {
            return Err(SignLabError::InvalidSequence(format!(
                "group {group} has {} landmarks, expected {}",
                points.len(),
                group.expected_points()
            )));
        }
        for p in points {
            out.extend_from_slice(&[p.x, p.y, p.z]);
        }
    }
    Ok(())
}

/// Flatten a sequence into row-major `[frames.len(), FEATURE_WIDTH]` values.
pub fn flatten_sequence(frames: &[Frame]) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(frames.len() * FEATURE_WIDTH);
    for frame in frames {
        flatten_frame(frame, &mut out)?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
