//! Landmark gap filling and shoulder-relative normalization of single frames.
//!
//! Every frame is first completed to the fixed group cardinalities with zero
//! landmarks, then re-centered on the shoulder midpoint and scaled by the
//! shoulder width so captures from different distances and positions land in
//! the same coordinate range.

use signlab_core::{Frame, Landmark, LandmarkGroup};

/// Pose index of the left shoulder.
pub const LEFT_SHOULDER: usize = 11;

/// Pose index of the right shoulder.
pub const RIGHT_SHOULDER: usize = 12;

/// Minimum number of captured pose points for geometric normalization.
pub const MIN_POSE_POINTS: usize = 12;

/// Pad every short or absent group with zero landmarks up to its cardinality.
///
/// Over-long groups are left untouched; the shaper rejects them when
/// flattening.
#[must_use]
pub fn fill_missing_landmarks(frame: &Frame) -> Frame {
    let mut filled = frame.clone();
    for group in LandmarkGroup::ALL {
        let expected = group.expected_points();
        let points = filled.group_mut(group);
        if points.len() < expected {
            tracing::debug!(
                group = %group,
                present = points.len(),
                missing = expected - points.len(),
                "Filling missing landmarks with zeros"
            );
            points.resize(expected, Landmark::ZERO);
        }
    }
    filled
}

/// Reference point and scale derived from the shoulders.
///
/// A zero shoulder distance (degenerate pose) yields a scale of 1.
#[must_use]
pub fn shoulder_reference(pose: &[Landmark]) -> (Landmark, f32) {
    let left = pose.get(LEFT_SHOULDER).copied().unwrap_or_default();
    let right = pose.get(RIGHT_SHOULDER).copied().unwrap_or_default();

    let center = Landmark::new(
        (left.x + right.x) / 2.0,
        (left.y + right.y) / 2.0,
        (left.z + right.z) / 2.0,
    );
    let (dx, dy, dz) = (left.x - right.x, left.y - right.y, left.z - right.z);
    let distance = (dx * dx + dy * dy + dz * dz).sqrt();

    if distance == 0.0 {
        tracing::debug!("Shoulder distance is zero, using unit scale");
        (center, 1.0)
    } else {
        (center, distance)
    }
}

/// Fill a frame and express every landmark relative to the shoulders.
///
/// When the incoming pose carries fewer than [`MIN_POSE_POINTS`] points the
/// filled frame is returned without geometric normalization.
#[must_use]
pub fn normalize_frame(frame: &Frame) -> Frame {
    let mut filled = fill_missing_landmarks(frame);

    if frame.pose.len() < MIN_POSE_POINTS {
        tracing::warn!(
            pose_points = frame.pose.len(),
            required = MIN_POSE_POINTS,
            "Not enough pose points to normalize, frame left unnormalized"
        );
        return filled;
    }

    let (center, scale) = shoulder_reference(&filled.pose);
    for group in LandmarkGroup::ALL {
        for p in filled.group_mut(group).iter_mut() {
            *p = Landmark::new(
                (p.x - center.x) / scale,
                (p.y - center.y) / scale,
                (p.z - center.z) / scale,
            );
        }
    }
    filled
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
