//! Loosely coupled optical → inertial position correction.

use hmd_tracking_core::Pose;
use hmd_tracking_imu::OrientationPositionTracker;
use nalgebra::{Isometry3, Vector3};

/// World-space position of the marker model origin for a valid optical pose.
///
/// `camera_to_world` places the camera in the tracker's world frame; it is
/// a property of the installation and supplied by the caller.
pub fn optical_position(pose: &Pose, camera_to_world: &Isometry3<f64>) -> Option<Vector3<f64>> {
    pose.as_valid()
        .map(|model_to_camera| (camera_to_world * model_to_camera).translation.vector)
}

/// Move the tracker's most recent translation a fraction `gain` of the way
/// towards `optical_position`. Velocity is left alone.
///
/// Returns the applied translation delta. `gain` is clamped to `[0, 1]`.
pub fn apply_optical_correction(
    tracker: &OrientationPositionTracker,
    optical_position: &Vector3<f64>,
    gain: f64,
) -> Vector3<f64> {
    let current = tracker.most_recent_state().translation;
    correct_towards(tracker, optical_position - current, gain)
}

/// Like [`apply_optical_correction`], but compares against the inertial
/// state closest to `time_stamp`, the device time at which the camera frame
/// was exposed.
pub fn apply_time_aligned_correction(
    tracker: &OrientationPositionTracker,
    optical_position: &Vector3<f64>,
    time_stamp: u32,
    gain: f64,
) -> Vector3<f64> {
    let then = tracker.get_recent_state(time_stamp).translation;
    correct_towards(tracker, optical_position - then, gain)
}

fn correct_towards(tracker: &OrientationPositionTracker, error: Vector3<f64>, gain: f64) -> Vector3<f64> {
    let delta = error * gain.clamp(0.0, 1.0);
    if delta.iter().all(|v| v.is_finite()) {
        tracker.apply_correction(delta, Vector3::zeros());
        delta
    } else {
        log::warn!("ignoring non-finite optical correction");
        Vector3::zeros()
    }
}
