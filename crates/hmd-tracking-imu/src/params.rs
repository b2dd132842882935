use serde::{Deserialize, Serialize};

use crate::state::DEFAULT_RING_CAPACITY;

/// Tuning of the orientation/position filter.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Fraction of the gradient-step angular rate fed into the gyro bias
    /// estimate (rad/s² per unit step).
    pub bias_drift_gain: f64,
    /// Magnitude of the normalized gradient step subtracted from the
    /// quaternion derivative (rad/s).
    pub orientation_drift_gain: f64,
    /// Include the magnetic-flux term in the correction gradient.
    pub use_magnetometer: bool,
    /// Gravity magnitude subtracted on the world vertical axis (m/s²).
    pub gravity: f64,
    /// Number of historical states kept for time alignment.
    pub ring_capacity: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            bias_drift_gain: 0.01,
            orientation_drift_gain: 0.1,
            use_magnetometer: true,
            gravity: 9.81,
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }
}
