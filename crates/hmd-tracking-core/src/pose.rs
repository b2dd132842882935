use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

/// Rigid transform of the marker constellation into camera space, plus a
/// validity flag.
///
/// An invalid pose keeps its last transform so that consumers can still
/// inspect it, but it must not be used for correction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub valid: bool,
    /// Maps object (marker model) coordinates to camera coordinates.
    pub transform: Isometry3<f64>,
}

impl Pose {
    pub fn valid(transform: Isometry3<f64>) -> Self {
        Self {
            valid: true,
            transform,
        }
    }

    pub fn invalid(transform: Isometry3<f64>) -> Self {
        Self {
            valid: false,
            transform,
        }
    }

    /// Mark this pose stale while keeping its transform.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// The transform, if the pose is valid.
    pub fn as_valid(&self) -> Option<&Isometry3<f64>> {
        self.valid.then_some(&self.transform)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::invalid(Isometry3::identity())
    }
}
