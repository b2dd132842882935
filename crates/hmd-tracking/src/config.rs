//! JSON configuration for a complete tracking setup.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use hmd_tracking_core::CameraIntrinsics;
use hmd_tracking_imu::{ImuCalibration, OrientationPositionTracker, TrackerParams};
use hmd_tracking_led::{Marker, MarkerModel, MarkerModelError};
use serde::{Deserialize, Serialize};

use crate::optical::{OpticalTracker, OpticalTrackerParams};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("invalid marker catalog: {0}")]
    Model(#[from] MarkerModelError),
}

fn default_correction_gain() -> f64 {
    0.1
}

/// Camera, marker catalog, IMU calibration and every tuning block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub camera: CameraIntrinsics,
    pub markers: Vec<Marker>,
    #[serde(default)]
    pub imu_calibration: ImuCalibration,
    #[serde(default)]
    pub tracker: TrackerParams,
    #[serde(default)]
    pub optical: OpticalTrackerParams,
    /// Fraction of the optical/inertial position disagreement corrected per
    /// frame.
    #[serde(default = "default_correction_gain")]
    pub correction_gain: f64,
}

impl TrackingConfig {
    /// Config with default tuning for the given hardware description.
    pub fn new(camera: CameraIntrinsics, markers: Vec<Marker>) -> Self {
        Self {
            camera,
            markers,
            imu_calibration: ImuCalibration::default(),
            tracker: TrackerParams::default(),
            optical: OpticalTrackerParams::default(),
            correction_gain: default_correction_gain(),
        }
    }

    /// Load a JSON config from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Validate the catalog and build its pattern table.
    pub fn build_model(&self) -> Result<Arc<MarkerModel>, ConfigError> {
        Ok(Arc::new(MarkerModel::new(self.markers.clone())?))
    }

    pub fn build_inertial_tracker(&self) -> OrientationPositionTracker {
        OrientationPositionTracker::new(self.tracker)
    }

    pub fn build_optical_tracker(&self) -> Result<OpticalTracker, ConfigError> {
        Ok(OpticalTracker::new(self.build_model()?, self.camera, self.optical.clone()))
    }
}
