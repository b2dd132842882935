//! Inertial/optical 6-DOF pose tracking for head-mounted displays.
//!
//! This facade ties the component crates into a running system:
//! - [`imu`]: gradient-descent orientation filter with dead-reckoned
//!   position, published through a lock-light state ring,
//! - [`led`]: temporal decoding of blinking LED codes from blob streams,
//! - [`pose`]: EPnP + Levenberg–Marquardt pose from 2D/3D correspondences,
//! - [`core`]: camera model, pose value, triple buffer and logging.
//!
//! On top of those it provides the per-frame [`OpticalTracker`], the
//! [`SamplingTask`] / [`VideoTask`] thread drivers, the JSON
//! [`TrackingConfig`] and the optical → inertial correction helpers.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use hmd_tracking::{apply_optical_correction, optical_position, FrameReport, TrackingConfig, VideoTask};
//! use nalgebra::Isometry3;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TrackingConfig::load_json("tracking.json")?;
//! let inertial = Arc::new(config.build_inertial_tracker());
//! let camera_to_world = Isometry3::identity();
//!
//! let fused = Arc::clone(&inertial);
//! let gain = config.correction_gain;
//! let video = VideoTask::spawn(
//!     config.build_optical_tracker()?,
//!     4,
//!     Some(Box::new(move |report: &FrameReport| {
//!         if let Some(p) = optical_position(&report.pose, &camera_to_world) {
//!             apply_optical_correction(&fused, &p, gain);
//!         }
//!     })),
//! )?;
//! // feed `video.submit(blobs)` from the blob extractor, and run a
//! // `SamplingTask` for the IMU stream
//! # drop(video);
//! # Ok(())
//! # }
//! ```

pub use hmd_tracking_core as core;
pub use hmd_tracking_imu as imu;
pub use hmd_tracking_led as led;
pub use hmd_tracking_pose as pose;

pub use hmd_tracking_core::{CameraIntrinsics, Pose, TripleBuffer};
pub use hmd_tracking_imu::{CalibratedSample, OrientationPositionTracker, TrackerParams, TrackingState};
pub use hmd_tracking_led::{Blob, IdentifiedLed, LedIdentifier, Marker, MarkerModel};
pub use hmd_tracking_pose::{PoseSolution, PoseSolver};

mod config;
mod fusion;
mod optical;
mod tasks;

pub use config::{ConfigError, TrackingConfig};
pub use fusion::{apply_optical_correction, apply_time_aligned_correction, optical_position};
pub use optical::{FrameReport, OpticalOutputs, OpticalTracker, OpticalTrackerParams};
pub use tasks::{FrameCallback, SamplingTask, TaskError, VideoTask};
