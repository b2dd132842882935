//! Inertial orientation/position tracking.
//!
//! This crate turns a stream of calibrated IMU samples into a continuously
//! updated 6-DOF kinematic state:
//! - warm-up samples seed the world frame (gravity up, magnetic flux in the
//!   X/Z plane) and the initial gyroscope bias,
//! - every following sample advances a gradient-descent corrected quaternion
//!   integrator and double-integrates world-space linear acceleration,
//! - states are published through a fixed-size ring so readers on other
//!   threads never wait on the integration math.
//!
//! Raw transport decoding is out of scope; devices plug in through
//! [`CalibratedSampleSource`].

mod params;
mod sample;
mod state;
mod tracker;

pub use params::TrackerParams;
pub use sample::{CalibratedSample, CalibratedSampleSource, ImuCalibration, RawImuSample, ReplaySource};
pub use state::{StateRing, TrackingState, DEFAULT_RING_CAPACITY};
pub use tracker::{OrientationPositionTracker, StreamCallback, TrackerPhase};
