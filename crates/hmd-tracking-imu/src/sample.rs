//! IMU samples, their calibration, and the sample source abstraction.

use std::collections::VecDeque;

use nalgebra::{Matrix3x4, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// One raw device report: integer readings as delivered by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawImuSample {
    pub accelerometer: [i32; 3],
    pub gyroscope: [i32; 3],
    pub magnetometer: [i32; 3],
    /// Device clock in microseconds, wrapping at 32 bits.
    pub time_stamp: u32,
    pub warmup: bool,
}

/// A time-stamped IMU sample in physical units.
///
/// Accelerometer in m/s², gyroscope in rad/s, magnetometer in arbitrary but
/// consistent flux units. At rest the accelerometer reads `+g` along the
/// sensor-space "up" direction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibratedSample {
    pub accelerometer: Vector3<f64>,
    pub gyroscope: Vector3<f64>,
    pub magnetometer: Vector3<f64>,
    /// Microseconds, wrapping at 32 bits.
    pub time_stamp: u32,
    /// Warm-up samples only seed the initial orientation and gyro bias.
    pub warmup: bool,
}

impl CalibratedSample {
    pub fn new(
        accelerometer: Vector3<f64>,
        gyroscope: Vector3<f64>,
        magnetometer: Vector3<f64>,
        time_stamp: u32,
    ) -> Self {
        Self {
            accelerometer,
            gyroscope,
            magnetometer,
            time_stamp,
            warmup: false,
        }
    }

    pub fn with_warmup(mut self, warmup: bool) -> Self {
        self.warmup = warmup;
        self
    }
}

/// Per-sensor affine correction from raw readings to physical units.
///
/// Each matrix maps the homogeneous raw reading `[x, y, z, 1]` to a
/// calibrated vector, so it carries scale, cross-axis coupling and offset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuCalibration {
    pub accelerometer: Matrix3x4<f64>,
    pub gyroscope: Matrix3x4<f64>,
    pub magnetometer: Matrix3x4<f64>,
}

impl Default for ImuCalibration {
    fn default() -> Self {
        Self {
            accelerometer: Matrix3x4::identity(),
            gyroscope: Matrix3x4::identity(),
            magnetometer: Matrix3x4::identity(),
        }
    }
}

impl ImuCalibration {
    /// Pure per-sensor scale factors with no offset or axis coupling.
    pub fn from_scales(accelerometer: f64, gyroscope: f64, magnetometer: f64) -> Self {
        Self {
            accelerometer: Matrix3x4::identity() * accelerometer,
            gyroscope: Matrix3x4::identity() * gyroscope,
            magnetometer: Matrix3x4::identity() * magnetometer,
        }
    }

    pub fn apply(&self, raw: &RawImuSample) -> CalibratedSample {
        CalibratedSample {
            accelerometer: apply_affine(&self.accelerometer, raw.accelerometer),
            gyroscope: apply_affine(&self.gyroscope, raw.gyroscope),
            magnetometer: apply_affine(&self.magnetometer, raw.magnetometer),
            time_stamp: raw.time_stamp,
            warmup: raw.warmup,
        }
    }
}

#[inline]
fn apply_affine(m: &Matrix3x4<f64>, raw: [i32; 3]) -> Vector3<f64> {
    m * Vector4::new(raw[0] as f64, raw[1] as f64, raw[2] as f64, 1.0)
}

/// Anything that delivers calibrated IMU samples in time-stamp order.
///
/// One implementation exists per physical device or transport; the tracker
/// only ever sees `CalibratedSample`s.
pub trait CalibratedSampleSource: Send {
    /// Next sample, or `None` once the source is exhausted or closed.
    fn next_sample(&mut self) -> Option<CalibratedSample>;

    /// The calibration this source applies to its raw readings.
    fn calibration(&self) -> &ImuCalibration;
}

/// Replays recorded raw reports through a calibration.
#[derive(Clone, Debug)]
pub struct ReplaySource {
    calibration: ImuCalibration,
    pending: VecDeque<RawImuSample>,
}

impl ReplaySource {
    pub fn new(calibration: ImuCalibration, samples: impl IntoIterator<Item = RawImuSample>) -> Self {
        Self {
            calibration,
            pending: samples.into_iter().collect(),
        }
    }

    /// Number of reports not yet delivered.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl CalibratedSampleSource for ReplaySource {
    fn next_sample(&mut self) -> Option<CalibratedSample> {
        let raw = self.pending.pop_front()?;
        Some(self.calibration.apply(&raw))
    }

    fn calibration(&self) -> &ImuCalibration {
        &self.calibration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn raw(time_stamp: u32) -> RawImuSample {
        RawImuSample {
            accelerometer: [0, 0, 4096],
            gyroscope: [10, -20, 0],
            magnetometer: [300, 0, -500],
            time_stamp,
            warmup: false,
        }
    }

    #[test]
    fn calibration_applies_scale_and_offset() {
        let mut cal = ImuCalibration::from_scales(9.81 / 4096.0, 1e-3, 1.0);
        cal.gyroscope[(0, 3)] = -0.01;

        let s = cal.apply(&raw(42));
        assert_relative_eq!(s.accelerometer, Vector3::new(0.0, 0.0, 9.81), epsilon = 1e-12);
        assert_relative_eq!(s.gyroscope, Vector3::new(0.0, -0.02, 0.0), epsilon = 1e-12);
        assert_relative_eq!(s.magnetometer, Vector3::new(300.0, 0.0, -500.0));
        assert_eq!(s.time_stamp, 42);
        assert!(!s.warmup);
    }

    #[test]
    fn replay_source_drains_in_order() {
        let mut src = ReplaySource::new(ImuCalibration::default(), (0..3).map(|i| raw(i * 1000)));
        assert_eq!(src.remaining(), 3);
        let stamps: Vec<u32> = std::iter::from_fn(|| src.next_sample())
            .map(|s| s.time_stamp)
            .collect();
        assert_eq!(stamps, vec![0, 1000, 2000]);
        assert!(src.next_sample().is_none());
    }
}
