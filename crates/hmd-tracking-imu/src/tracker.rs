//! Orientation and position dead-reckoning from calibrated IMU samples.
//!
//! The filter integrates the bias-corrected gyroscope rate into an
//! orientation quaternion and nudges it along the normalized gradient of the
//! gravity (and optionally magnetic flux) alignment error, Madgwick style.
//! The same gradient, mapped back to an angular rate, slowly drives the gyro
//! bias estimate. World-space linear acceleration is integrated twice into
//! velocity and translation.
//!
//! World frame: `+z` is up (the direction the accelerometer reads at rest)
//! and the horizontal component of the magnetic flux points along `+x`, so
//! the flux always lies in the world X/Z plane.

use nalgebra::{Matrix3, Matrix3x4, Quaternion, Rotation3, UnitQuaternion, Vector3, Vector4};
use parking_lot::{Mutex, RwLock};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::params::TrackerParams;
use crate::sample::CalibratedSample;
use crate::state::{StateRing, TrackingState};

/// Invoked with every newly pushed state, on the sampling thread.
pub type StreamCallback = Box<dyn Fn(&TrackingState) + Send + Sync>;

/// Warm-up state machine of the tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerPhase {
    /// Accumulating warm-up samples; no state has been produced yet.
    Uninitialized,
    Tracking,
}

#[derive(Clone, Copy, Debug)]
struct WarmupSums {
    accelerometer: Vector3<f64>,
    gyroscope: Vector3<f64>,
    magnetometer: Vector3<f64>,
    count: u32,
}

impl WarmupSums {
    fn new() -> Self {
        Self {
            accelerometer: Vector3::zeros(),
            gyroscope: Vector3::zeros(),
            magnetometer: Vector3::zeros(),
            count: 0,
        }
    }

    fn add(&mut self, sample: &CalibratedSample) {
        self.accelerometer += sample.accelerometer;
        self.gyroscope += sample.gyroscope;
        self.magnetometer += sample.magnetometer;
        self.count += 1;
    }
}

struct FilterCore {
    params: TrackerParams,
    phase: TrackerPhase,
    warmup: WarmupSums,
    gyro_bias: Vector3<f64>,
    last_time_stamp: Option<u32>,
}

impl FilterCore {
    /// Seconds since the previous sample, or `None` for a stamp that is
    /// older than the previous one after wraparound.
    fn delta_t(&mut self, time_stamp: u32) -> Option<f64> {
        let Some(prev) = self.last_time_stamp else {
            self.last_time_stamp = Some(time_stamp);
            return Some(0.0);
        };
        let ticks = time_stamp.wrapping_sub(prev) as i32;
        if ticks < 0 {
            log::warn!(
                "sample time stamp {} precedes previous {}; treating dt as zero",
                time_stamp,
                prev
            );
            return None;
        }
        self.last_time_stamp = Some(time_stamp);
        Some(ticks as f64 * 1e-6)
    }
}

/// Continuously updated 6-DOF kinematic state driven by IMU samples.
///
/// All methods take `&self`: a sampling thread calls
/// [`integrate_sample`](Self::integrate_sample) while other threads read
/// through [`lock_new_state`](Self::lock_new_state) /
/// [`get_locked_state`](Self::get_locked_state) and apply optical corrections.
/// Readers only touch the state ring, never the filter lock.
pub struct OrientationPositionTracker {
    core: Mutex<FilterCore>,
    ring: StateRing,
    callback: RwLock<Option<StreamCallback>>,
}

impl OrientationPositionTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self {
            ring: StateRing::new(params.ring_capacity, TrackingState::default()),
            core: Mutex::new(FilterCore {
                params,
                phase: TrackerPhase::Uninitialized,
                warmup: WarmupSums::new(),
                gyro_bias: Vector3::zeros(),
                last_time_stamp: None,
            }),
            callback: RwLock::new(None),
        }
    }

    pub fn params(&self) -> TrackerParams {
        self.core.lock().params
    }

    /// Toggle the magnetic-flux correction term at runtime.
    pub fn set_use_magnetometer(&self, enabled: bool) {
        self.core.lock().params.use_magnetometer = enabled;
    }

    pub fn phase(&self) -> TrackerPhase {
        self.core.lock().phase
    }

    pub fn is_tracking(&self) -> bool {
        self.phase() == TrackerPhase::Tracking
    }

    /// Current gyroscope bias estimate (rad/s, sensor space).
    pub fn gyro_bias(&self) -> Vector3<f64> {
        self.core.lock().gyro_bias
    }

    /// Install a callback receiving every new state; replaces any previous one.
    pub fn set_stream_callback(&self, callback: impl Fn(&TrackingState) + Send + Sync + 'static) {
        *self.callback.write() = Some(Box::new(callback));
    }

    pub fn clear_stream_callback(&self) {
        *self.callback.write() = None;
    }

    /// Advance the filter by one sample.
    ///
    /// Samples must arrive in time-stamp order. Warm-up samples received
    /// before tracking starts only accumulate; the first regular sample
    /// establishes the world frame and the initial gyro bias.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "trace", skip_all, fields(time_stamp = sample.time_stamp))
    )]
    pub fn integrate_sample(&self, sample: &CalibratedSample) {
        let mut core = self.core.lock();

        let state = match core.phase {
            TrackerPhase::Uninitialized => {
                if sample.warmup {
                    core.warmup.add(sample);
                    core.last_time_stamp = Some(sample.time_stamp);
                    return;
                }
                self.start_tracking(&mut core, sample)
            }
            TrackerPhase::Tracking => {
                let prev = self.ring.most_recent();
                // a late sample keeps the ring's time axis monotonic
                let (dt, time_stamp) = match core.delta_t(sample.time_stamp) {
                    Some(dt) => (dt, sample.time_stamp),
                    None => (0.0, prev.time_stamp),
                };
                let mut state = step(&mut core, &prev, sample, dt);
                state.time_stamp = time_stamp;
                self.ring.push(state);
                state
            }
        };
        drop(core);

        if let Some(callback) = self.callback.read().as_ref() {
            callback(&state);
        }
    }

    fn start_tracking(&self, core: &mut FilterCore, sample: &CalibratedSample) -> TrackingState {
        if core.warmup.count == 0 {
            core.warmup.add(sample);
        }
        let sums = core.warmup;
        core.gyro_bias = sums.gyroscope / sums.count as f64;
        core.last_time_stamp = Some(sample.time_stamp);
        core.phase = TrackerPhase::Tracking;

        let rotation = initial_rotation(&sums, core.params.use_magnetometer);
        let prev = self.ring.most_recent();
        let state = TrackingState {
            time_stamp: sample.time_stamp,
            linear_acceleration: Vector3::zeros(),
            linear_velocity: prev.linear_velocity,
            translation: prev.translation,
            angular_velocity: sample.gyroscope - core.gyro_bias,
            rotation,
        };
        self.ring.push(state);

        log::info!(
            "warm-up complete after {} samples; gyro bias [{:.5}, {:.5}, {:.5}] rad/s",
            sums.count,
            core.gyro_bias.x,
            core.gyro_bias.y,
            core.gyro_bias.z
        );
        state
    }

    /// Zero all velocities and optionally override translation and rotation.
    ///
    /// Gyro bias and the warm-up state are left alone. The restarted state is
    /// also locked, so it is readable immediately.
    pub fn restart(&self, translation: Option<Vector3<f64>>, rotation: Option<UnitQuaternion<f64>>) {
        let _core = self.core.lock();
        self.ring.modify_most_recent(|s| {
            s.linear_acceleration = Vector3::zeros();
            s.linear_velocity = Vector3::zeros();
            s.angular_velocity = Vector3::zeros();
            if let Some(t) = translation {
                s.translation = t;
            }
            if let Some(q) = rotation {
                s.rotation = q;
            }
        });
        self.ring.lock_new();
        log::info!("tracker restarted");
    }

    /// Additively nudge the most recent translation and velocity.
    ///
    /// Orientation is untouched. Serialized with `integrate_sample`, so the
    /// delta is never lost to a concurrently computed state.
    pub fn apply_correction(&self, delta_translation: Vector3<f64>, delta_velocity: Vector3<f64>) {
        let _core = self.core.lock();
        self.ring.modify_most_recent(|s| {
            s.translation += delta_translation;
            s.linear_velocity += delta_velocity;
        });
    }

    /// Lock the most recent state for reading. Returns `true` if it is newer
    /// than the previously locked state.
    pub fn lock_new_state(&self) -> bool {
        self.ring.lock_new()
    }

    pub fn get_locked_state(&self) -> TrackingState {
        self.ring.locked()
    }

    pub fn most_recent_state(&self) -> TrackingState {
        self.ring.most_recent()
    }

    /// The historical state closest to `time_stamp` (device microseconds).
    pub fn get_recent_state(&self, time_stamp: u32) -> TrackingState {
        self.ring.closest_to(time_stamp)
    }
}

/// One filter update from `prev` over `dt` seconds.
fn step(
    core: &mut FilterCore,
    prev: &TrackingState,
    sample: &CalibratedSample,
    dt: f64,
) -> TrackingState {
    let params = core.params;
    let q = prev.rotation;

    let flux = params.use_magnetometer.then_some(&sample.magnetometer);
    let grad = correction_gradient(&q, &sample.accelerometer, flux);
    let grad_norm = grad.norm();
    let step_dir = if grad_norm > 0.0 {
        grad / grad_norm
    } else {
        Quaternion::new(0.0, 0.0, 0.0, 0.0)
    };

    if grad_norm > 0.0 {
        // angular rate equivalent of the correction step
        let omega_err = (q.conjugate().into_inner() * step_dir).vector() * 2.0;
        core.gyro_bias += omega_err * (params.bias_drift_gain * dt);
    }
    let omega = sample.gyroscope - core.gyro_bias;

    let q_dot = q.into_inner() * Quaternion::from_imag(omega) * 0.5
        - step_dir * params.orientation_drift_gain;
    let raw = q.into_inner() + q_dot * dt;
    let rotation = UnitQuaternion::try_new(raw, 1e-12).unwrap_or(q);

    let linear_acceleration =
        rotation * sample.accelerometer - Vector3::new(0.0, 0.0, params.gravity);
    let linear_velocity = prev.linear_velocity + linear_acceleration * dt;
    let translation = prev.translation + linear_velocity * dt;

    TrackingState {
        time_stamp: sample.time_stamp,
        linear_acceleration,
        linear_velocity,
        translation,
        angular_velocity: omega,
        rotation,
    }
}

/// Gradient (w, x, y, z order) of the squared alignment error between the
/// measured reference directions and those predicted by `q`.
fn correction_gradient(
    q: &UnitQuaternion<f64>,
    accelerometer: &Vector3<f64>,
    flux: Option<&Vector3<f64>>,
) -> Quaternion<f64> {
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    let mut grad = Vector4::<f64>::zeros();

    if let Some(a) = accelerometer.try_normalize(1e-12) {
        // world up seen from the sensor
        let f = Vector3::new(
            2.0 * (x * z - w * y) - a.x,
            2.0 * (y * z + w * x) - a.y,
            1.0 - 2.0 * (x * x + y * y) - a.z,
        );
        #[rustfmt::skip]
        let j = Matrix3x4::new(
            -2.0 * y, 2.0 * z, -2.0 * w, 2.0 * x,
            2.0 * x, 2.0 * w, 2.0 * z, 2.0 * y,
            0.0, -4.0 * x, -4.0 * y, 0.0,
        );
        grad += j.transpose() * f;
    }

    if let Some(m) = flux.and_then(|m| m.try_normalize(1e-12)) {
        let h = q * m;
        let bx = (h.x * h.x + h.y * h.y).sqrt();
        let bz = h.z;
        let f = Vector3::new(
            bx * (1.0 - 2.0 * (y * y + z * z)) + bz * 2.0 * (x * z - w * y) - m.x,
            bx * 2.0 * (x * y - w * z) + bz * 2.0 * (y * z + w * x) - m.y,
            bx * 2.0 * (x * z + w * y) + bz * (1.0 - 2.0 * (x * x + y * y)) - m.z,
        );
        #[rustfmt::skip]
        let j = Matrix3x4::new(
            -2.0 * bz * y, 2.0 * bz * z, -4.0 * bx * y - 2.0 * bz * w, -4.0 * bx * z + 2.0 * bz * x,
            -2.0 * bx * z + 2.0 * bz * x, 2.0 * bx * y + 2.0 * bz * w, 2.0 * bx * x + 2.0 * bz * z, -2.0 * bx * w + 2.0 * bz * y,
            2.0 * bx * y, 2.0 * bx * z - 4.0 * bz * x, 2.0 * bx * w - 4.0 * bz * y, 2.0 * bx * x,
        );
        grad += j.transpose() * f;
    }

    Quaternion::new(grad[0], grad[1], grad[2], grad[3])
}

/// Orientation whose world `+z` is the mean accelerometer direction and whose
/// world `+x` is the horizontal part of the mean magnetic flux.
fn initial_rotation(sums: &WarmupSums, use_magnetometer: bool) -> UnitQuaternion<f64> {
    let Some(up) = sums.accelerometer.try_normalize(1e-12) else {
        return UnitQuaternion::identity();
    };
    let horizontal = |v: Vector3<f64>| (v - up * up.dot(&v)).try_normalize(1e-9);

    let north = use_magnetometer
        .then(|| horizontal(sums.magnetometer))
        .flatten()
        .or_else(|| {
            // sensor axis least aligned with gravity
            [Vector3::x(), Vector3::y(), Vector3::z()]
                .into_iter()
                .min_by(|a, b| a.dot(&up).abs().total_cmp(&b.dot(&up).abs()))
                .and_then(horizontal)
        })
        .unwrap_or_else(Vector3::x);
    let west = up.cross(&north);

    let basis = Matrix3::from_rows(&[north.transpose(), west.transpose(), up.transpose()]);
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(basis))
}
