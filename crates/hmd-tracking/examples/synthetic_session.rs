//! Runs a full inertial/optical session against a simulated headset.
//!
//! A resting IMU stream and a blinking-LED blob stream are generated for a
//! slowly drifting headset, fed through the sampling and video threads, and
//! every optical fix pulls the inertial position towards it.
//!
//! ```text
//! cargo run -p hmd-tracking --example synthetic_session -- [config-out.json]
//! ```
//!
//! With an argument, the generated configuration is written there as JSON.

use std::env;
use std::sync::Arc;

use hmd_tracking::imu::{ImuCalibration, RawImuSample, ReplaySource};
use hmd_tracking::led::hamming_distance;
use hmd_tracking::{
    apply_optical_correction, optical_position, Blob, CameraIntrinsics, FrameReport, Marker, SamplingTask,
    TrackingConfig, VideoTask,
};
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};

const FRAMES: u64 = 120;
const IMU_RATE_HZ: u32 = 1000;
const CAMERA_RATE_HZ: u32 = 60;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "tracing")]
    hmd_tracking::core::init_tracing(false);
    #[cfg(not(feature = "tracing"))]
    hmd_tracking::core::init_with_level(log::LevelFilter::Info)?;

    let mut config = TrackingConfig::new(
        CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, [640, 480]),
        visor_markers(24),
    );
    config.imu_calibration = ImuCalibration::from_scales(9.81 / 4096.0, 1e-3, 1e-3);
    config.correction_gain = 0.2;
    if let Some(path) = env::args().nth(1) {
        config.write_json(&path)?;
        log::info!("wrote configuration to {path}");
    }

    let inertial = Arc::new(config.build_inertial_tracker());
    let imu_samples = (FRAMES as u32 * IMU_RATE_HZ / CAMERA_RATE_HZ) as usize;
    let source = ReplaySource::new(config.imu_calibration, resting_imu(100, imu_samples));
    let sampling = SamplingTask::spawn(Box::new(source), Arc::clone(&inertial))?;

    let camera_to_world = Isometry3::translation(0.0, 1.5, 0.0);
    let fused = Arc::clone(&inertial);
    let gain = config.correction_gain;
    let video = VideoTask::spawn(
        config.build_optical_tracker()?,
        4,
        Some(Box::new(move |report: &FrameReport| {
            if let Some(p) = optical_position(&report.pose, &camera_to_world) {
                apply_optical_correction(&fused, &p, gain);
            }
            if report.frame_index % 20 == 0 {
                log::info!(
                    "frame {:3}: {} blobs, {} identified, pose valid: {}",
                    report.frame_index,
                    report.stats.raw_blobs,
                    report.stats.identified,
                    report.pose.valid
                );
            }
        })),
    )?;

    let camera = config.camera;
    for frame in 0..FRAMES {
        video.submit(render_blobs(&camera, &config.markers, frame))?;
    }
    let optical = video.finish()?;
    let samples = sampling.join()?;

    let state = inertial.most_recent_state();
    let truth = (camera_to_world * headset_pose(FRAMES - 1)).translation.vector;
    log::info!("{samples} IMU samples integrated");
    println!("{}", serde_json::to_string_pretty(&optical.last_pose())?);
    println!("{}", serde_json::to_string_pretty(&state)?);
    println!("fused position error: {:.3} mm", (state.translation - truth).norm() * 1e3);
    Ok(())
}

/// LEDs on the front cap of an ellipsoidal visor, each with a distinct code
/// at Hamming distance three or more from every other.
fn visor_markers(n: usize) -> Vec<Marker> {
    let mut codes: Vec<u16> = Vec::with_capacity(n);
    for code in (0..1024u16).filter(|c| c & 1 == 0 && (3..=7).contains(&c.count_ones())) {
        if codes.len() == n {
            break;
        }
        if codes.iter().all(|&c| hamming_distance(c, code) >= 3) {
            codes.push(code);
        }
    }

    let (a, b, c) = (0.09, 0.06, 0.08);
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    let count = codes.len();
    codes
        .into_iter()
        .enumerate()
        .map(|(k, pattern)| {
            let z = 1.0 - 0.7 * (k as f64 + 0.5) / count as f64;
            let r = (1.0 - z * z).sqrt();
            let phi = golden * k as f64;
            let position = Point3::new(a * r * phi.cos(), b * r * phi.sin(), -c * z);
            Marker {
                pattern,
                position,
                direction: Vector3::new(position.x / (a * a), position.y / (b * b), position.z / (c * c)),
            }
        })
        .collect()
}

fn headset_pose(frame: u64) -> Isometry3<f64> {
    let t = frame as f64 / CAMERA_RATE_HZ as f64;
    Isometry3::from_parts(
        Translation3::new(0.02 + 0.01 * t, -0.01, 0.8 - 0.02 * t),
        UnitQuaternion::from_euler_angles(0.05, -0.1 + 0.05 * t, 0.03),
    )
}

fn render_blobs(camera: &CameraIntrinsics, markers: &[Marker], frame: u64) -> Vec<Blob> {
    let pose = headset_pose(frame);
    markers
        .iter()
        .filter_map(|m| {
            let p = pose * m.position;
            if (pose.rotation * m.direction).dot(&p.coords) >= 0.0 {
                return None;
            }
            let uv = camera.project(&p).filter(|uv| camera.contains(uv))?;
            let bright = (m.pattern >> (frame % 10)) & 1 == 1;
            Some(Blob::disc(uv, if bright { 4 } else { 3 }))
        })
        .collect()
}

fn resting_imu(warmup: usize, samples: usize) -> Vec<RawImuSample> {
    let period_us = 1_000_000 / IMU_RATE_HZ;
    (0..warmup + samples)
        .map(|i| RawImuSample {
            accelerometer: [0, 0, 4096],
            gyroscope: [0, 0, 0],
            magnetometer: [300, 0, -500],
            time_stamp: i as u32 * period_us,
            warmup: i < warmup,
        })
        .collect()
}
