//! Synthetic headset, camera and sensor streams shared by the integration tests.

use hmd_tracking::imu::RawImuSample;
use hmd_tracking::led::hamming_distance;
use hmd_tracking::{Blob, CameraIntrinsics, Marker};
use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn camera() -> CameraIntrinsics {
    CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, [640, 480])
}

/// First `n` codes (in increasing order) with 3..=7 bits set, bit 0 clear
/// and pairwise Hamming distance of at least 3.
///
/// A blob's first sighting has no predecessor, so slot 1 is decoded against
/// a dark slot 0; keeping bit 0 clear makes the first full code exact.
pub fn spread_codes(n: usize) -> Vec<u16> {
    let mut codes: Vec<u16> = Vec::with_capacity(n);
    for code in 0..1024u16 {
        if codes.len() == n {
            break;
        }
        let ones = code.count_ones();
        if code & 1 == 0 && (3..=7).contains(&ones) && codes.iter().all(|&c| hamming_distance(c, code) >= 3) {
            codes.push(code);
        }
    }
    codes
}

/// LEDs spread over the front cap of an ellipsoidal visor, emitting along
/// the surface normal (towards `-z`). All of them face the camera for every
/// pose of [`pose_at`].
pub fn headset(n: usize) -> Vec<Marker> {
    let (a, b, c) = (0.09, 0.06, 0.08);
    let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    spread_codes(n)
        .into_iter()
        .enumerate()
        .map(|(k, pattern)| {
            let z = 1.0 - 0.7 * (k as f64 + 0.5) / n as f64;
            let r = (1.0 - z * z).sqrt();
            let phi = golden * k as f64;
            let position = Point3::new(a * r * phi.cos(), b * r * phi.sin(), -c * z);
            let normal = Vector3::new(position.x / (a * a), position.y / (b * b), position.z / (c * c));
            Marker {
                pattern,
                position,
                direction: normal,
            }
        })
        .collect()
}

/// Ground-truth model-to-camera pose at `frame`: a slow drift and turn.
pub fn pose_at(frame: u64) -> Isometry3<f64> {
    let t = frame as f64;
    Isometry3::from_parts(
        Translation3::new(0.02 + 0.0004 * t, -0.01, 0.8 - 0.0005 * t),
        UnitQuaternion::from_euler_angles(0.05, -0.1 + 0.002 * t, 0.03),
    )
}

/// Blobs for every LED facing the camera at `frame`, sized by its code bit.
pub fn blobs_at(markers: &[Marker], frame: u64) -> Vec<Blob> {
    let camera = camera();
    let pose = pose_at(frame);
    markers
        .iter()
        .filter_map(|m| {
            let p = pose * m.position;
            let d = pose.rotation * m.direction;
            if d.dot(&p.coords) >= 0.0 {
                return None;
            }
            let uv = camera.project(&p).filter(|uv| camera.contains(uv))?;
            let bright = (m.pattern >> (frame % 10)) & 1 == 1;
            Some(Blob::disc(uv, if bright { 4 } else { 3 }))
        })
        .collect()
}

/// Raw IMU reports of a device at rest: 4096 counts per g, gravity along
/// sensor `+z`, flux in the sensor X/Z plane.
pub fn resting_imu(warmup: usize, samples: usize) -> Vec<RawImuSample> {
    (0..warmup + samples)
        .map(|i| RawImuSample {
            accelerometer: [0, 0, 4096],
            gyroscope: [0, 0, 0],
            magnetometer: [300, 0, -500],
            time_stamp: (i as u32) * 1000,
            warmup: i < warmup,
        })
        .collect()
}
