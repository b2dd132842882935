use nalgebra::{Matrix3, Point2, Point3};
use serde::{Deserialize, Serialize};

/// Pinhole camera intrinsics for lens-corrected image coordinates.
///
/// Camera space looks down `+z`; a point `(x, y, z)` with `z > 0` projects to
/// `u = fx * x/z + skew * y/z + cx`, `v = fy * y/z + cy`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    #[serde(default)]
    pub skew: f64,
    pub cx: f64,
    pub cy: f64,
    /// Frame size in pixels `[width, height]`.
    pub image_size: [u32; 2],
}

impl CameraIntrinsics {
    /// Intrinsics without skew.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64, image_size: [u32; 2]) -> Self {
        Self {
            fx,
            fy,
            skew: 0.0,
            cx,
            cy,
            image_size,
        }
    }

    pub fn with_skew(mut self, skew: f64) -> Self {
        self.skew = skew;
        self
    }

    /// The upper-triangular calibration matrix `K`.
    pub fn k_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Project a camera-space point. Returns `None` for points at or behind
    /// the image plane.
    #[inline]
    pub fn project(&self, p: &Point3<f64>) -> Option<Point2<f64>> {
        if p.z <= f64::EPSILON {
            return None;
        }
        let x = p.x / p.z;
        let y = p.y / p.z;
        Some(Point2::new(
            self.fx * x + self.skew * y + self.cx,
            self.fy * y + self.cy,
        ))
    }

    /// Whether an image point lies inside the frame.
    #[inline]
    pub fn contains(&self, p: &Point2<f64>) -> bool {
        p.x >= 0.0
            && p.y >= 0.0
            && p.x < self.image_size[0] as f64
            && p.y < self.image_size[1] as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(700.0, 710.0, 376.0, 240.0, [752, 480]).with_skew(0.5)
    }

    #[test]
    fn projection_matches_k_matrix() {
        let cam = camera();
        let p = Point3::new(0.12, -0.07, 0.9);
        let uv = cam.project(&p).expect("in front");

        let h = cam.k_matrix() * p.coords;
        assert_relative_eq!(uv.x, h.x / h.z, epsilon = 1e-12);
        assert_relative_eq!(uv.y, h.y / h.z, epsilon = 1e-12);
    }

    #[test]
    fn points_behind_camera_do_not_project() {
        let cam = camera();
        assert!(cam.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(cam.project(&Point3::new(0.3, 0.1, 0.0)).is_none());
    }

    #[test]
    fn frame_bounds() {
        let cam = camera();
        assert!(cam.contains(&Point2::new(0.0, 0.0)));
        assert!(cam.contains(&Point2::new(751.9, 479.9)));
        assert!(!cam.contains(&Point2::new(752.0, 10.0)));
        assert!(!cam.contains(&Point2::new(10.0, -0.5)));
    }
}
