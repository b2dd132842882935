//! Closed-form EPnP pose estimate.
//!
//! Every model point is written as a barycentric combination of four
//! control points. Projecting those combinations gives a homogeneous linear
//! system in the twelve camera-space control point coordinates, solved by
//! the eigenvector of `MᵀM` with the smallest eigenvalue. The solution is
//! known up to scale, which is recovered by matching control point
//! distances in both frames.

use hmd_tracking_core::CameraIntrinsics;
use nalgebra::{
    Isometry3, Matrix3, Point2, Point3, Rotation3, SMatrix, SVector, Translation3, UnitQuaternion, Vector3,
    Vector4,
};

/// Eigenvalues below this fraction of the largest are raised to it, so that
/// near-planar point sets still get an invertible control point basis.
const MIN_EIGEN_RATIO: f64 = 1e-6;

/// Control points in model space: centroid plus one point along each
/// principal axis.
#[derive(Clone, Copy, Debug)]
struct ControlPoints {
    origin: Point3<f64>,
    /// Columns are the offsets of control points 1..=3 from the origin.
    axes: Matrix3<f64>,
}

impl ControlPoints {
    fn from_points(points: &[Point3<f64>]) -> Option<Self> {
        let n = points.len() as f64;
        let origin = Point3::from(points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n);

        let mut cov = Matrix3::zeros();
        for p in points {
            let d = p - origin;
            cov += d * d.transpose();
        }
        cov /= n;

        let eig = cov.symmetric_eigen();
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
        let largest = eig.eigenvalues[order[0]];
        if !(largest > f64::EPSILON) {
            return None;
        }

        let mut axes = Matrix3::zeros();
        for (col, &k) in order.iter().enumerate() {
            let lambda = eig.eigenvalues[k].max(largest * MIN_EIGEN_RATIO);
            axes.set_column(col, &(eig.eigenvectors.column(k) * lambda.sqrt()));
        }
        if axes.determinant() < 0.0 {
            let flipped = -axes.column(2);
            axes.set_column(2, &flipped);
        }
        Some(Self { origin, axes })
    }

    /// Barycentric weights `[α0, α1, α2, α3]`, summing to one.
    fn alphas(&self, points: &[Point3<f64>]) -> Option<Vec<Vector4<f64>>> {
        let inv = self.axes.try_inverse()?;
        Some(
            points
                .iter()
                .map(|p| {
                    let b = inv * (p - self.origin);
                    Vector4::new(1.0 - b.sum(), b.x, b.y, b.z)
                })
                .collect(),
        )
    }

    fn point(&self, k: usize) -> Point3<f64> {
        match k {
            0 => self.origin,
            _ => self.origin + self.axes.column(k - 1),
        }
    }
}

/// Model-to-camera transform from at least four correspondences.
///
/// Returns `None` when the model points are coincident or the linear system
/// is too degenerate to yield a finite pose.
pub fn estimate_pose(
    camera: &CameraIntrinsics,
    model: &[Point3<f64>],
    image: &[Point2<f64>],
) -> Option<Isometry3<f64>> {
    if model.len() < 4 || model.len() != image.len() {
        return None;
    }

    let control = ControlPoints::from_points(model)?;
    let alphas = control.alphas(model)?;

    let mut mtm = SMatrix::<f64, 12, 12>::zeros();
    for (a, uv) in alphas.iter().zip(image) {
        let mut row_u = SVector::<f64, 12>::zeros();
        let mut row_v = SVector::<f64, 12>::zeros();
        for j in 0..4 {
            row_u[3 * j] = a[j] * camera.fx;
            row_u[3 * j + 1] = a[j] * camera.skew;
            row_u[3 * j + 2] = a[j] * (camera.cx - uv.x);
            row_v[3 * j + 1] = a[j] * camera.fy;
            row_v[3 * j + 2] = a[j] * (camera.cy - uv.y);
        }
        mtm += row_u * row_u.transpose() + row_v * row_v.transpose();
    }

    let eig = mtm.symmetric_eigen();
    let smallest = eig.eigenvalues.imin();
    let null = eig.eigenvectors.column(smallest);

    let mut cam = [Point3::origin(); 4];
    for (j, c) in cam.iter_mut().enumerate() {
        *c = Point3::new(null[3 * j], null[3 * j + 1], null[3 * j + 2]);
    }

    // scale from control point distances in both frames
    let mut dot = 0.0;
    let mut norm = 0.0;
    for a in 0..4 {
        for b in (a + 1)..4 {
            let dc = (cam[a] - cam[b]).norm();
            let dw = (control.point(a) - control.point(b)).norm();
            dot += dc * dw;
            norm += dc * dc;
        }
    }
    if !(norm > 0.0) {
        return None;
    }
    let mut beta = dot / norm;

    // the model basis is right-handed; a mirrored camera basis means the
    // eigenvector came out with the wrong sign
    let cam_edges = Matrix3::from_columns(&[cam[1] - cam[0], cam[2] - cam[0], cam[3] - cam[0]]);
    if cam_edges.determinant() < 0.0 {
        beta = -beta;
    }
    for c in cam.iter_mut() {
        *c = Point3::from(c.coords * beta);
    }

    let world_basis = orthonormal_basis(&control.axes)?;
    let cam_basis = orthonormal_basis(&Matrix3::from_columns(&[
        cam[1] - cam[0],
        cam[2] - cam[0],
        cam[3] - cam[0],
    ]))?;
    let r = cam_basis * world_basis.transpose();
    let t = cam[0].coords - r * control.origin.coords;

    if !(r.iter().all(|v| v.is_finite()) && t.iter().all(|v| v.is_finite())) {
        log::warn!("epnp produced a non-finite pose");
        return None;
    }
    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    Some(Isometry3::from_parts(Translation3::from(t), rotation))
}

/// Gram–Schmidt on the first two columns; the third is their cross product,
/// so the result is always a proper rotation.
fn orthonormal_basis(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let e0 = m.column(0).try_normalize(f64::EPSILON)?;
    let c1 = m.column(1) - e0 * e0.dot(&m.column(1));
    let e1 = c1.try_normalize(f64::EPSILON)?;
    let e2 = e0.cross(&e1);
    Some(Matrix3::from_columns(&[e0, e1, e2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(620.0, 615.0, 320.0, 240.0, [640, 480]).with_skew(0.3)
    }

    fn cube() -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for x in [-0.05, 0.05] {
            for y in [-0.04, 0.04] {
                for z in [-0.03, 0.03] {
                    pts.push(Point3::new(x, y, z));
                }
            }
        }
        pts.push(Point3::new(0.0, 0.0, 0.06));
        pts
    }

    fn project_all(cam: &CameraIntrinsics, pose: &Isometry3<f64>, pts: &[Point3<f64>]) -> Vec<Point2<f64>> {
        pts.iter()
            .map(|p| cam.project(&(pose * p)).expect("in front of camera"))
            .collect()
    }

    #[test]
    fn control_points_are_right_handed_and_reproduce_points() {
        let pts = cube();
        let control = ControlPoints::from_points(&pts).expect("control points");
        assert!(control.axes.determinant() > 0.0);

        let alphas = control.alphas(&pts).expect("alphas");
        for (a, p) in alphas.iter().zip(&pts) {
            assert_relative_eq!(a.sum(), 1.0, epsilon = 1e-12);
            let rebuilt = (0..4).fold(Vector3::zeros(), |acc, k| acc + control.point(k).coords * a[k]);
            assert_relative_eq!(rebuilt, p.coords, epsilon = 1e-12);
        }
    }

    #[test]
    fn recovers_exact_pose_without_noise() {
        let cam = camera();
        let truth = Isometry3::from_parts(
            Translation3::new(0.03, -0.02, 0.7),
            UnitQuaternion::from_euler_angles(0.2, -0.3, 0.4),
        );
        let pts = cube();
        let image = project_all(&cam, &truth, &pts);

        let pose = estimate_pose(&cam, &pts, &image).expect("pose");
        assert_relative_eq!(pose.translation.vector, truth.translation.vector, epsilon = 1e-6);
        assert!(pose.rotation.angle_to(&truth.rotation) < 1e-6);
    }

    #[test]
    fn coincident_points_give_no_pose() {
        let cam = camera();
        let pts = vec![Point3::new(0.1, 0.2, 0.3); 5];
        let image = vec![Point2::new(320.0, 240.0); 5];
        assert!(estimate_pose(&cam, &pts, &image).is_none());
    }
}
