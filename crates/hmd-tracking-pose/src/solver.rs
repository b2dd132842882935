use hmd_tracking_core::{CameraIntrinsics, Pose};
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, MinimizationReport};
use nalgebra::{
    DVector, Dyn, Isometry3, Matrix3, Matrix3x4, OMatrix, Owned, Point2, Point3, Quaternion, SVector,
    Translation3, UnitQuaternion, Vector2, Vector3, U7,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::epnp;
use crate::error::PoseSolveError;

/// Points closer to the image plane than this are clamped when computing
/// residuals, so the optimizer sees a large but finite error.
const MIN_DEPTH: f64 = 1e-6;

/// Tolerances handed to the Levenberg–Marquardt minimizer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineParams {
    /// Iteration budget; the minimizer stops after `patience * 8` residual
    /// evaluations (one per parameter plus one).
    pub patience: usize,
    /// Relative reduction of the squared error below which it stops.
    pub ftol: f64,
    /// Relative step size below which it stops.
    pub xtol: f64,
    /// Orthogonality of residuals and Jacobian columns below which it stops.
    pub gtol: f64,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            patience: 50,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-10,
        }
    }
}

impl RefineParams {
    fn minimizer(&self) -> LevenbergMarquardt<f64> {
        LevenbergMarquardt::new()
            .with_patience(self.patience.max(1))
            .with_ftol(self.ftol)
            .with_xtol(self.xtol)
            .with_gtol(self.gtol)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseSolverParams {
    /// Fewer correspondences than this are rejected with an error.
    pub min_correspondences: usize,
    /// Budget of squared pixel error per correspondence; a pose whose total
    /// squared reprojection error exceeds `max_error_per_point * n` is
    /// invalid.
    pub max_error_per_point: f64,
    pub refine: RefineParams,
}

impl Default for PoseSolverParams {
    fn default() -> Self {
        Self {
            min_correspondences: 4,
            max_error_per_point: 2.0,
            refine: RefineParams::default(),
        }
    }
}

/// Result of one solve.
#[derive(Debug)]
pub struct PoseSolution {
    /// Model-to-camera pose; invalid when the error budget is exceeded.
    pub pose: Pose,
    /// Total squared reprojection error of `pose` (pixels²).
    pub reprojection_error: f64,
    /// Per-correspondence `projected - observed` residuals of `pose`.
    pub residuals: Vec<Vector2<f64>>,
    /// Squared error of the initial estimate (EPnP or the supplied prior).
    pub initial_error: f64,
    /// Whether the refined estimate replaced the initial one.
    pub refined: bool,
    /// Minimizer outcome; `None` when no initial estimate was found.
    pub report: Option<MinimizationReport<f64>>,
}

impl PoseSolution {
    fn failed(initial: Isometry3<f64>, n: usize) -> Self {
        Self {
            pose: Pose::invalid(initial),
            reprojection_error: f64::INFINITY,
            residuals: vec![Vector2::repeat(f64::INFINITY); n],
            initial_error: f64::INFINITY,
            refined: false,
            report: None,
        }
    }
}

/// EPnP followed by Levenberg–Marquardt refinement of the reprojection
/// error, with a per-point error budget deciding validity.
#[derive(Clone, Debug)]
pub struct PoseSolver {
    camera: CameraIntrinsics,
    params: PoseSolverParams,
}

impl PoseSolver {
    pub fn new(camera: CameraIntrinsics, params: PoseSolverParams) -> Self {
        Self { camera, params }
    }

    pub fn camera(&self) -> &CameraIntrinsics {
        &self.camera
    }

    pub fn params(&self) -> &PoseSolverParams {
        &self.params
    }

    /// Estimate the model-to-camera pose from scratch.
    ///
    /// `model[i]` must be the marker position observed at `image[i]`.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(n = model.len()))
    )]
    pub fn solve(&self, model: &[Point3<f64>], image: &[Point2<f64>]) -> Result<PoseSolution, PoseSolveError> {
        self.validate(model, image)?;

        let Some(initial) = epnp::estimate_pose(&self.camera, model, image) else {
            log::debug!("epnp found no pose for {} correspondences", model.len());
            return Ok(PoseSolution::failed(Isometry3::identity(), model.len()));
        };
        Ok(self.refine_from(initial, model, image))
    }

    /// Refine a caller-supplied pose (typically last frame's) without
    /// running EPnP.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(n = model.len()))
    )]
    pub fn refine(
        &self,
        prior: &Isometry3<f64>,
        model: &[Point3<f64>],
        image: &[Point2<f64>],
    ) -> Result<PoseSolution, PoseSolveError> {
        self.validate(model, image)?;
        Ok(self.refine_from(*prior, model, image))
    }

    fn validate(&self, model: &[Point3<f64>], image: &[Point2<f64>]) -> Result<(), PoseSolveError> {
        if model.len() != image.len() {
            return Err(PoseSolveError::LengthMismatch {
                model: model.len(),
                image: image.len(),
            });
        }
        let required = self.params.min_correspondences.max(4);
        if model.len() < required {
            return Err(PoseSolveError::TooFewCorrespondences {
                got: model.len(),
                required,
            });
        }
        let first = model[0];
        if model.iter().all(|p| (p - first).norm_squared() <= f64::EPSILON) {
            return Err(PoseSolveError::DegenerateGeometry);
        }
        Ok(())
    }

    fn refine_from(&self, initial: Isometry3<f64>, model: &[Point3<f64>], image: &[Point2<f64>]) -> PoseSolution {
        let initial_error = reprojection_error_sq(&initial, &self.camera, model, image);
        let problem = ReprojectionProblem::new(&self.camera, model, image, &initial);
        let (problem, report) = self.params.refine.minimizer().minimize(problem);
        let refined_pose = params_to_pose(&problem.params());
        let refined_error = reprojection_error_sq(&refined_pose, &self.camera, model, image);

        let refined = refined_error.is_finite() && refined_error < initial_error;
        let (transform, error) = if refined {
            (refined_pose, refined_error)
        } else {
            (initial, initial_error)
        };

        let budget = self.params.max_error_per_point * model.len() as f64;
        let valid = error.is_finite() && error <= budget;
        log::debug!(
            "pose solve: n={} initial={:.3} final={:.3} evaluations={} termination={:?} valid={}",
            model.len(),
            initial_error,
            error,
            report.number_of_evaluations,
            report.termination,
            valid
        );

        PoseSolution {
            pose: Pose {
                valid,
                transform,
            },
            reprojection_error: error,
            residuals: reprojection_residuals(&transform, &self.camera, model, image),
            initial_error,
            refined,
            report: Some(report),
        }
    }
}

/// `projected - observed` for every correspondence. Points behind the
/// camera get infinite residuals.
pub fn reprojection_residuals(
    pose: &Isometry3<f64>,
    camera: &CameraIntrinsics,
    model: &[Point3<f64>],
    image: &[Point2<f64>],
) -> Vec<Vector2<f64>> {
    model
        .iter()
        .zip(image)
        .map(|(p, uv)| match camera.project(&(pose * p)) {
            Some(proj) => proj - uv,
            None => Vector2::repeat(f64::INFINITY),
        })
        .collect()
}

/// Total squared reprojection error in pixels².
pub fn reprojection_error_sq(
    pose: &Isometry3<f64>,
    camera: &CameraIntrinsics,
    model: &[Point3<f64>],
    image: &[Point2<f64>],
) -> f64 {
    reprojection_residuals(pose, camera, model, image)
        .iter()
        .map(|r| r.norm_squared())
        .sum()
}

/// `[tx, ty, tz, qx, qy, qz, qw]`
fn pose_to_params(pose: &Isometry3<f64>) -> SVector<f64, 7> {
    let t = pose.translation.vector;
    let q = pose.rotation.coords;
    SVector::<f64, 7>::from_column_slice(&[t.x, t.y, t.z, q.x, q.y, q.z, q.w])
}

fn params_to_pose(x: &SVector<f64, 7>) -> Isometry3<f64> {
    let q = Quaternion::new(x[6], x[3], x[4], x[5]);
    Isometry3::from_parts(Translation3::new(x[0], x[1], x[2]), UnitQuaternion::from_quaternion(q))
}

/// Reprojection residuals over a translation + unit quaternion state.
struct ReprojectionProblem<'a> {
    camera: &'a CameraIntrinsics,
    model: &'a [Point3<f64>],
    image: &'a [Point2<f64>],
    /// `[tx, ty, tz, qx, qy, qz, qw]`, quaternion kept at unit norm.
    x: SVector<f64, 7>,
}

impl<'a> ReprojectionProblem<'a> {
    fn new(
        camera: &'a CameraIntrinsics,
        model: &'a [Point3<f64>],
        image: &'a [Point2<f64>],
        initial: &Isometry3<f64>,
    ) -> Self {
        Self {
            camera,
            model,
            image,
            x: pose_to_params(initial),
        }
    }

    fn camera_point(x: &SVector<f64, 7>, p: &Point3<f64>) -> Vector3<f64> {
        let v = Vector3::new(x[3], x[4], x[5]);
        let w = x[6];
        let p = p.coords;
        (w * w - v.dot(&v)) * p + 2.0 * v.dot(&p) * v + 2.0 * w * v.cross(&p) + Vector3::new(x[0], x[1], x[2])
    }

    /// d(R p)/d[qx, qy, qz, qw], projected onto the tangent of the unit sphere.
    fn rotation_jacobian(x: &SVector<f64, 7>, p: &Point3<f64>) -> Matrix3x4<f64> {
        let v = Vector3::new(x[3], x[4], x[5]);
        let w = x[6];
        let p = p.coords;

        let dv = 2.0 * (Matrix3::identity() * v.dot(&p) + v * p.transpose() - p * v.transpose() - w * p.cross_matrix());
        let dw = 2.0 * (w * p + v.cross(&p));
        let mut j = Matrix3x4::zeros();
        j.fixed_view_mut::<3, 3>(0, 0).copy_from(&dv);
        j.set_column(3, &dw);

        let q = x.fixed_rows::<4>(3).into_owned();
        j - (j * q) * q.transpose()
    }
}

/// Translation unchanged, quaternion scaled back to unit norm (identity if
/// it collapsed to zero).
fn normalized(x: &SVector<f64, 7>) -> SVector<f64, 7> {
    let mut x = *x;
    let norm = x.fixed_rows::<4>(3).norm();
    if norm > f64::EPSILON {
        x.fixed_rows_mut::<4>(3).unscale_mut(norm);
    } else {
        x.fixed_rows_mut::<4>(3).copy_from_slice(&[0.0, 0.0, 0.0, 1.0]);
    }
    x
}

impl LeastSquaresProblem<f64, Dyn, U7> for ReprojectionProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U7>;
    type ParameterStorage = Owned<f64, U7>;

    fn set_params(&mut self, x: &SVector<f64, 7>) {
        self.x = normalized(x);
    }

    fn params(&self) -> SVector<f64, 7> {
        self.x
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let cam = self.camera;
        let mut r = DVector::zeros(2 * self.model.len());
        for (i, (p, uv)) in self.model.iter().zip(self.image).enumerate() {
            let pc = Self::camera_point(&self.x, p);
            let z = pc.z.max(MIN_DEPTH);
            r[2 * i] = (cam.fx * pc.x + cam.skew * pc.y) / z + cam.cx - uv.x;
            r[2 * i + 1] = cam.fy * pc.y / z + cam.cy - uv.y;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U7>> {
        let cam = self.camera;
        let mut j = OMatrix::<f64, Dyn, U7>::zeros(2 * self.model.len());
        for (i, p) in self.model.iter().enumerate() {
            let pc = Self::camera_point(&self.x, p);
            let z = pc.z.max(MIN_DEPTH);
            let z2 = z * z;
            let du = Vector3::new(cam.fx / z, cam.skew / z, -(cam.fx * pc.x + cam.skew * pc.y) / z2);
            let dv = Vector3::new(0.0, cam.fy / z, -cam.fy * pc.y / z2);
            let dq = Self::rotation_jacobian(&self.x, p);

            for (row, d) in [(2 * i, du), (2 * i + 1, dv)] {
                for k in 0..3 {
                    j[(row, k)] = d[k];
                }
                let dq_row = d.transpose() * dq;
                for k in 0..4 {
                    j[(row, 3 + k)] = dq_row[k];
                }
            }
        }
        Some(j)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    fn camera() -> CameraIntrinsics {
        CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, [640, 480])
    }

    /// Markers spread over the front of an ellipsoid, facing `-z`.
    fn constellation(n: usize) -> Vec<Point3<f64>> {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        (0..n)
            .map(|k| {
                let z = 1.0 - (k as f64 + 0.5) / n as f64;
                let r = (1.0 - z * z).sqrt();
                let phi = golden * k as f64;
                Point3::new(0.09 * r * phi.cos(), 0.06 * r * phi.sin(), -0.08 * z)
            })
            .collect()
    }

    fn truth() -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(0.04, -0.03, 0.8),
            UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3::new(1.0, 2.0, 0.5)), 0.25),
        )
    }

    fn project_all(pose: &Isometry3<f64>, pts: &[Point3<f64>]) -> Vec<Point2<f64>> {
        pts.iter()
            .map(|p| camera().project(&(pose * p)).expect("in front of camera"))
            .collect()
    }

    fn solver() -> PoseSolver {
        PoseSolver::new(camera(), PoseSolverParams::default())
    }

    #[test]
    fn rotation_jacobian_matches_finite_differences() {
        let x = pose_to_params(&truth());
        let p = Point3::new(0.03, -0.05, 0.02);
        let analytic = ReprojectionProblem::rotation_jacobian(&x, &p);

        // differences of the normalized rotation, so the radial direction drops out
        let rotate = |x: &SVector<f64, 7>| {
            let q = x.fixed_rows::<4>(3).normalize();
            let x = SVector::<f64, 7>::from_column_slice(&[0.0, 0.0, 0.0, q[0], q[1], q[2], q[3]]);
            ReprojectionProblem::camera_point(&x, &p)
        };
        let h = 1e-7;
        for k in 0..4 {
            let mut plus = x;
            let mut minus = x;
            plus[3 + k] += h;
            minus[3 + k] -= h;
            let numeric = (rotate(&plus) - rotate(&minus)) / (2.0 * h);
            assert_relative_eq!(analytic.column(k).into_owned(), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn round_trip_recovers_ground_truth() {
        let pts = constellation(20);
        let image = project_all(&truth(), &pts);

        let solution = solver().solve(&pts, &image).expect("solvable");
        assert!(solution.pose.valid);
        let pose = solution.pose.transform;
        assert!((pose.translation.vector - truth().translation.vector).norm() < 1e-4 * 0.8);
        assert!(pose.rotation.angle_to(&truth().rotation) < 1e-4);
        assert!(solution.reprojection_error < 1e-8);
        assert_eq!(solution.residuals.len(), 20);
    }

    /// Mean translation and rotation error over `seeds` noisy images.
    /// A seed draws the same unit-normal offsets at every `sigma`.
    fn mean_pose_error(sigma: f64, seeds: u64) -> (f64, f64) {
        let pts = constellation(20);
        let unit = Normal::new(0.0, 1.0).expect("valid sigma");
        let mut translation = 0.0;
        let mut rotation = 0.0;
        for seed in 0..seeds {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let image: Vec<Point2<f64>> = project_all(&truth(), &pts)
                .into_iter()
                .map(|uv| uv + sigma * Vector2::new(unit.sample(&mut rng), unit.sample(&mut rng)))
                .collect();

            let solution = solver().solve(&pts, &image).expect("solvable");
            if sigma <= 0.5 {
                assert!(solution.pose.valid, "sigma {sigma} seed {seed}: {}", solution.reprojection_error);
            }
            translation += (solution.pose.transform.translation.vector - truth().translation.vector).norm();
            rotation += solution.pose.transform.rotation.angle_to(&truth().rotation);
        }
        (translation / seeds as f64, rotation / seeds as f64)
    }

    #[test]
    fn pose_error_grows_no_faster_than_pixel_noise() {
        let sigmas = [0.25, 0.5, 1.0];
        let errors = sigmas.map(|sigma| mean_pose_error(sigma, 8));

        for (sigma, (translation, rotation)) in sigmas.iter().zip(errors) {
            assert!(translation > 0.0 && translation < 0.02 * sigma, "sigma {sigma}: {translation}");
            assert!(rotation > 0.0 && rotation < 0.05 * sigma, "sigma {sigma}: {rotation}");
        }
        // doubling the noise at most doubles the error, up to projection
        // curvature
        for pair in errors.windows(2) {
            let (t0, r0) = pair[0];
            let (t1, r1) = pair[1];
            assert!(t1 / t0 <= 2.05, "translation ratio {}", t1 / t0);
            assert!(r1 / r0 <= 2.05, "rotation ratio {}", r1 / r0);
        }
    }

    #[test]
    fn refine_from_perturbed_prior() {
        let pts = constellation(12);
        let image = project_all(&truth(), &pts);
        let prior = Isometry3::from_parts(
            Translation3::new(0.05, -0.02, 0.82),
            truth().rotation * UnitQuaternion::from_euler_angles(0.03, -0.02, 0.04),
        );

        let solution = solver().refine(&prior, &pts, &image).expect("solvable");
        let report = solution.report.as_ref().expect("minimizer ran");
        assert!(report.number_of_evaluations > 1);
        assert!(report.termination.was_successful(), "{:?}", report.termination);
        assert!(solution.refined);
        assert!(solution.pose.valid);
        assert!(solution.initial_error > 1.0);
        assert_relative_eq!(
            solution.pose.transform.translation.vector,
            truth().translation.vector,
            epsilon = 1e-6
        );
    }

    #[test]
    fn outlier_invalidates_pose() {
        let pts = constellation(20);
        let mut image = project_all(&truth(), &pts);
        image[7] += Vector2::new(60.0, -45.0);

        let solution = solver().solve(&pts, &image).expect("solvable");
        assert!(!solution.pose.valid);
        assert!(solution.reprojection_error > 2.0 * pts.len() as f64);
    }

    #[test]
    fn input_validation() {
        let pts = constellation(6);
        let image = project_all(&truth(), &pts);
        let s = solver();

        assert_eq!(
            s.solve(&pts[..3], &image[..3]).unwrap_err(),
            PoseSolveError::TooFewCorrespondences { got: 3, required: 4 }
        );
        assert_eq!(
            s.solve(&pts, &image[..5]).unwrap_err(),
            PoseSolveError::LengthMismatch { model: 6, image: 5 }
        );
        let same = vec![Point3::new(0.01, 0.02, 0.03); 5];
        assert_eq!(
            s.solve(&same, &image[..5]).unwrap_err(),
            PoseSolveError::DegenerateGeometry
        );
    }

    #[test]
    fn points_behind_camera_have_infinite_error() {
        let pts = constellation(5);
        let image = project_all(&truth(), &pts);
        let behind = Isometry3::translation(0.0, 0.0, -1.0);
        assert!(reprojection_error_sq(&behind, &camera(), &pts, &image).is_infinite());
        assert_relative_eq!(reprojection_error_sq(&truth(), &camera(), &pts, &image), 0.0, epsilon = 1e-16);
    }
}
