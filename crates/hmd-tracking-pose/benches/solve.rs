use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hmd_tracking_core::CameraIntrinsics;
use hmd_tracking_pose::{epnp, PoseSolver, PoseSolverParams};
use nalgebra::{Isometry3, Point2, Point3, Translation3, UnitQuaternion};

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

fn bench_solve(c: &mut Criterion) {
    let camera = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, [640, 480]);
    let truth = Isometry3::from_parts(
        Translation3::new(0.04, -0.03, 0.8),
        UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
    );
    let model = constellation(20);
    let image: Vec<Point2<f64>> = model
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let uv = camera.project(&(truth * p)).expect("marker in front of camera");
            // deterministic sub-pixel jitter so LM has work to do
            Point2::new(uv.x + 0.3 * (i as f64).sin(), uv.y + 0.3 * (i as f64).cos())
        })
        .collect();

    let solver = PoseSolver::new(camera, PoseSolverParams::default());
    c.bench_function("pose_solve_20_markers", |b| {
        b.iter(|| solver.solve(black_box(&model), black_box(&image)))
    });
    c.bench_function("epnp_20_markers", |b| {
        b.iter(|| epnp::estimate_pose(&camera, black_box(&model), black_box(&image)))
    });
    let prior = truth * Isometry3::translation(0.005, 0.0, -0.01);
    c.bench_function("pose_refine_20_markers", |b| {
        b.iter(|| solver.refine(black_box(&prior), black_box(&model), black_box(&image)))
    });
}

criterion_group!(benches, bench_solve);
criterion_main!(benches);
