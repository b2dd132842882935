//! Per-frame optical pipeline: blobs → identified LEDs → pose.

use std::sync::Arc;

use hmd_tracking_core::{CameraIntrinsics, Pose, TripleBuffer};
use hmd_tracking_led::{
    Blob, IdentificationStats, IdentifiedLed, LedIdentifier, LedIdentifierParams, MarkerModel, TrackedBlob,
};
use hmd_tracking_pose::{PoseSolveError, PoseSolver, PoseSolverParams};
use nalgebra::{Isometry3, Point2, Point3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalTrackerParams {
    pub identifier: LedIdentifierParams,
    pub solver: PoseSolverParams,
    /// Refine from the previous frame's valid pose instead of running EPnP.
    pub use_prior_pose: bool,
}

/// What happened in one processed frame.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub stats: IdentificationStats,
    /// Identified LEDs handed to the solver (zero if too few to try).
    pub correspondences: usize,
    pub pose: Pose,
    /// Total squared reprojection error, when a solve was attempted.
    pub reprojection_error: Option<f64>,
    /// Ghost blobs prepared for the next frame.
    pub ghosts_added: usize,
    /// Why the solver refused the correspondences, if it did.
    pub solve_error: Option<PoseSolveError>,
}

/// Triple-buffered pipeline outputs, shared with consumer threads.
#[derive(Debug, Default)]
pub struct OpticalOutputs {
    pub blobs: TripleBuffer<Vec<TrackedBlob>>,
    pub leds: TripleBuffer<Vec<IdentifiedLed>>,
    pub pose: TripleBuffer<Pose>,
}

impl OpticalOutputs {
    /// Lock the latest published pose; `true` if it is newer than the
    /// previously locked one.
    pub fn lock_new_pose(&self) -> bool {
        self.pose.lock_new_value()
    }

    pub fn locked_pose(&self) -> Pose {
        *self.pose.locked()
    }

    pub fn lock_new_leds(&self) -> bool {
        self.leds.lock_new_value()
    }

    pub fn locked_leds(&self) -> Vec<IdentifiedLed> {
        self.leds.locked_value()
    }

    pub fn lock_new_blobs(&self) -> bool {
        self.blobs.lock_new_value()
    }

    pub fn locked_blobs(&self) -> Vec<TrackedBlob> {
        self.blobs.locked_value()
    }
}

/// Owns the LED identifier and pose solver; driven by one thread, one frame
/// at a time and in order.
pub struct OpticalTracker {
    identifier: LedIdentifier,
    solver: PoseSolver,
    use_prior_pose: bool,
    last_pose: Pose,
    /// Transform of the most recent valid pose; ghosts are predicted from it.
    last_valid_pose: Option<Isometry3<f64>>,
    outputs: Arc<OpticalOutputs>,
    model_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl OpticalTracker {
    pub fn new(model: Arc<MarkerModel>, camera: CameraIntrinsics, params: OpticalTrackerParams) -> Self {
        Self {
            identifier: LedIdentifier::new(model, camera, params.identifier),
            solver: PoseSolver::new(camera, params.solver),
            use_prior_pose: params.use_prior_pose,
            last_pose: Pose::default(),
            last_valid_pose: None,
            outputs: Arc::new(OpticalOutputs::default()),
            model_points: Vec::new(),
            image_points: Vec::new(),
        }
    }

    /// Handle to the published blobs, LEDs and pose.
    pub fn outputs(&self) -> Arc<OpticalOutputs> {
        Arc::clone(&self.outputs)
    }

    pub fn identifier(&self) -> &LedIdentifier {
        &self.identifier
    }

    pub fn solver(&self) -> &PoseSolver {
        &self.solver
    }

    /// Pose of the last processed frame.
    pub fn last_pose(&self) -> Pose {
        self.last_pose
    }

    pub fn set_use_prior_pose(&mut self, enabled: bool) {
        self.use_prior_pose = enabled;
    }

    /// Drop blob history and mark the pose stale.
    pub fn reset(&mut self) {
        self.identifier.reset();
        self.last_pose.invalidate();
        self.last_valid_pose = None;
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(frame = self.identifier.frame_index(), blobs = blobs.len()))
    )]
    pub fn process_frame(&mut self, blobs: &[Blob]) -> FrameReport {
        let frame = self.identifier.process_frame(blobs);

        self.model_points.clear();
        self.image_points.clear();
        for led in &frame.leds {
            self.model_points.push(led.model_position);
            self.image_points.push(led.image_position);
        }

        let mut report = FrameReport {
            frame_index: frame.stats.frame_index,
            stats: frame.stats,
            correspondences: 0,
            pose: Pose::invalid(self.last_pose.transform),
            reprojection_error: None,
            ghosts_added: 0,
            solve_error: None,
        };

        if self.model_points.len() >= self.solver.params().min_correspondences.max(4) {
            report.correspondences = self.model_points.len();
            let result = match (self.use_prior_pose, self.last_pose.as_valid()) {
                (true, Some(prior)) => self.solver.refine(prior, &self.model_points, &self.image_points),
                _ => self.solver.solve(&self.model_points, &self.image_points),
            };
            match result {
                Ok(solution) => {
                    report.pose = solution.pose;
                    report.reprojection_error = Some(solution.reprojection_error);
                }
                Err(err) => {
                    log::debug!("frame {}: pose not solved: {err}", report.frame_index);
                    report.solve_error = Some(err);
                }
            }
        }

        match (self.last_pose.valid, report.pose.valid) {
            (true, false) => log::info!("frame {}: optical pose lost", report.frame_index),
            (false, true) => log::info!(
                "frame {}: optical pose acquired from {} LEDs",
                report.frame_index,
                report.correspondences
            ),
            _ => {}
        }
        self.last_pose = report.pose;
        if let Some(pose) = report.pose.as_valid() {
            self.last_valid_pose = Some(*pose);
        }
        report.ghosts_added = self.identifier.prepare_next_frame(self.last_valid_pose.as_ref());

        {
            let mut slot = self.outputs.blobs.next_slot();
            slot.clear();
            slot.extend_from_slice(&frame.blobs);
        }
        self.outputs.blobs.publish();
        self.outputs.leds.write(frame.leds);
        self.outputs.pose.write(report.pose);

        report
    }
}
