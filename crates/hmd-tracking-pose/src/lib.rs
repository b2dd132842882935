//! Model-based pose estimation for a rigid marker constellation.
//!
//! [`PoseSolver`] takes matched marker positions (model space) and image
//! observations and returns the model-to-camera transform:
//! 1. a closed-form EPnP estimate ([`epnp::estimate_pose`]),
//! 2. Levenberg–Marquardt refinement of the pixel reprojection error over a
//!    translation + quaternion state,
//! 3. a validity check against a per-point squared error budget.
//!
//! If refinement does not lower the error the EPnP estimate is kept, and
//! either way the pose is flagged invalid when the budget is exceeded.
//! Refinement runs the `levenberg-marquardt` crate's MINPACK-style
//! minimizer; its [`MinimizationReport`] is kept in every [`PoseSolution`].

pub mod epnp;
mod error;
mod solver;

pub use error::PoseSolveError;
pub use levenberg_marquardt::{MinimizationReport, TerminationReason};
pub use solver::{
    reprojection_error_sq, reprojection_residuals, PoseSolution, PoseSolver, PoseSolverParams, RefineParams,
};
