use thiserror::Error;

/// Reasons a correspondence set cannot be handed to the solver at all.
///
/// Numerical trouble inside the solver is not an error: it yields a
/// [`PoseSolution`](crate::PoseSolution) whose pose is marked invalid.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoseSolveError {
    #[error("need at least {required} correspondences, got {got}")]
    TooFewCorrespondences { got: usize, required: usize },
    #[error("{model} model points but {image} image points")]
    LengthMismatch { model: usize, image: usize },
    #[error("model points are coincident")]
    DegenerateGeometry,
}
