//! Core types shared by the inertial and optical tracking crates.
//!
//! This crate is intentionally small and purely geometric. It does *not*
//! know about sensors, blobs or solvers; it only provides the camera model,
//! the pose value handed between pipeline stages, the lock-light triple
//! buffer used for every "write latest, read latest" handoff, and the logger.

mod camera;
mod logger;
mod pose;
mod triple_buffer;

pub use camera::CameraIntrinsics;
pub use pose::Pose;
pub use triple_buffer::TripleBuffer;

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
