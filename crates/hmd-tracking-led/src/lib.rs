//! Identification of blinking infrared LED markers.
//!
//! Each LED on the headset blinks a 10-bit code, one bit per camera frame,
//! by switching between two brightness levels. Given the blobs extracted
//! from each frame, this crate
//! - rejects blobs that do not look like a single round LED,
//! - matches every blob to its nearest neighbour in the previous frame,
//! - turns the size change between matches into one code bit per frame,
//! - resolves complete codes to marker indices through a 1024-entry table
//!   that tolerates one bit error.
//!
//! With a recent pose available, markers predicted to be visible are
//! injected as "ghost" blobs so an LED that re-appears is identified on its
//! first frame instead of after ten.
//!
//! ```
//! use std::sync::Arc;
//! use hmd_tracking_core::CameraIntrinsics;
//! use hmd_tracking_led::{Blob, LedIdentifier, LedIdentifierParams, Marker, MarkerModel};
//! use nalgebra::{Point2, Point3, Vector3};
//!
//! let model = MarkerModel::new(vec![Marker {
//!     pattern: 0x26A,
//!     position: Point3::origin(),
//!     direction: -Vector3::z(),
//! }])?;
//! let camera = CameraIntrinsics::new(600.0, 600.0, 320.0, 240.0, [640, 480]);
//! let mut identifier = LedIdentifier::new(Arc::new(model), camera, LedIdentifierParams::default());
//!
//! let frame = identifier.process_frame(&[Blob::disc(Point2::new(100.0, 100.0), 4)]);
//! assert_eq!(frame.stats.circular_blobs, 1);
//! assert!(frame.leds.is_empty());
//! # Ok::<(), hmd_tracking_led::MarkerModelError>(())
//! ```

mod blob;
mod identifier;
mod marker;
mod params;
mod pattern;

pub use blob::Blob;
pub use identifier::{FrameIdentification, IdentificationStats, IdentifiedLed, LedIdentifier, TrackedBlob};
pub use marker::{Marker, MarkerModel, MarkerModelError};
pub use params::LedIdentifierParams;
pub use pattern::{hamming_distance, PatternTable, CODE_BITS, MAX_CODE_ERRORS, PATTERN_COUNT};
