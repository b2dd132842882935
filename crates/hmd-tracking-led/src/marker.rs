//! Marker catalog: where the LEDs sit on the headset and how they blink.

use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};

use crate::pattern::{PatternTable, CODE_BITS, PATTERN_COUNT};

/// One LED on the tracked device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// 10-bit blink code. Bit `k` is the brightness level during frame
    /// `k mod 10`.
    pub pattern: u16,
    /// Position in model space.
    pub position: Point3<f64>,
    /// Emission direction in model space (unit length after validation).
    pub direction: Vector3<f64>,
}

/// Errors reported while validating a marker catalog.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MarkerModelError {
    #[error("marker catalog is empty")]
    Empty,
    #[error("marker catalog has {0} markers, at most {max} supported", max = PATTERN_COUNT)]
    TooManyMarkers(usize),
    #[error("marker {index} pattern {pattern:#x} does not fit in {bits} bits", bits = CODE_BITS)]
    PatternTooWide { index: usize, pattern: u16 },
    #[error("marker {index} has a zero or non-finite emission direction")]
    InvalidDirection { index: usize },
    #[error("markers {first} and {second} share pattern {pattern:#x}")]
    DuplicatePattern {
        first: usize,
        second: usize,
        pattern: u16,
    },
}

/// A validated catalog plus its code lookup table.
#[derive(Clone, Debug)]
pub struct MarkerModel {
    markers: Vec<Marker>,
    table: PatternTable,
}

impl MarkerModel {
    /// Validate `markers`, normalize their directions and build the
    /// pattern table.
    pub fn new(mut markers: Vec<Marker>) -> Result<Self, MarkerModelError> {
        if markers.is_empty() {
            return Err(MarkerModelError::Empty);
        }
        if markers.len() > PATTERN_COUNT {
            return Err(MarkerModelError::TooManyMarkers(markers.len()));
        }

        let mut owner = vec![None::<usize>; PATTERN_COUNT];
        for (index, marker) in markers.iter_mut().enumerate() {
            if usize::from(marker.pattern) >= PATTERN_COUNT {
                return Err(MarkerModelError::PatternTooWide {
                    index,
                    pattern: marker.pattern,
                });
            }
            let slot = &mut owner[usize::from(marker.pattern)];
            if let Some(first) = *slot {
                return Err(MarkerModelError::DuplicatePattern {
                    first,
                    second: index,
                    pattern: marker.pattern,
                });
            }
            *slot = Some(index);

            let norm = marker.direction.norm();
            if !norm.is_finite() || norm <= f64::EPSILON {
                return Err(MarkerModelError::InvalidDirection { index });
            }
            marker.direction /= norm;
        }

        let table = PatternTable::build(&markers);
        log::debug!(
            "marker model: {} markers, {} resolvable codes",
            markers.len(),
            table.resolvable_codes()
        );
        Ok(Self { markers, table })
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Marker> {
        self.markers.get(index)
    }

    pub fn pattern_table(&self) -> &PatternTable {
        &self.table
    }

    /// Marker index for an observed 10-bit code.
    pub fn resolve(&self, code: u16) -> Option<usize> {
        self.table.resolve(code)
    }

    /// Markers facing a camera at the origin, given the model-to-camera
    /// transform, with their camera-space positions.
    ///
    /// A marker faces the camera when its emission direction points back
    /// towards the camera center and it lies in front of the image plane.
    pub fn visible_markers(&self, model_to_camera: &Isometry3<f64>) -> Vec<(usize, Point3<f64>)> {
        self.markers
            .iter()
            .enumerate()
            .filter_map(|(idx, m)| {
                let p = model_to_camera * m.position;
                let d = model_to_camera.rotation * m.direction;
                (p.z > 0.0 && d.dot(&p.coords) < 0.0).then_some((idx, p))
            })
            .collect()
    }
}
