//! Connected bright regions as delivered by the blob extractor.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::params::LedIdentifierParams;

/// One blob in image pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    /// Intensity-weighted center.
    pub centroid: Point2<f64>,
    pub pixel_count: u32,
    /// Inclusive bounding box corner with the smallest coordinates.
    pub bbox_min: [u32; 2],
    /// Inclusive bounding box corner with the largest coordinates.
    pub bbox_max: [u32; 2],
}

impl Blob {
    pub fn new(centroid: Point2<f64>, pixel_count: u32, bbox_min: [u32; 2], bbox_max: [u32; 2]) -> Self {
        Self {
            centroid,
            pixel_count,
            bbox_min,
            bbox_max,
        }
    }

    /// A blob filling the disc of `radius` around `centroid`, with the pixel
    /// count of that disc and its square bounding box.
    pub fn disc(centroid: Point2<f64>, radius: u32) -> Self {
        let r = radius as f64;
        let pixel_count = (std::f64::consts::PI * r * r).round().max(1.0) as u32;
        let cx = centroid.x.round().max(0.0) as u32;
        let cy = centroid.y.round().max(0.0) as u32;
        Self {
            centroid,
            pixel_count,
            bbox_min: [cx.saturating_sub(radius), cy.saturating_sub(radius)],
            bbox_max: [cx + radius, cy + radius],
        }
    }

    pub fn width(&self) -> u32 {
        self.bbox_max[0].saturating_sub(self.bbox_min[0]) + 1
    }

    pub fn height(&self) -> u32 {
        self.bbox_max[1].saturating_sub(self.bbox_min[1]) + 1
    }

    /// Whether the blob is plausibly a single round LED image: large enough,
    /// near-square bounding box, and mostly filled.
    pub fn is_circular(&self, params: &LedIdentifierParams) -> bool {
        if self.pixel_count < params.min_blob_pixels {
            return false;
        }
        let w = self.width() as f64;
        let h = self.height() as f64;
        if w > params.max_aspect * h || h > params.max_aspect * w {
            return false;
        }
        self.pixel_count as f64 >= params.min_fill * w * h
    }
}
