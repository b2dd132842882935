use serde::{Deserialize, Serialize};

/// Tuning of blob filtering, frame-to-frame matching and bit decoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedIdentifierParams {
    /// Largest centroid displacement (pixels) between consecutive frames for
    /// two blobs to be treated as the same LED.
    pub max_match_distance: f64,
    /// Size ratio at or above which the LED is considered to have grown (bit 1).
    pub grow_ratio: f64,
    /// Size ratio at or below which the LED is considered to have shrunk (bit 0).
    pub shrink_ratio: f64,
    /// Blobs with fewer pixels are dropped.
    pub min_blob_pixels: u32,
    /// Largest accepted bounding-box aspect ratio (long side / short side).
    pub max_aspect: f64,
    /// Smallest accepted fraction of the bounding box covered by blob pixels.
    pub min_fill: f64,
    /// Inject blobs predicted from the last accepted pose into the previous
    /// frame so re-appearing LEDs are identified immediately.
    pub ghost_blobs: bool,
}

impl Default for LedIdentifierParams {
    fn default() -> Self {
        Self {
            max_match_distance: 10.0,
            grow_ratio: 13.0 / 12.0,
            shrink_ratio: 12.0 / 13.0,
            min_blob_pixels: 10,
            max_aspect: 4.0 / 3.0,
            min_fill: 0.5,
            ghost_blobs: true,
        }
    }
}
