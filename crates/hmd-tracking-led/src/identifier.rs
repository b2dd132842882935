//! Frame-to-frame blob matching and blink-code decoding.
//!
//! Every LED toggles between two brightness levels following its 10-bit
//! pattern, one bit per camera frame. A blob's pixel count tracks the
//! brightness, so comparing it with the matched blob of the previous frame
//! yields one code bit per frame. After ten matched frames the accumulated
//! code is looked up in the [`PatternTable`](crate::PatternTable).

use std::sync::Arc;

use hmd_tracking_core::CameraIntrinsics;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Isometry3, Point2, Point3};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::blob::Blob;
use crate::marker::MarkerModel;
use crate::params::LedIdentifierParams;
use crate::pattern::CODE_BITS;

/// Per-blob identification state, carried from frame to frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedBlob {
    pub position: Point2<f64>,
    /// Pixel count; zero for ghost blobs.
    pub blob_size: u32,
    /// Number of consecutive frames this blob has been matched (saturates at 10).
    pub bits: u32,
    /// Accumulated code; bit `t mod 10` holds the level observed in frame `t`.
    pub decoded_pattern: u16,
    /// Resolved marker index, once known.
    pub marker: Option<usize>,
}

impl TrackedBlob {
    fn unmatched(position: Point2<f64>, blob_size: u32) -> Self {
        Self {
            position,
            blob_size,
            bits: 0,
            decoded_pattern: 0,
            marker: None,
        }
    }

    fn ghost(position: Point2<f64>, marker: usize, pattern: u16) -> Self {
        Self {
            position,
            blob_size: 0,
            bits: CODE_BITS,
            decoded_pattern: pattern,
            marker: Some(marker),
        }
    }

    /// Predicted from a pose rather than observed.
    pub fn is_ghost(&self) -> bool {
        self.blob_size == 0
    }
}

/// A blob with a resolved marker identity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedLed {
    pub image_position: Point2<f64>,
    pub marker_index: usize,
    pub model_position: Point3<f64>,
}

/// Counters for one processed frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentificationStats {
    pub frame_index: u64,
    pub raw_blobs: usize,
    pub circular_blobs: usize,
    /// Blobs matched to a real blob of the previous frame.
    pub matched_blobs: usize,
    /// Blobs that inherited their identity from a ghost.
    pub ghost_matches: usize,
    /// Blobs dropped because several blobs resolved to the same marker.
    pub duplicates_dropped: usize,
    pub identified: usize,
}

/// Result of [`LedIdentifier::process_frame`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameIdentification {
    /// All circular blobs of the frame with their decoding state.
    pub blobs: Vec<TrackedBlob>,
    /// Blobs with a unique marker identity.
    pub leds: Vec<IdentifiedLed>,
    pub stats: IdentificationStats,
}

/// Stateful LED identifier. Feed it every camera frame in order.
///
/// The per-frame cycle is [`process_frame`](Self::process_frame), then pose
/// estimation by the caller, then [`prepare_next_frame`](Self::prepare_next_frame)
/// with the accepted pose (if any). Skipping `prepare_next_frame` is allowed;
/// the next frame then matches against the plain observed blobs.
pub struct LedIdentifier {
    model: Arc<MarkerModel>,
    camera: CameraIntrinsics,
    params: LedIdentifierParams,
    frame_index: u64,
    /// Blobs of the last processed frame, before ghost injection.
    pending: Option<Vec<TrackedBlob>>,
    /// Match targets for the next frame and their search tree.
    previous: Vec<TrackedBlob>,
    tree: KdTree<f64, 2>,
}

impl LedIdentifier {
    pub fn new(model: Arc<MarkerModel>, camera: CameraIntrinsics, params: LedIdentifierParams) -> Self {
        Self {
            model,
            camera,
            params,
            frame_index: 0,
            pending: None,
            previous: Vec::new(),
            tree: KdTree::new(),
        }
    }

    pub fn model(&self) -> &MarkerModel {
        &self.model
    }

    pub fn params(&self) -> &LedIdentifierParams {
        &self.params
    }

    /// Index of the next frame to be processed.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Forget all per-blob history. The frame counter keeps running so the
    /// bit slots stay aligned with the LED blink phase.
    pub fn reset(&mut self) {
        self.pending = None;
        self.previous.clear();
        self.tree = KdTree::new();
    }

    /// Match this frame's blobs against the previous frame, update their
    /// codes and report those with a unique marker identity.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip_all, fields(frame = self.frame_index, blobs = blobs.len()))
    )]
    pub fn process_frame(&mut self, blobs: &[Blob]) -> FrameIdentification {
        if self.pending.is_some() {
            self.prepare_next_frame(None);
        }

        let frame = self.frame_index;
        let slot = (frame % CODE_BITS as u64) as u32;
        let previous_slot = (slot + CODE_BITS - 1) % CODE_BITS;
        let mut stats = IdentificationStats {
            frame_index: frame,
            raw_blobs: blobs.len(),
            ..IdentificationStats::default()
        };

        let mut current = Vec::with_capacity(blobs.len());
        for blob in blobs.iter().filter(|b| b.is_circular(&self.params)) {
            let mut tracked = TrackedBlob::unmatched(blob.centroid, blob.pixel_count);
            if let Some(prev) = self.predecessor(&blob.centroid) {
                if prev.is_ghost() {
                    tracked.bits = prev.bits;
                    tracked.decoded_pattern = prev.decoded_pattern;
                    tracked.marker = prev.marker;
                    stats.ghost_matches += 1;
                } else {
                    let bit = self
                        .size_change(prev.blob_size, blob.pixel_count)
                        .unwrap_or((prev.decoded_pattern >> previous_slot) & 1 == 1);
                    tracked.decoded_pattern = with_bit(prev.decoded_pattern, slot, bit);
                    tracked.bits = (prev.bits + 1).min(CODE_BITS);
                    stats.matched_blobs += 1;
                }
            }
            if tracked.bits >= CODE_BITS {
                tracked.marker = self.model.resolve(tracked.decoded_pattern);
            }
            current.push(tracked);
        }
        stats.circular_blobs = current.len();

        let leds = self.unique_identities(&current, &mut stats);
        stats.identified = leds.len();
        log::trace!(
            "frame {frame}: {} blobs, {} circular, {} identified",
            stats.raw_blobs,
            stats.circular_blobs,
            stats.identified
        );

        self.frame_index += 1;
        self.pending = Some(current.clone());
        FrameIdentification {
            blobs: current,
            leds,
            stats,
        }
    }

    /// Finish the last processed frame: optionally add ghost blobs for
    /// markers predicted visible under `pose` (model-to-camera) that no
    /// observed blob already carries, then index everything for matching.
    ///
    /// Returns the number of ghost blobs added.
    pub fn prepare_next_frame(&mut self, pose: Option<&Isometry3<f64>>) -> usize {
        let mut blobs = self.pending.take().unwrap_or_default();
        let observed = blobs.len();

        if let (true, Some(pose)) = (self.params.ghost_blobs, pose) {
            let mut present = vec![false; self.model.len()];
            for idx in blobs.iter().filter_map(|b| b.marker) {
                present[idx] = true;
            }
            for (idx, p_cam) in self.model.visible_markers(pose) {
                if present[idx] {
                    continue;
                }
                let Some(uv) = self.camera.project(&p_cam) else {
                    continue;
                };
                if self.camera.contains(&uv) {
                    blobs.push(TrackedBlob::ghost(uv, idx, self.model.markers()[idx].pattern));
                }
            }
        }

        let ghosts = blobs.len() - observed;
        let coords = blobs
            .iter()
            .map(|b| [b.position.x, b.position.y])
            .collect::<Vec<_>>();
        self.tree = (&coords).into();
        self.previous = blobs;
        ghosts
    }

    /// Blobs the next frame will be matched against, ghosts included.
    pub fn match_targets(&self) -> &[TrackedBlob] {
        &self.previous
    }

    fn predecessor(&self, position: &Point2<f64>) -> Option<&TrackedBlob> {
        if self.previous.is_empty() {
            return None;
        }
        let nn = self.tree.nearest_one::<SquaredEuclidean>(&[position.x, position.y]);
        let max = self.params.max_match_distance;
        (nn.distance < max * max)
            .then(|| self.previous.get(nn.item as usize))
            .flatten()
    }

    /// `Some(true)` for a clear growth, `Some(false)` for a clear shrink,
    /// `None` when the change is inside the dead band.
    fn size_change(&self, previous: u32, current: u32) -> Option<bool> {
        let ratio = current as f64 / previous.max(1) as f64;
        if ratio >= self.params.grow_ratio {
            Some(true)
        } else if ratio <= self.params.shrink_ratio {
            Some(false)
        } else {
            None
        }
    }

    fn unique_identities(&self, blobs: &[TrackedBlob], stats: &mut IdentificationStats) -> Vec<IdentifiedLed> {
        let mut claims = vec![0usize; self.model.len()];
        for idx in blobs.iter().filter_map(|b| b.marker) {
            claims[idx] += 1;
        }
        stats.duplicates_dropped = claims.iter().filter(|&&c| c > 1).sum();

        blobs
            .iter()
            .filter_map(|b| {
                let idx = b.marker?;
                (claims[idx] == 1).then(|| IdentifiedLed {
                    image_position: b.position,
                    marker_index: idx,
                    model_position: self.model.markers()[idx].position,
                })
            })
            .collect()
    }
}

#[inline]
fn with_bit(code: u16, slot: u32, bit: bool) -> u16 {
    (code & !(1 << slot)) | (u16::from(bit) << slot)
}
