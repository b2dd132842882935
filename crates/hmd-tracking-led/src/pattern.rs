//! Nearest-code lookup from observed 10-bit blink codes to marker indices.

use crate::marker::Marker;

/// Number of frames (and bits) in one blink code.
pub const CODE_BITS: u32 = 10;

/// Number of distinct codes.
pub const PATTERN_COUNT: usize = 1 << CODE_BITS;

/// Largest Hamming distance still resolved to a marker.
pub const MAX_CODE_ERRORS: u32 = 1;

const CODE_MASK: u16 = (PATTERN_COUNT - 1) as u16;

/// Number of differing bits among the low [`CODE_BITS`] bits.
#[inline]
pub fn hamming_distance(a: u16, b: u16) -> u32 {
    ((a ^ b) & CODE_MASK).count_ones()
}

/// Table mapping every possible code to the closest marker.
///
/// `table[code]` is the index of the marker with the smallest Hamming
/// distance to `code`, provided that distance is at most
/// [`MAX_CODE_ERRORS`]. When several markers are equally close, the lowest
/// marker index wins. Built once; read-only afterwards, so it can be shared
/// across threads freely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternTable {
    entries: Box<[Option<u16>]>,
}

impl PatternTable {
    /// Build the table for `markers`; indices refer to positions in the slice.
    ///
    /// Callers are expected to pass at most [`PATTERN_COUNT`] markers; see
    /// `MarkerModel::new` for validation.
    pub fn build(markers: &[Marker]) -> Self {
        let entries = (0..PATTERN_COUNT as u16)
            .map(|code| {
                markers
                    .iter()
                    .enumerate()
                    .map(|(idx, m)| (hamming_distance(code, m.pattern), idx))
                    .min()
                    .filter(|&(dist, _)| dist <= MAX_CODE_ERRORS)
                    .map(|(_, idx)| idx as u16)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { entries }
    }

    /// Marker index for an observed code. Bits above [`CODE_BITS`] are ignored.
    #[inline]
    pub fn resolve(&self, code: u16) -> Option<usize> {
        self.entries[(code & CODE_MASK) as usize].map(usize::from)
    }

    /// Number of codes that resolve to some marker.
    pub fn resolvable_codes(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}
