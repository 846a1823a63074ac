//! Multi-axial Rotary Position Embedding tables
//!
//! DiT models attend over a sequence made of several blocks (image patches,
//! reference images, caption tokens). Each block encodes its own mix of
//! temporal, vertical, horizontal and token coordinates, and each coordinate
//! owns a slice of the head channels.
//!
//! [`build`] evaluates a list of [`Region`]s against an [`AxisLayout`] and
//! produces an [`EncodingTensor`] that a graph consumes as a constant input.
//!
//! # Formula
//!
//! For position `p` in region `r`, axis `a` and frequency index `k`:
//! ```text
//! θ = coord_{r,a}(p) * freq_a(k)
//! table[p, h, 2 * pair_a(k)]     = cos θ
//! table[p, h, 2 * pair_a(k) + 1] = sin θ
//! ```
//!
//! # References
//!
//! - [RoFormer: Enhanced Transformer with Rotary Position Embedding](https://arxiv.org/abs/2104.09864)

use std::ops::Range;

use thiserror::Error;
use tracing::debug;

use crate::axis::AxisLayout;
use crate::encoding::EncodingTensor;
use crate::region::Region;

/// Invalid axis or region description; always fatal
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("channel count must be even, got {0}")]
    OddChannels(usize),

    #[error("axis {axis} has odd channel width {width}")]
    OddAxis { axis: usize, width: usize },

    #[error("channel count {channels} must be a multiple of {multiple}")]
    Unaligned { channels: usize, multiple: usize },

    #[error("axis {axis} has no channel pairs")]
    EmptyAxis { axis: usize },

    #[error("axis {axis} writes pair {pair}, beyond the {pairs} available")]
    OutOfRange {
        axis: usize,
        pair: usize,
        pairs: usize,
    },

    #[error("pair {pair} claimed by both axis {first} and axis {second}")]
    Overlap {
        pair: usize,
        first: usize,
        second: usize,
    },

    #[error("pair {pair} of {channels} channels is not covered by any axis")]
    Uncovered { pair: usize, channels: usize },

    #[error("region '{region}' has {actual} coordinates for {expected} axes")]
    CoordinateCount {
        region: String,
        expected: usize,
        actual: usize,
    },

    #[error("head count must be positive")]
    NoHeads,

    #[error("{channels} channels cannot be split into {heads} heads")]
    HeadSplit { channels: usize, heads: usize },
}

/// Axis partition plus region order for one table
#[derive(Debug, Clone, PartialEq)]
pub struct RopeLayout {
    pub axes: AxisLayout,
    pub regions: Vec<Region>,
    /// Number of heads to replicate over; 1 means the consumer broadcasts
    pub heads: usize,
}

impl RopeLayout {
    pub fn new(axes: AxisLayout, regions: Vec<Region>) -> Self {
        Self {
            axes,
            regions,
            heads: 1,
        }
    }

    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    /// Total number of positions
    pub fn sequence_len(&self) -> usize {
        self.regions.iter().map(Region::len).sum()
    }

    /// Position range covered by each region, in order
    pub fn region_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.regions
            .iter()
            .map(|r| {
                let range = start..start + r.len();
                start = range.end;
                range
            })
            .collect()
    }

    /// Position range of the first region with the given name
    pub fn region_range(&self, name: &str) -> Option<Range<usize>> {
        self.regions
            .iter()
            .zip(self.region_ranges())
            .find(|(r, _)| r.name == name)
            .map(|(_, range)| range)
    }

    pub fn build(&self) -> Result<EncodingTensor, ConfigurationError> {
        build(&self.regions, &self.axes, self.heads)
    }
}

/// Builds a `[1, positions, heads, channels]` table of interleaved cos/sin
/// pairs
pub fn build(
    regions: &[Region],
    axes: &AxisLayout,
    heads: usize,
) -> Result<EncodingTensor, ConfigurationError> {
    if heads == 0 {
        return Err(ConfigurationError::NoHeads);
    }
    for region in regions {
        if region.coordinates.len() != axes.len() {
            return Err(ConfigurationError::CoordinateCount {
                region: region.name.clone(),
                expected: axes.len(),
                actual: region.coordinates.len(),
            });
        }
    }

    let channels = axes.channels();
    let len: usize = regions.iter().map(Region::len).sum();
    let frequencies: Vec<Vec<f64>> = axes.axes().iter().map(|a| a.frequencies()).collect();

    let row = heads * channels;
    let mut data = vec![0.0f32; len * row];
    let mut position = 0;
    for region in regions {
        for local in 0..region.len() {
            let at = region.locate(local);
            let out = &mut data[position * row..(position + 1) * row];
            for ((axis, coordinate), freqs) in axes
                .axes()
                .iter()
                .zip(&region.coordinates)
                .zip(&frequencies)
            {
                let coord = coordinate.value(at);
                for (k, freq) in freqs.iter().enumerate() {
                    let theta = coord * freq;
                    let pair = axis.span.pair(k);
                    out[pair * 2] = theta.cos() as f32;
                    out[pair * 2 + 1] = theta.sin() as f32;
                }
            }
            // Head-invariant: replicate head 0
            for h in 1..heads {
                out.copy_within(0..channels, h * channels);
            }
            position += 1;
        }
    }

    debug!(
        positions = len,
        heads,
        channels,
        regions = regions.len(),
        "built rope table"
    );
    Ok(EncodingTensor::from_parts(data, [1, len, heads, channels]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{AxisKind, Frequency};
    use crate::region::Coordinate;

    fn flux_style_axes(channels: usize) -> AxisLayout {
        AxisLayout::aligned(
            channels,
            Frequency::Inverse { base: 10_000.0 },
            &[
                (AxisKind::Temporal, channels / 8),
                (AxisKind::Vertical, channels * 7 / 16),
                (AxisKind::Horizontal, channels * 7 / 16),
            ],
        )
        .unwrap()
    }

    fn image(h: usize, w: usize) -> Region {
        Region::image(
            "image",
            h,
            w,
            vec![Coordinate::zero(), Coordinate::row(), Coordinate::column()],
        )
    }

    #[test]
    fn test_two_by_two_grid() {
        // 16 channels: temporal pairs 0..2, vertical 2..5, horizontal 5..8
        let axes = AxisLayout::contiguous(
            16,
            Frequency::Inverse { base: 10_000.0 },
            &[
                (AxisKind::Temporal, 4),
                (AxisKind::Vertical, 6),
                (AxisKind::Horizontal, 6),
            ],
        )
        .unwrap();
        let table = build(&[image(2, 2)], &axes, 1).unwrap();
        assert_eq!(table.shape(), [1, 4, 1, 16]);

        // (0, 0) is the identity on every pair
        for pair in 0..8 {
            assert_eq!(table.pair(0, 0, pair), (1.0, 0.0));
        }

        // (1, 1): first pair of each spatial axis rotates by exactly 1 rad
        let p = 3;
        for pair in [2, 5] {
            let (cos, sin) = table.pair(p, 0, pair);
            assert!((cos - 1f64.cos() as f32).abs() < 1e-6);
            assert!((sin - 1f64.sin() as f32).abs() < 1e-6);
        }

        // second vertical pair uses 1 / 10000^(2/6)
        let theta = 1.0 / 10_000f64.powf(2.0 / 6.0);
        let (cos, sin) = table.pair(p, 0, 3);
        assert!((cos - theta.cos() as f32).abs() < 1e-6);
        assert!((sin - theta.sin() as f32).abs() < 1e-6);

        // temporal pairs stay identity
        assert_eq!(table.pair(p, 0, 0), (1.0, 0.0));
        assert_eq!(table.pair(p, 0, 1), (1.0, 0.0));
    }

    #[test]
    fn test_flux_split_needs_even_axes() {
        // 7 * 16 / 16 = 7 channels cannot hold whole pairs
        let err = AxisLayout::aligned(
            16,
            Frequency::Inverse { base: 10_000.0 },
            &[
                (AxisKind::Temporal, 2),
                (AxisKind::Vertical, 7),
                (AxisKind::Horizontal, 7),
            ],
        )
        .unwrap_err();
        assert_eq!(err, ConfigurationError::OddAxis { axis: 1, width: 7 });
    }

    #[test]
    fn test_heads_are_replicated() {
        let axes = flux_style_axes(32);
        let table = build(&[image(3, 2)], &axes, 4).unwrap();
        assert_eq!(table.shape(), [1, 6, 4, 32]);
        for p in 0..6 {
            for h in 1..4 {
                for c in 0..32 {
                    assert_eq!(table.get(p, h, c), table.get(p, 0, c));
                }
            }
        }
    }

    #[test]
    fn test_every_pair_is_unit_length() {
        let axes = flux_style_axes(64);
        let regions = vec![
            Region::sequence("tokens", 5, vec![Coordinate::zero(); 3]),
            image(4, 3),
        ];
        let table = build(&regions, &axes, 1).unwrap();
        for p in 0..table.sequence_len() {
            for pair in 0..32 {
                let (c, s) = table.pair(p, 0, pair);
                assert!((c * c + s * s - 1.0).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_padding_is_identity() {
        let axes = flux_style_axes(32);
        let regions = vec![image(2, 2), Region::padding(3, 3)];
        let table = build(&regions, &axes, 1).unwrap();
        assert_eq!(table.sequence_len(), 7);
        for p in 4..7 {
            for pair in 0..16 {
                assert_eq!(table.pair(p, 0, pair), (1.0, 0.0));
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let layout = RopeLayout::new(flux_style_axes(32), vec![image(5, 7)]).with_heads(2);
        let a = layout.build().unwrap();
        let b = layout.build().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_coordinate_count_mismatch() {
        let axes = flux_style_axes(32);
        let bad = Region::sequence("tokens", 2, vec![Coordinate::zero(); 2]);
        let err = build(&[bad], &axes, 1).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::CoordinateCount {
                region: "tokens".into(),
                expected: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn test_zero_heads() {
        let axes = flux_style_axes(32);
        assert_eq!(build(&[], &axes, 0), Err(ConfigurationError::NoHeads));
    }

    #[test]
    fn test_region_ranges() {
        let layout = RopeLayout::new(
            flux_style_axes(32),
            vec![
                Region::sequence("tokens", 3, vec![Coordinate::zero(); 3]),
                image(2, 4),
            ],
        );
        assert_eq!(layout.region_ranges(), vec![0..3, 3..11]);
        assert_eq!(layout.region_range("image"), Some(3..11));
        assert_eq!(layout.sequence_len(), 11);
    }
}
