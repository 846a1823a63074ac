//! Position axes and their channel-pair assignments
//!
//! A RoPE table is split along the channel dimension into one span per
//! axis. Each span is a set of channel pairs `(2k, 2k + 1)`; the pair holds
//! `(cos θ, sin θ)` for that axis's coordinate.

use std::f64::consts::FRAC_PI_2;

use crate::rope::ConfigurationError;

/// What coordinate an axis encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisKind {
    /// Frame index, or a per-region constant (reference images)
    Temporal,
    /// Row within a grid
    Vertical,
    /// Column within a grid
    Horizontal,
    /// Position within a token sequence
    Token,
    /// Always the identity rotation (cos 1, sin 0)
    Constant,
}

impl AxisKind {
    /// Short human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            AxisKind::Temporal => "temporal",
            AxisKind::Vertical => "vertical",
            AxisKind::Horizontal => "horizontal",
            AxisKind::Token => "token",
            AxisKind::Constant => "constant",
        }
    }
}

/// Angular frequency schedule across the pairs of one axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frequency {
    /// RoFormer schedule: `1 / base^(2k / dim)` where `dim` is the
    /// channel width of the axis
    Inverse { base: f64 },
    /// `base^(k / (pairs - 1)) * π/2`, for coordinates already scaled
    /// into `[-1, 1]`
    FractionalPi { base: f64 },
}

impl Frequency {
    /// Frequency of pair `k` of an axis with `pairs` channel pairs
    pub fn at(&self, k: usize, pairs: usize) -> f64 {
        match *self {
            Frequency::Inverse { base } => 1.0 / base.powf((k * 2) as f64 / (pairs * 2) as f64),
            Frequency::FractionalPi { base } => {
                if pairs < 2 {
                    FRAC_PI_2
                } else {
                    base.powf(k as f64 / (pairs - 1) as f64) * FRAC_PI_2
                }
            }
        }
    }

    pub fn base(&self) -> f64 {
        match *self {
            Frequency::Inverse { base } | Frequency::FractionalPi { base } => base,
        }
    }
}

/// Channel pairs written by one axis: `start, start + stride, ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairSpan {
    pub start: usize,
    pub count: usize,
    pub stride: usize,
}

impl PairSpan {
    /// Contiguous run of pairs
    pub fn contiguous(start: usize, count: usize) -> Self {
        Self {
            start,
            count,
            stride: 1,
        }
    }

    /// Pairs spaced `stride` apart, as used when axes interleave
    pub fn strided(start: usize, count: usize, stride: usize) -> Self {
        Self {
            start,
            count,
            stride,
        }
    }

    /// Pair index of the k-th frequency
    #[inline]
    pub fn pair(&self, k: usize) -> usize {
        self.start + k * self.stride
    }

    pub fn pairs(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.count).map(|k| self.pair(k))
    }
}

/// One axis of a RoPE table
#[derive(Debug, Clone, PartialEq)]
pub struct PositionAxis {
    pub kind: AxisKind,
    pub frequency: Frequency,
    pub span: PairSpan,
}

impl PositionAxis {
    pub fn new(kind: AxisKind, frequency: Frequency, span: PairSpan) -> Self {
        Self {
            kind,
            frequency,
            span,
        }
    }

    /// Width of the axis in channels
    pub fn channels(&self) -> usize {
        self.span.count * 2
    }

    /// Precomputed frequency for each pair of the span
    pub fn frequencies(&self) -> Vec<f64> {
        (0..self.span.count)
            .map(|k| self.frequency.at(k, self.span.count))
            .collect()
    }
}

/// Axis partition of a channel dimension
///
/// Construction validates that the axes tile every channel pair exactly
/// once.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisLayout {
    channels: usize,
    axes: Vec<PositionAxis>,
}

impl AxisLayout {
    /// Validates an explicit set of axes against a channel count
    pub fn new(channels: usize, axes: Vec<PositionAxis>) -> Result<Self, ConfigurationError> {
        if channels % 2 != 0 {
            return Err(ConfigurationError::OddChannels(channels));
        }
        let pairs = channels / 2;
        let mut owner: Vec<Option<usize>> = vec![None; pairs];
        for (index, axis) in axes.iter().enumerate() {
            if axis.span.count == 0 {
                return Err(ConfigurationError::EmptyAxis { axis: index });
            }
            if axis.span.stride == 0 {
                return Err(ConfigurationError::Overlap {
                    pair: axis.span.start,
                    first: index,
                    second: index,
                });
            }
            for pair in axis.span.pairs() {
                let Some(slot) = owner.get_mut(pair) else {
                    return Err(ConfigurationError::OutOfRange {
                        axis: index,
                        pair,
                        pairs,
                    });
                };
                if let Some(first) = *slot {
                    return Err(ConfigurationError::Overlap {
                        pair,
                        first,
                        second: index,
                    });
                }
                *slot = Some(index);
            }
        }
        if let Some(pair) = owner.iter().position(Option::is_none) {
            return Err(ConfigurationError::Uncovered { pair, channels });
        }
        Ok(Self { channels, axes })
    }

    /// Lays axes out back to back, each given as `(kind, channel width)`
    pub fn contiguous(
        channels: usize,
        frequency: Frequency,
        widths: &[(AxisKind, usize)],
    ) -> Result<Self, ConfigurationError> {
        let mut start = 0;
        let mut axes = Vec::with_capacity(widths.len());
        for (index, &(kind, width)) in widths.iter().enumerate() {
            if width % 2 != 0 {
                return Err(ConfigurationError::OddAxis { axis: index, width });
            }
            axes.push(PositionAxis::new(
                kind,
                frequency,
                PairSpan::contiguous(start, width / 2),
            ));
            start += width / 2;
        }
        Self::new(channels, axes)
    }

    /// Same as [`AxisLayout::contiguous`], additionally requiring
    /// `channels % 16 == 0`
    pub fn aligned(
        channels: usize,
        frequency: Frequency,
        widths: &[(AxisKind, usize)],
    ) -> Result<Self, ConfigurationError> {
        if channels % 16 != 0 {
            return Err(ConfigurationError::Unaligned {
                channels,
                multiple: 16,
            });
        }
        Self::contiguous(channels, frequency, widths)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn axes(&self) -> &[PositionAxis] {
        &self.axes
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// First axis of the given kind
    pub fn find(&self, kind: AxisKind) -> Option<&PositionAxis> {
        self.axes.iter().find(|a| a.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROFORMER: Frequency = Frequency::Inverse { base: 10_000.0 };

    #[test]
    fn test_inverse_schedule_matches_roformer() {
        // pair 0 is always 1, pair k is base^(-2k/dim)
        assert_eq!(ROFORMER.at(0, 4), 1.0);
        let expected = 1.0 / 10_000f64.powf(2.0 / 8.0);
        assert!((ROFORMER.at(1, 4) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_fractional_schedule_endpoints() {
        let f = Frequency::FractionalPi { base: 10_000.0 };
        assert!((f.at(0, 5) - FRAC_PI_2).abs() < 1e-12);
        assert!((f.at(4, 5) - 10_000.0 * FRAC_PI_2).abs() < 1e-6);
        // a single pair would divide by zero, fall back to π/2
        assert_eq!(f.at(0, 1), FRAC_PI_2);
    }

    #[test]
    fn test_contiguous_layout_tiles_channels() {
        let layout = AxisLayout::contiguous(
            16,
            ROFORMER,
            &[
                (AxisKind::Temporal, 4),
                (AxisKind::Vertical, 6),
                (AxisKind::Horizontal, 6),
            ],
        )
        .unwrap();
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.axes()[1].span, PairSpan::contiguous(2, 3));
        assert_eq!(layout.axes()[2].span, PairSpan::contiguous(5, 3));
        assert_eq!(layout.find(AxisKind::Horizontal).unwrap().channels(), 6);
    }

    #[test]
    fn test_layout_rejects_odd_channels() {
        let err = AxisLayout::contiguous(15, ROFORMER, &[(AxisKind::Token, 14)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::OddChannels(15)));
    }

    #[test]
    fn test_layout_rejects_gap() {
        let err = AxisLayout::contiguous(16, ROFORMER, &[(AxisKind::Token, 12)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::Uncovered { pair: 6, .. }));
    }

    #[test]
    fn test_layout_rejects_overlap() {
        let axes = vec![
            PositionAxis::new(AxisKind::Vertical, ROFORMER, PairSpan::contiguous(0, 3)),
            PositionAxis::new(AxisKind::Horizontal, ROFORMER, PairSpan::contiguous(2, 2)),
        ];
        let err = AxisLayout::new(8, axes).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::Overlap {
                pair: 2,
                first: 0,
                second: 1
            }
        ));
    }

    #[test]
    fn test_layout_rejects_overflow() {
        let axes = vec![PositionAxis::new(
            AxisKind::Token,
            ROFORMER,
            PairSpan::contiguous(0, 5),
        )];
        let err = AxisLayout::new(8, axes).unwrap_err();
        assert!(matches!(err, ConfigurationError::OutOfRange { pair: 4, .. }));
    }

    #[test]
    fn test_interleaved_axes_tile() {
        // one padding pair then three axes interleaved with stride 3
        let f = Frequency::FractionalPi { base: 10_000.0 };
        let axes = vec![
            PositionAxis::new(AxisKind::Constant, f, PairSpan::contiguous(0, 1)),
            PositionAxis::new(AxisKind::Temporal, f, PairSpan::strided(1, 2, 3)),
            PositionAxis::new(AxisKind::Vertical, f, PairSpan::strided(2, 2, 3)),
            PositionAxis::new(AxisKind::Horizontal, f, PairSpan::strided(3, 2, 3)),
        ];
        let layout = AxisLayout::new(14, axes).unwrap();
        let pairs: Vec<usize> = layout.axes()[2].span.pairs().collect();
        assert_eq!(pairs, vec![2, 5]);
    }

    #[test]
    fn test_aligned_requires_multiple_of_16() {
        let err = AxisLayout::aligned(24, ROFORMER, &[(AxisKind::Token, 24)]).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::Unaligned {
                channels: 24,
                multiple: 16
            }
        ));
    }
}
