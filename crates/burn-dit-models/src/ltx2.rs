//! LTX-2 position tables
//!
//! LTX-2 runs a video stream and an audio stream side by side. Positions
//! are fractional: every coordinate is mapped into `[-1, 1]` before the
//! `FractionalPi` schedule is applied, and tables are built over the full
//! channel width and then reinterpreted per head.

use burn_dit_core::{
    AxisKind, AxisLayout, ConfigurationError, Coordinate, EncodingTensor, Frequency, PairSpan,
    PositionAxis, Region, RopeLayout,
};
use serde::Serialize;
use tracing::debug;

use crate::geometry::Geometry;

pub const ROPE_FREQUENCY: Frequency = Frequency::FractionalPi { base: 10_000.0 };

/// Source frames per latent video frame
pub const VIDEO_TEMPORAL_STRIDE: usize = 8;
/// Source frames per audio latent
pub const AUDIO_TEMPORAL_STRIDE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ltx2Config {
    pub video_channels: usize,
    pub audio_channels: usize,
    pub heads: usize,
}

impl Ltx2Config {
    /// LTX-2 19B
    pub fn base() -> Self {
        Self {
            video_channels: 4096,
            audio_channels: 2048,
            heads: 32,
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self {
            video_channels: 100,
            audio_channels: 64,
            heads: 2,
        }
    }

    /// Video, audio and video-to-audio tables split into heads
    pub fn tables(&self, geometry: &Geometry) -> Result<Ltx2Tables, ConfigurationError> {
        let tables = Ltx2Tables {
            video: video_rope_layout(self.video_channels, geometry)?
                .build()?
                .split_heads(self.heads)?,
            audio: audio_rope_layout(self.audio_channels, geometry)?
                .build()?
                .split_heads(self.heads)?,
            video_to_audio: video_to_audio_rope_layout(self.audio_channels, geometry)?
                .build()?
                .split_heads(self.heads)?,
        };
        debug!(
            video = tables.video.sequence_len(),
            audio = tables.audio.sequence_len(),
            heads = self.heads,
            "built ltx2 tables"
        );
        Ok(tables)
    }
}

/// The three tables consumed by one LTX-2 forward pass
#[derive(Debug, Clone, PartialEq)]
pub struct Ltx2Tables {
    pub video: EncodingTensor,
    pub audio: EncodingTensor,
    /// Video positions seen from the audio stream's cross-attention
    pub video_to_audio: EncodingTensor,
}

/// Audio latents covering `time` video latents
pub fn audio_len(time: usize) -> usize {
    time.saturating_sub(1) * VIDEO_TEMPORAL_STRIDE + 1
}

fn frame_coordinate() -> Coordinate {
    Coordinate::causal_frame(VIDEO_TEMPORAL_STRIDE)
        .scaled(1.0 / 500.0)
        .shifted(-1.0)
}

fn patch_coordinate(source: Coordinate) -> Coordinate {
    source.shifted(0.5).scaled(1.0 / 32.0).shifted(-1.0)
}

fn single_axis(channels: usize) -> Result<AxisLayout, ConfigurationError> {
    AxisLayout::new(
        channels,
        vec![PositionAxis::new(
            AxisKind::Temporal,
            ROPE_FREQUENCY,
            PairSpan::contiguous(0, channels / 2),
        )],
    )
}

/// Leading identity pairs, then frame, row and column interleaved pair by
/// pair
pub fn video_axes(channels: usize) -> Result<AxisLayout, ConfigurationError> {
    let dim = channels / 3 / 2;
    let pad = (channels / 2).saturating_sub(dim * 3);
    let mut axes = Vec::with_capacity(4);
    if pad > 0 {
        axes.push(PositionAxis::new(
            AxisKind::Constant,
            ROPE_FREQUENCY,
            PairSpan::contiguous(0, pad),
        ));
    }
    for (offset, kind) in [AxisKind::Temporal, AxisKind::Vertical, AxisKind::Horizontal]
        .into_iter()
        .enumerate()
    {
        axes.push(PositionAxis::new(
            kind,
            ROPE_FREQUENCY,
            PairSpan::strided(pad + offset, dim, 3),
        ));
    }
    AxisLayout::new(channels, axes)
}

pub fn video_rope_layout(
    channels: usize,
    geometry: &Geometry,
) -> Result<RopeLayout, ConfigurationError> {
    let axes = video_axes(channels)?;
    let mut coordinates = Vec::with_capacity(axes.len());
    if axes.find(AxisKind::Constant).is_some() {
        coordinates.push(Coordinate::zero());
    }
    coordinates.push(frame_coordinate());
    coordinates.push(patch_coordinate(Coordinate::row()));
    coordinates.push(patch_coordinate(Coordinate::column()));
    let video = Region::grid(
        "video",
        geometry.time,
        geometry.height,
        geometry.width,
        coordinates,
    );
    Ok(RopeLayout::new(axes, vec![video]))
}

pub fn audio_rope_layout(
    channels: usize,
    geometry: &Geometry,
) -> Result<RopeLayout, ConfigurationError> {
    let audio = Region::grid(
        "audio",
        audio_len(geometry.time),
        1,
        1,
        vec![
            Coordinate::causal_frame(AUDIO_TEMPORAL_STRIDE)
                .scaled(1.0 / 2000.0)
                .shifted(-1.0),
        ],
    );
    Ok(RopeLayout::new(single_axis(channels)?, vec![audio]))
}

/// Video grid at audio width, rotated by the frame coordinate only
pub fn video_to_audio_rope_layout(
    channels: usize,
    geometry: &Geometry,
) -> Result<RopeLayout, ConfigurationError> {
    let video = Region::grid(
        "video",
        geometry.time,
        geometry.height,
        geometry.width,
        vec![frame_coordinate()],
    );
    Ok(RopeLayout::new(single_axis(channels)?, vec![video]))
}

/// Caption table for the text connector: token `i` sits at
/// `2i / max_length - 1`
pub fn token_table(
    token_length: usize,
    max_length: usize,
    channels: usize,
    head_dim: usize,
) -> Result<EncodingTensor, ConfigurationError> {
    if head_dim == 0 {
        return Err(ConfigurationError::NoHeads);
    }
    let tokens = Region::sequence(
        "tokens",
        token_length,
        vec![
            Coordinate::index()
                .scaled(2.0 / max_length.max(1) as f64)
                .shifted(-1.0),
        ],
    );
    RopeLayout::new(single_axis(channels)?, vec![tokens])
        .build()?
        .split_heads(channels / head_dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn close(actual: f32, expected: f64) -> bool {
        (actual as f64 - expected).abs() < 1e-5
    }

    #[test]
    fn test_video_axes_pad_and_interleave() {
        let axes = video_axes(100).unwrap();
        assert_eq!(axes.len(), 4);
        assert_eq!(axes.axes()[0].kind, AxisKind::Constant);
        assert_eq!(axes.axes()[0].channels(), 4);
        let vertical = axes.find(AxisKind::Vertical).unwrap();
        assert_eq!(vertical.span.pair(0), 3);
        assert_eq!(vertical.span.pair(1), 6);

        // 96 channels split evenly, no padding
        assert!(video_axes(96).unwrap().find(AxisKind::Constant).is_none());
    }

    #[test]
    fn test_video_coordinates() {
        let g = Geometry::image(2, 2).with_time(2);
        let table = video_rope_layout(100, &g).unwrap().build().unwrap();
        assert_eq!(table.pair(0, 0, 0), (1.0, 0.0));
        assert_eq!(table.pair(7, 0, 1), (1.0, 0.0));

        // first frequency of every axis is π/2
        let first_frame = 1.0 / 500.0 - 1.0;
        assert!(close(table.pair(0, 0, 2).1, (first_frame * FRAC_PI_2).sin()));
        // frame 1 covers source frames 1..=8
        let second_frame = 10.0 / 500.0 - 1.0;
        assert!(close(table.pair(4, 0, 2).1, (second_frame * FRAC_PI_2).sin()));
        // position 3 is (y=1, x=1)
        let patch = 1.5 / 32.0 - 1.0;
        assert!(close(table.pair(3, 0, 3).0, (patch * FRAC_PI_2).cos()));
        assert!(close(table.pair(3, 0, 4).1, (patch * FRAC_PI_2).sin()));
    }

    #[test]
    fn test_audio_length_and_coordinates() {
        assert_eq!(audio_len(1), 1);
        assert_eq!(audio_len(3), 17);
        let g = Geometry::image(1, 1).with_time(2);
        let table = audio_rope_layout(16, &g).unwrap().build().unwrap();
        assert_eq!(table.sequence_len(), 9);
        let second = 6.0 / 2000.0 - 1.0;
        assert!(close(table.pair(1, 0, 0).1, (second * FRAC_PI_2).sin()));
        let last = 10_000f64.powf(1.0 / 7.0) * FRAC_PI_2 * second;
        assert!(close(table.pair(1, 0, 1).0, last.cos()));
    }

    #[test]
    fn test_tables_split_into_heads() {
        let config = Ltx2Config::tiny();
        let tables = config.tables(&Geometry::image(2, 3).with_time(2)).unwrap();
        assert_eq!(tables.video.shape(), [1, 12, 2, 50]);
        assert_eq!(tables.audio.shape(), [1, 9, 2, 32]);
        assert_eq!(tables.video_to_audio.shape(), [1, 12, 2, 32]);
        // every position of a frame shares one rotation
        assert_eq!(
            tables.video_to_audio.positions(6..7),
            tables.video_to_audio.positions(11..12)
        );
    }

    #[test]
    fn test_token_table() {
        let table = token_table(3, 4, 32, 16).unwrap();
        assert_eq!(table.shape(), [1, 3, 2, 16]);
        // token 2 of 4 sits at the origin
        assert_eq!(table.pair(2, 0, 0), (1.0, 0.0));
        assert!(close(table.pair(0, 0, 0).1, (-FRAC_PI_2).sin()));
    }
}
