//! HiDream-I1 position tables
//!
//! Weight mapping for HiDream is not provided; its mixture-of-experts
//! checkpoints load through the generic diffusers path.

use burn_dit_core::{ConfigurationError, Coordinate, Region, RopeLayout};

use crate::geometry::{Geometry, spatial_remainder_layout};

pub const HEAD_DIM: usize = 128;

/// `t C - 2d, y d, x d` with `d = (C / 8) * 2`; image first, then caption
/// tokens at the origin
pub fn rope_layout(channels: usize, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let axes = spatial_remainder_layout(channels, (channels / 8) * 2)?;
    let image = Region::image(
        "image",
        geometry.height,
        geometry.width,
        vec![Coordinate::zero(), Coordinate::row(), Coordinate::column()],
    );
    let tokens = Region::sequence("tokens", geometry.token_length, vec![Coordinate::zero(); 3]);
    Ok(RopeLayout::new(axes, vec![image, tokens]).with_heads(geometry.heads))
}
