//! HunyuanVideo position tables
//!
//! The double-stream blocks attend over the video alone, the single-stream
//! blocks over the video followed by the caption, so two tables are built
//! from the same grid.

use burn_dit_core::{ConfigurationError, Coordinate, Region, RopeLayout};

use crate::geometry::{Geometry, eighths_layout};

pub const HEAD_DIM: usize = 128;

fn video(geometry: &Geometry) -> Region {
    // the temporal axis is kept at 0 for every frame
    Region::grid(
        "video",
        geometry.time,
        geometry.height,
        geometry.width,
        vec![Coordinate::zero(), Coordinate::row(), Coordinate::column()],
    )
}

/// Table over the latent video only
pub fn video_rope_layout(
    channels: usize,
    geometry: &Geometry,
) -> Result<RopeLayout, ConfigurationError> {
    Ok(RopeLayout::new(eighths_layout(channels)?, vec![video(geometry)]).with_heads(geometry.heads))
}

/// Table over the latent video followed by identity-rotated caption tokens
pub fn joint_rope_layout(
    channels: usize,
    geometry: &Geometry,
) -> Result<RopeLayout, ConfigurationError> {
    let tokens = Region::sequence("tokens", geometry.token_length, vec![Coordinate::zero(); 3]);
    Ok(
        RopeLayout::new(eighths_layout(channels)?, vec![video(geometry), tokens])
            .with_heads(geometry.heads),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joint_table_extends_video_table() {
        let g = Geometry::image(2, 2).with_time(2).with_tokens(3);
        let video = video_rope_layout(HEAD_DIM, &g).unwrap().build().unwrap();
        let joint = joint_rope_layout(HEAD_DIM, &g).unwrap().build().unwrap();
        assert_eq!(video.sequence_len(), 8);
        assert_eq!(joint.sequence_len(), 11);
        assert_eq!(joint.positions(0..8), video);
        assert_eq!(joint.pair(10, 0, 40), (1.0, 0.0));
    }

    #[test]
    fn test_frames_share_rotation() {
        let g = Geometry::image(1, 2).with_time(3);
        let table = video_rope_layout(HEAD_DIM, &g).unwrap().build().unwrap();
        assert_eq!(table.positions(1..2), table.positions(5..6));
    }
}
