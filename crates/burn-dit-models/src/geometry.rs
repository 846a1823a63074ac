//! Latent geometry and the axis splits shared between architectures

use burn_dit_core::{AxisKind, AxisLayout, ConfigurationError, Frequency};
use serde::{Deserialize, Serialize};

/// RoFormer schedule used by most image DiTs
pub const ROFORMER: Frequency = Frequency::Inverse { base: 10_000.0 };

/// Size of a conditioning image in patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub height: usize,
    pub width: usize,
}

impl ReferenceImage {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn len(&self) -> usize {
        self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sequence geometry of one denoising call, in patches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub height: usize,
    pub width: usize,
    /// Latent frames; 1 for still images
    pub time: usize,
    pub token_length: usize,
    #[serde(default)]
    pub references: Vec<ReferenceImage>,
    /// Heads to replicate the table over; 1 broadcasts downstream
    pub heads: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            height: 64,
            width: 64,
            time: 1,
            token_length: 512,
            references: Vec::new(),
            heads: 1,
        }
    }
}

impl Geometry {
    /// Still image without caption tokens
    pub fn image(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            time: 1,
            token_length: 0,
            references: Vec::new(),
            heads: 1,
        }
    }

    pub fn with_time(mut self, time: usize) -> Self {
        self.time = time;
        self
    }

    pub fn with_tokens(mut self, token_length: usize) -> Self {
        self.token_length = token_length;
        self
    }

    pub fn with_reference(mut self, height: usize, width: usize) -> Self {
        self.references.push(ReferenceImage::new(height, width));
        self
    }

    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    /// Positions of the main latent grid
    pub fn latent_len(&self) -> usize {
        self.time * self.height * self.width
    }

    /// Positions of all reference images
    pub fn reference_len(&self) -> usize {
        self.references.iter().map(ReferenceImage::len).sum()
    }
}

/// `t C/8, y 7C/16, x 7C/16`, used by Flux.1, Hunyuan and Qwen-Image
pub fn eighths_layout(channels: usize) -> Result<AxisLayout, ConfigurationError> {
    AxisLayout::aligned(
        channels,
        ROFORMER,
        &[
            (AxisKind::Temporal, channels / 8),
            (AxisKind::Vertical, channels * 7 / 16),
            (AxisKind::Horizontal, channels * 7 / 16),
        ],
    )
}

/// Temporal axis takes the remainder after two spatial axes of width `d`
pub fn spatial_remainder_layout(
    channels: usize,
    spatial: usize,
) -> Result<AxisLayout, ConfigurationError> {
    AxisLayout::aligned(
        channels,
        ROFORMER,
        &[
            (AxisKind::Temporal, channels.saturating_sub(2 * spatial)),
            (AxisKind::Vertical, spatial),
            (AxisKind::Horizontal, spatial),
        ],
    )
}
