//! Qwen-Image
//!
//! A stack of dual-stream blocks run in reduced precision. Activations are
//! kept small by dividing attention and MLP outputs by per-layer factors,
//! so the matching biases are divided by the same factors on load.
//!
//! Checkpoints only exist in the diffusers layout; both naming
//! conventions produce the same table.

use burn_dit_convert::{
    Layer, MappingError, MappingTable, NamedTensorRef, NamingConvention, WeightMapper,
};
use burn_dit_core::{ConfigurationError, Coordinate, Region, RopeLayout};
use serde::Serialize;
use tracing::debug;

use crate::geometry::{Geometry, eighths_layout};
use crate::stream::StreamLayers;

pub const HEAD_DIM: usize = 128;

/// Query, key and value biases are pre-divided by this
pub const QKV_SCALE: f32 = 8.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QwenImageConfig {
    pub channels: usize,
    pub layers: usize,
}

impl QwenImageConfig {
    /// Qwen-Image 20B
    pub fn base() -> Self {
        Self {
            channels: 3072,
            layers: 60,
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self {
            channels: 256,
            layers: 3,
        }
    }

    pub fn heads(&self) -> usize {
        self.channels / HEAD_DIM
    }

    /// `(attention, mlp)` output divisors of block `i`
    ///
    /// The last 16 blocks run attention at 16, the last block runs its MLP
    /// at 256.
    pub fn scale_factors(&self, i: usize) -> (f32, f32) {
        let attention = if i + 16 >= self.layers { 16.0 } else { 2.0 };
        let mlp = if i + 1 >= self.layers { 256.0 } else { 16.0 };
        (attention, mlp)
    }

    pub fn rope_layout(&self, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
        rope_layout(HEAD_DIM, geometry)
    }

    pub fn mapper(&self) -> QwenImage {
        QwenImage::new(self.clone())
    }
}

/// Image coordinates centred on zero; tokens continue past the largest
/// image coordinate on every axis
pub fn rope_layout(channels: usize, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let axes = eighths_layout(channels)?;
    let (h, w) = (geometry.height, geometry.width);
    let start = (h / 2).max(w / 2) as f64;
    let image = Region::image(
        "image",
        h,
        w,
        vec![
            Coordinate::zero(),
            Coordinate::row().shifted(-((h - h / 2) as f64)),
            Coordinate::column().shifted(-((w - w / 2) as f64)),
        ],
    );
    let tokens = Region::sequence(
        "tokens",
        geometry.token_length,
        vec![Coordinate::index().shifted(start); 3],
    );
    Ok(RopeLayout::new(axes, vec![image, tokens]).with_heads(geometry.heads))
}

/// Dual-stream block with scale-corrected biases
#[derive(Debug, Clone)]
pub struct QwenImageBlock {
    pub block: usize,
    pub context: StreamLayers,
    pub x: StreamLayers,
    pub context_block_pre_only: bool,
    pub scale_factors: (f32, f32),
}

impl QwenImageBlock {
    pub fn new(
        block: usize,
        index: usize,
        context_block_pre_only: bool,
        scale_factors: (f32, f32),
    ) -> Self {
        Self {
            block,
            context: StreamLayers::gelu("c", index, if context_block_pre_only { 2 } else { 6 }),
            x: StreamLayers::gelu("x", index, 6),
            context_block_pre_only,
            scale_factors,
        }
    }
}

/// `<prefix>.weight` as is, `<prefix>.bias` divided by `divisor`
fn add_scaled(t: &mut MappingTable, prefix: &str, layer: &Layer, divisor: f32) {
    t.add(format!("{prefix}.weight"), layer.weight.clone());
    if let Some(bias) = &layer.bias {
        t.insert(
            format!("{prefix}.bias"),
            NamedTensorRef::single(bias.clone()).with_scale(1.0 / divisor),
        );
    }
}

impl WeightMapper for QwenImageBlock {
    fn mapping(&self, _: NamingConvention) -> Result<MappingTable, MappingError> {
        let p = format!("transformer_blocks.{}", self.block);
        let (c, x) = (&self.context, &self.x);
        let (attention, mlp) = self.scale_factors;
        let mut t = MappingTable::new();
        add_scaled(&mut t, &format!("{p}.attn.add_q_proj"), &c.q, QKV_SCALE);
        add_scaled(&mut t, &format!("{p}.attn.add_k_proj"), &c.k, QKV_SCALE);
        add_scaled(&mut t, &format!("{p}.attn.add_v_proj"), &c.v, QKV_SCALE);
        t.add(format!("{p}.attn.norm_added_k.weight"), c.norm_k.weight.clone());
        t.add(format!("{p}.attn.norm_added_q.weight"), c.norm_q.weight.clone());
        add_scaled(&mut t, &format!("{p}.attn.to_q"), &x.q, QKV_SCALE);
        add_scaled(&mut t, &format!("{p}.attn.to_k"), &x.k, QKV_SCALE);
        add_scaled(&mut t, &format!("{p}.attn.to_v"), &x.v, QKV_SCALE);
        t.add(format!("{p}.attn.norm_k.weight"), x.norm_k.weight.clone());
        t.add(format!("{p}.attn.norm_q.weight"), x.norm_q.weight.clone());
        if !self.context_block_pre_only {
            add_scaled(&mut t, &format!("{p}.attn.to_add_out"), &c.out, QKV_SCALE * attention);
        }
        add_scaled(&mut t, &format!("{p}.attn.to_out.0"), &x.out, QKV_SCALE * attention);
        if !self.context_block_pre_only {
            t.add_layer(&format!("{p}.txt_mlp.net.0.proj"), &c.up[0]);
            add_scaled(&mut t, &format!("{p}.txt_mlp.net.2"), &c.down, mlp);
        }
        t.add_layer(&format!("{p}.img_mlp.net.0.proj"), &x.up[0]);
        add_scaled(&mut t, &format!("{p}.img_mlp.net.2"), &x.down, mlp);
        t.add_fused_layers(&format!("{p}.txt_mod.1"), &c.ada_ln())?;
        t.add_fused_layers(&format!("{p}.img_mod.1"), &x.ada_ln())?;
        Ok(t)
    }
}

/// Whole Qwen-Image transformer
#[derive(Debug, Clone)]
pub struct QwenImage {
    pub config: QwenImageConfig,
    pub blocks: Vec<QwenImageBlock>,
}

impl QwenImage {
    pub fn new(config: QwenImageConfig) -> Self {
        let blocks = (0..config.layers)
            .map(|i| {
                QwenImageBlock::new(i, i, i + 1 == config.layers, config.scale_factors(i))
            })
            .collect();
        Self { config, blocks }
    }
}

impl WeightMapper for QwenImage {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let mut t = MappingTable::new();
        t.add_layer("img_in", &Layer::new("x_embedder", 0));
        t.add_layer("txt_norm", &Layer::no_bias("context_norm", 0));
        t.add_layer("txt_in", &Layer::new("context_embedder", 0));
        let time = "time_text_embed.timestep_embedder";
        t.add_layer(&format!("{time}.linear_1"), &Layer::new("t_embedder_0", 0));
        t.add_layer(&format!("{time}.linear_2"), &Layer::new("t_embedder_1", 0));
        t.merge(self.blocks.mapping(convention)?);
        let scale = Layer::new("ada_ln_0", 0);
        let shift = Layer::new("ada_ln_1", 0);
        t.add_fused_layers("norm_out.linear", &[&scale, &shift])?;
        t.add_layer("proj_out", &Layer::new("linear", 0));
        debug!(entries = t.len(), "built qwen-image mapping");
        Ok(t)
    }
}
