//! Flux.2
//!
//! Bias-free blocks with SwiGLU MLPs. Modulation is not per block: one
//! fixed set of projections produces the modulation for every dual-stream
//! and every single-stream block.
//!
//! # Sequence layout
//!
//! ```text
//! [image patches][reference 0][reference 1]...[caption tokens]
//!  (0, y, x, 0)   (10, y, x, 0) (20, y, x, 0)   (0, 0, 0, i)
//! ```

use burn_dit_convert::{
    FuseAxis, Layer, MappingError, MappingTable, NamingConvention, ParameterId, WeightMapper,
};
use burn_dit_core::{
    AxisKind, AxisLayout, ConfigurationError, Coordinate, Frequency, Region, RopeLayout,
};
use serde::Serialize;
use tracing::debug;

use crate::geometry::Geometry;
use crate::stream::StreamLayers;

pub const HEAD_DIM: usize = 128;

pub const ROPE_FREQUENCY: Frequency = Frequency::Inverse { base: 2_000.0 };

/// Temporal coordinate step between reference images
pub const REFERENCE_STRIDE: f64 = 10.0;

/// Flux.2 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flux2Config {
    pub channels: usize,
    pub layers: (usize, usize),
    pub guidance_embed: bool,
}

impl Flux2Config {
    /// Flux.2-dev configuration
    pub fn dev() -> Self {
        Self {
            channels: 6144,
            layers: (8, 48),
            guidance_embed: true,
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self {
            channels: 256,
            layers: (2, 2),
            guidance_embed: true,
        }
    }

    pub fn heads(&self) -> usize {
        self.channels / HEAD_DIM
    }

    pub fn rope_layout(&self, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
        rope_layout(HEAD_DIM, geometry)
    }

    pub fn mapper(&self) -> Flux2 {
        Flux2::new(self.clone())
    }
}

/// Four equal axes; reference image `n` sits at temporal `10 (n + 1)`
pub fn rope_layout(channels: usize, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let quarter = channels / 4;
    let axes = AxisLayout::aligned(
        channels,
        ROPE_FREQUENCY,
        &[
            (AxisKind::Temporal, quarter),
            (AxisKind::Vertical, quarter),
            (AxisKind::Horizontal, quarter),
            (AxisKind::Token, quarter),
        ],
    )?;
    let mut regions = vec![Region::image(
        "image",
        geometry.height,
        geometry.width,
        vec![
            Coordinate::zero(),
            Coordinate::row(),
            Coordinate::column(),
            Coordinate::zero(),
        ],
    )];
    for (n, r) in geometry.references.iter().enumerate() {
        regions.push(Region::image(
            format!("reference.{n}"),
            r.height,
            r.width,
            vec![
                Coordinate::constant(REFERENCE_STRIDE * (n + 1) as f64),
                Coordinate::row(),
                Coordinate::column(),
                Coordinate::zero(),
            ],
        ));
    }
    regions.push(Region::sequence(
        "tokens",
        geometry.token_length,
        vec![
            Coordinate::zero(),
            Coordinate::zero(),
            Coordinate::zero(),
            Coordinate::index(),
        ],
    ));
    Ok(RopeLayout::new(axes, regions).with_heads(geometry.heads))
}

/// Dual-stream block
#[derive(Debug, Clone)]
pub struct Flux2DoubleBlock {
    pub block: usize,
    pub context: StreamLayers,
    pub x: StreamLayers,
}

impl Flux2DoubleBlock {
    pub fn new(block: usize, index: usize) -> Self {
        Self {
            block,
            context: StreamLayers::swiglu("c", index, 0),
            x: StreamLayers::swiglu("x", index, 0),
        }
    }
}

impl WeightMapper for Flux2DoubleBlock {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let (c, x) = (&self.context, &self.x);
        let mut t = MappingTable::new();
        match convention {
            NamingConvention::GenerativeModels => {
                let p = format!("double_blocks.{}", self.block);
                t.add_fused_layers(&format!("{p}.txt_attn.qkv"), &c.qkv())?;
                t.add(format!("{p}.txt_attn.norm.key_norm.scale"), c.norm_k.weight.clone());
                t.add(format!("{p}.txt_attn.norm.query_norm.scale"), c.norm_q.weight.clone());
                t.add_fused_layers(&format!("{p}.img_attn.qkv"), &x.qkv())?;
                t.add(format!("{p}.img_attn.norm.key_norm.scale"), x.norm_k.weight.clone());
                t.add(format!("{p}.img_attn.norm.query_norm.scale"), x.norm_q.weight.clone());
                t.add_layer(&format!("{p}.txt_attn.proj"), &c.out);
                t.add_layer(&format!("{p}.img_attn.proj"), &x.out);
                t.add_fused_layers(&format!("{p}.txt_mlp.0"), &c.up())?;
                t.add_layer(&format!("{p}.txt_mlp.2"), &c.down);
                t.add_fused_layers(&format!("{p}.img_mlp.0"), &x.up())?;
                t.add_layer(&format!("{p}.img_mlp.2"), &x.down);
            }
            NamingConvention::Diffusers => {
                let p = format!("transformer_blocks.{}", self.block);
                t.add_layer(&format!("{p}.attn.add_q_proj"), &c.q);
                t.add_layer(&format!("{p}.attn.add_k_proj"), &c.k);
                t.add_layer(&format!("{p}.attn.add_v_proj"), &c.v);
                t.add(format!("{p}.attn.norm_added_k.weight"), c.norm_k.weight.clone());
                t.add(format!("{p}.attn.norm_added_q.weight"), c.norm_q.weight.clone());
                t.add_layer(&format!("{p}.attn.to_q"), &x.q);
                t.add_layer(&format!("{p}.attn.to_k"), &x.k);
                t.add_layer(&format!("{p}.attn.to_v"), &x.v);
                t.add(format!("{p}.attn.norm_k.weight"), x.norm_k.weight.clone());
                t.add(format!("{p}.attn.norm_q.weight"), x.norm_q.weight.clone());
                t.add_layer(&format!("{p}.attn.to_add_out"), &c.out);
                t.add_layer(&format!("{p}.attn.to_out.0"), &x.out);
                t.add_fused_layers(&format!("{p}.ff_context.linear_in"), &c.up())?;
                t.add_layer(&format!("{p}.ff_context.linear_out"), &c.down);
                t.add_fused_layers(&format!("{p}.ff.linear_in"), &x.up())?;
                t.add_layer(&format!("{p}.ff.linear_out"), &x.down);
            }
        }
        Ok(t)
    }
}

/// Single-stream block
///
/// One projection produces Q, K, V and both SwiGLU inputs (each `3C`
/// wide), so the fused tensor splits at `[0, C, 2C, 3C, 6C]`.
#[derive(Debug, Clone)]
pub struct Flux2SingleBlock {
    pub block: usize,
    pub x: StreamLayers,
    pub channels: usize,
}

impl Flux2SingleBlock {
    pub fn new(block: usize, index: usize, channels: usize) -> Self {
        Self {
            block,
            x: StreamLayers::swiglu("x", index, 0),
            channels,
        }
    }

    pub fn qkv_mlp_offsets(&self) -> Vec<usize> {
        let c = self.channels;
        vec![0, c, 2 * c, 3 * c, 6 * c]
    }

    fn qkv_mlp_targets(&self) -> Vec<ParameterId> {
        let x = &self.x;
        [&x.q, &x.k, &x.v, &x.up[0], &x.up[1]]
            .iter()
            .map(|l| l.weight.clone())
            .collect()
    }

    fn output_targets(&self) -> Vec<ParameterId> {
        vec![self.x.out.weight.clone(), self.x.down.weight.clone()]
    }
}

impl WeightMapper for Flux2SingleBlock {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let (p, qkv_mlp, norm, out) = match convention {
            NamingConvention::GenerativeModels => (
                format!("single_blocks.{}", self.block),
                "linear1.weight",
                ("norm.key_norm.scale", "norm.query_norm.scale"),
                "linear2.weight",
            ),
            NamingConvention::Diffusers => (
                format!("single_transformer_blocks.{}", self.block),
                "attn.to_qkv_mlp_proj.weight",
                ("attn.norm_k.weight", "attn.norm_q.weight"),
                "attn.to_out.weight",
            ),
        };
        let mut t = MappingTable::new();
        t.add_fused_at(
            format!("{p}.{qkv_mlp}"),
            self.qkv_mlp_targets(),
            FuseAxis::Output,
            self.qkv_mlp_offsets(),
        )?;
        t.add(format!("{p}.{}", norm.0), self.x.norm_k.weight.clone());
        t.add(format!("{p}.{}", norm.1), self.x.norm_q.weight.clone());
        t.add_fused_at(
            format!("{p}.{out}"),
            self.output_targets(),
            FuseAxis::Input,
            vec![0, self.channels],
        )?;
        Ok(t)
    }
}

/// Conditioning embedders and the shared modulation projections
#[derive(Debug, Clone)]
pub struct Flux2Fixed {
    pub guidance_embed: bool,
    pub x_ada_ln: Vec<Layer>,
    pub context_ada_ln: Vec<Layer>,
    pub single_ada_ln: Vec<Layer>,
}

impl Flux2Fixed {
    pub fn new(guidance_embed: bool) -> Self {
        let chunks = |name: &str, n: usize| -> Vec<Layer> {
            (0..n)
                .map(|i| Layer::no_bias(&format!("{name}_ada_ln_{i}"), 0))
                .collect()
        };
        Self {
            guidance_embed,
            x_ada_ln: chunks("x", 6),
            context_ada_ln: chunks("context", 6),
            single_ada_ln: chunks("single", 3),
        }
    }
}

impl WeightMapper for Flux2Fixed {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let context_embedder = Layer::no_bias("context_embedder", 0);
        let t_embedder = [Layer::no_bias("t_embedder_0", 0), Layer::no_bias("t_embedder_1", 0)];
        let g_embedder = [Layer::no_bias("g_embedder_0", 0), Layer::no_bias("g_embedder_1", 0)];
        let scale = Layer::no_bias("ada_ln_0", 0);
        let shift = Layer::no_bias("ada_ln_1", 0);

        let mut t = MappingTable::new();
        match convention {
            NamingConvention::GenerativeModels => {
                t.add_layer("txt_in", &context_embedder);
                t.add_layer("time_in.in_layer", &t_embedder[0]);
                t.add_layer("time_in.out_layer", &t_embedder[1]);
                if self.guidance_embed {
                    t.add_layer("guidance_in.in_layer", &g_embedder[0]);
                    t.add_layer("guidance_in.out_layer", &g_embedder[1]);
                }
                t.add_fused_layers("double_stream_modulation_img.lin", &refs(&self.x_ada_ln))?;
                t.add_fused_layers(
                    "double_stream_modulation_txt.lin",
                    &refs(&self.context_ada_ln),
                )?;
                t.add_fused_layers("single_stream_modulation.lin", &refs(&self.single_ada_ln))?;
                t.add_fused_layers("final_layer.adaLN_modulation.1", &[&shift, &scale])?;
            }
            NamingConvention::Diffusers => {
                t.add_layer("context_embedder", &context_embedder);
                let time = "time_guidance_embed.timestep_embedder";
                t.add_layer(&format!("{time}.linear_1"), &t_embedder[0]);
                t.add_layer(&format!("{time}.linear_2"), &t_embedder[1]);
                if self.guidance_embed {
                    let guidance = "time_guidance_embed.guidance_embedder";
                    t.add_layer(&format!("{guidance}.linear_1"), &g_embedder[0]);
                    t.add_layer(&format!("{guidance}.linear_2"), &g_embedder[1]);
                }
                t.add_fused_layers(
                    "double_stream_modulation_img.linear",
                    &refs(&self.x_ada_ln),
                )?;
                t.add_fused_layers(
                    "double_stream_modulation_txt.linear",
                    &refs(&self.context_ada_ln),
                )?;
                t.add_fused_layers("single_stream_modulation.linear", &refs(&self.single_ada_ln))?;
                t.add_fused_layers("norm_out.linear", &[&scale, &shift])?;
            }
        }
        Ok(t)
    }
}

fn refs(layers: &[Layer]) -> Vec<&Layer> {
    layers.iter().collect()
}

/// Whole Flux.2 transformer
#[derive(Debug, Clone)]
pub struct Flux2 {
    pub config: Flux2Config,
    pub fixed: Flux2Fixed,
    pub double_blocks: Vec<Flux2DoubleBlock>,
    pub single_blocks: Vec<Flux2SingleBlock>,
}

impl Flux2 {
    pub fn new(config: Flux2Config) -> Self {
        let (double, single) = config.layers;
        Self {
            fixed: Flux2Fixed::new(config.guidance_embed),
            double_blocks: (0..double).map(|i| Flux2DoubleBlock::new(i, i)).collect(),
            single_blocks: (0..single)
                .map(|i| Flux2SingleBlock::new(i, double + i, config.channels))
                .collect(),
            config,
        }
    }
}

impl WeightMapper for Flux2 {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let x_embedder = Layer::no_bias("x_embedder", 0);
        let proj_out = Layer::no_bias("linear", 0);
        let mut table = MappingTable::new();
        match convention {
            NamingConvention::GenerativeModels => {
                table.add_layer("img_in", &x_embedder);
                table.add_layer("final_layer.linear", &proj_out);
            }
            NamingConvention::Diffusers => {
                table.add_layer("x_embedder", &x_embedder);
                table.add_layer("proj_out", &proj_out);
            }
        }
        table.merge(self.fixed.mapping(convention)?);
        table.merge(self.double_blocks.mapping(convention)?);
        table.merge(self.single_blocks.mapping(convention)?);
        debug!(
            convention = %convention,
            entries = table.len(),
            "built flux2 mapping"
        );
        Ok(table)
    }
}
