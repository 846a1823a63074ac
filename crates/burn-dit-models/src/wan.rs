//! Wan 2.1
//!
//! Video DiT: every block runs self-attention over the latent video,
//! cross-attention into the text embedding, then a GELU MLP. Per-block
//! modulation is a learned `[1, 6, C]` table added to a shared time
//! projection.

use burn_dit_convert::{
    FuseAxis, Layer, MappingError, MappingTable, NamedTensorRef, NamingConvention, WeightMapper,
};
use burn_dit_core::{ConfigurationError, Coordinate, Region, RopeLayout};
use serde::Serialize;
use tracing::debug;

use crate::geometry::{Geometry, spatial_remainder_layout};

pub const HEAD_DIM: usize = 128;

/// Divisor applied inside an upcast feed-forward
pub const FFN_UPCAST_SCALE: f32 = 8.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WanConfig {
    pub channels: usize,
    pub layers: usize,
    pub intermediate_size: usize,
    /// Run the feed-forward output in f32, pre-dividing by 8
    pub upcast_ffn: bool,
}

impl WanConfig {
    /// Wan 2.1 14B
    pub fn t2v_14b() -> Self {
        Self {
            channels: 5120,
            layers: 40,
            intermediate_size: 13_824,
            upcast_ffn: false,
        }
    }

    /// Wan 2.1 1.3B
    pub fn t2v_1_3b() -> Self {
        Self {
            channels: 1536,
            layers: 30,
            intermediate_size: 8960,
            upcast_ffn: false,
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self {
            channels: 256,
            layers: 2,
            intermediate_size: 512,
            upcast_ffn: true,
        }
    }

    pub fn heads(&self) -> usize {
        self.channels / HEAD_DIM
    }

    pub fn rope_layout(&self, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
        rope_layout(HEAD_DIM, geometry)
    }

    pub fn mapper(&self) -> Wan {
        Wan::new(self.clone())
    }
}

/// `t C - 2d, y d, x d` with `d = (C / 6) * 2` over the latent video
///
/// The temporal axis is present but carries coordinate 0 for every frame.
pub fn rope_layout(channels: usize, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let axes = spatial_remainder_layout(channels, (channels / 6) * 2)?;
    let video = Region::grid(
        "video",
        geometry.time,
        geometry.height,
        geometry.width,
        vec![Coordinate::zero(), Coordinate::row(), Coordinate::column()],
    );
    Ok(RopeLayout::new(axes, vec![video]).with_heads(geometry.heads))
}

/// Self-attention, cross-attention and feed-forward of one block
#[derive(Debug, Clone)]
pub struct WanAttentionBlock {
    pub block: usize,
    pub self_attention: [Layer; 4],
    pub self_norms: [Layer; 2],
    pub cross_attention: [Layer; 4],
    pub cross_norms: [Layer; 2],
    pub norm3: Layer,
    pub ffn: [Layer; 2],
    pub modulation: Vec<Layer>,
    pub upcast_ffn: bool,
}

impl WanAttentionBlock {
    pub fn new(block: usize, index: usize, upcast_ffn: bool) -> Self {
        let dense = |name: &str| Layer::new(name, index);
        let norm = |name: &str| Layer::no_bias(name, index);
        Self {
            block,
            self_attention: [dense("x_q"), dense("x_k"), dense("x_v"), dense("x_o")],
            self_norms: [norm("x_norm_q"), norm("x_norm_k")],
            cross_attention: [dense("x_c_q"), dense("c_k"), dense("c_v"), dense("c_o")],
            cross_norms: [norm("x_c_norm_q"), norm("c_norm_k")],
            norm3: dense("x_norm_3"),
            ffn: [dense("x_linear1"), dense("x_out_proj")],
            modulation: (0..6)
                .map(|i| norm(&format!("attn_ada_ln_{i}")))
                .collect(),
            upcast_ffn,
        }
    }

    fn add_attention(t: &mut MappingTable, prefix: &str, names: [&str; 4], layers: &[Layer; 4]) {
        for (name, layer) in names.iter().zip(layers) {
            t.add_layer(&format!("{prefix}.{name}"), layer);
        }
    }
}

impl WeightMapper for WanAttentionBlock {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let p = format!("blocks.{}", self.block);
        let mut t = MappingTable::new();
        let (self_attn, cross_attn, projections, norm3, ffn, modulation) = match convention {
            NamingConvention::GenerativeModels => (
                "self_attn",
                "cross_attn",
                ["q", "k", "v", "o"],
                "norm3",
                ["ffn.0", "ffn.2"],
                "modulation",
            ),
            NamingConvention::Diffusers => (
                "attn1",
                "attn2",
                ["to_q", "to_k", "to_v", "to_out.0"],
                "norm2",
                ["ffn.net.0.proj", "ffn.net.2"],
                "scale_shift_table",
            ),
        };

        let attn = format!("{p}.{self_attn}");
        Self::add_attention(&mut t, &attn, projections, &self.self_attention);
        t.add(format!("{attn}.norm_q.weight"), self.self_norms[0].weight.clone());
        t.add(format!("{attn}.norm_k.weight"), self.self_norms[1].weight.clone());

        let attn = format!("{p}.{cross_attn}");
        Self::add_attention(&mut t, &attn, projections, &self.cross_attention);
        t.add(format!("{attn}.norm_q.weight"), self.cross_norms[0].weight.clone());
        t.add(format!("{attn}.norm_k.weight"), self.cross_norms[1].weight.clone());

        t.add_layer(&format!("{p}.{norm3}"), &self.norm3);
        t.add_layer(&format!("{p}.{}", ffn[0]), &self.ffn[0]);
        t.add(format!("{p}.{}.weight", ffn[1]), self.ffn[1].weight.clone());
        if let Some(bias) = &self.ffn[1].bias {
            let mut entry = NamedTensorRef::single(bias.clone());
            if self.upcast_ffn {
                entry = entry.with_scale(1.0 / FFN_UPCAST_SCALE);
            }
            t.insert(format!("{p}.{}.bias", ffn[1]), entry);
        }
        t.add_fused(
            format!("{p}.{modulation}"),
            self.modulation.iter().map(|l| l.weight.clone()).collect(),
            FuseAxis::Output,
        )?;
        Ok(t)
    }
}

/// Whole Wan transformer
#[derive(Debug, Clone)]
pub struct Wan {
    pub config: WanConfig,
    pub blocks: Vec<WanAttentionBlock>,
}

impl Wan {
    pub fn new(config: WanConfig) -> Self {
        let blocks = (0..config.layers)
            .map(|i| WanAttentionBlock::new(i, i, config.upcast_ffn))
            .collect();
        Self { config, blocks }
    }
}

impl WeightMapper for Wan {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let x_embedder = Layer::new("x_embedder", 0);
        let text = [Layer::new("text_embedder_0", 0), Layer::new("text_embedder_1", 0)];
        let time = [Layer::new("t_embedder_0", 0), Layer::new("t_embedder_1", 0)];
        let time_projection: Vec<Layer> = (0..6)
            .map(|i| Layer::new(&format!("time_ada_ln_{i}"), 0))
            .collect();
        let time_projection: Vec<&Layer> = time_projection.iter().collect();
        let proj_out = Layer::new("linear", 0);
        let head_modulation = vec![
            Layer::no_bias("head_ada_ln_1", 0).weight,
            Layer::no_bias("head_ada_ln_0", 0).weight,
        ];

        let mut t = MappingTable::new();
        t.add_layer("patch_embedding", &x_embedder);
        match convention {
            NamingConvention::GenerativeModels => {
                t.add_layer("text_embedding.0", &text[0]);
                t.add_layer("text_embedding.2", &text[1]);
                t.add_layer("time_embedding.0", &time[0]);
                t.add_layer("time_embedding.2", &time[1]);
                t.add_fused_layers("time_projection.1", &time_projection)?;
                t.add_layer("head.head", &proj_out);
                t.add_fused("head.modulation", head_modulation, FuseAxis::Output)?;
            }
            NamingConvention::Diffusers => {
                let embedder = "condition_embedder";
                t.add_layer(&format!("{embedder}.text_embedder.linear_1"), &text[0]);
                t.add_layer(&format!("{embedder}.text_embedder.linear_2"), &text[1]);
                t.add_layer(&format!("{embedder}.time_embedder.linear_1"), &time[0]);
                t.add_layer(&format!("{embedder}.time_embedder.linear_2"), &time[1]);
                t.add_fused_layers(&format!("{embedder}.time_proj"), &time_projection)?;
                t.add_layer("proj_out", &proj_out);
                t.add_fused("scale_shift_table", head_modulation, FuseAxis::Output)?;
            }
        }
        t.merge(self.blocks.mapping(convention)?);
        debug!(
            convention = %convention,
            entries = t.len(),
            "built wan mapping"
        );
        Ok(t)
    }
}
