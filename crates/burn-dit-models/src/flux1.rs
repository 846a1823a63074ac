//! Flux.1
//!
//! Dual-stream blocks followed by single-stream blocks, 128-channel heads.
//! Checkpoints ship either in the Black Forest Labs layout
//! (`double_blocks.N.img_attn.qkv`) or the diffusers layout
//! (`transformer_blocks.N.attn.to_q`).
//!
//! # Sequence layout
//!
//! ```text
//! [caption tokens][image patches][reference 0][reference 1]...
//!  (0, 0, 0)       (0, y, x)      (1, y + dy, x + dx)
//! ```

use burn_dit_convert::{
    FuseAxis, Layer, MappingError, MappingTable, NamingConvention, ParameterId, WeightMapper,
};
use burn_dit_core::{ConfigurationError, Coordinate, Region, RopeLayout};
use serde::Serialize;
use tracing::debug;

use crate::geometry::{Geometry, ReferenceImage, eighths_layout};
use crate::stream::StreamLayers;

/// Channels per attention head
pub const HEAD_DIM: usize = 128;

/// Flux.1 configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Flux1Config {
    /// Hidden size
    pub channels: usize,
    /// Number of dual-stream and single-stream blocks
    pub layers: (usize, usize),
    /// Guidance-distilled checkpoints carry a guidance embedder
    pub guidance_embed: bool,
}

impl Flux1Config {
    /// Flux.1-dev configuration
    pub fn dev() -> Self {
        Self {
            channels: 3072,
            layers: (19, 38),
            guidance_embed: true,
        }
    }

    /// Flux.1-schnell configuration (same blocks, no guidance embedder)
    pub fn schnell() -> Self {
        Self {
            guidance_embed: false,
            ..Self::dev()
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

    /// RoPE layout for one denoising call
    pub fn rope_layout(&self, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
        rope_layout(HEAD_DIM, geometry)
    }

    pub fn mapper(&self) -> Flux1 {
        Flux1::new(self.clone())
    }
}

/// Offsets of each reference image inside the packed reference canvas
///
/// Each image goes to the right of the canvas when stacking it below would
/// make the canvas taller than wide, and below otherwise. This is a
/// heuristic: with three or more images of dissimilar aspect ratios the
/// packed canvas is not compact.
pub fn pack_references(references: &[ReferenceImage]) -> Vec<(usize, usize)> {
    let (mut h, mut w) = (0, 0);
    references
        .iter()
        .map(|r| {
            let (dy, dx) = if r.height + h > r.width + w {
                (0, w)
            } else {
                (h, 0)
            };
            h = h.max(r.height + dy);
            w = w.max(r.width + dx);
            (dy, dx)
        })
        .collect()
}

/// Tokens, image, then Kontext references on temporal coordinate 1
pub fn rope_layout(channels: usize, geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let axes = eighths_layout(channels)?;
    let mut regions = vec![
        Region::sequence("tokens", geometry.token_length, vec![Coordinate::zero(); 3]),
        Region::image(
            "image",
            geometry.height,
            geometry.width,
            vec![Coordinate::zero(), Coordinate::row(), Coordinate::column()],
        ),
    ];
    let offsets = pack_references(&geometry.references);
    for (n, (r, (dy, dx))) in geometry.references.iter().zip(offsets).enumerate() {
        regions.push(Region::image(
            format!("reference.{n}"),
            r.height,
            r.width,
            vec![
                Coordinate::constant(1.0),
                Coordinate::row().shifted(dy as f64),
                Coordinate::column().shifted(dx as f64),
            ],
        ));
    }
    Ok(RopeLayout::new(axes, regions).with_heads(geometry.heads))
}

/// Dual-stream block
#[derive(Debug, Clone)]
pub struct Flux1DoubleBlock {
    pub block: usize,
    pub context: StreamLayers,
    pub x: StreamLayers,
    /// The caption stream ends after attention
    pub context_block_pre_only: bool,
}

impl Flux1DoubleBlock {
    pub fn new(block: usize, index: usize, context_block_pre_only: bool) -> Self {
        Self {
            block,
            context: StreamLayers::gelu("c", index, if context_block_pre_only { 2 } else { 6 }),
            x: StreamLayers::gelu("x", index, 6),
            context_block_pre_only,
        }
    }

    fn generative_models(&self) -> Result<MappingTable, MappingError> {
        let p = format!("double_blocks.{}", self.block);
        let (c, x) = (&self.context, &self.x);
        let mut t = MappingTable::new();
        t.add_fused_layers(&format!("{p}.txt_attn.qkv"), &c.qkv())?;
        t.add(format!("{p}.txt_attn.norm.key_norm.scale"), c.norm_k.weight.clone());
        t.add(format!("{p}.txt_attn.norm.query_norm.scale"), c.norm_q.weight.clone());
        t.add_fused_layers(&format!("{p}.img_attn.qkv"), &x.qkv())?;
        t.add(format!("{p}.img_attn.norm.key_norm.scale"), x.norm_k.weight.clone());
        t.add(format!("{p}.img_attn.norm.query_norm.scale"), x.norm_q.weight.clone());
        if !self.context_block_pre_only {
            t.add_layer(&format!("{p}.txt_attn.proj"), &c.out);
            t.add_layer(&format!("{p}.txt_mlp.0"), &c.up[0]);
            t.add_layer(&format!("{p}.txt_mlp.2"), &c.down);
        }
        t.add_layer(&format!("{p}.img_attn.proj"), &x.out);
        t.add_layer(&format!("{p}.img_mlp.0"), &x.up[0]);
        t.add_layer(&format!("{p}.img_mlp.2"), &x.down);
        t.add_fused_layers(&format!("{p}.txt_mod.lin"), &c.ada_ln())?;
        t.add_fused_layers(&format!("{p}.img_mod.lin"), &x.ada_ln())?;
        Ok(t)
    }

    fn diffusers(&self) -> Result<MappingTable, MappingError> {
        let p = format!("transformer_blocks.{}", self.block);
        let (c, x) = (&self.context, &self.x);
        let mut t = MappingTable::new();
        t.add_layer(&format!("{p}.attn.to_q"), &x.q);
        t.add_layer(&format!("{p}.attn.to_k"), &x.k);
        t.add_layer(&format!("{p}.attn.to_v"), &x.v);
        t.add(format!("{p}.attn.norm_q.weight"), x.norm_q.weight.clone());
        t.add(format!("{p}.attn.norm_k.weight"), x.norm_k.weight.clone());
        t.add_layer(&format!("{p}.attn.add_q_proj"), &c.q);
        t.add_layer(&format!("{p}.attn.add_k_proj"), &c.k);
        t.add_layer(&format!("{p}.attn.add_v_proj"), &c.v);
        t.add(format!("{p}.attn.norm_added_q.weight"), c.norm_q.weight.clone());
        t.add(format!("{p}.attn.norm_added_k.weight"), c.norm_k.weight.clone());
        t.add_layer(&format!("{p}.attn.to_out.0"), &x.out);
        if !self.context_block_pre_only {
            t.add_layer(&format!("{p}.attn.to_add_out"), &c.out);
            t.add_layer(&format!("{p}.ff_context.net.0.proj"), &c.up[0]);
            t.add_layer(&format!("{p}.ff_context.net.2"), &c.down);
        }
        t.add_layer(&format!("{p}.ff.net.0.proj"), &x.up[0]);
        t.add_layer(&format!("{p}.ff.net.2"), &x.down);
        t.add_fused_layers(&format!("{p}.norm1.linear"), &x.ada_ln())?;
        t.add_fused_layers(&format!("{p}.norm1_context.linear"), &c.ada_ln())?;
        Ok(t)
    }
}

impl WeightMapper for Flux1DoubleBlock {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        match convention {
            NamingConvention::GenerativeModels => self.generative_models(),
            NamingConvention::Diffusers => self.diffusers(),
        }
    }
}

/// Single-stream block
///
/// Q, K, V and the MLP input share one fused projection; the attention
/// output and MLP output share one input-axis fused projection.
#[derive(Debug, Clone)]
pub struct Flux1SingleBlock {
    pub block: usize,
    pub x: StreamLayers,
    /// Hidden size, needed for the fused offsets
    pub channels: usize,
}

impl Flux1SingleBlock {
    pub fn new(block: usize, index: usize, channels: usize) -> Self {
        let mut x = StreamLayers::gelu("x", index, 3);
        // attention and MLP outputs are summed; only the MLP side has a bias
        x.out = Layer::no_bias("x_o", index);
        Self { block, x, channels }
    }

    fn qkv_mlp_offsets(&self) -> Vec<usize> {
        let c = self.channels;
        vec![0, c, 2 * c, 3 * c]
    }

    fn output_targets(&self) -> Vec<ParameterId> {
        vec![self.x.out.weight.clone(), self.x.down.weight.clone()]
    }
}

impl WeightMapper for Flux1SingleBlock {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let x = &self.x;
        let mut t = MappingTable::new();
        match convention {
            NamingConvention::GenerativeModels => {
                let p = format!("single_blocks.{}", self.block);
                let [q, k, v] = x.qkv();
                t.add_fused_layers_at(
                    &format!("{p}.linear1"),
                    &[q, k, v, &x.up[0]],
                    self.qkv_mlp_offsets(),
                )?;
                t.add(format!("{p}.norm.key_norm.scale"), x.norm_k.weight.clone());
                t.add(format!("{p}.norm.query_norm.scale"), x.norm_q.weight.clone());
                t.add_fused_at(
                    format!("{p}.linear2.weight"),
                    self.output_targets(),
                    FuseAxis::Input,
                    vec![0, self.channels],
                )?;
                if let Some(bias) = &x.down.bias {
                    t.add(format!("{p}.linear2.bias"), bias.clone());
                }
                t.add_fused_layers(&format!("{p}.modulation.lin"), &x.ada_ln())?;
            }
            NamingConvention::Diffusers => {
                let p = format!("single_transformer_blocks.{}", self.block);
                t.add_layer(&format!("{p}.attn.to_q"), &x.q);
                t.add_layer(&format!("{p}.attn.to_k"), &x.k);
                t.add_layer(&format!("{p}.attn.to_v"), &x.v);
                t.add(format!("{p}.attn.norm_q.weight"), x.norm_q.weight.clone());
                t.add(format!("{p}.attn.norm_k.weight"), x.norm_k.weight.clone());
                t.add_layer(&format!("{p}.proj_mlp"), &x.up[0]);
                t.add_fused_at(
                    format!("{p}.proj_out.weight"),
                    self.output_targets(),
                    FuseAxis::Input,
                    vec![0, self.channels],
                )?;
                if let Some(bias) = &x.down.bias {
                    t.add(format!("{p}.proj_out.bias"), bias.clone());
                }
                t.add_fused_layers(&format!("{p}.norm.linear"), &x.ada_ln())?;
            }
        }
        Ok(t)
    }
}

/// Whole Flux.1 transformer
#[derive(Debug, Clone)]
pub struct Flux1 {
    pub config: Flux1Config,
    pub double_blocks: Vec<Flux1DoubleBlock>,
    pub single_blocks: Vec<Flux1SingleBlock>,
}

impl Flux1 {
    pub fn new(config: Flux1Config) -> Self {
        let (double, single) = config.layers;
        let double_blocks = (0..double)
            .map(|i| Flux1DoubleBlock::new(i, i, false))
            .collect();
        let single_blocks = (0..single)
            .map(|i| Flux1SingleBlock::new(i, double + i, config.channels))
            .collect();
        Self {
            config,
            double_blocks,
            single_blocks,
        }
    }

    fn top_level(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let x_embedder = Layer::new("x_embedder", 0);
        let t_embedder = [Layer::new("t_embedder_0", 0), Layer::new("t_embedder_1", 0)];
        let g_embedder = [Layer::new("g_embedder_0", 0), Layer::new("g_embedder_1", 0)];
        let y_embedder = [Layer::new("y_embedder_0", 0), Layer::new("y_embedder_1", 0)];
        let context_embedder = Layer::new("context_embedder", 0);
        let scale = Layer::new("ada_ln_0", 0);
        let shift = Layer::new("ada_ln_1", 0);
        let proj_out = Layer::new("linear", 0);

        let mut t = MappingTable::new();
        match convention {
            NamingConvention::GenerativeModels => {
                t.add_layer("img_in", &x_embedder);
                t.add_layer("time_in.in_layer", &t_embedder[0]);
                t.add_layer("time_in.out_layer", &t_embedder[1]);
                if self.config.guidance_embed {
                    t.add_layer("guidance_in.in_layer", &g_embedder[0]);
                    t.add_layer("guidance_in.out_layer", &g_embedder[1]);
                }
                t.add_layer("vector_in.in_layer", &y_embedder[0]);
                t.add_layer("vector_in.out_layer", &y_embedder[1]);
                t.add_layer("txt_in", &context_embedder);
                t.add_fused_layers("final_layer.adaLN_modulation.1", &[&shift, &scale])?;
                t.add_layer("final_layer.linear", &proj_out);
            }
            NamingConvention::Diffusers => {
                t.add_layer("x_embedder", &x_embedder);
                let time = "time_text_embed.timestep_embedder";
                t.add_layer(&format!("{time}.linear_1"), &t_embedder[0]);
                t.add_layer(&format!("{time}.linear_2"), &t_embedder[1]);
                if self.config.guidance_embed {
                    let guidance = "time_text_embed.guidance_embedder";
                    t.add_layer(&format!("{guidance}.linear_1"), &g_embedder[0]);
                    t.add_layer(&format!("{guidance}.linear_2"), &g_embedder[1]);
                }
                t.add_layer("time_text_embed.text_embedder.linear_1", &y_embedder[0]);
                t.add_layer("time_text_embed.text_embedder.linear_2", &y_embedder[1]);
                t.add_layer("context_embedder", &context_embedder);
                t.add_fused_layers("norm_out.linear", &[&scale, &shift])?;
                t.add_layer("proj_out", &proj_out);
            }
        }
        Ok(t)
    }
}

impl WeightMapper for Flux1 {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let mut table = self.top_level(convention)?;
        table.merge(self.double_blocks.mapping(convention)?);
        table.merge(self.single_blocks.mapping(convention)?);
        debug!(
            convention = %convention,
            entries = table.len(),
            "built flux1 mapping"
        );
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_dit_convert::Split;

    #[test]
    fn test_flux1_configs() {
        assert_eq!(Flux1Config::dev().heads(), 24);
        assert!(!Flux1Config::schnell().guidance_embed);
        assert_eq!(Flux1Config::tiny().heads(), 2);
    }

    #[test]
    fn test_tokens_precede_image() {
        let layout = rope_layout(128, &Geometry::image(2, 3).with_tokens(4)).unwrap();
        assert_eq!(layout.region_range("tokens"), Some(0..4));
        assert_eq!(layout.region_range("image"), Some(4..10));
        let table = layout.build().unwrap();
        // (y=1, x=2): first vertical pair sees theta 1, first horizontal theta 2
        assert!((table.pair(9, 0, 8).0 - 1f32.cos()).abs() < 1e-6);
        assert!((table.pair(9, 0, 36).1 - 2f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_image_index_uses_width_stride() {
        let layout = rope_layout(128, &Geometry::image(2, 3)).unwrap();
        let table = layout.build().unwrap();
        // position 3 is (y=1, x=0) on a 2x3 grid
        assert!((table.pair(3, 0, 8).1 - 1f32.sin()).abs() < 1e-6);
        assert_eq!(table.pair(3, 0, 36), (1.0, 0.0));
    }

    #[test]
    fn test_pack_two_references() {
        let refs = [ReferenceImage::new(4, 4), ReferenceImage::new(4, 4)];
        // ties stack below
        assert_eq!(pack_references(&refs), vec![(0, 0), (4, 0)]);
    }

    #[test]
    fn test_pack_tall_then_wide() {
        let refs = [ReferenceImage::new(6, 2), ReferenceImage::new(2, 6)];
        assert_eq!(pack_references(&refs), vec![(0, 0), (6, 0)]);
    }

    #[test]
    fn test_pack_three_dissimilar_references() {
        // known heuristic boundary: placement only looks at the running
        // bounding box, so the canvas ends up sparse
        let refs = [
            ReferenceImage::new(1, 8),
            ReferenceImage::new(8, 1),
            ReferenceImage::new(1, 1),
        ];
        let offsets = pack_references(&refs);
        assert_eq!(offsets, vec![(0, 0), (1, 0), (0, 8)]);
    }

    #[test]
    fn test_reference_temporal_constant() {
        let g = Geometry::image(2, 2).with_reference(2, 2);
        let table = rope_layout(128, &g).unwrap().build().unwrap();
        assert!((table.pair(4, 0, 0).0 - 1f32.cos()).abs() < 1e-6);
        assert_eq!(table.pair(0, 0, 0), (1.0, 0.0));
    }

    #[test]
    fn test_double_block_generative_names() {
        let t = Flux1DoubleBlock::new(3, 3, false)
            .mapping(NamingConvention::GenerativeModels)
            .unwrap();
        let qkv = t.lookup("double_blocks.3.img_attn.qkv.weight").unwrap();
        assert_eq!(
            qkv.targets(),
            &[
                ParameterId::weight("x_q", 3),
                ParameterId::weight("x_k", 3),
                ParameterId::weight("x_v", 3)
            ]
        );
        assert_eq!(
            t.lookup("double_blocks.3.txt_mod.lin.bias").unwrap().targets().len(),
            6
        );
        assert!(t.contains("double_blocks.3.txt_mlp.2.bias"));
    }

    #[test]
    fn test_pre_only_context_drops_outputs() {
        let t = Flux1DoubleBlock::new(0, 0, true)
            .mapping(NamingConvention::Diffusers)
            .unwrap();
        assert!(!t.contains("transformer_blocks.0.attn.to_add_out.weight"));
        assert_eq!(
            t.lookup("transformer_blocks.0.norm1_context.linear.weight")
                .unwrap()
                .targets()
                .len(),
            2
        );
    }

    #[test]
    fn test_single_block_offsets() {
        let block = Flux1SingleBlock::new(0, 19, 3072);
        let t = block.mapping(NamingConvention::GenerativeModels).unwrap();
        let linear1 = t.lookup("single_blocks.0.linear1.weight").unwrap();
        assert_eq!(linear1.targets().len(), 4);
        assert_eq!(
            linear1.slices(3072 * 7).unwrap(),
            vec![0..3072, 3072..6144, 6144..9216, 9216..21504]
        );
        let linear2 = t.lookup("single_blocks.0.linear2.weight").unwrap();
        assert!(matches!(linear2.split(), Split::Offsets { axis: FuseAxis::Input, .. }));
        assert_eq!(
            t.lookup("single_blocks.0.linear2.bias").unwrap().targets(),
            &[ParameterId::bias("x_out_proj", 19)]
        );
    }

    #[test]
    fn test_final_modulation_order_differs_by_convention() {
        let model = Flux1Config::tiny().mapper();
        let generative = model.mapping(NamingConvention::GenerativeModels).unwrap();
        let diffusers = model.mapping(NamingConvention::Diffusers).unwrap();
        let shift = ParameterId::weight("ada_ln_1", 0);
        assert_eq!(
            generative
                .lookup("final_layer.adaLN_modulation.1.weight")
                .unwrap()
                .targets()[0],
            shift
        );
        assert_eq!(diffusers.lookup("norm_out.linear.weight").unwrap().targets()[1], shift);
    }

    #[test]
    fn test_conventions_cover_same_parameters() {
        let model = Flux1Config::tiny().mapper();
        let generative = model.mapping(NamingConvention::GenerativeModels).unwrap();
        let diffusers = model.mapping(NamingConvention::Diffusers).unwrap();
        assert_eq!(generative.parameters(), diffusers.parameters());
        assert!(generative.collisions().is_empty());
        assert!(diffusers.collisions().is_empty());
    }

    #[test]
    fn test_schnell_has_no_guidance() {
        let t = Flux1Config::schnell()
            .mapper()
            .mapping(NamingConvention::GenerativeModels)
            .unwrap();
        assert!(!t.contains("guidance_in.in_layer.weight"));
        assert!(t.contains("single_blocks.37.modulation.lin.weight"));
    }
}
