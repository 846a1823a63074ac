//! Z-Image
//!
//! Single-stream DiT. Captions and image patches are first refined
//! separately (two refiner blocks each, only the image refiner is
//! modulated) and then concatenated for the main layers.
//!
//! The checkpoint vocabulary is the same for both naming conventions.

use burn_dit_convert::{Layer, MappingError, MappingTable, NamingConvention, WeightMapper};
use burn_dit_core::{AxisKind, AxisLayout, ConfigurationError, Coordinate, Frequency, Region, RopeLayout};
use serde::Serialize;
use tracing::debug;

use crate::geometry::Geometry;

pub const HEAD_DIM: usize = 128;

pub const ROPE_FREQUENCY: Frequency = Frequency::Inverse { base: 256.0 };

/// Number of caption and of image refiner blocks
pub const REFINER_LAYERS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZImageConfig {
    pub channels: usize,
    pub layers: usize,
}

impl ZImageConfig {
    /// Z-Image 6B
    pub fn base() -> Self {
        Self {
            channels: 3840,
            layers: 30,
        }
    }

    /// Tiny model for testing
    pub fn tiny() -> Self {
        Self {
            channels: 256,
            layers: 2,
        }
    }

    pub fn heads(&self) -> usize {
        self.channels / HEAD_DIM
    }

    pub fn mapper(&self) -> ZImage {
        ZImage::new(self.clone())
    }
}

fn axes() -> Result<AxisLayout, ConfigurationError> {
    AxisLayout::aligned(
        HEAD_DIM,
        ROPE_FREQUENCY,
        &[
            (AxisKind::Temporal, 32),
            (AxisKind::Vertical, 48),
            (AxisKind::Horizontal, 48),
        ],
    )
}

/// Caption table: token `i` sits at temporal `i + 1`
pub fn caption_rope_layout(geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let tokens = Region::sequence(
        "tokens",
        geometry.token_length,
        vec![
            Coordinate::index().shifted(1.0),
            Coordinate::zero(),
            Coordinate::zero(),
        ],
    );
    Ok(RopeLayout::new(axes()?, vec![tokens]).with_heads(geometry.heads))
}

/// Image table: every patch sits at temporal `token_length + 1`, one past
/// the last caption token
pub fn image_rope_layout(geometry: &Geometry) -> Result<RopeLayout, ConfigurationError> {
    let image = Region::image(
        "image",
        geometry.height,
        geometry.width,
        vec![
            Coordinate::constant((geometry.token_length + 1) as f64),
            Coordinate::row(),
            Coordinate::column(),
        ],
    );
    Ok(RopeLayout::new(axes()?, vec![image]).with_heads(geometry.heads))
}

/// Attention and SwiGLU block, shared by refiners and main layers
#[derive(Debug, Clone)]
pub struct ZImageBlock {
    /// Checkpoint prefix, e.g. `layers.3` or `noise_refiner.0`
    pub prefix: String,
    pub q: Layer,
    pub k: Layer,
    pub v: Layer,
    pub o: Layer,
    pub norm_q: Layer,
    pub norm_k: Layer,
    pub attention_norms: [Layer; 2],
    /// `w1`, `w2`, `w3`
    pub feed_forward: [Layer; 3],
    pub ffn_norms: [Layer; 2],
    pub ada_ln: Option<[Layer; 4]>,
}

impl ZImageBlock {
    pub fn new(prefix: impl Into<String>, family: &str, index: usize, modulation: bool) -> Self {
        let layer = |name: &str| Layer::no_bias(&format!("{family}_{name}"), index);
        Self {
            prefix: prefix.into(),
            q: layer("q"),
            k: layer("k"),
            v: layer("v"),
            o: layer("o"),
            norm_q: layer("norm_q"),
            norm_k: layer("norm_k"),
            attention_norms: [layer("attention_norm1"), layer("attention_norm2")],
            feed_forward: [layer("w1"), layer("w2"), layer("w3")],
            ffn_norms: [layer("ffn_norm1"), layer("ffn_norm2")],
            ada_ln: modulation.then(|| {
                [0, 1, 2, 3].map(|i| Layer::new(&format!("{family}_ada_ln_{i}"), index))
            }),
        }
    }
}

impl WeightMapper for ZImageBlock {
    fn mapping(&self, _: NamingConvention) -> Result<MappingTable, MappingError> {
        let p = &self.prefix;
        let mut t = MappingTable::new();
        t.add_layer(&format!("{p}.attention.to_q"), &self.q);
        t.add_layer(&format!("{p}.attention.to_k"), &self.k);
        t.add_layer(&format!("{p}.attention.to_v"), &self.v);
        t.add_layer(&format!("{p}.attention.to_out.0"), &self.o);
        t.add_layer(&format!("{p}.attention.norm_q"), &self.norm_q);
        t.add_layer(&format!("{p}.attention.norm_k"), &self.norm_k);
        t.add_layer(&format!("{p}.attention_norm1"), &self.attention_norms[0]);
        t.add_layer(&format!("{p}.attention_norm2"), &self.attention_norms[1]);
        for (name, layer) in ["w1", "w2", "w3"].iter().zip(&self.feed_forward) {
            t.add_layer(&format!("{p}.feed_forward.{name}"), layer);
        }
        t.add_layer(&format!("{p}.ffn_norm1"), &self.ffn_norms[0]);
        t.add_layer(&format!("{p}.ffn_norm2"), &self.ffn_norms[1]);
        if let Some(ada_ln) = &self.ada_ln {
            let chunks: Vec<&Layer> = ada_ln.iter().collect();
            t.add_fused_layers(&format!("{p}.adaLN_modulation.0"), &chunks)?;
        }
        Ok(t)
    }
}

/// Whole Z-Image transformer
#[derive(Debug, Clone)]
pub struct ZImage {
    pub config: ZImageConfig,
    pub context_refiner: Vec<ZImageBlock>,
    pub noise_refiner: Vec<ZImageBlock>,
    pub layers: Vec<ZImageBlock>,
}

impl ZImage {
    pub fn new(config: ZImageConfig) -> Self {
        let refiner = |family: &str, modulation: bool| -> Vec<ZImageBlock> {
            (0..REFINER_LAYERS)
                .map(|i| ZImageBlock::new(format!("{family}.{i}"), family, i, modulation))
                .collect()
        };
        Self {
            context_refiner: refiner("context_refiner", false),
            noise_refiner: refiner("noise_refiner", true),
            layers: (0..config.layers)
                .map(|i| ZImageBlock::new(format!("layers.{i}"), "layer", i, true))
                .collect(),
            config,
        }
    }
}

impl WeightMapper for ZImage {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let mut t = MappingTable::new();
        t.add_layer("all_x_embedder.2-1", &Layer::new("x_embedder", 0));
        t.add_layer("cap_embedder.0", &Layer::no_bias("cap_norm", 0));
        t.add_layer("cap_embedder.1", &Layer::new("cap_embedder", 0));
        t.add_layer("t_embedder.mlp.0", &Layer::new("t_embedder_0", 0));
        t.add_layer("t_embedder.mlp.2", &Layer::new("t_embedder_1", 0));
        t.merge(self.context_refiner.mapping(convention)?);
        t.merge(self.noise_refiner.mapping(convention)?);
        t.merge(self.layers.mapping(convention)?);
        t.add_layer(
            "all_final_layer.2-1.adaLN_modulation.1",
            &Layer::new("ada_ln_final", 0),
        );
        t.add_layer("all_final_layer.2-1.linear", &Layer::new("linear_final", 0));
        debug!(entries = t.len(), "built z-image mapping");
        Ok(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_dit_convert::ParameterId;

    #[test]
    fn test_caption_offset_by_one() {
        let table = caption_rope_layout(&Geometry::image(0, 0).with_tokens(2))
            .unwrap()
            .build()
            .unwrap();
        // token 0 is at temporal 1, never the identity
        assert!((table.pair(0, 0, 0).1 - 1f32.sin()).abs() < 1e-6);
        assert!((table.pair(1, 0, 0).1 - 2f32.sin()).abs() < 1e-6);
        assert_eq!(table.pair(1, 0, 16), (1.0, 0.0));
    }

    #[test]
    fn test_image_follows_captions() {
        let g = Geometry::image(2, 2).with_tokens(5);
        let table = image_rope_layout(&g).unwrap().build().unwrap();
        assert_eq!(table.sequence_len(), 4);
        assert!((table.pair(0, 0, 0).0 - 6f32.cos()).abs() < 1e-6);
        // (y=1, x=1) on the first vertical pair
        assert!((table.pair(3, 0, 16).1 - 1f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_refiners_and_modulation() {
        let t = ZImageConfig::tiny()
            .mapper()
            .mapping(NamingConvention::Diffusers)
            .unwrap();
        assert!(!t.contains("context_refiner.0.adaLN_modulation.0.weight"));
        let m = t.lookup("noise_refiner.1.adaLN_modulation.0.bias").unwrap();
        assert_eq!(m.targets()[3], ParameterId::bias("noise_refiner_ada_ln_3", 1));
        assert_eq!(
            t.lookup("layers.1.feed_forward.w3.weight").unwrap().targets(),
            &[ParameterId::weight("layer_w3", 1)]
        );
        assert!(t.collisions().is_empty());
    }

    #[test]
    fn test_single_vocabulary() {
        let model = ZImageConfig::tiny().mapper();
        assert_eq!(
            model.mapping(NamingConvention::GenerativeModels).unwrap(),
            model.mapping(NamingConvention::Diffusers).unwrap()
        );
    }
}
