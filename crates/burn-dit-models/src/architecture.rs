//! Architecture registry
//!
//! Ties every supported model to its default position tables, its
//! checkpoint mapper and the marker used to tell its naming conventions
//! apart.

use std::fmt;
use std::str::FromStr;

use burn_dit_convert::{MappingError, MappingTable, NamingConvention, WeightMapper};
use burn_dit_core::{ConfigurationError, EncodingTensor};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::flux1::{self, Flux1Config};
use crate::flux2::{self, Flux2Config};
use crate::geometry::Geometry;
use crate::ltx2::Ltx2Config;
use crate::qwenimage::{self, QwenImageConfig};
use crate::wan::{self, WanConfig};
use crate::zimage::{self, ZImageConfig};
use crate::{hidream, hunyuan};

/// Errors from the architecture registry
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("{0} has no checkpoint mapping")]
    NoMapping(Architecture),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Architecture {
    Flux1,
    Flux2,
    HiDream,
    Hunyuan,
    Ltx2,
    QwenImage,
    Wan14B,
    Wan1_3B,
    ZImage,
}

impl Architecture {
    pub const ALL: [Architecture; 9] = [
        Architecture::Flux1,
        Architecture::Flux2,
        Architecture::HiDream,
        Architecture::Hunyuan,
        Architecture::Ltx2,
        Architecture::QwenImage,
        Architecture::Wan14B,
        Architecture::Wan1_3B,
        Architecture::ZImage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Flux1 => "flux1",
            Architecture::Flux2 => "flux2",
            Architecture::HiDream => "hidream",
            Architecture::Hunyuan => "hunyuan",
            Architecture::Ltx2 => "ltx2",
            Architecture::QwenImage => "qwen-image",
            Architecture::Wan14B => "wan-14b",
            Architecture::Wan1_3B => "wan-1.3b",
            Architecture::ZImage => "z-image",
        }
    }

    /// Model width of the published checkpoint
    pub fn channels(&self) -> usize {
        match self {
            Architecture::Flux1 => Flux1Config::dev().channels,
            Architecture::Flux2 => Flux2Config::dev().channels,
            Architecture::HiDream => 2560,
            Architecture::Hunyuan => 3072,
            Architecture::Ltx2 => Ltx2Config::base().video_channels,
            Architecture::QwenImage => QwenImageConfig::base().channels,
            Architecture::Wan14B => WanConfig::t2v_14b().channels,
            Architecture::Wan1_3B => WanConfig::t2v_1_3b().channels,
            Architecture::ZImage => ZImageConfig::base().channels,
        }
    }

    pub fn has_mapping(&self) -> bool {
        !matches!(
            self,
            Architecture::HiDream | Architecture::Hunyuan | Architecture::Ltx2
        )
    }

    /// Substring that only appears in diffusers-layout checkpoints
    ///
    /// `None` when the architecture only ships one layout.
    pub fn diffusers_marker(&self) -> Option<&'static str> {
        match self {
            Architecture::Flux1 => Some("single_transformer_blocks.37."),
            Architecture::Flux2 => Some("single_transformer_blocks.39.attn.to_qkv_mlp_proj."),
            Architecture::Wan14B => Some("blocks.39.attn2.to_v."),
            Architecture::Wan1_3B => Some("blocks.29.attn2.to_v."),
            Architecture::ZImage => Some("layers.29.attention.to_out.0."),
            Architecture::HiDream
            | Architecture::Hunyuan
            | Architecture::Ltx2
            | Architecture::QwenImage => None,
        }
    }

    /// Naming convention of a checkpoint given its tensor names
    pub fn detect_convention<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> NamingConvention {
        match self.diffusers_marker() {
            Some(marker) => NamingConvention::detect(names, marker),
            None => NamingConvention::Diffusers,
        }
    }

    /// Position tables of one denoising call, in the order the model
    /// consumes them
    pub fn rope_tables(
        &self,
        geometry: &Geometry,
    ) -> Result<Vec<(&'static str, EncodingTensor)>, ConfigurationError> {
        let tables = match self {
            Architecture::Flux1 => vec![("rot", flux1::rope_layout(flux1::HEAD_DIM, geometry)?.build()?)],
            Architecture::Flux2 => vec![("rot", flux2::rope_layout(flux2::HEAD_DIM, geometry)?.build()?)],
            Architecture::HiDream => {
                vec![("rot", hidream::rope_layout(hidream::HEAD_DIM, geometry)?.build()?)]
            }
            Architecture::Hunyuan => vec![
                ("video", hunyuan::video_rope_layout(hunyuan::HEAD_DIM, geometry)?.build()?),
                ("joint", hunyuan::joint_rope_layout(hunyuan::HEAD_DIM, geometry)?.build()?),
            ],
            Architecture::Ltx2 => {
                let tables = Ltx2Config::base().tables(geometry)?;
                vec![
                    ("video", tables.video),
                    ("audio", tables.audio),
                    ("video_to_audio", tables.video_to_audio),
                ]
            }
            Architecture::QwenImage => vec![(
                "rot",
                qwenimage::rope_layout(qwenimage::HEAD_DIM, geometry)?.build()?,
            )],
            Architecture::Wan14B | Architecture::Wan1_3B => {
                vec![("rot", wan::rope_layout(wan::HEAD_DIM, geometry)?.build()?)]
            }
            Architecture::ZImage => vec![
                ("tokens", zimage::caption_rope_layout(geometry)?.build()?),
                ("image", zimage::image_rope_layout(geometry)?.build()?),
            ],
        };
        debug!(
            architecture = self.name(),
            tables = tables.len(),
            "built rope tables"
        );
        Ok(tables)
    }

    /// Checkpoint mapping of the published model
    pub fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, ModelError> {
        let table = match self {
            Architecture::Flux1 => Flux1Config::dev().mapper().mapping(convention)?,
            Architecture::Flux2 => Flux2Config::dev().mapper().mapping(convention)?,
            Architecture::QwenImage => QwenImageConfig::base().mapper().mapping(convention)?,
            Architecture::Wan14B => WanConfig::t2v_14b().mapper().mapping(convention)?,
            Architecture::Wan1_3B => WanConfig::t2v_1_3b().mapper().mapping(convention)?,
            Architecture::ZImage => ZImageConfig::base().mapper().mapping(convention)?,
            Architecture::HiDream | Architecture::Hunyuan | Architecture::Ltx2 => {
                return Err(ModelError::NoMapping(*self));
            }
        };
        Ok(table)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Architecture {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('_', "-");
        Architecture::ALL
            .into_iter()
            .find(|a| a.name() == normalized || a.name().replace('-', "") == normalized)
            .ok_or_else(|| ModelError::UnknownArchitecture(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for arch in Architecture::ALL {
            assert_eq!(arch.name().parse::<Architecture>().unwrap(), arch);
        }
        assert_eq!("QwenImage".parse::<Architecture>().unwrap(), Architecture::QwenImage);
        assert_eq!("z_image".parse::<Architecture>().unwrap(), Architecture::ZImage);
        assert!(matches!(
            "sdxl".parse::<Architecture>(),
            Err(ModelError::UnknownArchitecture(_))
        ));
    }

    #[test]
    fn test_detect_convention() {
        let diffusers = ["blocks.39.attn2.to_v.weight", "proj_out.weight"];
        let original = ["blocks.39.cross_attn.v.weight", "head.head.weight"];
        assert_eq!(
            Architecture::Wan14B.detect_convention(diffusers),
            NamingConvention::Diffusers
        );
        assert_eq!(
            Architecture::Wan14B.detect_convention(original),
            NamingConvention::GenerativeModels
        );
        // single-layout models are always diffusers
        assert_eq!(
            Architecture::QwenImage.detect_convention(original),
            NamingConvention::Diffusers
        );
    }

    #[test]
    fn test_markers_hit_published_mappings() {
        for arch in Architecture::ALL.into_iter().filter(Architecture::has_mapping) {
            let Some(marker) = arch.diffusers_marker() else {
                continue;
            };
            let diffusers = arch.mapping(NamingConvention::Diffusers).unwrap();
            assert!(diffusers.names().any(|n| n.contains(marker)), "{arch}");
            if arch != Architecture::ZImage {
                let original = arch.mapping(NamingConvention::GenerativeModels).unwrap();
                assert!(!original.names().any(|n| n.contains(marker)), "{arch}");
            }
        }
    }

    #[test]
    fn test_unmapped_architectures_have_no_marker() {
        for arch in Architecture::ALL.into_iter().filter(|a| !a.has_mapping()) {
            assert_eq!(arch.diffusers_marker(), None, "{arch}");
            assert_eq!(
                arch.detect_convention(["single_transformer_blocks.39.attn.to_q.weight"]),
                NamingConvention::Diffusers
            );
        }
    }

    #[test]
    fn test_rope_only_architectures() {
        assert!(matches!(
            Architecture::Ltx2.mapping(NamingConvention::Diffusers),
            Err(ModelError::NoMapping(Architecture::Ltx2))
        ));
        let tables = Architecture::Hunyuan
            .rope_tables(&Geometry::image(2, 2).with_tokens(1))
            .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["video", "joint"]);
    }
}
