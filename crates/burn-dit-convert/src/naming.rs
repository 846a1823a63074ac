//! On-disk naming conventions

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Vocabulary a checkpoint's tensor names are written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NamingConvention {
    /// Reference-implementation names (`double_blocks.0.img_attn.qkv.weight`)
    #[default]
    GenerativeModels,
    /// Hugging Face diffusers names (`transformer_blocks.0.attn.to_q.weight`)
    Diffusers,
}

impl NamingConvention {
    pub const ALL: [NamingConvention; 2] =
        [NamingConvention::GenerativeModels, NamingConvention::Diffusers];

    pub fn name(&self) -> &'static str {
        match self {
            NamingConvention::GenerativeModels => "generative-models",
            NamingConvention::Diffusers => "diffusers",
        }
    }

    /// Picks diffusers when any name contains `marker`
    ///
    /// Markers are architecture specific, usually a diffusers-only block
    /// name deep enough into the model to rule out partial checkpoints.
    pub fn detect<'a>(names: impl IntoIterator<Item = &'a str>, marker: &str) -> Self {
        if names.into_iter().any(|n| n.contains(marker)) {
            NamingConvention::Diffusers
        } else {
            NamingConvention::GenerativeModels
        }
    }
}

impl fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NamingConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "generative-models" | "generativemodels" | "original" => {
                Ok(NamingConvention::GenerativeModels)
            }
            "diffusers" => Ok(NamingConvention::Diffusers),
            other => Err(format!("unknown naming convention: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_marker() {
        let names = [
            "single_transformer_blocks.37.attn.to_q.weight",
            "x_embedder.weight",
        ];
        assert_eq!(
            NamingConvention::detect(names, "single_transformer_blocks.37."),
            NamingConvention::Diffusers
        );
        let names = ["single_blocks.37.linear1.weight"];
        assert_eq!(
            NamingConvention::detect(names, "single_transformer_blocks.37."),
            NamingConvention::GenerativeModels
        );
    }

    #[test]
    fn test_parse_round_trip_names() {
        for convention in NamingConvention::ALL {
            assert_eq!(convention.name().parse::<NamingConvention>(), Ok(convention));
        }
        assert_eq!(
            "Generative_Models".parse::<NamingConvention>(),
            Ok(NamingConvention::GenerativeModels)
        );
        assert!("comfy".parse::<NamingConvention>().is_err());
    }
}
