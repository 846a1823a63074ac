//! Internal parameter identifiers
//!
//! Every trainable tensor in a built graph is addressed as
//! `t-<layer>-<index>-<slot>`, where slot 0 is the weight and slot 1 the
//! bias. LoRA factors live on sibling layers named `<layer>_lora_down` and
//! `<layer>_lora_up`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Weight or bias slot of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterSlot {
    Weight,
    Bias,
}

impl ParameterSlot {
    fn index(self) -> u8 {
        match self {
            ParameterSlot::Weight => 0,
            ParameterSlot::Bias => 1,
        }
    }
}

/// Identifier of one runtime parameter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterId(String);

impl ParameterId {
    pub fn new(layer: &str, index: usize, slot: ParameterSlot) -> Self {
        Self(format!("t-{layer}-{index}-{}", slot.index()))
    }

    pub fn weight(layer: &str, index: usize) -> Self {
        Self::new(layer, index, ParameterSlot::Weight)
    }

    pub fn bias(layer: &str, index: usize) -> Self {
        Self::new(layer, index, ParameterSlot::Bias)
    }

    /// Down-projection factor of the adapter on `layer`
    pub fn lora_down(layer: &str, index: usize) -> Self {
        Self::weight(&format!("{layer}_lora_down"), index)
    }

    /// Up-projection factor of the adapter on `layer`
    pub fn lora_up(layer: &str, index: usize) -> Self {
        Self::weight(&format!("{layer}_lora_up"), index)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the identifier back into layer, index and slot
    pub fn parts(&self) -> Option<(&str, usize, ParameterSlot)> {
        let rest = self.0.strip_prefix("t-")?;
        let (rest, slot) = rest.rsplit_once('-')?;
        let (layer, index) = rest.rsplit_once('-')?;
        let slot = match slot {
            "0" => ParameterSlot::Weight,
            "1" => ParameterSlot::Bias,
            _ => return None,
        };
        Some((layer, index.parse().ok()?, slot))
    }

    pub fn layer(&self) -> Option<&str> {
        self.parts().map(|(layer, _, _)| layer)
    }

    pub fn is_weight(&self) -> bool {
        matches!(self.parts(), Some((_, _, ParameterSlot::Weight)))
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParameterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Weight and optional bias of one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    pub weight: ParameterId,
    pub bias: Option<ParameterId>,
}

impl Layer {
    /// Dense or norm layer with a bias
    pub fn new(name: &str, index: usize) -> Self {
        Self {
            weight: ParameterId::weight(name, index),
            bias: Some(ParameterId::bias(name, index)),
        }
    }

    pub fn no_bias(name: &str, index: usize) -> Self {
        Self {
            weight: ParameterId::weight(name, index),
            bias: None,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        if !bias {
            self.bias = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_format() {
        assert_eq!(ParameterId::weight("x_embedder", 0).as_str(), "t-x_embedder-0-0");
        assert_eq!(ParameterId::bias("x_embedder", 3).as_str(), "t-x_embedder-3-1");
        assert_eq!(ParameterId::lora_up("x_q", 2).as_str(), "t-x_q_lora_up-2-0");
    }

    #[test]
    fn test_parts() {
        let id = ParameterId::bias("img_mlp_0", 12);
        assert_eq!(id.parts(), Some(("img_mlp_0", 12, ParameterSlot::Bias)));
        assert!(!id.is_weight());
        assert!(ParameterId::weight("a-b", 1).is_weight());
        assert_eq!(ParameterId::weight("a-b", 1).layer(), Some("a-b"));
        assert_eq!(ParameterId::from("scale_shift_table").parts(), None);
    }

    #[test]
    fn test_layer_bias_toggle() {
        let layer = Layer::new("to_q", 0).with_bias(false);
        assert!(layer.bias.is_none());
        assert_eq!(Layer::no_bias("to_q", 0), layer);
    }
}
