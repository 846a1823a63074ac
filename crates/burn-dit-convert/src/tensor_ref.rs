//! What one on-disk tensor turns into

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::mapping::MappingError;
use crate::parameter::ParameterId;

/// Axis along which sub-tensors are concatenated on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuseAxis {
    /// Rows (dim 0), e.g. Q/K/V stacked into one projection
    Output,
    /// Columns (dim 1), e.g. attention and MLP outputs feeding one projection
    Input,
}

impl FuseAxis {
    pub fn dim(&self) -> usize {
        match self {
            FuseAxis::Output => 0,
            FuseAxis::Input => 1,
        }
    }
}

/// How the on-disk tensor is divided among targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Split {
    Single,
    /// Equal-size parts
    Even { axis: FuseAxis },
    /// Part `i` starts at `offsets[i]` and runs to the next offset
    Offsets { axis: FuseAxis, offsets: Vec<usize> },
}

/// Base weight plus the two adapter factors trained against it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraTriple {
    pub base: ParameterId,
    pub down: ParameterId,
    pub up: ParameterId,
}

/// Mapping of one on-disk tensor name to runtime parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensorRef {
    targets: Vec<ParameterId>,
    split: Split,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scale: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    lora: Vec<LoraTriple>,
}

impl NamedTensorRef {
    /// 1:1 mapping
    pub fn single(target: ParameterId) -> Self {
        Self {
            targets: vec![target],
            split: Split::Single,
            scale: None,
            lora: Vec::new(),
        }
    }

    /// Equal-size concatenation of `targets` along `axis`
    pub fn fused(targets: Vec<ParameterId>, axis: FuseAxis) -> Result<Self, MappingError> {
        let split = match targets.len() {
            0 => return Err(MappingError::NoTargets),
            1 => Split::Single,
            _ => Split::Even { axis },
        };
        Ok(Self {
            targets,
            split,
            scale: None,
            lora: Vec::new(),
        })
    }

    /// Concatenation with explicit start offsets along `axis`
    ///
    /// Offsets must start at 0 and strictly increase; the last part runs to
    /// the end of the on-disk extent.
    pub fn fused_at(
        targets: Vec<ParameterId>,
        axis: FuseAxis,
        offsets: Vec<usize>,
    ) -> Result<Self, MappingError> {
        if targets.is_empty() {
            return Err(MappingError::NoTargets);
        }
        if offsets.len() != targets.len() {
            return Err(MappingError::OffsetCount {
                targets: targets.len(),
                offsets: offsets.len(),
            });
        }
        if offsets[0] != 0 || offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MappingError::InvalidOffsets(offsets));
        }
        Ok(Self {
            targets,
            split: Split::Offsets { axis, offsets },
            scale: None,
            lora: Vec::new(),
        })
    }

    /// Multiply values by `scale` on load
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    pub(crate) fn with_lora(mut self, lora: Vec<LoraTriple>) -> Self {
        self.lora = lora;
        self
    }

    pub fn targets(&self) -> &[ParameterId] {
        &self.targets
    }

    pub fn split(&self) -> &Split {
        &self.split
    }

    pub fn scale(&self) -> Option<f32> {
        self.scale
    }

    pub fn lora(&self) -> &[LoraTriple] {
        &self.lora
    }

    pub fn is_fused(&self) -> bool {
        !matches!(self.split, Split::Single)
    }

    pub fn axis(&self) -> Option<FuseAxis> {
        match &self.split {
            Split::Single => None,
            Split::Even { axis } | Split::Offsets { axis, .. } => Some(*axis),
        }
    }

    /// Range of each target along the fuse axis, for an on-disk extent
    pub fn slices(&self, extent: usize) -> Result<Vec<Range<usize>>, MappingError> {
        match &self.split {
            Split::Single => Ok(vec![0..extent]),
            Split::Even { .. } => {
                let parts = self.targets.len();
                if extent % parts != 0 {
                    return Err(MappingError::SplitMismatch { extent, parts });
                }
                let size = extent / parts;
                Ok((0..parts).map(|i| i * size..(i + 1) * size).collect())
            }
            Split::Offsets { offsets, .. } => {
                let last = offsets[offsets.len() - 1];
                if last >= extent {
                    return Err(MappingError::OffsetOutOfRange {
                        offset: last,
                        extent,
                    });
                }
                Ok(offsets
                    .iter()
                    .enumerate()
                    .map(|(i, &start)| start..offsets.get(i + 1).copied().unwrap_or(extent))
                    .collect())
            }
        }
    }
}

impl From<ParameterId> for NamedTensorRef {
    fn from(id: ParameterId) -> Self {
        NamedTensorRef::single(id)
    }
}
