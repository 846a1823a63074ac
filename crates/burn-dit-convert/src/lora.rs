//! LoRA adapters on mapped weights
//!
//! [`attach_lora`] decorates a [`MappingTable`] so each weight entry also
//! names its adapter factors. [`load_lora_deltas`] reads an adapter file
//! (PEFT or diffusers keys), resolves each module through the
//! table, and splits the factors of fused weights the same way the base
//! weight is split. [`merge_lora`] folds a delta into its base weight.

use std::collections::{BTreeMap, BTreeSet};

use burn::prelude::*;
use tracing::{debug, warn};

use crate::checkpoint::{HostTensor, TensorSource};
use crate::loader::LoadError;
use crate::mapping::MappingTable;
use crate::parameter::ParameterId;
use crate::tensor_ref::{FuseAxis, LoraTriple};

/// Which adapters to attach
#[derive(Debug, Clone, PartialEq)]
pub struct LoraConfiguration {
    /// Adapter rank; 0 disables adapters
    pub rank: usize,
    /// Multiplier applied to every merged delta
    pub scale: f32,
    /// Layer names that receive adapters; `None` means all weights
    pub keys: Option<BTreeSet<String>>,
}

impl Default for LoraConfiguration {
    fn default() -> Self {
        Self {
            rank: 0,
            scale: 1.0,
            keys: None,
        }
    }
}

impl LoraConfiguration {
    pub fn new(rank: usize, scale: f32) -> Self {
        Self {
            rank,
            scale,
            keys: None,
        }
    }

    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_active(&self) -> bool {
        self.rank > 0
    }

    fn covers(&self, layer: &str) -> bool {
        self.keys.as_ref().is_none_or(|keys| keys.contains(layer))
    }
}

/// Adds a (base, down, up) triple to every weight target the configuration
/// covers
pub fn attach_lora(table: &MappingTable, config: &LoraConfiguration) -> MappingTable {
    if !config.is_active() {
        return table.clone();
    }
    table
        .iter()
        .map(|(name, tensor)| {
            let lora: Vec<LoraTriple> = tensor
                .targets()
                .iter()
                .filter_map(|id| {
                    let (layer, index, _) = id.parts()?;
                    (id.is_weight() && config.covers(layer)).then(|| LoraTriple {
                        base: id.clone(),
                        down: ParameterId::lora_down(layer, index),
                        up: ParameterId::lora_up(layer, index),
                    })
                })
                .collect();
            // fused entries need a factor for every part or none
            let lora = if lora.len() == tensor.targets().len() {
                lora
            } else {
                Vec::new()
            };
            (name.to_string(), tensor.clone().with_lora(lora))
        })
        .collect()
}

/// Role of one tensor in an adapter file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraFactor {
    Down,
    Up,
    Alpha,
}

const FACTOR_SUFFIXES: &[(&str, LoraFactor)] = &[
    (".lora_A.default.weight", LoraFactor::Down),
    (".lora_B.default.weight", LoraFactor::Up),
    (".lora_A.weight", LoraFactor::Down),
    (".lora_B.weight", LoraFactor::Up),
    (".lora.down.weight", LoraFactor::Down),
    (".lora.up.weight", LoraFactor::Up),
    (".lora_down.weight", LoraFactor::Down),
    (".lora_up.weight", LoraFactor::Up),
    (".alpha", LoraFactor::Alpha),
];

const MODULE_PREFIXES: &[&str] = &[
    "base_model.model.",
    "transformer.",
    "diffusion_model.",
    "model.diffusion_model.",
];

/// Splits an adapter key into the base module path and factor
///
/// The module path is in the same vocabulary as the base checkpoint, so
/// `<module>.weight` is the key to look up in a [`MappingTable`].
pub fn parse_lora_key(key: &str) -> Option<(String, LoraFactor)> {
    let (module, factor) = FACTOR_SUFFIXES
        .iter()
        .find_map(|(suffix, factor)| key.strip_suffix(suffix).map(|m| (m, *factor)))?;
    let module = MODULE_PREFIXES
        .iter()
        .find_map(|p| module.strip_prefix(p))
        .unwrap_or(module);
    Some((module.to_string(), factor))
}

/// Adapter tensors grouped by module
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoraGroup {
    pub down: Option<String>,
    pub up: Option<String>,
    pub alpha: Option<String>,
}

pub fn group_lora_keys<'a>(names: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, LoraGroup> {
    let mut groups: BTreeMap<String, LoraGroup> = BTreeMap::new();
    for key in names {
        let Some((module, factor)) = parse_lora_key(key) else {
            continue;
        };
        let group = groups.entry(module).or_default();
        let slot = match factor {
            LoraFactor::Down => &mut group.down,
            LoraFactor::Up => &mut group.up,
            LoraFactor::Alpha => &mut group.alpha,
        };
        *slot = Some(key.to_string());
    }
    groups
}

/// Adapter factors for one runtime weight
#[derive(Debug, Clone, PartialEq)]
pub struct LoraDelta {
    pub triple: LoraTriple,
    /// `[rank, in]`
    pub down: HostTensor,
    /// `[out, rank]`
    pub up: HostTensor,
    /// `alpha / rank`, 1 when the file carries no alpha, times the
    /// entry's load scale
    pub alpha_scale: f32,
}

/// Result of resolving an adapter file against a table
#[derive(Debug, Clone, Default)]
pub struct LoraDeltas {
    pub deltas: Vec<LoraDelta>,
    /// Modules with no adapter-enabled entry in the table
    pub unmatched: Vec<String>,
}

/// Reads adapter factors and routes them to the weights the table maps
///
/// For a weight fused along the output axis the up factor is split like
/// the base weight and the down factor shared; along the input axis the
/// roles swap.
pub fn load_lora_deltas<S: TensorSource + ?Sized>(
    table: &MappingTable,
    source: &S,
) -> Result<LoraDeltas, LoadError> {
    let names = source.names();
    let groups = group_lora_keys(names.iter().map(String::as_str));
    let mut result = LoraDeltas::default();

    for (module, group) in groups {
        let (Some(down_key), Some(up_key)) = (&group.down, &group.up) else {
            debug!(module = %module, "incomplete adapter pair, skipping");
            continue;
        };
        let base_name = format!("{module}.weight");
        let Some(mapping) = table.lookup(&base_name).filter(|m| !m.lora().is_empty()) else {
            warn!(module = %module, "adapter has no target in mapping table");
            result.unmatched.push(module);
            continue;
        };

        let down = source.read(down_key)?;
        let up = source.read(up_key)?;
        let rank = down.shape().first().copied().unwrap_or(1).max(1);
        let alpha_scale = match &group.alpha {
            Some(key) => {
                let alpha = source.read(key)?.data().first().copied();
                alpha.unwrap_or(rank as f32) / rank as f32
            }
            None => 1.0,
        };
        // the base was scaled on load, so the delta follows it
        let alpha_scale = alpha_scale * mapping.scale().unwrap_or(1.0);

        let wrap = |err| LoadError::Mapping {
            name: base_name.clone(),
            source: err,
        };
        let parts: Vec<(HostTensor, HostTensor)> = match mapping.axis() {
            None => vec![(down, up)],
            Some(FuseAxis::Output) => {
                let extent = up.shape().first().copied().unwrap_or(0);
                let slices = mapping.slices(extent).map_err(wrap)?;
                slices
                    .into_iter()
                    .map(|r| Ok((down.clone(), up.narrow(0, r).map_err(wrap)?)))
                    .collect::<Result<_, LoadError>>()?
            }
            Some(FuseAxis::Input) => {
                let extent = down.shape().get(1).copied().unwrap_or(0);
                let slices = mapping.slices(extent).map_err(wrap)?;
                slices
                    .into_iter()
                    .map(|r| Ok((down.narrow(1, r).map_err(wrap)?, up.clone())))
                    .collect::<Result<_, LoadError>>()?
            }
        };
        for (triple, (down, up)) in mapping.lora().iter().zip(parts) {
            result.deltas.push(LoraDelta {
                triple: triple.clone(),
                down,
                up,
                alpha_scale,
            });
        }
    }
    Ok(result)
}

/// `base + scale * up · down`
pub fn merge_lora<B: Backend>(
    base: Tensor<B, 2>,
    down: Tensor<B, 2>,
    up: Tensor<B, 2>,
    scale: f32,
) -> Tensor<B, 2> {
    base + up.matmul(down).mul_scalar(scale)
}

/// Folds every delta into the matching base weight of `params`
pub fn apply_lora_deltas<B: Backend>(
    params: &mut BTreeMap<ParameterId, HostTensor>,
    deltas: &[LoraDelta],
    config: &LoraConfiguration,
    device: &B::Device,
) -> Result<usize, LoadError> {
    let mut merged = 0;
    for delta in deltas {
        let Some(base) = params.get(&delta.triple.base) else {
            return Err(LoadError::TensorNotFound(delta.triple.base.to_string()));
        };
        let base = base.clone().into_tensor::<B, 2>(device)?;
        let down = delta.down.clone().into_tensor::<B, 2>(device)?;
        let up = delta.up.clone().into_tensor::<B, 2>(device)?;
        let [out, inner] = base.dims();
        let [rank, down_in] = down.dims();
        let [up_out, up_rank] = up.dims();
        if up_out != out || down_in != inner || up_rank != rank {
            return Err(LoadError::ShapeMismatch {
                expected: vec![out, inner],
                actual: vec![up_out, down_in],
            });
        }
        let result = merge_lora(base, down, up, config.scale * delta.alpha_scale);
        params.insert(delta.triple.base.clone(), HostTensor::from_tensor(result)?);
        merged += 1;
    }
    Ok(merged)
}
