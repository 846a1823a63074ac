//! Map checkpoint tensor names to runtime parameters
//!
//! Each block of a model knows which parameters it created; a
//! [`WeightMapper`] turns that knowledge into a [`MappingTable`] for one
//! [`NamingConvention`]. Tables from all blocks are merged bottom-up into the
//! table the checkpoint loader consults once per on-disk tensor.
//!
//! # Collisions
//!
//! Merging is last-writer-wins. Re-registering a name with an identical
//! [`NamedTensorRef`] is a no-op; re-registering it with a different one is
//! recorded as a [`Collision`] and logged, unless it was declared with
//! [`MappingTable::insert_override`]. Use [`merge_strict`] to reject
//! undeclared collisions instead.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::naming::NamingConvention;
use crate::parameter::{Layer, ParameterId};
use crate::tensor_ref::{FuseAxis, NamedTensorRef};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("Fused tensor needs at least one target")]
    NoTargets,

    #[error("Offset count mismatch: {targets} targets, {offsets} offsets")]
    OffsetCount { targets: usize, offsets: usize },

    #[error("Offsets must start at 0 and strictly increase: {0:?}")]
    InvalidOffsets(Vec<usize>),

    #[error("Offset {offset} out of range for extent {extent}")]
    OffsetOutOfRange { offset: usize, extent: usize },

    #[error("Extent {extent} does not split evenly into {parts} parts")]
    SplitMismatch { extent: usize, parts: usize },

    #[error("Rank {rank} tensor has no axis {dim} to split")]
    MissingAxis { rank: usize, dim: usize },

    #[error("Conflicting registration for '{0}'")]
    Collision(String),
}

/// Produces the name table for the parameters a block owns
pub trait WeightMapper {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError>;
}

impl<M: WeightMapper> WeightMapper for [M] {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        let mut table = MappingTable::new();
        for mapper in self {
            table.merge(mapper.mapping(convention)?);
        }
        Ok(table)
    }
}

impl<M: WeightMapper> WeightMapper for Vec<M> {
    fn mapping(&self, convention: NamingConvention) -> Result<MappingTable, MappingError> {
        self.as_slice().mapping(convention)
    }
}

/// A name that was registered twice with different targets
#[derive(Debug, Clone, PartialEq)]
pub struct Collision {
    pub name: String,
    pub previous: NamedTensorRef,
    pub replacement: NamedTensorRef,
}

/// On-disk name to [`NamedTensorRef`], iterated in name order
///
/// Equality compares the entries only; the collision log and declared
/// overrides are diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct MappingTable {
    entries: BTreeMap<String, NamedTensorRef>,
    #[serde(skip)]
    overrides: BTreeSet<String>,
    #[serde(skip)]
    collisions: Vec<Collision>,
}

impl PartialEq for MappingTable {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, replacing any previous entry
    pub fn insert(&mut self, name: impl Into<String>, tensor: NamedTensorRef) {
        let name = name.into();
        let expected = self.overrides.contains(&name);
        self.put(name, tensor, expected);
    }

    /// Registers `name`, declaring that it is meant to replace an earlier
    /// entry
    pub fn insert_override(&mut self, name: impl Into<String>, tensor: NamedTensorRef) {
        let name = name.into();
        self.overrides.insert(name.clone());
        self.put(name, tensor, true);
    }

    fn put(&mut self, name: String, tensor: NamedTensorRef, expected: bool) {
        let Some(previous) = self.entries.get(&name) else {
            self.entries.insert(name, tensor);
            return;
        };
        if *previous == tensor {
            return;
        }
        if expected {
            debug!(name = %name, "expected mapping override");
        } else {
            warn!(
                name = %name,
                previous = ?previous.targets(),
                replacement = ?tensor.targets(),
                "mapping collision, last registration wins"
            );
            self.collisions.push(Collision {
                name: name.clone(),
                previous: previous.clone(),
                replacement: tensor.clone(),
            });
        }
        self.entries.insert(name, tensor);
    }

    /// 1:1 mapping
    pub fn add(&mut self, name: impl Into<String>, target: ParameterId) {
        self.insert(name, NamedTensorRef::single(target));
    }

    /// 1:1 mapping of `<prefix>.weight` and `<prefix>.bias`
    pub fn add_layer(&mut self, prefix: &str, layer: &Layer) {
        self.add(format!("{prefix}.weight"), layer.weight.clone());
        if let Some(bias) = &layer.bias {
            self.add(format!("{prefix}.bias"), bias.clone());
        }
    }

    /// Equal-size fused mapping
    pub fn add_fused(
        &mut self,
        name: impl Into<String>,
        targets: Vec<ParameterId>,
        axis: FuseAxis,
    ) -> Result<(), MappingError> {
        self.insert(name, NamedTensorRef::fused(targets, axis)?);
        Ok(())
    }

    /// Fused mapping with explicit start offsets
    pub fn add_fused_at(
        &mut self,
        name: impl Into<String>,
        targets: Vec<ParameterId>,
        axis: FuseAxis,
        offsets: Vec<usize>,
    ) -> Result<(), MappingError> {
        self.insert(name, NamedTensorRef::fused_at(targets, axis, offsets)?);
        Ok(())
    }

    /// Even output-axis fusion of `<prefix>.weight`, plus `<prefix>.bias`
    /// when every layer has one
    pub fn add_fused_layers(&mut self, prefix: &str, layers: &[&Layer]) -> Result<(), MappingError> {
        let weights = layers.iter().map(|l| l.weight.clone()).collect();
        self.add_fused(format!("{prefix}.weight"), weights, FuseAxis::Output)?;
        let biases: Option<Vec<ParameterId>> = layers.iter().map(|l| l.bias.clone()).collect();
        if let Some(biases) = biases {
            self.add_fused(format!("{prefix}.bias"), biases, FuseAxis::Output)?;
        }
        Ok(())
    }

    /// Output-axis fusion at explicit offsets, weight and bias alike
    pub fn add_fused_layers_at(
        &mut self,
        prefix: &str,
        layers: &[&Layer],
        offsets: Vec<usize>,
    ) -> Result<(), MappingError> {
        let weights = layers.iter().map(|l| l.weight.clone()).collect();
        let biases: Option<Vec<ParameterId>> = layers.iter().map(|l| l.bias.clone()).collect();
        if let Some(biases) = biases {
            self.add_fused_at(
                format!("{prefix}.bias"),
                biases,
                FuseAxis::Output,
                offsets.clone(),
            )?;
        }
        self.add_fused_at(format!("{prefix}.weight"), weights, FuseAxis::Output, offsets)
    }

    /// The loader callback: what to do with the on-disk tensor `name`
    pub fn lookup(&self, name: &str) -> Option<&NamedTensorRef> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NamedTensorRef)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    /// Unexpected collisions seen while building this table
    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    /// Every parameter mentioned by any entry
    pub fn parameters(&self) -> BTreeSet<&ParameterId> {
        self.entries.values().flat_map(|r| r.targets()).collect()
    }

    /// Merges `other` into `self`, `other` winning on conflicts
    pub fn merge(&mut self, other: MappingTable) {
        self.overrides.extend(other.overrides);
        for collision in other.collisions {
            if !self.collisions.contains(&collision) {
                self.collisions.push(collision);
            }
        }
        for (name, tensor) in other.entries {
            self.insert(name, tensor);
        }
    }

    /// Like [`MappingTable::merge`], failing on the first undeclared
    /// collision and leaving `self` untouched
    pub fn merge_strict(&mut self, other: MappingTable) -> Result<(), MappingError> {
        for (name, tensor) in &other.entries {
            if let Some(previous) = self.entries.get(name) {
                let declared = self.overrides.contains(name) || other.overrides.contains(name);
                if previous != tensor && !declared {
                    return Err(MappingError::Collision(name.clone()));
                }
            }
        }
        self.merge(other);
        Ok(())
    }

    /// Parameter to every on-disk name that feeds it
    ///
    /// More than one name per parameter means the checkpoint may carry
    /// aliases; any one of them satisfies the parameter.
    pub fn reverse(&self) -> BTreeMap<ParameterId, Vec<String>> {
        let mut reverse: BTreeMap<ParameterId, Vec<String>> = BTreeMap::new();
        for (name, tensor) in &self.entries {
            for target in tensor.targets() {
                reverse
                    .entry(target.clone())
                    .or_default()
                    .push(name.clone());
            }
        }
        reverse
    }

    /// On-disk names feeding one parameter
    pub fn aliases_of(&self, id: &ParameterId) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, r)| r.targets().contains(id))
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

impl FromIterator<(String, NamedTensorRef)> for MappingTable {
    fn from_iter<I: IntoIterator<Item = (String, NamedTensorRef)>>(iter: I) -> Self {
        let mut table = MappingTable::new();
        for (name, tensor) in iter {
            table.insert(name, tensor);
        }
        table
    }
}

/// Merges tables left to right, last writer winning
pub fn merge_all(tables: impl IntoIterator<Item = MappingTable>) -> MappingTable {
    let mut merged = MappingTable::new();
    for table in tables {
        merged.merge(table);
    }
    merged
}

/// Merges tables left to right, rejecting undeclared collisions
pub fn merge_strict(
    tables: impl IntoIterator<Item = MappingTable>,
) -> Result<MappingTable, MappingError> {
    let mut merged = MappingTable::new();
    for table in tables {
        merged.merge_strict(table)?;
    }
    Ok(merged)
}
