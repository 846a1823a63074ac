//! Apply a [`MappingTable`] to a checkpoint
//!
//! The loader walks every tensor a [`TensorSource`] offers, asks the table
//! what it becomes, slices fused tensors at their offsets, applies scale
//! corrections and hands the pieces to a [`ParameterSink`].

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use burn::prelude::*;
use tracing::{debug, info};

use crate::loader::LoadError;
use crate::mapping::{MappingError, MappingTable};
use crate::parameter::ParameterId;
use crate::tensor_ref::NamedTensorRef;

/// Row-major f32 tensor in host memory
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, LoadError> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(LoadError::ShapeMismatch {
                expected: shape,
                actual: vec![data.len()],
            });
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Drops leading unit dimensions while rank stays above 2
    ///
    /// Modulation tables stored as `[1, n, d]` split the same way as `[n, d]`.
    pub fn squeeze_leading(mut self) -> Self {
        while self.shape.len() > 2 && self.shape[0] == 1 {
            self.shape.remove(0);
        }
        self
    }

    /// Sub-tensor covering `range` along `dim`
    pub fn narrow(&self, dim: usize, range: Range<usize>) -> Result<Self, MappingError> {
        let rank = self.rank();
        if dim >= rank {
            return Err(MappingError::MissingAxis { rank, dim });
        }
        let extent = self.shape[dim];
        if range.start > range.end || range.end > extent {
            return Err(MappingError::OffsetOutOfRange {
                offset: range.end,
                extent,
            });
        }
        let outer: usize = self.shape[..dim].iter().product();
        let inner: usize = self.shape[dim + 1..].iter().product();
        let mut data = Vec::with_capacity(outer * range.len() * inner);
        for o in 0..outer {
            let base = o * extent;
            data.extend_from_slice(
                &self.data[(base + range.start) * inner..(base + range.end) * inner],
            );
        }
        let mut shape = self.shape.clone();
        shape[dim] = range.len();
        Ok(Self { shape, data })
    }

    /// Concatenates along `dim`; all other dimensions must agree
    pub fn cat(parts: &[HostTensor], dim: usize) -> Result<Self, LoadError> {
        let Some(first) = parts.first() else {
            return Err(LoadError::ShapeMismatch {
                expected: vec![],
                actual: vec![],
            });
        };
        let mut shape = first.shape.clone();
        if dim >= shape.len() {
            return Err(LoadError::ShapeMismatch {
                expected: vec![dim + 1],
                actual: shape,
            });
        }
        for part in &parts[1..] {
            let compatible = part.rank() == shape.len()
                && part
                    .shape
                    .iter()
                    .zip(&shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == dim || a == b);
            if !compatible {
                return Err(LoadError::ShapeMismatch {
                    expected: shape,
                    actual: part.shape.clone(),
                });
            }
        }
        shape[dim] = parts.iter().map(|p| p.shape[dim]).sum();
        let outer: usize = shape[..dim].iter().product();
        let inner: usize = shape[dim + 1..].iter().product();
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for part in parts {
                let rows = part.shape[dim] * inner;
                data.extend_from_slice(&part.data[o * rows..(o + 1) * rows]);
            }
        }
        Ok(Self { shape, data })
    }

    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.data {
            *v *= factor;
        }
    }

    /// Uploads to a device as a rank-`D` tensor
    pub fn into_tensor<B: Backend, const D: usize>(
        self,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, LoadError> {
        let shape: [usize; D] = self
            .shape
            .clone()
            .try_into()
            .map_err(|actual| LoadError::ShapeMismatch {
                expected: vec![0; D],
                actual,
            })?;
        Ok(Tensor::from_data(TensorData::new(self.data, shape), device))
    }

    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self, LoadError> {
        let shape = tensor.dims().to_vec();
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|_| LoadError::ShapeMismatch {
                expected: shape.clone(),
                actual: vec![],
            })?;
        HostTensor::new(shape, data)
    }
}

/// Anything that can hand out named tensors
pub trait TensorSource {
    fn names(&self) -> Vec<String>;
    fn contains(&self, name: &str) -> bool;
    fn shape(&self, name: &str) -> Option<Vec<usize>>;
    fn read(&self, name: &str) -> Result<HostTensor, LoadError>;
}

impl TensorSource for BTreeMap<String, HostTensor> {
    fn names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn contains(&self, name: &str) -> bool {
        self.contains_key(name)
    }

    fn shape(&self, name: &str) -> Option<Vec<usize>> {
        self.get(name).map(|t| t.shape.clone())
    }

    fn read(&self, name: &str) -> Result<HostTensor, LoadError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))
    }
}

/// Receives runtime parameters
pub trait ParameterSink {
    fn write(&mut self, id: &ParameterId, tensor: HostTensor) -> Result<(), LoadError>;
}

impl ParameterSink for BTreeMap<ParameterId, HostTensor> {
    fn write(&mut self, id: &ParameterId, tensor: HostTensor) -> Result<(), LoadError> {
        self.insert(id.clone(), tensor);
        Ok(())
    }
}

/// Divides one on-disk tensor among its targets and applies the scale
pub fn split_tensor(
    name: &str,
    tensor: HostTensor,
    mapping: &NamedTensorRef,
) -> Result<Vec<(ParameterId, HostTensor)>, LoadError> {
    let wrap = |err| LoadError::Mapping {
        name: name.to_string(),
        source: err,
    };
    let mut parts = match mapping.axis() {
        None => {
            let target = mapping.targets()[0].clone();
            vec![(target, tensor)]
        }
        Some(axis) => {
            let tensor = tensor.squeeze_leading();
            let dim = axis.dim();
            let rank = tensor.rank();
            if dim >= rank {
                return Err(wrap(MappingError::MissingAxis { rank, dim }));
            }
            let slices = mapping.slices(tensor.shape()[dim]).map_err(wrap)?;
            mapping
                .targets()
                .iter()
                .zip(slices)
                .map(|(id, range)| Ok((id.clone(), tensor.narrow(dim, range).map_err(wrap)?)))
                .collect::<Result<Vec<_>, LoadError>>()?
        }
    };
    if let Some(scale) = mapping.scale() {
        for (_, part) in &mut parts {
            part.scale(scale);
        }
    }
    Ok(parts)
}

/// Outcome of one checkpoint pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// On-disk tensors consumed
    pub tensors: usize,
    /// Runtime parameters written
    pub parameters: usize,
    /// On-disk tensors the table has no entry for
    pub unmapped: Vec<String>,
}

/// Drives a [`MappingTable`] over a [`TensorSource`]
pub struct CheckpointLoader<'a> {
    table: &'a MappingTable,
    require_complete: bool,
}

impl<'a> CheckpointLoader<'a> {
    pub fn new(table: &'a MappingTable) -> Self {
        Self {
            table,
            require_complete: true,
        }
    }

    /// Whether a parameter no on-disk tensor feeds is an error (default on)
    pub fn require_complete(mut self, require: bool) -> Self {
        self.require_complete = require;
        self
    }

    /// Parameters in the table that `source` cannot supply, with one
    /// on-disk name that would have fed each
    pub fn missing<S: TensorSource + ?Sized>(&self, source: &S) -> Vec<(ParameterId, String)> {
        self.table
            .reverse()
            .into_iter()
            .filter(|(_, names)| !names.iter().any(|n| source.contains(n)))
            .filter_map(|(id, names)| names.into_iter().next().map(|n| (id, n)))
            .collect()
    }

    pub fn load<S, K>(&self, source: &S, sink: &mut K) -> Result<LoadReport, LoadError>
    where
        S: TensorSource + ?Sized,
        K: ParameterSink + ?Sized,
    {
        if self.require_complete {
            if let Some((id, name)) = self.missing(source).into_iter().next() {
                debug!(parameter = %id, "no checkpoint tensor for parameter");
                return Err(LoadError::TensorNotFound(name));
            }
        }

        let mut report = LoadReport::default();
        let mut written = BTreeSet::new();
        for name in source.names() {
            let Some(mapping) = self.table.lookup(&name) else {
                debug!(name = %name, "unmapped checkpoint tensor");
                report.unmapped.push(name);
                continue;
            };
            let tensor = source.read(&name)?;
            for (id, part) in split_tensor(&name, tensor, mapping)? {
                debug!(name = %name, parameter = %id, shape = ?part.shape(), "loaded");
                sink.write(&id, part)?;
                written.insert(id);
            }
            report.tensors += 1;
        }
        report.parameters = written.len();
        info!(
            tensors = report.tensors,
            parameters = report.parameters,
            unmapped = report.unmapped.len(),
            "checkpoint loaded"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor_ref::FuseAxis;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn ramp(shape: &[usize]) -> HostTensor {
        let n = shape.iter().product();
        HostTensor::new(shape.to_vec(), (0..n).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_new_checks_len() {
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_narrow_rows_and_columns() {
        let t = ramp(&[3, 4]);
        let rows = t.narrow(0, 1..3).unwrap();
        assert_eq!(rows.shape(), &[2, 4]);
        assert_eq!(rows.data()[0], 4.0);
        let cols = t.narrow(1, 1..3).unwrap();
        assert_eq!(cols.shape(), &[3, 2]);
        assert_eq!(cols.data(), &[1.0, 2.0, 5.0, 6.0, 9.0, 10.0]);
        assert_eq!(
            t.narrow(2, 0..1),
            Err(MappingError::MissingAxis { rank: 2, dim: 2 })
        );
    }

    #[test]
    fn test_cat_inverts_narrow() {
        let t = ramp(&[4, 6]);
        for dim in [0, 1] {
            let parts = vec![t.narrow(dim, 0..1).unwrap(), t.narrow(dim, 1..4).unwrap()];
            assert_eq!(HostTensor::cat(&parts, dim).unwrap(), t);
        }
        let bad = vec![ramp(&[2, 3]), ramp(&[2, 4])];
        assert!(HostTensor::cat(&bad, 0).is_err());
    }

    #[test]
    fn test_split_squeezes_modulation_table() {
        let ids: Vec<ParameterId> = (0..6).map(|i| ParameterId::weight("ada_ln", i)).collect();
        let mapping = NamedTensorRef::fused(ids, FuseAxis::Output).unwrap();
        let parts = split_tensor("scale_shift_table", ramp(&[1, 6, 4]), &mapping).unwrap();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[5].1.shape(), &[1, 4]);
        assert_eq!(parts[5].1.data()[0], 20.0);
    }

    #[test]
    fn test_input_axis_on_bias_fails() {
        let ids = vec![ParameterId::weight("a", 0), ParameterId::weight("b", 0)];
        let mapping = NamedTensorRef::fused(ids, FuseAxis::Input).unwrap();
        let err = split_tensor("linear2.bias", ramp(&[8]), &mapping).unwrap_err();
        assert!(matches!(
            err,
            LoadError::Mapping {
                source: MappingError::MissingAxis { rank: 1, dim: 1 },
                ..
            }
        ));
    }

    #[test]
    fn test_tensor_round_trip() {
        let device = Default::default();
        let t = ramp(&[2, 3]);
        let tensor = t.clone().into_tensor::<TestBackend, 2>(&device).unwrap();
        assert_eq!(tensor.dims(), [2, 3]);
        assert_eq!(HostTensor::from_tensor(tensor).unwrap(), t);
        assert!(t.into_tensor::<TestBackend, 3>(&device).is_err());
    }

    #[test]
    fn test_loader_reports_unmapped_and_missing() {
        let mut table = MappingTable::new();
        table.add("a.weight", ParameterId::weight("a", 0));
        table.add("b.weight", ParameterId::weight("b", 0));

        let mut source = BTreeMap::new();
        source.insert("a.weight".to_string(), ramp(&[2]));
        source.insert("extra.weight".to_string(), ramp(&[1]));

        let mut sink: BTreeMap<ParameterId, HostTensor> = BTreeMap::new();
        let err = CheckpointLoader::new(&table)
            .load(&source, &mut sink)
            .unwrap_err();
        assert!(matches!(err, LoadError::TensorNotFound(name) if name == "b.weight"));

        let report = CheckpointLoader::new(&table)
            .require_complete(false)
            .load(&source, &mut sink)
            .unwrap();
        assert_eq!(report.tensors, 1);
        assert_eq!(report.parameters, 1);
        assert_eq!(report.unmapped, vec!["extra.weight".to_string()]);
        assert!(sink.contains_key(&ParameterId::weight("a", 0)));
    }
}
