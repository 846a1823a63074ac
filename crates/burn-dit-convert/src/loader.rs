//! Read tensors from .safetensors checkpoints

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;
use tracing::debug;

use crate::checkpoint::{HostTensor, TensorSource};
use crate::mapping::MappingError;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(Dtype),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Mapping error for '{name}': {source}")]
    Mapping {
        name: String,
        #[source]
        source: MappingError,
    },
}

/// Memory-mapped safetensors file
pub struct SafeTensorFile {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
}

struct TensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

impl SafeTensorFile {
    /// Maps the file and indexes its header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // Safety: the map is read-only and we never hand out slices that
        // outlive `self`
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let tensors = {
            let st = SafeTensors::deserialize(&mmap)?;
            let base = mmap.as_ptr() as usize;
            st.tensors()
                .into_iter()
                .map(|(name, view)| {
                    let start = view.data().as_ptr() as usize - base;
                    let info = TensorInfo {
                        dtype: view.dtype(),
                        shape: view.shape().to_vec(),
                        start,
                        end: start + view.data().len(),
                    };
                    (name, info)
                })
                .collect::<HashMap<_, _>>()
        };
        debug!(path = %path.display(), tensors = tensors.len(), "opened safetensors");

        Ok(Self { mmap, tensors })
    }

    /// Tensor names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    pub fn dtype(&self, name: &str) -> Option<Dtype> {
        self.tensors.get(name).map(|t| t.dtype)
    }

    /// Reads a tensor as f32, widening fp16/bf16
    pub fn read_f32(&self, name: &str) -> Result<HostTensor, LoadError> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| LoadError::TensorNotFound(name.to_string()))?;
        let bytes = &self.mmap[info.start..info.end];
        HostTensor::new(info.shape.clone(), decode_f32(info.dtype, bytes)?)
    }
}

/// Decodes little-endian bytes, tolerating unaligned mmap data
pub fn decode_f32(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>, LoadError> {
    let floats = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect(),
        dtype => return Err(LoadError::UnsupportedDtype(dtype)),
    };
    Ok(floats)
}

impl TensorSource for SafeTensorFile {
    fn names(&self) -> Vec<String> {
        SafeTensorFile::names(self)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn contains(&self, name: &str) -> bool {
        SafeTensorFile::contains(self, name)
    }

    fn shape(&self, name: &str) -> Option<Vec<usize>> {
        SafeTensorFile::shape(self, name).map(<[usize]>::to_vec)
    }

    fn read(&self, name: &str) -> Result<HostTensor, LoadError> {
        self.read_f32(name)
    }
}
