//! Checkpoint Weight Mapping
//!
//! This crate translates between on-disk checkpoint tensor names and the
//! parameters a built DiT graph owns.
//!
//! # Mapping Tables
//!
//! Blocks implement [`WeightMapper`] and emit a [`MappingTable`] for a
//! [`NamingConvention`]. Tables merge bottom-up, last writer wins, with
//! collisions recorded:
//!
//! ```ignore
//! use burn_dit_convert::{MappingTable, NamingConvention, WeightMapper, merge_all};
//!
//! let table = merge_all([
//!     embedder.mapping(NamingConvention::Diffusers)?,
//!     blocks.mapping(NamingConvention::Diffusers)?,
//! ]);
//! assert!(table.collisions().is_empty());
//! ```
//!
//! # Loading
//!
//! ```ignore
//! use burn_dit_convert::{CheckpointLoader, SafeTensorFile};
//!
//! let file = SafeTensorFile::open("flux1-dev.safetensors")?;
//! let mut params = BTreeMap::new();
//! let report = CheckpointLoader::new(&table).load(&file, &mut params)?;
//! ```
//!
//! # LoRA
//!
//! - [`attach_lora`] - Name adapter factors alongside base weights
//! - [`load_lora_deltas`] - Resolve an adapter file through a table
//! - [`merge_lora`] - Fold a delta into its base weight

pub mod checkpoint;
pub mod loader;
pub mod lora;
pub mod mapping;
pub mod naming;
pub mod parameter;
pub mod tensor_ref;

pub use checkpoint::{
    CheckpointLoader, HostTensor, LoadReport, ParameterSink, TensorSource, split_tensor,
};
pub use loader::{LoadError, SafeTensorFile};
pub use lora::{
    LoraConfiguration, LoraDelta, LoraDeltas, apply_lora_deltas, attach_lora, load_lora_deltas,
    merge_lora, parse_lora_key,
};
pub use mapping::{Collision, MappingError, MappingTable, WeightMapper, merge_all, merge_strict};
pub use naming::NamingConvention;
pub use parameter::{Layer, ParameterId, ParameterSlot};
pub use tensor_ref::{FuseAxis, LoraTriple, NamedTensorRef, Split};
