//! Per-Architecture DiT Layouts
//!
//! This crate describes, for each supported diffusion transformer, the
//! position tables its attention consumes and the mapping from published
//! checkpoint names to its parameters.
//!
//! # Supported Models
//!
//! - **Flux.1**: dev, schnell and Kontext reference images
//! - **Flux.2**: dev with up to several reference images
//! - **Qwen-Image**: reduced-precision dual-stream blocks
//! - **Wan 2.1**: 14B and 1.3B text-to-video
//! - **Z-Image**: single-stream with caption and image refiners
//! - **HiDream**, **HunyuanVideo**, **LTX-2**: position tables only
//!
//! # Example
//!
//! ```ignore
//! use burn_dit_convert::{CheckpointLoader, SafeTensorFile};
//! use burn_dit_models::{Architecture, Geometry};
//!
//! let file = SafeTensorFile::open("flux1-dev.safetensors")?;
//! let arch = Architecture::Flux1;
//! let table = arch.mapping(arch.detect_convention(file.names()))?;
//! let report = CheckpointLoader::new(&table).load(&file, &mut params)?;
//!
//! let tables = arch.rope_tables(&Geometry::image(64, 64).with_tokens(512))?;
//! ```

pub mod architecture;
pub mod flux1;
pub mod flux2;
pub mod geometry;
pub mod hidream;
pub mod hunyuan;
pub mod ltx2;
pub mod qwenimage;
pub mod stream;
pub mod wan;
pub mod zimage;

pub use architecture::{Architecture, ModelError};
pub use flux1::{Flux1, Flux1Config};
pub use flux2::{Flux2, Flux2Config};
pub use geometry::{Geometry, ReferenceImage};
pub use ltx2::{Ltx2Config, Ltx2Tables};
pub use qwenimage::{QwenImage, QwenImageConfig};
pub use wan::{Wan, WanConfig};
pub use zimage::{ZImage, ZImageConfig};
