//! Rotary Position Tables for Diffusion Transformers
//!
//! This crate builds the constant RoPE inputs consumed by DiT attention
//! blocks. A table is described by an axis partition of the head channels
//! and an ordered list of sequence regions.
//!
//! # Modules
//!
//! - [`axis`] - Position axes, frequency schedules, channel-pair spans
//! - [`region`] - Sequence regions and per-axis coordinate rules
//! - [`rope`] - The table builder and [`ConfigurationError`]
//! - [`encoding`] - [`EncodingTensor`], the built table
//!
//! # Example
//!
//! ```ignore
//! use burn_dit_core::{AxisKind, AxisLayout, Coordinate, Frequency, Region, RopeLayout};
//!
//! let axes = AxisLayout::aligned(
//!     128,
//!     Frequency::Inverse { base: 10_000.0 },
//!     &[(AxisKind::Temporal, 16), (AxisKind::Vertical, 56), (AxisKind::Horizontal, 56)],
//! )?;
//! let image = Region::image(
//!     "image",
//!     64,
//!     64,
//!     vec![Coordinate::zero(), Coordinate::row(), Coordinate::column()],
//! );
//! let table = RopeLayout::new(axes, vec![image]).build()?;
//! let rot = table.to_tensor::<B>(&device);
//! ```

pub mod axis;
pub mod encoding;
pub mod region;
pub mod rope;

pub use axis::{AxisKind, AxisLayout, Frequency, PairSpan, PositionAxis};
pub use encoding::EncodingTensor;
pub use region::{Coordinate, LocalPosition, Region, RegionShape, Source};
pub use rope::{ConfigurationError, RopeLayout, build};
