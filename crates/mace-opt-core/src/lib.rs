//! # mace-opt core
//!
//! Rewrites trained MACE interatomic potentials for fast inference.
//!
//! This crate provides:
//! - **Reference MACE layers** with energies and autograd forces
//! - **Fused kernels** for linear, message-passing and contraction layers
//! - **Graph surgery** that swaps one for the other, layer by layer
//! - **Structure input**: extended XYZ, periodic neighbor lists, batching
//! - **Benchmarking** of original against rewritten models

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bench;
pub mod data;
pub mod error;
pub mod irreps;
pub mod kernels;
pub mod model;
pub mod transform;

pub use error::{MaceOptError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bench::{benchmark, load_structures, prepare_batch, BenchmarkOptions, BenchmarkReport};
    pub use crate::data::{AtomicGraph, AtomicNumberTable, Configuration};
    pub use crate::error::{MaceOptError, Result};
    pub use crate::model::{InteractionForward, Mace, MaceConfig, MaceOutput, Precision};
    pub use crate::transform::{optimize, optimize_with, OptimizeOptions};
}
