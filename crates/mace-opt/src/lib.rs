//! # mace-opt
//!
//! Optimize a trained MACE model for accelerated inference and benchmark it
//! against the original.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mace_opt::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let outcome = Pipeline::builder()
//!         .model_path("models/mace.safetensors")
//!         .precision(Precision::Float64)
//!         .benchmark(true)
//!         .build()
//!         .run()?;
//!
//!     println!("saved {}", outcome.output_path.display());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use mace_opt_core::*;

pub mod cli;
mod pipeline;

pub use pipeline::{
    parse_device, Pipeline, PipelineBuilder, PipelineConfig, PipelineOutcome, DEFAULT_OUTPUT,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineConfig, PipelineOutcome};
    pub use mace_opt_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
