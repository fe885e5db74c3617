//! Model graph surgery.
//!
//! Rewrites a trained [`Mace`](crate::model::Mace) layer by layer, swapping
//! its generic sublayers for the kernels in [`crate::kernels`]:
//!
//! | Reference layer                 | Replacement                  |
//! |---------------------------------|------------------------------|
//! | interaction `linear_up`         | [`LinearMatmul`]             |
//! | interaction `conv_tp`           | [`InvariantMessagePassing`]  |
//! | interaction `linear`            | [`ChannelLinear`]            |
//! | product `symmetric_contractions`| [`ContractionWrapper`]       |
//! | product `linear`                | [`LinearMatmul`]             |
//! | spherical harmonics             | fused degree-3 evaluator     |
//!
//! The model is consumed; any structural surprise aborts the whole rewrite.
//!
//! [`LinearMatmul`]: crate::kernels::LinearMatmul
//! [`InvariantMessagePassing`]: crate::kernels::InvariantMessagePassing
//! [`ChannelLinear`]: crate::kernels::ChannelLinear
//! [`ContractionWrapper`]: crate::kernels::ContractionWrapper

mod extract;
mod optimize;
mod rewrite;

pub use extract::{extract_channel_linear, extract_contraction, extract_linear, LinearParams};
pub use optimize::{optimize, optimize_with};
pub use rewrite::{
    replace_contraction, replace_linear, replace_tensor_product, rewrite_layer,
    AcceleratedInteraction, InteractionVariant,
};

use crate::kernels::KernelTiling;

/// Knobs of the rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeOptions {
    /// Thread-block shape of the contraction kernels.
    pub tiling: KernelTiling,
    /// Harmonic degree the fused front-end evaluates.
    pub sh_degree: u32,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        Self {
            tiling: KernelTiling::default(),
            sh_degree: 3,
        }
    }
}

impl OptimizeOptions {
    /// Set the contraction tiling.
    pub fn with_tiling(mut self, tiling: KernelTiling) -> Self {
        self.tiling = tiling;
        self
    }
}
