//! Fused inference kernels.
//!
//! Replacements for the generic layers of a trained model. Each kernel keeps
//! the numerical contract of the layer it replaces but takes the faster call
//! signature the rewritten interaction uses: u32 indices, receiver buckets
//! and integer element types instead of one-hot attributes.
//!
//! - [`LinearMatmul`] - Scalar linear as one pre-normalized matmul
//! - [`ChannelLinear`] - Per-degree channel mixing on [n, C, K] messages
//! - [`InvariantMessagePassing`] - Bucketed tensor-product message passing
//! - [`AcceleratedContraction`] / [`ContractionWrapper`] - Symmetric
//!   contraction indexed by element type

mod contraction;
mod linear;
mod message_passing;

pub use contraction::{
    argmax_rows, first_occurrence_argmax, AcceleratedContraction, ContractionWeights,
    ContractionWrapper, KernelTiling,
};
pub use linear::{ChannelLinear, LinearMatmul};
pub use message_passing::{first_occurrences, InvariantMessagePassing};

use crate::error::{MaceOptError, Result};
use candle_core::{DType, Tensor};

/// Fail unless `t` holds u32 indices.
pub(crate) fn require_u32(name: &str, t: &Tensor) -> Result<()> {
    if t.dtype() != DType::U32 {
        return Err(MaceOptError::structural(
            name,
            format!("indices must be u32, got {:?}", t.dtype()),
        ));
    }
    Ok(())
}

/// Fail unless every tensor has the kernel's floating point precision.
pub(crate) fn require_dtype(kernel: &str, expected: DType, tensors: &[&Tensor]) -> Result<()> {
    for t in tensors {
        if t.dtype() != expected {
            return Err(MaceOptError::PrecisionMismatch(format!(
                "{kernel} was built for {:?}, got {:?} input",
                expected,
                t.dtype()
            )));
        }
    }
    Ok(())
}
