//! MACE model graph.
//!
//! Provides the layers of an invariant MACE interatomic potential:
//! - Reference (e3nn-style) layers as they come out of training
//! - The [`Mace`] model that chains them into energies and forces
//! - SafeTensors persistence with a JSON architecture manifest

mod config;
mod interaction;
mod linear;
mod loader;
mod mace;
mod product;
mod radial;
mod spherical;
mod symmetric;
mod tensor_product;

pub use config::{MaceConfig, Precision};
pub use interaction::{Interaction, InteractionBlock, InteractionForward, InteractionKind};
pub use linear::{Instruction, IrrepsLinear};
pub use loader::{
    InteractionManifest, LayerManifest, ModelManifest, ProductManifest, ShManifest, TensorStore,
    FORMAT_VERSION, MANIFEST_KEY,
};
pub use mace::{Mace, MaceOutput};
pub use product::{Contraction, ProductBlock, ProductLinear, Readout};
pub use radial::{RadialEmbedding, RadialMlp};
pub use spherical::{
    FusedSphericalHarmonics, ReferenceSphericalHarmonics, ShNormalization, SphericalHarmonics,
};
pub use symmetric::{ContractionBlock, SymmetricContraction};
pub use tensor_product::{ConvTensorProduct, FullyConnectedTensorProduct};

use crate::error::Result;
use candle_core::{DType, Device, Tensor};

/// Access to the tensors a layer owns.
///
/// Used to persist layers, to move them between devices and precisions and
/// to detach them from autograd.
pub trait Parameters: Sized {
    /// Append every owned tensor, named under `prefix`, in registration order.
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>);

    /// Rebuild the layer with every owned tensor passed through `f`.
    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self>;
}

/// Join a parameter prefix and a name with a dot.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Standard-normal tensor in the requested precision.
pub(crate) fn randn(shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::randn(0.0f32, 1.0, shape, device)?.to_dtype(dtype)?)
}
