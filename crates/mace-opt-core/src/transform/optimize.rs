//! Whole-model rewrite.

use super::{rewrite_layer, OptimizeOptions};
use crate::error::{MaceOptError, Result};
use crate::model::{FusedSphericalHarmonics, Interaction, Mace, SphericalHarmonics};
use tracing::{debug, info};

/// Rewrite `model` with the default options.
///
/// # Example
///
/// ```ignore
/// let model = Mace::load(Path::new("model.safetensors"), &Device::Cpu)?;
/// let model = optimize(model)?;
/// assert!(model.is_accelerated());
/// ```
pub fn optimize(model: Mace) -> Result<Mace> {
    optimize_with(model, &OptimizeOptions::default())
}

/// Rewrite every layer of `model`.
///
/// Parameters are frozen first and the working precision is taken from the
/// node embedding weight. The model is consumed; on error nothing is
/// returned.
pub fn optimize_with(model: Mace, options: &OptimizeOptions) -> Result<Mace> {
    let model = model.freeze()?;
    let dtype = model.dtype();

    let sh_lmax = model.spherical_harmonics.lmax();
    if options.sh_degree != FusedSphericalHarmonics::LMAX || sh_lmax != options.sh_degree {
        return Err(MaceOptError::structural(
            "spherical_harmonics",
            format!(
                "edge harmonics have degree {sh_lmax}, fused evaluator supports {}",
                FusedSphericalHarmonics::LMAX
            ),
        ));
    }

    let Mace {
        config,
        node_embedding,
        atomic_energies,
        radial_embedding,
        spherical_harmonics: _,
        interactions,
        products,
        readouts,
    } = model;

    info!(
        layers = interactions.len(),
        dtype = ?dtype,
        tiling = %options.tiling,
        "rewriting model"
    );

    let mut rewritten_interactions = Vec::with_capacity(interactions.len());
    let mut rewritten_products = Vec::with_capacity(products.len());
    for (layer, (interaction, product)) in interactions.into_iter().zip(products).enumerate() {
        let block = match interaction {
            Interaction::Reference(block) => block,
            Interaction::Accelerated(_) => {
                return Err(MaceOptError::structural(
                    format!("interactions.{layer}"),
                    "interaction has already been rewritten",
                ))
            }
        };
        let (interaction, product) = rewrite_layer(block, product, layer, options, dtype)?;
        debug!(layer, variant = ?interaction.kind(), type_name = interaction.type_name(), "rewrote layer");
        rewritten_interactions.push(Interaction::Accelerated(interaction));
        rewritten_products.push(product);
    }

    info!("model rewritten");
    Ok(Mace {
        config,
        node_embedding,
        atomic_energies,
        radial_embedding,
        spherical_harmonics: SphericalHarmonics::Fused(FusedSphericalHarmonics::new()),
        interactions: rewritten_interactions,
        products: rewritten_products,
        readouts,
    })
}
