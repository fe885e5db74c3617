//! The MACE interatomic potential.
//!
//! # Formula
//!
//! `E = sum_nodes (attrs . E0) + sum_layers sum_nodes readout_i(h_i)`
//!
//! with `h_0 = embedding(attrs)`, `(m_i, sc_i) = interaction_i(h_i, ...)` and
//! `h_(i+1) = product_i(m_i, sc_i, attrs)`. Forces are `-dE/dpos`.

use super::{
    join, Contraction, FusedSphericalHarmonics, Interaction, InteractionBlock, InteractionForward,
    InteractionManifest, IrrepsLinear, LayerManifest, MaceConfig, ModelManifest, Parameters,
    Precision, ProductBlock, ProductManifest, RadialEmbedding, Readout,
    ReferenceSphericalHarmonics, ShManifest, ShNormalization, SphericalHarmonics, TensorStore,
    FORMAT_VERSION,
};
use crate::data::AtomicGraph;
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use crate::transform::AcceleratedInteraction;
use candle_core::{DType, Device, Tensor, Var};
use std::path::Path;

/// Output of a forward pass.
#[derive(Debug, Clone)]
pub struct MaceOutput {
    /// Total energy per graph [num_graphs].
    pub energy: Tensor,
    /// Energy per node [n].
    pub node_energy: Tensor,
    /// Forces [n, 3], when requested.
    pub forces: Option<Tensor>,
}

/// A MACE model.
#[derive(Debug, Clone)]
pub struct Mace {
    pub(crate) config: MaceConfig,
    pub(crate) node_embedding: IrrepsLinear,
    /// Reference energies [num_elements, 1]
    pub(crate) atomic_energies: Tensor,
    pub(crate) radial_embedding: RadialEmbedding,
    pub(crate) spherical_harmonics: SphericalHarmonics,
    pub(crate) interactions: Vec<Interaction>,
    pub(crate) products: Vec<ProductBlock>,
    pub(crate) readouts: Vec<Readout>,
}

impl Mace {
    /// Create a model with random reference layers (for testing).
    pub fn random(config: MaceConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let num_elements = config.num_elements();

        let node_embedding = IrrepsLinear::random(
            Irreps::scalars(num_elements),
            config.hidden_irreps(),
            dtype,
            device,
        )?;
        let atomic_energies = atomic_energies_tensor(&config, dtype, device)?;

        let mut interactions = Vec::with_capacity(config.num_interactions);
        let mut products = Vec::with_capacity(config.num_interactions);
        let mut readouts = Vec::with_capacity(config.num_interactions);
        for layer in 0..config.num_interactions {
            let block = InteractionBlock::random(&config, layer, dtype, device)?;
            let use_sc = block.skip_tp.is_some();
            interactions.push(Interaction::Reference(block));
            products.push(ProductBlock::random(&config, use_sc, dtype, device)?);
            let last = layer + 1 == config.num_interactions;
            readouts.push(Readout::random(&config, last, dtype, device)?);
        }

        Ok(Self {
            radial_embedding: radial_embedding(&config),
            spherical_harmonics: SphericalHarmonics::Reference(ReferenceSphericalHarmonics::new(
                config.max_ell,
                true,
                ShNormalization::Component,
            )?),
            config,
            node_embedding,
            atomic_energies,
            interactions,
            products,
            readouts,
        })
    }

    /// Architecture hyperparameters.
    pub fn config(&self) -> &MaceConfig {
        &self.config
    }

    /// Number of interaction layers.
    pub fn num_interactions(&self) -> usize {
        self.interactions.len()
    }

    /// Interaction layers.
    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Product blocks.
    pub fn products(&self) -> &[ProductBlock] {
        &self.products
    }

    /// Edge harmonics front-end.
    pub fn spherical_harmonics(&self) -> &SphericalHarmonics {
        &self.spherical_harmonics
    }

    /// Precision of the first parameter tensor.
    pub fn dtype(&self) -> DType {
        self.node_embedding.weight().dtype()
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        self.node_embedding.weight().device()
    }

    /// Whether every layer has been rewritten.
    pub fn is_accelerated(&self) -> bool {
        matches!(self.spherical_harmonics, SphericalHarmonics::Fused(_))
            && self.interactions.iter().all(Interaction::is_accelerated)
            && self.products.iter().all(ProductBlock::is_accelerated)
    }

    /// Every parameter, named, in registration order.
    pub fn parameters(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::new();
        self.named_tensors("", &mut out);
        out
    }

    /// Detach every parameter from any autograd graph.
    pub fn freeze(self) -> Result<Self> {
        self.map_tensors(&mut |t: &Tensor| Ok(t.detach()))
    }

    /// Convert floating point parameters to `dtype`.
    pub fn to_dtype(self, dtype: DType) -> Result<Self> {
        self.map_tensors(&mut |t: &Tensor| {
            if t.dtype().is_float() {
                Ok(t.to_dtype(dtype)?)
            } else {
                Ok(t.clone())
            }
        })
    }

    /// Move every parameter to `device`.
    pub fn to_device(self, device: &Device) -> Result<Self> {
        self.map_tensors(&mut |t: &Tensor| Ok(t.to_device(device)?))
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `graph` - Batched atomic graph
    /// * `compute_force` - Also differentiate the energy with respect to
    ///   positions
    pub fn forward(&self, graph: &AtomicGraph, compute_force: bool) -> Result<MaceOutput> {
        let dtype = self.dtype();
        let device = self.device();
        let positions = graph.positions().to_dtype(dtype)?.to_device(device)?;
        let node_attrs = graph.node_attrs().to_dtype(dtype)?.to_device(device)?;
        let shifts = graph.shifts().to_dtype(dtype)?.to_device(device)?;
        let edge_index = graph.edge_index().to_device(device)?;
        let batch = graph.batch().to_device(device)?;

        if node_attrs.dims2()?.1 != self.config.num_elements() {
            return Err(MaceOptError::ShapeMismatch(format!(
                "node attributes have {} elements, model has {}",
                node_attrs.dims2()?.1,
                self.config.num_elements()
            )));
        }

        let var = if compute_force {
            Some(Var::from_tensor(&positions)?)
        } else {
            None
        };
        let positions = var.as_ref().map(|v| v.as_tensor().clone()).unwrap_or(positions);

        // e0 [n]
        let mut node_energy = node_attrs.matmul(&self.atomic_energies)?.squeeze(1)?;

        let sender = edge_index.get(0)?;
        let receiver = edge_index.get(1)?;
        let vectors = ((positions.index_select(&receiver, 0)? - positions.index_select(&sender, 0)?)?
            + shifts)?;
        let lengths = vectors.sqr()?.sum_keepdim(1)?.sqrt()?;

        let edge_attrs = self.spherical_harmonics.forward(&vectors)?;
        let edge_feats = self.radial_embedding.forward(&lengths)?;

        let mut h = self.node_embedding.forward(&node_attrs)?;
        for ((interaction, product), readout) in self
            .interactions
            .iter()
            .zip(&self.products)
            .zip(&self.readouts)
        {
            let (message, sc) =
                interaction.forward(&node_attrs, &h, &edge_attrs, &edge_feats, &edge_index)?;
            h = product.forward(&message, sc.as_ref(), &node_attrs)?;
            node_energy = (node_energy + readout.forward(&h)?.squeeze(1)?)?;
        }

        let energy = Tensor::zeros(graph.num_graphs(), dtype, device)?.index_add(
            &batch,
            &node_energy,
            0,
        )?;

        let forces = match &var {
            Some(var) => {
                let grads = energy.sum_all()?.backward()?;
                let forces = match grads.get(var.as_tensor()) {
                    Some(grad) => grad.neg()?,
                    None => var.as_tensor().zeros_like()?,
                };
                Some(forces.detach())
            }
            None => None,
        };

        Ok(MaceOutput {
            energy: energy.detach(),
            node_energy: node_energy.detach(),
            forces,
        })
    }

    /// Architecture manifest of this model.
    pub fn manifest(&self) -> Result<ModelManifest> {
        let precision = Precision::from_dtype(self.dtype()).ok_or_else(|| {
            MaceOptError::ModelError(format!("cannot persist a {:?} model", self.dtype()))
        })?;
        let spherical_harmonics = match &self.spherical_harmonics {
            SphericalHarmonics::Reference(sh) => ShManifest::Reference {
                lmax: sh.lmax(),
                normalize: sh.normalize(),
                normalization: sh.normalization(),
            },
            SphericalHarmonics::Fused(_) => ShManifest::Fused,
        };
        let mut layers = Vec::with_capacity(self.interactions.len());
        for (interaction, product) in self.interactions.iter().zip(&self.products) {
            let interaction = match interaction {
                Interaction::Reference(block) => InteractionManifest::Reference {
                    type_name: block.type_name().to_string(),
                    avg_num_neighbors: block.avg_num_neighbors(),
                },
                Interaction::Accelerated(block) => InteractionManifest::Accelerated {
                    type_name: block.type_name().to_string(),
                    variant: block.kind(),
                    avg_num_neighbors: block.avg_num_neighbors(),
                },
            };
            let product = match product.contraction() {
                Contraction::Accelerated(wrapper) if product.is_accelerated() => {
                    ProductManifest::Accelerated {
                        use_sc: product.use_sc(),
                        tiling: wrapper.tiling(),
                    }
                }
                Contraction::Reference(_) if !product.is_accelerated() => {
                    ProductManifest::Reference {
                        use_sc: product.use_sc(),
                    }
                }
                _ => {
                    return Err(MaceOptError::ModelError(
                        "product block mixes reference and rewritten sublayers".to_string(),
                    ))
                }
            };
            layers.push(LayerManifest {
                interaction,
                product,
            });
        }
        Ok(ModelManifest {
            format_version: FORMAT_VERSION,
            config: self.config.clone(),
            precision,
            spherical_harmonics,
            layers,
        })
    }

    /// Save tensors and manifest to a SafeTensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let manifest = self.manifest()?;
        let parameters = self.parameters();
        TensorStore::save(path, &parameters, &manifest)?;
        tracing::info!(
            path = %path.display(),
            tensors = parameters.len(),
            "saved model"
        );
        Ok(())
    }

    /// Load a model saved with [`Mace::save`].
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let store = TensorStore::from_file(path, device)?;
        let manifest = store.manifest()?;
        let config = manifest.config;
        config.validate()?;
        if manifest.layers.len() != config.num_interactions {
            return Err(MaceOptError::ModelError(format!(
                "manifest lists {} layers, config has {}",
                manifest.layers.len(),
                config.num_interactions
            )));
        }

        let spherical_harmonics = match manifest.spherical_harmonics {
            ShManifest::Reference {
                lmax,
                normalize,
                normalization,
            } => SphericalHarmonics::Reference(ReferenceSphericalHarmonics::new(
                lmax,
                normalize,
                normalization,
            )?),
            ShManifest::Fused => SphericalHarmonics::Fused(FusedSphericalHarmonics::new()),
        };

        let node_embedding = IrrepsLinear::load(
            &store,
            "node_embedding",
            Irreps::scalars(config.num_elements()),
            config.hidden_irreps(),
        )?;
        let atomic_energies = store.get_tensor("atomic_energies")?;

        let mut interactions = Vec::with_capacity(config.num_interactions);
        let mut products = Vec::with_capacity(config.num_interactions);
        let mut readouts = Vec::with_capacity(config.num_interactions);
        for (layer, entry) in manifest.layers.iter().enumerate() {
            let prefix = format!("interactions.{layer}");
            let interaction = match &entry.interaction {
                InteractionManifest::Reference {
                    type_name,
                    avg_num_neighbors,
                } => {
                    let mut block = InteractionBlock::load(&store, &prefix, &config, layer)?;
                    if block.type_name() != type_name {
                        return Err(MaceOptError::ModelError(format!(
                            "layer {layer}: manifest type `{type_name}` disagrees with config `{}`",
                            block.type_name()
                        )));
                    }
                    block.avg_num_neighbors = *avg_num_neighbors;
                    Interaction::Reference(block)
                }
                InteractionManifest::Accelerated {
                    type_name,
                    variant,
                    avg_num_neighbors,
                } => Interaction::Accelerated(AcceleratedInteraction::load(
                    &store,
                    &prefix,
                    &config,
                    type_name,
                    *variant,
                    *avg_num_neighbors,
                )?),
            };
            interactions.push(interaction);

            let prefix = format!("products.{layer}");
            let product = match &entry.product {
                ProductManifest::Reference { use_sc } => {
                    ProductBlock::load(&store, &prefix, &config, *use_sc)?
                }
                ProductManifest::Accelerated { use_sc, tiling } => {
                    ProductBlock::load_accelerated(&store, &prefix, &config, *use_sc, *tiling)?
                }
            };
            products.push(product);

            let last = layer + 1 == config.num_interactions;
            readouts.push(Readout::load(
                &store,
                &format!("readouts.{layer}"),
                &config,
                last,
            )?);
        }

        let model = Self {
            radial_embedding: radial_embedding(&config),
            config,
            node_embedding,
            atomic_energies,
            spherical_harmonics,
            interactions,
            products,
            readouts,
        };
        let used = model.parameters().len();
        if used != store.len() {
            return Err(MaceOptError::ModelError(format!(
                "{} holds {} tensors, the model uses {used}",
                path.display(),
                store.len()
            )));
        }

        tracing::info!(
            path = %path.display(),
            layers = model.interactions.len(),
            precision = %manifest.precision,
            "loaded model"
        );
        Ok(model)
    }
}

fn radial_embedding(config: &MaceConfig) -> RadialEmbedding {
    RadialEmbedding::new(
        config.r_max,
        config.num_bessel,
        config.num_polynomial_cutoff,
    )
}

fn atomic_energies_tensor(config: &MaceConfig, dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(
        Tensor::from_vec(config.atomic_energies.clone(), (config.num_elements(), 1), device)?
            .to_dtype(dtype)?,
    )
}

impl Parameters for Mace {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.node_embedding
            .named_tensors(&join(prefix, "node_embedding"), out);
        out.push((join(prefix, "atomic_energies"), self.atomic_energies.clone()));
        for (i, interaction) in self.interactions.iter().enumerate() {
            interaction.named_tensors(&join(prefix, &format!("interactions.{i}")), out);
        }
        for (i, product) in self.products.iter().enumerate() {
            product.named_tensors(&join(prefix, &format!("products.{i}")), out);
        }
        for (i, readout) in self.readouts.iter().enumerate() {
            readout.named_tensors(&join(prefix, &format!("readouts.{i}")), out);
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let node_embedding = self.node_embedding.map_tensors(f)?;
        let atomic_energies = f(&self.atomic_energies)?;
        let interactions = self
            .interactions
            .into_iter()
            .map(|i| i.map_tensors(f))
            .collect::<Result<Vec<_>>>()?;
        let products = self
            .products
            .into_iter()
            .map(|p| p.map_tensors(f))
            .collect::<Result<Vec<_>>>()?;
        let readouts = self
            .readouts
            .into_iter()
            .map(|r| r.map_tensors(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config: self.config,
            node_embedding,
            atomic_energies,
            radial_embedding: self.radial_embedding,
            spherical_harmonics: self.spherical_harmonics,
            interactions,
            products,
            readouts,
        })
    }
}
