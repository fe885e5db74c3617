//! Per-layer replacement.

use super::{extract_channel_linear, extract_contraction, extract_linear, LinearParams, OptimizeOptions};
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use crate::kernels::{
    AcceleratedContraction, ChannelLinear, ContractionWrapper, InvariantMessagePassing, LinearMatmul,
};
use crate::model::{
    join, ConvTensorProduct, Contraction, FullyConnectedTensorProduct, InteractionBlock,
    InteractionForward, InteractionKind, MaceConfig, Parameters, ProductBlock, ProductLinear,
    RadialMlp, SymmetricContraction, TensorStore,
};
use candle_core::{DType, Tensor};

/// Forward variant of a rewritten interaction.
#[derive(Debug, Clone)]
pub enum InteractionVariant {
    /// Message only.
    Standard,
    /// Message plus self-connection, computed before uplifting.
    Residual {
        /// Unmodified self-connection tensor product.
        skip_tp: FullyConnectedTensorProduct,
    },
}

impl InteractionVariant {
    /// Matching variant tag.
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::Standard => InteractionKind::Standard,
            Self::Residual { .. } => InteractionKind::Residual,
        }
    }
}

/// Interaction block running on fused kernels.
#[derive(Debug, Clone)]
pub struct AcceleratedInteraction {
    type_name: String,
    linear_up: LinearMatmul,
    conv_tp_weights: RadialMlp,
    tp: InvariantMessagePassing,
    linear: ChannelLinear,
    variant: InteractionVariant,
    avg_num_neighbors: f64,
}

impl AcceleratedInteraction {
    /// Declared type name of the block this was rewritten from.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Variant tag.
    pub fn kind(&self) -> InteractionKind {
        self.variant.kind()
    }

    /// Forward variant.
    pub fn variant(&self) -> &InteractionVariant {
        &self.variant
    }

    /// Average-neighbor-count normalizer.
    pub fn avg_num_neighbors(&self) -> f64 {
        self.avg_num_neighbors
    }

    /// Load a block saved from a rewritten model.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        config: &MaceConfig,
        type_name: &str,
        kind: InteractionKind,
        avg_num_neighbors: f64,
    ) -> Result<Self> {
        if InteractionKind::from_type_name(type_name) != Some(kind) {
            return Err(MaceOptError::structural(
                prefix,
                format!("`{type_name}` does not denote a {kind:?} interaction"),
            ));
        }
        let hidden = config.hidden_irreps();
        let variant = match kind {
            InteractionKind::Standard => InteractionVariant::Standard,
            InteractionKind::Residual => InteractionVariant::Residual {
                skip_tp: FullyConnectedTensorProduct::load(
                    store,
                    &join(prefix, "skip_tp"),
                    hidden.clone(),
                    Irreps::scalars(config.num_elements()),
                    hidden,
                )?,
            },
        };
        Ok(Self {
            type_name: type_name.to_string(),
            linear_up: LinearMatmul::load(store, &join(prefix, "linear_up"))?,
            conv_tp_weights: RadialMlp::load(
                store,
                &join(prefix, "conv_tp_weights"),
                config.radial_mlp.len() + 1,
            )?,
            tp: InvariantMessagePassing::new(config.hidden_channels, config.max_ell),
            linear: ChannelLinear::load(store, &join(prefix, "linear"), config.max_ell)?,
            variant,
            avg_num_neighbors,
        })
    }
}

impl InteractionForward for AcceleratedInteraction {
    fn forward(
        &self,
        node_attrs: &Tensor,
        node_feats: &Tensor,
        edge_attrs: &Tensor,
        edge_feats: &Tensor,
        edge_index: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let sender = edge_index.get(0)?.to_dtype(DType::U32)?;
        let receiver = edge_index.get(1)?.to_dtype(DType::U32)?;
        let num_nodes = node_feats.dims2()?.0;

        let sc = match &self.variant {
            InteractionVariant::Residual { skip_tp } => Some(skip_tp.forward(node_feats, node_attrs)?),
            InteractionVariant::Standard => None,
        };

        let h = self.linear_up.forward(node_feats)?;
        let tp_weights = self.conv_tp_weights.forward(edge_feats)?;
        let offsets = self.tp.calculate_first_occurrences(&receiver, num_nodes)?;

        // [e, (lmax + 1) * C] -> [e, lmax + 1, C]
        let (num_edges, width) = tp_weights.dims2()?;
        let channels = h.dims2()?.1;
        let tp_weights = tp_weights.reshape((num_edges, width / channels, channels))?;

        let message = self
            .tp
            .forward(&h, edge_attrs, &tp_weights, &sender, &receiver, &offsets)?;
        let message = (self.linear.forward(&message)? / self.avg_num_neighbors)?;
        Ok((message, sc))
    }
}

impl Parameters for AcceleratedInteraction {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.linear_up.named_tensors(&join(prefix, "linear_up"), out);
        self.conv_tp_weights
            .named_tensors(&join(prefix, "conv_tp_weights"), out);
        self.linear.named_tensors(&join(prefix, "linear"), out);
        if let InteractionVariant::Residual { skip_tp } = &self.variant {
            skip_tp.named_tensors(&join(prefix, "skip_tp"), out);
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let variant = match self.variant {
            InteractionVariant::Standard => InteractionVariant::Standard,
            InteractionVariant::Residual { skip_tp } => InteractionVariant::Residual {
                skip_tp: skip_tp.map_tensors(f)?,
            },
        };
        Ok(Self {
            type_name: self.type_name,
            linear_up: self.linear_up.map_tensors(f)?,
            conv_tp_weights: self.conv_tp_weights.map_tensors(f)?,
            tp: self.tp,
            linear: self.linear.map_tensors(f)?,
            variant,
            avg_num_neighbors: self.avg_num_neighbors,
        })
    }
}

/// `W.reshape(c_in, c_out) / sqrt(c_in)` as a single matmul.
pub fn replace_linear(params: LinearParams, layer: &str) -> Result<LinearMatmul> {
    let LinearParams { c_in, c_out, weight } = params;
    if weight.elem_count() != c_in * c_out {
        return Err(MaceOptError::structural(
            layer,
            format!(
                "weight has {} elements, expected {c_in} x {c_out}",
                weight.elem_count()
            ),
        ));
    }
    let weight = (weight.reshape((c_in, c_out))? / (c_in as f64).sqrt())?;
    LinearMatmul::new(weight)
}

/// Bucketed message passing with the same channels and degree as `conv_tp`.
pub fn replace_tensor_product(
    conv_tp: &ConvTensorProduct,
    options: &OptimizeOptions,
    layer: &str,
) -> Result<InvariantMessagePassing> {
    if conv_tp.lmax() != options.sh_degree {
        return Err(MaceOptError::structural(
            layer,
            format!(
                "tensor product couples degree {}, fused harmonics provide {}",
                conv_tp.lmax(),
                options.sh_degree
            ),
        ));
    }
    Ok(InvariantMessagePassing::new(conv_tp.channels(), conv_tp.lmax()))
}

/// Fused contraction built from the weights of `sc`.
pub fn replace_contraction(
    sc: &SymmetricContraction,
    options: &OptimizeOptions,
    dtype: DType,
    layer: &str,
) -> Result<ContractionWrapper> {
    let weights = extract_contraction(sc, dtype, layer)?;
    let coupling = sc.irreps_in().coupling();
    let kernel = AcceleratedContraction::new(
        coupling,
        sc.irreps_out().clone(),
        &weights,
        options.tiling,
        dtype,
    )
    .map_err(|e| MaceOptError::structural(layer, e.to_string()))?;
    Ok(ContractionWrapper::new(kernel))
}

/// Rewrite interaction `layer` and its product block.
pub fn rewrite_layer(
    block: InteractionBlock,
    product: ProductBlock,
    layer: usize,
    options: &OptimizeOptions,
    dtype: DType,
) -> Result<(AcceleratedInteraction, ProductBlock)> {
    let path = format!("interactions.{layer}");
    let kind = InteractionKind::from_type_name(&block.type_name).ok_or_else(|| {
        MaceOptError::structural(
            &path,
            format!("`{}` is not an interaction block", block.type_name),
        )
    })?;

    let linear_up = replace_linear(
        extract_linear(&block.linear_up),
        &join(&path, "linear_up"),
    )?;
    let tp = replace_tensor_product(&block.conv_tp, options, &join(&path, "conv_tp"))?;
    let linear = ChannelLinear::new(extract_channel_linear(
        &block.linear,
        &join(&path, "linear"),
    )?)?;
    let variant = match (kind, block.skip_tp) {
        (InteractionKind::Residual, Some(skip_tp)) => InteractionVariant::Residual { skip_tp },
        (InteractionKind::Standard, None) => InteractionVariant::Standard,
        (kind, _) => {
            return Err(MaceOptError::structural(
                join(&path, "skip_tp"),
                format!("{kind:?} block has an unexpected self-connection layout"),
            ))
        }
    };

    let interaction = AcceleratedInteraction {
        type_name: block.type_name,
        linear_up,
        conv_tp_weights: block.conv_tp_weights,
        tp,
        linear,
        variant,
        avg_num_neighbors: block.avg_num_neighbors,
    };

    let path = format!("products.{layer}");
    let ProductBlock {
        contraction,
        linear,
        use_sc,
    } = product;
    let contraction = match contraction {
        Contraction::Reference(sc) => replace_contraction(
            &sc,
            options,
            dtype,
            &join(&path, "symmetric_contractions"),
        )?,
        Contraction::Accelerated(_) => {
            return Err(MaceOptError::structural(
                join(&path, "symmetric_contractions"),
                "contraction has already been rewritten",
            ))
        }
    };
    let linear = match linear {
        ProductLinear::Reference(linear) => {
            replace_linear(extract_linear(&linear), &join(&path, "linear"))?
        }
        ProductLinear::Matmul(_) => {
            return Err(MaceOptError::structural(
                join(&path, "linear"),
                "linear has already been rewritten",
            ))
        }
    };

    let product = ProductBlock::new(
        Contraction::Accelerated(contraction),
        ProductLinear::Matmul(linear),
        use_sc,
    );
    Ok((interaction, product))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn small_config() -> MaceConfig {
        MaceConfig {
            atomic_numbers: vec![1, 6],
            atomic_energies: vec![0.0, 0.0],
            hidden_channels: 4,
            radial_mlp: vec![8],
            num_bessel: 4,
            ..Default::default()
        }
    }

    fn inputs() -> (Tensor, Tensor, Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let node_attrs = Tensor::new(&[[1.0f64, 0.0], [0.0, 1.0], [1.0, 0.0]], &device).unwrap();
        let node_feats = Tensor::randn(0.0f64, 1.0, (3, 4), &device).unwrap();
        let edge_attrs = Tensor::randn(0.0f64, 1.0, (4, 16), &device).unwrap();
        let edge_feats = Tensor::randn(0.0f64, 1.0, (4, 4), &device).unwrap();
        // sorted by receiver
        let edge_index = Tensor::new(&[[1i64, 2, 0, 1], [0, 0, 1, 2]], &device).unwrap();
        (node_attrs, node_feats, edge_attrs, edge_feats, edge_index)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f64>()
            .unwrap()
    }

    #[test]
    fn linear_rewrite_is_exact() {
        let device = Device::Cpu;
        let linear = crate::model::IrrepsLinear::random(
            Irreps::scalars(9),
            Irreps::scalars(5),
            DType::F64,
            &device,
        )
        .unwrap();
        let matmul = replace_linear(extract_linear(&linear), "products.0.linear").unwrap();

        let x = Tensor::randn(0.0f64, 1.0, (7, 9), &device).unwrap();
        let a = linear.forward(&x).unwrap();
        let b = matmul.forward(&x).unwrap();
        assert!(max_diff(&a, &b) < 1e-12);
    }

    #[test]
    fn linear_weight_count_mismatch_fails_fast() {
        let params = LinearParams {
            c_in: 4,
            c_out: 4,
            weight: Tensor::zeros(15, DType::F32, &Device::Cpu).unwrap(),
        };
        let err = replace_linear(params, "interactions.0.linear_up").unwrap_err();
        assert!(matches!(err, MaceOptError::StructuralMismatch { .. }));
    }

    #[test]
    fn rewritten_layers_match_reference() {
        let config = small_config();
        let device = Device::Cpu;
        let (a, h, y, r, idx) = inputs();

        for layer in 0..2 {
            let block = InteractionBlock::random(&config, layer, DType::F64, &device).unwrap();
            let use_sc = block.kind() == InteractionKind::Residual;
            let product = ProductBlock::random(&config, use_sc, DType::F64, &device).unwrap();

            let (m_ref, sc_ref) = block.forward(&a, &h, &y, &r, &idx).unwrap();
            let out_ref = product.forward(&m_ref, sc_ref.as_ref(), &a).unwrap();

            let (block, product) = rewrite_layer(
                block,
                product,
                layer,
                &OptimizeOptions::default(),
                DType::F64,
            )
            .unwrap();
            let (m_opt, sc_opt) = block.forward(&a, &h, &y, &r, &idx).unwrap();
            let out_opt = product.forward(&m_opt, sc_opt.as_ref(), &a).unwrap();

            assert_eq!(m_opt.dims(), &[3, 4, 16]);
            assert_eq!(sc_opt.is_some(), use_sc);
            assert!(max_diff(&m_ref, &m_opt) < 1e-10);
            assert!(max_diff(&out_ref, &out_opt) < 1e-10);
        }
    }

    #[test]
    fn variant_follows_type_name() {
        let config = small_config();
        let device = Device::Cpu;
        for (layer, expected) in [(0, InteractionKind::Standard), (1, InteractionKind::Residual)] {
            let block = InteractionBlock::random(&config, layer, DType::F32, &device).unwrap();
            let product = ProductBlock::random(&config, false, DType::F32, &device).unwrap();
            let (block, _) =
                rewrite_layer(block, product, layer, &OptimizeOptions::default(), DType::F32)
                    .unwrap();
            assert_eq!(block.kind(), expected);
        }
    }

    #[test]
    fn rejects_rewritten_product() {
        let config = small_config();
        let device = Device::Cpu;
        let block = InteractionBlock::random(&config, 0, DType::F32, &device).unwrap();
        let product = ProductBlock::random(&config, false, DType::F32, &device).unwrap();
        let (_, rewritten) =
            rewrite_layer(block, product, 0, &OptimizeOptions::default(), DType::F32).unwrap();

        let block = InteractionBlock::random(&config, 0, DType::F32, &device).unwrap();
        let err = rewrite_layer(block, rewritten, 0, &OptimizeOptions::default(), DType::F32)
            .unwrap_err();
        assert!(err.to_string().contains("products.0.symmetric_contractions"));
    }

    #[test]
    fn unsorted_edges_are_rejected() {
        let config = small_config();
        let device = Device::Cpu;
        let block = InteractionBlock::random(&config, 0, DType::F64, &device).unwrap();
        let product = ProductBlock::random(&config, false, DType::F64, &device).unwrap();
        let (block, _) =
            rewrite_layer(block, product, 0, &OptimizeOptions::default(), DType::F64).unwrap();

        let (a, h, y, r, _) = inputs();
        let idx = Tensor::new(&[[1i64, 2, 0, 1], [2, 0, 1, 0]], &device).unwrap();
        assert!(matches!(
            block.forward(&a, &h, &y, &r, &idx),
            Err(MaceOptError::UnsortedReceivers(_))
        ));
    }
}
