//! Interaction blocks: equivariant message passing between neighbors.
//!
//! A block uplifts node features, builds per-edge messages with a tensor
//! product of sender features and edge harmonics (weighted by a radial MLP),
//! sums them per receiver, mixes them with a linear layer and normalizes by
//! the average neighbor count.

use super::{
    join, ConvTensorProduct, FullyConnectedTensorProduct, IrrepsLinear, MaceConfig, Parameters,
    RadialMlp, TensorStore,
};
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use crate::transform::AcceleratedInteraction;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// Common call signature of all interaction implementations.
pub trait InteractionForward {
    /// Compute messages.
    ///
    /// # Arguments
    ///
    /// * `node_attrs` - One-hot elements [n, num_elements]
    /// * `node_feats` - Node features [n, C]
    /// * `edge_attrs` - Edge harmonics [e, (lmax + 1)^2]
    /// * `edge_feats` - Radial features [e, num_bessel]
    /// * `edge_index` - Sender (row 0) and receiver (row 1) [2, e]
    ///
    /// # Returns
    ///
    /// Messages [n, C, (lmax + 1)^2] and, for residual blocks, the
    /// self-connection [n, C].
    fn forward(
        &self,
        node_attrs: &Tensor,
        node_feats: &Tensor,
        edge_attrs: &Tensor,
        edge_feats: &Tensor,
        edge_index: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)>;
}

/// Interaction variant, derived from the block's declared type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionKind {
    /// No self-connection.
    Standard,
    /// Self-connection computed before uplifting and returned alongside
    /// the message.
    Residual,
}

impl InteractionKind {
    /// Variant of a type name such as `RealAgnosticResidualInteractionBlock`.
    ///
    /// Returns `None` when the name does not denote an interaction block.
    pub fn from_type_name(name: &str) -> Option<Self> {
        if !name.contains("InteractionBlock") {
            return None;
        }
        if name.contains("Residual") {
            Some(Self::Residual)
        } else {
            Some(Self::Standard)
        }
    }
}

/// Reshape flat `C x (0e + 1o + ...)` features into [n, C, (lmax + 1)^2].
pub(crate) fn to_channel_major(x: &Tensor, channels: usize, lmax: u32) -> Result<Tensor> {
    let n = x.dims2()?.0;
    let mut blocks = Vec::with_capacity(lmax as usize + 1);
    let mut offset = 0;
    for l in 0..=lmax as usize {
        let d = 2 * l + 1;
        blocks.push(x.narrow(1, offset, channels * d)?.reshape((n, channels, d))?);
        offset += channels * d;
    }
    Ok(Tensor::cat(&blocks, 2)?)
}

/// Reference interaction block.
#[derive(Debug, Clone)]
pub struct InteractionBlock {
    pub(crate) type_name: String,
    pub(crate) kind: InteractionKind,
    pub(crate) linear_up: IrrepsLinear,
    pub(crate) conv_tp: ConvTensorProduct,
    pub(crate) conv_tp_weights: RadialMlp,
    pub(crate) linear: IrrepsLinear,
    pub(crate) skip_tp: Option<FullyConnectedTensorProduct>,
    pub(crate) avg_num_neighbors: f64,
}

impl InteractionBlock {
    /// Assemble a block from its layers.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        type_name: impl Into<String>,
        linear_up: IrrepsLinear,
        conv_tp: ConvTensorProduct,
        conv_tp_weights: RadialMlp,
        linear: IrrepsLinear,
        skip_tp: Option<FullyConnectedTensorProduct>,
        avg_num_neighbors: f64,
    ) -> Result<Self> {
        let type_name = type_name.into();
        let kind = InteractionKind::from_type_name(&type_name).ok_or_else(|| {
            MaceOptError::ModelError(format!("`{type_name}` is not an interaction block"))
        })?;
        if (kind == InteractionKind::Residual) != skip_tp.is_some() {
            return Err(MaceOptError::ModelError(format!(
                "`{type_name}` {} a self-connection",
                if skip_tp.is_some() {
                    "does not take"
                } else {
                    "requires"
                }
            )));
        }
        if conv_tp_weights.out_dim() != conv_tp.weight_numel() {
            return Err(MaceOptError::ShapeMismatch(format!(
                "radial MLP produces {} weights, tensor product needs {}",
                conv_tp_weights.out_dim(),
                conv_tp.weight_numel()
            )));
        }
        if linear_up.irreps_out() != conv_tp.irreps_in1() || linear.irreps_in() != conv_tp.irreps_out()
        {
            return Err(MaceOptError::InvalidIrreps(format!(
                "linear layers {} / {} do not match tensor product {} -> {}",
                linear_up.irreps_out(),
                linear.irreps_in(),
                conv_tp.irreps_in1(),
                conv_tp.irreps_out()
            )));
        }
        Ok(Self {
            type_name,
            kind,
            linear_up,
            conv_tp,
            conv_tp_weights,
            linear,
            skip_tp,
            avg_num_neighbors,
        })
    }

    /// Create a block for layer `layer` with random weights (for testing).
    pub fn random(config: &MaceConfig, layer: usize, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = config.hidden_irreps();
        let target = config.target_irreps();
        let conv_tp = ConvTensorProduct::new(config.hidden_channels, config.max_ell);
        let widths = mlp_widths(config, &conv_tp);
        let type_name = config.interaction_type(layer).to_string();
        let skip_tp = match InteractionKind::from_type_name(&type_name) {
            Some(InteractionKind::Residual) => Some(FullyConnectedTensorProduct::random(
                hidden.clone(),
                Irreps::scalars(config.num_elements()),
                hidden.clone(),
                dtype,
                device,
            )?),
            _ => None,
        };
        Self::new(
            type_name,
            IrrepsLinear::random(hidden.clone(), hidden, dtype, device)?,
            conv_tp,
            RadialMlp::random(&widths, dtype, device)?,
            IrrepsLinear::random(target.clone(), target, dtype, device)?,
            skip_tp,
            config.avg_num_neighbors,
        )
    }

    /// Load block `layer` from tensors stored under `prefix`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        config: &MaceConfig,
        layer: usize,
    ) -> Result<Self> {
        let hidden = config.hidden_irreps();
        let target = config.target_irreps();
        let conv_tp = ConvTensorProduct::new(config.hidden_channels, config.max_ell);
        let widths = mlp_widths(config, &conv_tp);
        let type_name = config.interaction_type(layer).to_string();
        let skip_tp = match InteractionKind::from_type_name(&type_name) {
            Some(InteractionKind::Residual) => Some(FullyConnectedTensorProduct::load(
                store,
                &join(prefix, "skip_tp"),
                hidden.clone(),
                Irreps::scalars(config.num_elements()),
                hidden.clone(),
            )?),
            _ => None,
        };
        Self::new(
            type_name,
            IrrepsLinear::load(store, &join(prefix, "linear_up"), hidden.clone(), hidden)?,
            conv_tp,
            RadialMlp::load(store, &join(prefix, "conv_tp_weights"), widths.len() - 1)?,
            IrrepsLinear::load(store, &join(prefix, "linear"), target.clone(), target)?,
            skip_tp,
            config.avg_num_neighbors,
        )
    }

    /// Declared type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Variant.
    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    /// Average-neighbor-count normalizer.
    pub fn avg_num_neighbors(&self) -> f64 {
        self.avg_num_neighbors
    }
}

fn mlp_widths(config: &MaceConfig, conv_tp: &ConvTensorProduct) -> Vec<usize> {
    let mut widths = vec![config.num_bessel];
    widths.extend_from_slice(&config.radial_mlp);
    widths.push(conv_tp.weight_numel());
    widths
}

impl InteractionForward for InteractionBlock {
    fn forward(
        &self,
        node_attrs: &Tensor,
        node_feats: &Tensor,
        edge_attrs: &Tensor,
        edge_feats: &Tensor,
        edge_index: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let n = node_feats.dims2()?.0;
        let sender = edge_index.get(0)?;
        let receiver = edge_index.get(1)?;

        let sc = match &self.skip_tp {
            Some(skip_tp) => Some(skip_tp.forward(node_feats, node_attrs)?),
            None => None,
        };

        let h = self.linear_up.forward(node_feats)?;
        let tp_weights = self.conv_tp_weights.forward(edge_feats)?;
        let mji = self
            .conv_tp
            .forward(&h.index_select(&sender, 0)?, edge_attrs, &tp_weights)?;

        let message = Tensor::zeros((n, mji.dims2()?.1), mji.dtype(), mji.device())?
            .index_add(&receiver, &mji, 0)?;
        let message = (self.linear.forward(&message)? / self.avg_num_neighbors)?;
        let message = to_channel_major(&message, self.conv_tp.channels(), self.conv_tp.lmax())?;
        Ok((message, sc))
    }
}

impl Parameters for InteractionBlock {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.linear_up.named_tensors(&join(prefix, "linear_up"), out);
        self.conv_tp_weights
            .named_tensors(&join(prefix, "conv_tp_weights"), out);
        self.linear.named_tensors(&join(prefix, "linear"), out);
        if let Some(skip_tp) = &self.skip_tp {
            skip_tp.named_tensors(&join(prefix, "skip_tp"), out);
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(Self {
            linear_up: self.linear_up.map_tensors(f)?,
            conv_tp_weights: self.conv_tp_weights.map_tensors(f)?,
            linear: self.linear.map_tensors(f)?,
            skip_tp: self.skip_tp.map(|tp| tp.map_tensors(f)).transpose()?,
            ..self
        })
    }
}

/// An interaction layer of a model, reference or rewritten.
#[derive(Debug, Clone)]
pub enum Interaction {
    /// Layers as trained.
    Reference(InteractionBlock),
    /// Layers replaced by fused kernels.
    Accelerated(AcceleratedInteraction),
}

impl Interaction {
    /// Whether the layer has already been rewritten.
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Accelerated(_))
    }

    /// Declared type name.
    pub fn type_name(&self) -> &str {
        match self {
            Self::Reference(block) => block.type_name(),
            Self::Accelerated(block) => block.type_name(),
        }
    }

    /// Variant.
    pub fn kind(&self) -> InteractionKind {
        match self {
            Self::Reference(block) => block.kind(),
            Self::Accelerated(block) => block.kind(),
        }
    }
}

impl InteractionForward for Interaction {
    fn forward(
        &self,
        node_attrs: &Tensor,
        node_feats: &Tensor,
        edge_attrs: &Tensor,
        edge_feats: &Tensor,
        edge_index: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)> {
        match self {
            Self::Reference(block) => {
                block.forward(node_attrs, node_feats, edge_attrs, edge_feats, edge_index)
            }
            Self::Accelerated(block) => {
                block.forward(node_attrs, node_feats, edge_attrs, edge_feats, edge_index)
            }
        }
    }
}

impl Parameters for Interaction {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        match self {
            Self::Reference(block) => block.named_tensors(prefix, out),
            Self::Accelerated(block) => block.named_tensors(prefix, out),
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(match self {
            Self::Reference(block) => Self::Reference(block.map_tensors(f)?),
            Self::Accelerated(block) => Self::Accelerated(block.map_tensors(f)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> MaceConfig {
        MaceConfig {
            atomic_numbers: vec![1, 6],
            atomic_energies: vec![-1.0, -2.0],
            hidden_channels: 4,
            radial_mlp: vec![8],
            num_bessel: 4,
            ..Default::default()
        }
    }

    fn inputs(config: &MaceConfig) -> (Tensor, Tensor, Tensor, Tensor, Tensor) {
        let device = Device::Cpu;
        let node_attrs = Tensor::new(&[[1.0f64, 0.0], [0.0, 1.0], [1.0, 0.0]], &device).unwrap();
        let node_feats = Tensor::randn(0.0f64, 1.0, (3, config.hidden_channels), &device).unwrap();
        let edge_attrs = Tensor::randn(0.0f64, 1.0, (4, 16), &device).unwrap();
        let edge_feats = Tensor::randn(0.0f64, 1.0, (4, config.num_bessel), &device).unwrap();
        let edge_index = Tensor::new(&[[1i64, 2, 0, 1], [0, 0, 1, 2]], &device).unwrap();
        (node_attrs, node_feats, edge_attrs, edge_feats, edge_index)
    }

    #[test]
    fn kind_from_type_name() {
        assert_eq!(
            InteractionKind::from_type_name("RealAgnosticResidualInteractionBlock"),
            Some(InteractionKind::Residual)
        );
        assert_eq!(
            InteractionKind::from_type_name("RealAgnosticInteractionBlock"),
            Some(InteractionKind::Standard)
        );
        assert_eq!(InteractionKind::from_type_name("EquivariantProductBasisBlock"), None);
    }

    #[test]
    fn standard_block_has_no_self_connection() {
        let config = small_config();
        let block = InteractionBlock::random(&config, 0, DType::F64, &Device::Cpu).unwrap();
        assert_eq!(block.kind(), InteractionKind::Standard);

        let (a, h, y, r, idx) = inputs(&config);
        let (message, sc) = block.forward(&a, &h, &y, &r, &idx).unwrap();
        assert_eq!(message.dims(), &[3, 4, 16]);
        assert!(sc.is_none());
    }

    #[test]
    fn residual_block_returns_self_connection() {
        let config = small_config();
        let block = InteractionBlock::random(&config, 1, DType::F64, &Device::Cpu).unwrap();
        assert_eq!(block.kind(), InteractionKind::Residual);

        let (a, h, y, r, idx) = inputs(&config);
        let (message, sc) = block.forward(&a, &h, &y, &r, &idx).unwrap();
        assert_eq!(message.dims(), &[3, 4, 16]);
        assert_eq!(sc.unwrap().dims(), &[3, 4]);
    }

    #[test]
    fn node_without_incoming_edges_gets_zero_message() {
        let config = small_config();
        let block = InteractionBlock::random(&config, 0, DType::F64, &Device::Cpu).unwrap();
        let (a, h, y, r, _) = inputs(&config);
        // every edge points at node 0
        let idx = Tensor::new(&[[1i64, 2, 1, 2], [0, 0, 0, 0]], &Device::Cpu).unwrap();
        let (message, _) = block.forward(&a, &h, &y, &r, &idx).unwrap();
        let rest: Vec<f64> = message
            .narrow(0, 1, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(rest.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn channel_major_reshape() {
        // C = 2, lmax = 1: [a0 b0 | a1x a1y a1z b1x b1y b1z]
        let x = Tensor::new(&[[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]], &Device::Cpu).unwrap();
        let y: Vec<Vec<Vec<f64>>> = to_channel_major(&x, 2, 1).unwrap().to_vec3().unwrap();
        assert_eq!(y[0][0], vec![1.0, 3.0, 4.0, 5.0]);
        assert_eq!(y[0][1], vec![2.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn rejects_non_interaction_type() {
        let config = MaceConfig {
            interaction_first: "ScaleShiftBlock".to_string(),
            ..small_config()
        };
        assert!(InteractionBlock::random(&config, 0, DType::F32, &Device::Cpu).is_err());
    }
}
