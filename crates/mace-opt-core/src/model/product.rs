//! Product blocks and readouts.
//!
//! A product block contracts the aggregated message into invariant node
//! features, mixes them with a linear layer and optionally adds the residual
//! self-connection of the preceding interaction.

use super::{join, IrrepsLinear, MaceConfig, Parameters, SymmetricContraction, TensorStore};
use crate::error::Result;
use crate::irreps::Irreps;
use crate::kernels::{ContractionWrapper, KernelTiling, LinearMatmul};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::silu;

/// Symmetric contraction of a product block.
#[derive(Debug, Clone)]
pub enum Contraction {
    /// Generic contraction over one-hot attributes.
    Reference(SymmetricContraction),
    /// Fused kernel selecting weights by element index.
    Accelerated(ContractionWrapper),
}

impl Contraction {
    /// Contract messages [n, C, K] with node attributes [n, E] into [n, C].
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        match self {
            Self::Reference(sc) => sc.forward(x, y),
            Self::Accelerated(sc) => sc.forward(x, y),
        }
    }
}

/// Trailing linear of a product block.
#[derive(Debug, Clone)]
pub enum ProductLinear {
    /// Generic irreps linear.
    Reference(IrrepsLinear),
    /// Single pre-normalized matmul.
    Matmul(LinearMatmul),
}

impl ProductLinear {
    /// Apply to [n, C_in].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Reference(linear) => linear.forward(x),
            Self::Matmul(linear) => linear.forward(x),
        }
    }
}

/// Contraction, linear and optional residual add.
#[derive(Debug, Clone)]
pub struct ProductBlock {
    pub(crate) contraction: Contraction,
    pub(crate) linear: ProductLinear,
    pub(crate) use_sc: bool,
}

impl ProductBlock {
    /// Assemble a product block.
    pub fn new(contraction: Contraction, linear: ProductLinear, use_sc: bool) -> Self {
        Self {
            contraction,
            linear,
            use_sc,
        }
    }

    /// Create with random reference layers (for testing).
    pub fn random(config: &MaceConfig, use_sc: bool, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = config.hidden_irreps();
        let contraction = SymmetricContraction::random(
            config.target_irreps(),
            hidden.clone(),
            config.correlation,
            config.num_elements(),
            dtype,
            device,
        )?;
        let linear = IrrepsLinear::random(hidden.clone(), hidden, dtype, device)?;
        Ok(Self::new(
            Contraction::Reference(contraction),
            ProductLinear::Reference(linear),
            use_sc,
        ))
    }

    /// Load reference layers stored under `prefix`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        config: &MaceConfig,
        use_sc: bool,
    ) -> Result<Self> {
        let hidden = config.hidden_irreps();
        let contraction = SymmetricContraction::load(
            store,
            &join(prefix, "symmetric_contractions"),
            config.target_irreps(),
            hidden.clone(),
            config.correlation,
        )?;
        let linear = IrrepsLinear::load(store, &join(prefix, "linear"), hidden.clone(), hidden)?;
        Ok(Self::new(
            Contraction::Reference(contraction),
            ProductLinear::Reference(linear),
            use_sc,
        ))
    }

    /// Load rewritten layers stored under `prefix`.
    pub fn load_accelerated(
        store: &TensorStore,
        prefix: &str,
        config: &MaceConfig,
        use_sc: bool,
        tiling: KernelTiling,
    ) -> Result<Self> {
        let contraction = ContractionWrapper::load(
            store,
            &join(prefix, "symmetric_contractions"),
            config.target_irreps().coupling(),
            config.hidden_irreps(),
            tiling,
        )?;
        let linear = LinearMatmul::load(store, &join(prefix, "linear"))?;
        Ok(Self::new(
            Contraction::Accelerated(contraction),
            ProductLinear::Matmul(linear),
            use_sc,
        ))
    }

    /// The contraction.
    pub fn contraction(&self) -> &Contraction {
        &self.contraction
    }

    /// The trailing linear.
    pub fn linear(&self) -> &ProductLinear {
        &self.linear
    }

    /// Whether the residual self-connection is added.
    pub fn use_sc(&self) -> bool {
        self.use_sc
    }

    /// Whether both sublayers have been rewritten.
    pub fn is_accelerated(&self) -> bool {
        matches!(
            (&self.contraction, &self.linear),
            (Contraction::Accelerated(_), ProductLinear::Matmul(_))
        )
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `node_feats` - Messages [n, C, K]
    /// * `sc` - Self-connection [n, C] from a residual interaction
    /// * `node_attrs` - One-hot elements [n, E]
    pub fn forward(
        &self,
        node_feats: &Tensor,
        sc: Option<&Tensor>,
        node_attrs: &Tensor,
    ) -> Result<Tensor> {
        let h = self.contraction.forward(node_feats, node_attrs)?;
        let h = self.linear.forward(&h)?;
        match sc {
            Some(sc) if self.use_sc => Ok((h + sc)?),
            _ => Ok(h),
        }
    }
}

impl Parameters for ProductBlock {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        let contraction = join(prefix, "symmetric_contractions");
        match &self.contraction {
            Contraction::Reference(sc) => sc.named_tensors(&contraction, out),
            Contraction::Accelerated(sc) => sc.named_tensors(&contraction, out),
        }
        let linear = join(prefix, "linear");
        match &self.linear {
            ProductLinear::Reference(l) => l.named_tensors(&linear, out),
            ProductLinear::Matmul(l) => l.named_tensors(&linear, out),
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let contraction = match self.contraction {
            Contraction::Reference(sc) => Contraction::Reference(sc.map_tensors(f)?),
            Contraction::Accelerated(sc) => Contraction::Accelerated(sc.map_tensors(f)?),
        };
        let linear = match self.linear {
            ProductLinear::Reference(l) => ProductLinear::Reference(l.map_tensors(f)?),
            ProductLinear::Matmul(l) => ProductLinear::Matmul(l.map_tensors(f)?),
        };
        Ok(Self {
            contraction,
            linear,
            use_sc: self.use_sc,
        })
    }
}

/// Per-layer energy readout.
#[derive(Debug, Clone)]
pub enum Readout {
    /// `C -> 1` linear.
    Linear(IrrepsLinear),
    /// `C -> hidden -> 1` with SiLU in between.
    NonLinear {
        /// First layer.
        hidden: IrrepsLinear,
        /// Output layer.
        output: IrrepsLinear,
    },
}

impl Readout {
    /// Create a readout with random weights (for testing).
    pub fn random(config: &MaceConfig, last: bool, dtype: DType, device: &Device) -> Result<Self> {
        let hidden = config.hidden_irreps();
        let scalar = Irreps::scalars(1);
        if last {
            let mid = Irreps::scalars(config.readout_hidden);
            Ok(Self::NonLinear {
                hidden: IrrepsLinear::random(hidden, mid.clone(), dtype, device)?,
                output: IrrepsLinear::random(mid, scalar, dtype, device)?,
            })
        } else {
            Ok(Self::Linear(IrrepsLinear::random(hidden, scalar, dtype, device)?))
        }
    }

    /// Load a readout stored under `prefix`.
    pub fn load(store: &TensorStore, prefix: &str, config: &MaceConfig, last: bool) -> Result<Self> {
        let hidden = config.hidden_irreps();
        let scalar = Irreps::scalars(1);
        if last {
            let mid = Irreps::scalars(config.readout_hidden);
            Ok(Self::NonLinear {
                hidden: IrrepsLinear::load(store, &join(prefix, "linear_1"), hidden, mid.clone())?,
                output: IrrepsLinear::load(store, &join(prefix, "linear_2"), mid, scalar)?,
            })
        } else {
            Ok(Self::Linear(IrrepsLinear::load(
                store,
                &join(prefix, "linear"),
                hidden,
                scalar,
            )?))
        }
    }

    /// Node energies [n, 1] from node features [n, C].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Linear(linear) => linear.forward(x),
            Self::NonLinear { hidden, output } => output.forward(&silu(&hidden.forward(x)?)?),
        }
    }
}

impl Parameters for Readout {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        match self {
            Self::Linear(linear) => linear.named_tensors(&join(prefix, "linear"), out),
            Self::NonLinear { hidden, output } => {
                hidden.named_tensors(&join(prefix, "linear_1"), out);
                output.named_tensors(&join(prefix, "linear_2"), out);
            }
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(match self {
            Self::Linear(linear) => Self::Linear(linear.map_tensors(f)?),
            Self::NonLinear { hidden, output } => Self::NonLinear {
                hidden: hidden.map_tensors(f)?,
                output: output.map_tensors(f)?,
            },
        })
    }
}
