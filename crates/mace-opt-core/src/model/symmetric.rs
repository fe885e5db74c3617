//! Symmetric contraction of aggregated messages into invariant node features.
//!
//! For each channel the message `A[n, c, lm]` is expanded into invariant
//! many-body basis functions, which are mixed with element-dependent weights.
//!
//! # Formula
//!
//! `q_l = sum_m A_lm^2`
//!
//! - order 1: `A_00`
//! - order 2: `q_l` for every `l`
//! - order 3: `A_00 * q_l` for every `l`
//!
//! `B[n, c] = sum_nu sum_k basis_nu[n, c, k] * (y[n] @ W_nu)[k, c]`

use super::{join, randn, Parameters, TensorStore};
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use candle_core::{DType, Device, Tensor};

/// Number of basis functions of body order `nu`.
pub(crate) fn basis_size(nu: usize, lmax: u32) -> usize {
    match nu {
        1 => 1,
        _ => lmax as usize + 1,
    }
}

/// Per-degree squared norms `q[n, c, l]` of a message `[n, C, (lmax + 1)^2]`.
pub(crate) fn degree_norms(x: &Tensor, lmax: u32) -> Result<Tensor> {
    let sq = x.sqr()?;
    let norms = (0..=lmax as usize)
        .map(|l| sq.narrow(2, l * l, 2 * l + 1)?.sum_keepdim(2))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&norms, 2)?)
}

/// Basis functions of body order `nu`: [n, C, basis_size(nu)].
pub(crate) fn basis(x: &Tensor, lmax: u32, nu: usize) -> Result<Tensor> {
    let x0 = x.narrow(2, 0, 1)?;
    match nu {
        1 => Ok(x0),
        2 => degree_norms(x, lmax),
        3 => Ok(degree_norms(x, lmax)?.broadcast_mul(&x0)?),
        _ => Err(MaceOptError::ModelError(format!(
            "body order {nu} is not supported"
        ))),
    }
}

/// Weights of one output irrep.
#[derive(Debug, Clone)]
pub struct ContractionBlock {
    /// Weights of the highest body order: [num_elements, k, C]
    weights_max: Tensor,
    /// Lower orders, descending (`correlation - 1` down to 1)
    weights: Vec<Tensor>,
}

impl ContractionBlock {
    /// Create from per-order weights.
    pub fn new(weights_max: Tensor, weights: Vec<Tensor>) -> Result<Self> {
        let check = |w: &Tensor| -> Result<()> {
            if w.rank() != 3 {
                return Err(MaceOptError::ShapeMismatch(format!(
                    "contraction weights must be [num_elements, k, C], got {:?}",
                    w.dims()
                )));
            }
            Ok(())
        };
        check(&weights_max)?;
        for w in &weights {
            check(w)?;
        }
        Ok(Self {
            weights_max,
            weights,
        })
    }

    /// Highest body order.
    pub fn correlation(&self) -> usize {
        self.weights.len() + 1
    }

    /// Weights of the highest body order.
    pub fn weights_max(&self) -> &Tensor {
        &self.weights_max
    }

    /// Lower-order weights, descending order.
    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    /// Weights of body order `nu`, if present.
    pub fn weight_for_order(&self, nu: usize) -> Option<&Tensor> {
        let correlation = self.correlation();
        if nu == correlation {
            Some(&self.weights_max)
        } else if (1..correlation).contains(&nu) {
            self.weights.get(correlation - 1 - nu)
        } else {
            None
        }
    }
}

/// Reference symmetric contraction over one-hot element attributes.
#[derive(Debug, Clone)]
pub struct SymmetricContraction {
    irreps_in: Irreps,
    irreps_out: Irreps,
    channels: usize,
    lmax: u32,
    contractions: Vec<ContractionBlock>,
}

impl SymmetricContraction {
    /// Create a contraction.
    ///
    /// `irreps_in` must be `C x (0e + 1o + ... + lmax)`, `irreps_out` scalar
    /// with one block per contraction.
    pub fn new(
        irreps_in: Irreps,
        irreps_out: Irreps,
        contractions: Vec<ContractionBlock>,
    ) -> Result<Self> {
        let (channels, lmax) = irreps_in.uniform_spherical().ok_or_else(|| {
            MaceOptError::InvalidIrreps(format!(
                "{irreps_in}: contraction input must carry every degree with equal multiplicity"
            ))
        })?;
        if !irreps_out.is_scalar() || irreps_out.len() != contractions.len() {
            return Err(MaceOptError::InvalidIrreps(format!(
                "{irreps_out}: expected {} scalar output blocks",
                contractions.len()
            )));
        }
        for (mul_ir, block) in irreps_out.iter().zip(&contractions) {
            if mul_ir.mul != channels {
                return Err(MaceOptError::InvalidIrreps(format!(
                    "{irreps_out}: output multiplicity must equal {channels}"
                )));
            }
            for nu in 1..=block.correlation() {
                let expected = basis_size(nu, lmax);
                let w = block.weight_for_order(nu).ok_or_else(|| {
                    MaceOptError::ModelError(format!("missing weights for body order {nu}"))
                })?;
                let (_, k, c) = w.dims3()?;
                if k != expected || c != channels {
                    return Err(MaceOptError::ShapeMismatch(format!(
                        "order {nu} weights must be [E, {expected}, {channels}], got {:?}",
                        w.dims()
                    )));
                }
            }
        }
        Ok(Self {
            irreps_in,
            irreps_out,
            channels,
            lmax,
            contractions,
        })
    }

    /// Create with random weights (for testing).
    pub fn random(
        irreps_in: Irreps,
        irreps_out: Irreps,
        correlation: usize,
        num_elements: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let (channels, lmax) = irreps_in.uniform_spherical().ok_or_else(|| {
            MaceOptError::InvalidIrreps(format!("{irreps_in}: not a uniform spherical layout"))
        })?;
        let make = |nu: usize| randn(&[num_elements, basis_size(nu, lmax), channels], dtype, device);
        let contractions = irreps_out
            .iter()
            .map(|_| {
                let weights = (1..correlation)
                    .rev()
                    .map(&make)
                    .collect::<Result<Vec<_>>>()?;
                ContractionBlock::new(make(correlation)?, weights)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(irreps_in, irreps_out, contractions)
    }

    /// Load weights stored under `prefix.contractions.{j}.weights_max` and
    /// `prefix.contractions.{j}.weights.{i}`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        irreps_in: Irreps,
        irreps_out: Irreps,
        correlation: usize,
    ) -> Result<Self> {
        let contractions = (0..irreps_out.len())
            .map(|j| {
                let base = join(prefix, &format!("contractions.{j}"));
                let weights_max = store.get_tensor(&join(&base, "weights_max"))?;
                let weights = (0..correlation.saturating_sub(1))
                    .map(|i| store.get_tensor(&join(&base, &format!("weights.{i}"))))
                    .collect::<Result<Vec<_>>>()?;
                ContractionBlock::new(weights_max, weights)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(irreps_in, irreps_out, contractions)
    }

    /// Input irreps.
    pub fn irreps_in(&self) -> &Irreps {
        &self.irreps_in
    }

    /// Output irreps.
    pub fn irreps_out(&self) -> &Irreps {
        &self.irreps_out
    }

    /// One block per output irrep.
    pub fn contractions(&self) -> &[ContractionBlock] {
        &self.contractions
    }

    /// Highest body order.
    pub fn correlation(&self) -> usize {
        self.contractions
            .first()
            .map(ContractionBlock::correlation)
            .unwrap_or(0)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Messages [n, C, (lmax + 1)^2]
    /// * `y` - One-hot element attributes [n, num_elements]
    ///
    /// # Returns
    ///
    /// Invariant features [n, J * C]
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let (n, c, k) = x.dims3()?;
        let sh_dim = (self.lmax as usize + 1).pow(2);
        if c != self.channels || k != sh_dim {
            return Err(MaceOptError::ShapeMismatch(format!(
                "contraction expects [n, {}, {sh_dim}], got {:?}",
                self.channels,
                x.dims()
            )));
        }
        let num_elements = y.dims2()?.1;

        let mut outputs = Vec::with_capacity(self.contractions.len());
        for block in &self.contractions {
            let mut acc = Tensor::zeros((n, c), x.dtype(), x.device())?;
            for nu in 1..=block.correlation() {
                let Some(w) = block.weight_for_order(nu) else {
                    continue;
                };
                let kb = basis_size(nu, self.lmax);
                // [n, E] @ [E, k * C] -> [n, C, k]
                let w_node = y
                    .matmul(&w.reshape((num_elements, kb * c))?)?
                    .reshape((n, kb, c))?
                    .transpose(1, 2)?;
                let term = (basis(x, self.lmax, nu)? * w_node)?.sum(2)?;
                acc = (acc + term)?;
            }
            outputs.push(acc);
        }
        Ok(Tensor::cat(&outputs, 1)?)
    }
}

impl Parameters for SymmetricContraction {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (j, block) in self.contractions.iter().enumerate() {
            let base = join(prefix, &format!("contractions.{j}"));
            out.push((join(&base, "weights_max"), block.weights_max.clone()));
            for (i, w) in block.weights.iter().enumerate() {
                out.push((join(&base, &format!("weights.{i}")), w.clone()));
            }
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let contractions = self
            .contractions
            .iter()
            .map(|block| {
                let weights = block.weights.iter().map(|w| f(w)).collect::<Result<Vec<_>>>()?;
                ContractionBlock::new(f(&block.weights_max)?, weights)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            contractions,
            ..self
        })
    }
}
