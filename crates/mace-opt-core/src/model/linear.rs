//! Equivariant linear layer on flat irreps features.
//!
//! Mixes multiplicities within each irrep type while leaving the `m`
//! components alone, so it commutes with rotations.
//!
//! # Formula
//!
//! `y_j = sum_{i -> j} x_i @ W_ij / sqrt(fan_in_j)`
//!
//! where `fan_in_j` is the total input multiplicity feeding output block `j`.

use super::{join, randn, Parameters, TensorStore};
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

/// One weight path from input block `i_in` to output block `i_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Input block index.
    pub i_in: usize,
    /// Output block index.
    pub i_out: usize,
    /// Weight shape `(mul_in, mul_out)`.
    pub path_shape: (usize, usize),
}

/// Generic equivariant linear layer.
#[derive(Debug, Clone)]
pub struct IrrepsLinear {
    irreps_in: Irreps,
    irreps_out: Irreps,
    instructions: Vec<Instruction>,
    /// Flat weight: every instruction's `[mul_in, mul_out]` block, row-major,
    /// in instruction order.
    weight: Tensor,
}

impl IrrepsLinear {
    /// All paths between blocks carrying the same irrep.
    pub fn instructions_for(irreps_in: &Irreps, irreps_out: &Irreps) -> Vec<Instruction> {
        let mut instructions = Vec::new();
        for (i_in, a) in irreps_in.iter().enumerate() {
            for (i_out, b) in irreps_out.iter().enumerate() {
                if a.ir == b.ir {
                    instructions.push(Instruction {
                        i_in,
                        i_out,
                        path_shape: (a.mul, b.mul),
                    });
                }
            }
        }
        instructions
    }

    /// Create a layer with the given flat weight.
    pub fn new(irreps_in: Irreps, irreps_out: Irreps, weight: Tensor) -> Result<Self> {
        let instructions = Self::instructions_for(&irreps_in, &irreps_out);
        let numel: usize = instructions
            .iter()
            .map(|ins| ins.path_shape.0 * ins.path_shape.1)
            .sum();
        if weight.rank() != 1 || weight.elem_count() != numel {
            return Err(MaceOptError::ShapeMismatch(format!(
                "linear {irreps_in} -> {irreps_out} needs a flat weight of {numel} elements, got {:?}",
                weight.dims()
            )));
        }
        Ok(Self {
            irreps_in,
            irreps_out,
            instructions,
            weight,
        })
    }

    /// Create a layer with random weights (for testing).
    pub fn random(
        irreps_in: Irreps,
        irreps_out: Irreps,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let numel: usize = Self::instructions_for(&irreps_in, &irreps_out)
            .iter()
            .map(|ins| ins.path_shape.0 * ins.path_shape.1)
            .sum();
        let weight = randn(&[numel], dtype, device)?;
        Self::new(irreps_in, irreps_out, weight)
    }

    /// Load the flat weight stored under `prefix.weight`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        irreps_in: Irreps,
        irreps_out: Irreps,
    ) -> Result<Self> {
        let weight = store.get_tensor(&join(prefix, "weight"))?;
        Self::new(irreps_in, irreps_out, weight)
    }

    /// Input irreps.
    pub fn irreps_in(&self) -> &Irreps {
        &self.irreps_in
    }

    /// Output irreps.
    pub fn irreps_out(&self) -> &Irreps {
        &self.irreps_out
    }

    /// Weight paths.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Flat weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Every instruction with its `[mul_in, mul_out]` weight block.
    pub fn weight_blocks(&self) -> Result<Vec<(Instruction, Tensor)>> {
        let mut offset = 0;
        let mut blocks = Vec::with_capacity(self.instructions.len());
        for ins in &self.instructions {
            let (mul_in, mul_out) = ins.path_shape;
            let block = self
                .weight
                .narrow(0, offset, mul_in * mul_out)?
                .reshape((mul_in, mul_out))?;
            offset += mul_in * mul_out;
            blocks.push((*ins, block));
        }
        Ok(blocks)
    }

    /// Total input multiplicity feeding output block `i_out`.
    pub fn fan_in(&self, i_out: usize) -> usize {
        self.instructions
            .iter()
            .filter(|ins| ins.i_out == i_out)
            .map(|ins| ins.path_shape.0)
            .sum()
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Flat features [n, irreps_in.dim()]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, dim) = x.dims2()?;
        if dim != self.irreps_in.dim() {
            return Err(MaceOptError::ShapeMismatch(format!(
                "linear expects {} features ({}), got {dim}",
                self.irreps_in.dim(),
                self.irreps_in
            )));
        }

        let in_offsets = self.irreps_in.offsets();
        let mut outputs: Vec<Option<Tensor>> = vec![None; self.irreps_out.len()];

        for (ins, w) in self.weight_blocks()? {
            let block = self.irreps_in.iter().nth(ins.i_in).copied().ok_or_else(|| {
                MaceOptError::ModelError(format!("instruction input {} out of range", ins.i_in))
            })?;
            let (mul_in, mul_out) = ins.path_shape;
            let d = block.ir.dim();

            // [n, mul_in * d] -> [n * d, mul_in]
            let xi = x
                .narrow(1, in_offsets[ins.i_in], block.dim())?
                .reshape((n, mul_in, d))?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((n * d, mul_in))?;

            // [n * d, mul_out] -> [n, mul_out * d]
            let y = xi
                .matmul(&w)?
                .reshape((n, d, mul_out))?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((n, mul_out * d))?;

            let slot = &mut outputs[ins.i_out];
            *slot = Some(match slot.take() {
                Some(acc) => (acc + y)?,
                None => y,
            });
        }

        let mut blocks = Vec::with_capacity(outputs.len());
        for (i_out, (acc, block)) in outputs.into_iter().zip(self.irreps_out.iter()).enumerate() {
            let y = match acc {
                Some(acc) => (acc / (self.fan_in(i_out) as f64).sqrt())?,
                None => Tensor::zeros((n, block.dim()), x.dtype(), x.device())?,
            };
            blocks.push(y);
        }
        Ok(Tensor::cat(&blocks, 1)?)
    }
}

impl Parameters for IrrepsLinear {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        out.push((join(prefix, "weight"), self.weight.clone()));
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(Self {
            weight: f(&self.weight)?,
            ..self
        })
    }
}
