//! Linear replacements.
//!
//! Both kernels fold the `1/sqrt(fan_in)` normalization of the generic layer
//! into their weights at construction time.

use super::require_dtype;
use crate::error::{MaceOptError, Result};
use crate::model::{join, Parameters, TensorStore};
use candle_core::Tensor;

/// `y = x @ W`, with `W` already normalized.
#[derive(Debug, Clone)]
pub struct LinearMatmul {
    /// [c_in, c_out]
    weight: Tensor,
}

impl LinearMatmul {
    /// Wrap a pre-normalized [c_in, c_out] weight.
    pub fn new(weight: Tensor) -> Result<Self> {
        if weight.rank() != 2 {
            return Err(MaceOptError::ShapeMismatch(format!(
                "matmul weight must be [c_in, c_out], got {:?}",
                weight.dims()
            )));
        }
        Ok(Self { weight })
    }

    /// Load the weight stored under `prefix.weight`.
    pub fn load(store: &TensorStore, prefix: &str) -> Result<Self> {
        Self::new(store.get_tensor(&join(prefix, "weight"))?)
    }

    /// Normalized weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Input channels.
    pub fn c_in(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Output channels.
    pub fn c_out(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Forward pass on [n, c_in].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        require_dtype("linear matmul", self.weight.dtype(), &[x])?;
        Ok(x.matmul(&self.weight)?)
    }
}

impl Parameters for LinearMatmul {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        out.push((join(prefix, "weight"), self.weight.clone()));
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Self::new(f(&self.weight)?)
    }
}

/// Channel mixing per rotational degree of [n, C_in, (lmax + 1)^2] messages.
///
/// `y[:, :, lm] = W_l^T x[:, :, lm]`
#[derive(Debug, Clone)]
pub struct ChannelLinear {
    /// One pre-normalized [C_in, C_out] weight per degree
    weights: Vec<Tensor>,
}

impl ChannelLinear {
    /// Create from per-degree weights, degree 0 first.
    pub fn new(weights: Vec<Tensor>) -> Result<Self> {
        let first = weights.first().ok_or_else(|| {
            MaceOptError::ModelError("channel linear needs at least degree 0".to_string())
        })?;
        let dims = first.dims2()?;
        for w in &weights {
            if w.dims2()? != dims {
                return Err(MaceOptError::ShapeMismatch(format!(
                    "per-degree weights must share one shape, got {:?} and {:?}",
                    first.dims(),
                    w.dims()
                )));
            }
        }
        Ok(Self { weights })
    }

    /// Load `lmax + 1` weights stored under `prefix.weights.{l}`.
    pub fn load(store: &TensorStore, prefix: &str, lmax: u32) -> Result<Self> {
        let weights = (0..=lmax)
            .map(|l| store.get_tensor(&join(prefix, &format!("weights.{l}"))))
            .collect::<Result<Vec<_>>>()?;
        Self::new(weights)
    }

    /// Maximum degree.
    pub fn lmax(&self) -> u32 {
        self.weights.len() as u32 - 1
    }

    /// Per-degree weights.
    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Messages [n, C_in, (lmax + 1)^2]
    ///
    /// # Returns
    ///
    /// [n, C_out, (lmax + 1)^2]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        require_dtype("channel linear", self.weights[0].dtype(), &[x])?;
        let (n, c_in, k) = x.dims3()?;
        let sh_dim = self.weights.len() * self.weights.len();
        if k != sh_dim || c_in != self.weights[0].dims()[0] {
            return Err(MaceOptError::ShapeMismatch(format!(
                "channel linear expects [n, {}, {sh_dim}], got {:?}",
                self.weights[0].dims()[0],
                x.dims()
            )));
        }

        let mut blocks = Vec::with_capacity(self.weights.len());
        for (l, w) in self.weights.iter().enumerate() {
            let d = 2 * l + 1;
            let c_out = w.dims()[1];
            let y = x
                .narrow(2, l * l, d)?
                .transpose(1, 2)?
                .contiguous()?
                .reshape((n * d, c_in))?
                .matmul(w)?
                .reshape((n, d, c_out))?
                .transpose(1, 2)?;
            blocks.push(y);
        }
        Ok(Tensor::cat(&blocks, 2)?)
    }
}

impl Parameters for ChannelLinear {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (l, w) in self.weights.iter().enumerate() {
            out.push((join(prefix, &format!("weights.{l}")), w.clone()));
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let weights = self.weights.iter().map(|w| f(w)).collect::<Result<Vec<_>>>()?;
        Self::new(weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn matmul_forward() {
        let device = Device::Cpu;
        let w = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0], [1.0, 1.0]], &device).unwrap();
        let linear = LinearMatmul::new(w).unwrap();
        assert_eq!((linear.c_in(), linear.c_out()), (3, 2));

        let x = Tensor::new(&[[1.0f32, 1.0, 1.0]], &device).unwrap();
        let y: Vec<Vec<f32>> = linear.forward(&x).unwrap().to_vec2().unwrap();
        assert_eq!(y, vec![vec![2.0, 3.0]]);
    }

    #[test]
    fn matmul_rejects_other_precision() {
        let device = Device::Cpu;
        let linear = LinearMatmul::new(Tensor::ones((2, 2), DType::F32, &device).unwrap()).unwrap();
        let x = Tensor::ones((1, 2), DType::F64, &device).unwrap();
        assert!(matches!(
            linear.forward(&x),
            Err(MaceOptError::PrecisionMismatch(_))
        ));
    }

    #[test]
    fn channel_linear_mixes_each_degree() {
        let device = Device::Cpu;
        let identity = Tensor::eye(2, DType::F64, &device).unwrap();
        let double = (Tensor::eye(2, DType::F64, &device).unwrap() * 2.0).unwrap();
        let linear = ChannelLinear::new(vec![identity, double]).unwrap();
        assert_eq!(linear.lmax(), 1);

        let x = Tensor::randn(0.0f64, 1.0, (3, 2, 4), &device).unwrap();
        let y = linear.forward(&x).unwrap();
        assert_eq!(y.dims(), &[3, 2, 4]);

        let scalar = (y.narrow(2, 0, 1).unwrap() - x.narrow(2, 0, 1).unwrap()).unwrap();
        let vector =
            (y.narrow(2, 1, 3).unwrap() - (x.narrow(2, 1, 3).unwrap() * 2.0).unwrap()).unwrap();
        for diff in [scalar, vector] {
            let max = diff.abs().unwrap().max_all().unwrap().to_scalar::<f64>().unwrap();
            assert!(max < 1e-12);
        }
    }

    #[test]
    fn channel_linear_rejects_wrong_width() {
        let device = Device::Cpu;
        let w = Tensor::eye(2, DType::F32, &device).unwrap();
        let linear = ChannelLinear::new(vec![w.clone(), w]).unwrap();
        let x = Tensor::zeros((1, 2, 9), DType::F32, &device).unwrap();
        assert!(linear.forward(&x).is_err());
    }
}
