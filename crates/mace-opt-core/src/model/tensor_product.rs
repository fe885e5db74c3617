//! Reference tensor products.
//!
//! - [`ConvTensorProduct`] - Per-edge `uvu` product of sender scalars with
//!   edge harmonics, weighted by the radial MLP
//! - [`FullyConnectedTensorProduct`] - Self-connection mixing node features
//!   with the one-hot element attributes
//!
//! # Formula
//!
//! Convolution, for every edge `e`, channel `c` and component `(l, m)`:
//!
//! `out[e, c, lm] = w[e, l * C + c] * x[e, c] * Y[e, lm]`
//!
//! Self-connection:
//!
//! `sc[n, k] = sum_{c, a} x[n, c] * attr[n, a] * W[c, a, k] / sqrt(C * A)`

use super::{join, randn, Parameters, TensorStore};
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use candle_core::{DType, Device, Tensor};

/// Edge convolution tensor product with external per-edge weights.
///
/// Output is in flat irreps layout: for each degree `l`, `C * (2l + 1)`
/// entries, channel-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvTensorProduct {
    irreps_in1: Irreps,
    irreps_in2: Irreps,
    irreps_out: Irreps,
    channels: usize,
    lmax: u32,
}

impl ConvTensorProduct {
    /// Create a product of `C` scalar channels with harmonics up to `lmax`.
    pub fn new(channels: usize, lmax: u32) -> Self {
        Self {
            irreps_in1: Irreps::scalars(channels),
            irreps_in2: Irreps::spherical_harmonics(lmax),
            irreps_out: Irreps::channels_times_spherical(channels, lmax),
            channels,
            lmax,
        }
    }

    /// Node feature irreps.
    pub fn irreps_in1(&self) -> &Irreps {
        &self.irreps_in1
    }

    /// Edge attribute irreps.
    pub fn irreps_in2(&self) -> &Irreps {
        &self.irreps_in2
    }

    /// Output irreps.
    pub fn irreps_out(&self) -> &Irreps {
        &self.irreps_out
    }

    /// Number of scalar channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Maximum harmonic degree.
    pub fn lmax(&self) -> u32 {
        self.lmax
    }

    /// Per-edge weights consumed: one per `(l, c)` path.
    pub fn weight_numel(&self) -> usize {
        (self.lmax as usize + 1) * self.channels
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Sender features [num_edges, C]
    /// * `y` - Edge harmonics [num_edges, (lmax + 1)^2]
    /// * `weights` - Per-edge path weights [num_edges, (lmax + 1) * C]
    ///
    /// # Returns
    ///
    /// Flat per-edge messages [num_edges, irreps_out.dim()]
    pub fn forward(&self, x: &Tensor, y: &Tensor, weights: &Tensor) -> Result<Tensor> {
        let (e, c) = x.dims2()?;
        let sh_dim = self.irreps_in2.dim();
        if c != self.channels || y.dims() != [e, sh_dim] || weights.dims() != [e, self.weight_numel()]
        {
            return Err(MaceOptError::ShapeMismatch(format!(
                "conv tensor product expects x [{e}, {}], y [{e}, {sh_dim}], weights [{e}, {}]; got {:?}, {:?}, {:?}",
                self.channels,
                self.weight_numel(),
                x.dims(),
                y.dims(),
                weights.dims()
            )));
        }

        let mut blocks = Vec::with_capacity(self.lmax as usize + 1);
        for l in 0..=self.lmax as usize {
            let d = 2 * l + 1;
            let w = weights.narrow(1, l * c, c)?;
            let xw = (x * w)?.unsqueeze(2)?;
            let ylm = y.narrow(1, l * l, d)?.unsqueeze(1)?;
            blocks.push(xw.broadcast_mul(&ylm)?.reshape((e, c * d))?);
        }
        Ok(Tensor::cat(&blocks, 1)?)
    }
}

/// Fully connected scalar tensor product `Cx0e ⊗ Ax0e -> Kx0e`.
#[derive(Debug, Clone)]
pub struct FullyConnectedTensorProduct {
    irreps_in1: Irreps,
    irreps_in2: Irreps,
    irreps_out: Irreps,
    /// Flat weight, reshaped to [C, A, K] on use
    weight: Tensor,
}

impl FullyConnectedTensorProduct {
    /// Create from a flat weight of `C * A * K` elements.
    pub fn new(
        irreps_in1: Irreps,
        irreps_in2: Irreps,
        irreps_out: Irreps,
        weight: Tensor,
    ) -> Result<Self> {
        if !(irreps_in1.is_scalar() && irreps_in2.is_scalar() && irreps_out.is_scalar()) {
            return Err(MaceOptError::InvalidIrreps(format!(
                "{irreps_in1} x {irreps_in2} -> {irreps_out}: only scalar self-connections are supported"
            )));
        }
        let numel = irreps_in1.dim() * irreps_in2.dim() * irreps_out.dim();
        if weight.elem_count() != numel {
            return Err(MaceOptError::ShapeMismatch(format!(
                "self-connection needs {numel} weights, got {:?}",
                weight.dims()
            )));
        }
        let weight = weight.flatten_all()?;
        Ok(Self {
            irreps_in1,
            irreps_in2,
            irreps_out,
            weight,
        })
    }

    /// Create with random weights (for testing).
    pub fn random(
        irreps_in1: Irreps,
        irreps_in2: Irreps,
        irreps_out: Irreps,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let numel = irreps_in1.dim() * irreps_in2.dim() * irreps_out.dim();
        let weight = randn(&[numel], dtype, device)?;
        Self::new(irreps_in1, irreps_in2, irreps_out, weight)
    }

    /// Load the weight stored under `prefix.weight`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        irreps_in1: Irreps,
        irreps_in2: Irreps,
        irreps_out: Irreps,
    ) -> Result<Self> {
        let weight = store.get_tensor(&join(prefix, "weight"))?;
        Self::new(irreps_in1, irreps_in2, irreps_out, weight)
    }

    /// Output irreps.
    pub fn irreps_out(&self) -> &Irreps {
        &self.irreps_out
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Node features [n, C]
    /// * `attrs` - Node attributes [n, A]
    ///
    /// # Returns
    ///
    /// [n, K]
    pub fn forward(&self, x: &Tensor, attrs: &Tensor) -> Result<Tensor> {
        let (n, c) = x.dims2()?;
        let a = attrs.dims2()?.1;
        if c != self.irreps_in1.dim() || a != self.irreps_in2.dim() {
            return Err(MaceOptError::ShapeMismatch(format!(
                "self-connection expects [{n}, {}] x [{n}, {}], got {:?} x {:?}",
                self.irreps_in1.dim(),
                self.irreps_in2.dim(),
                x.dims(),
                attrs.dims()
            )));
        }
        let k = self.irreps_out.dim();

        let outer = x
            .unsqueeze(2)?
            .broadcast_mul(&attrs.unsqueeze(1)?)?
            .reshape((n, c * a))?;
        let w = self.weight.reshape((c * a, k))?;
        Ok((outer.matmul(&w)? / ((c * a) as f64).sqrt())?)
    }
}

impl Parameters for FullyConnectedTensorProduct {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_output_layout() {
        let device = Device::Cpu;
        let tp = ConvTensorProduct::new(2, 1);
        assert_eq!(tp.weight_numel(), 4);
        assert_eq!(tp.irreps_out().dim(), 8);

        let x = Tensor::new(&[[1.0f64, 2.0]], &device).unwrap();
        let y = Tensor::new(&[[1.0f64, 0.1, 0.2, 0.3]], &device).unwrap();
        let w = Tensor::new(&[[1.0f64, 1.0, 10.0, 100.0]], &device).unwrap();

        let out: Vec<f64> = tp
            .forward(&x, &y, &w)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let expected = [1.0, 2.0, 1.0, 2.0, 3.0, 20.0, 40.0, 60.0];
        for (a, b) in out.iter().zip(expected) {
            assert!((a - b).abs() < 1e-12, "{out:?}");
        }
    }

    #[test]
    fn conv_rejects_wrong_weights() {
        let device = Device::Cpu;
        let tp = ConvTensorProduct::new(2, 1);
        let x = Tensor::zeros((3, 2), DType::F32, &device).unwrap();
        let y = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let w = Tensor::zeros((3, 3), DType::F32, &device).unwrap();
        assert!(tp.forward(&x, &y, &w).is_err());
    }

    #[test]
    fn self_connection_with_one_hot_selects_slice() {
        let device = Device::Cpu;
        let tp = FullyConnectedTensorProduct::random(
            Irreps::scalars(3),
            Irreps::scalars(2),
            Irreps::scalars(4),
            DType::F64,
            &device,
        )
        .unwrap();

        let x = Tensor::randn(0.0f64, 1.0, (1, 3), &device).unwrap();
        let attrs = Tensor::new(&[[0.0f64, 1.0]], &device).unwrap();
        let out = tp.forward(&x, &attrs).unwrap();

        let w = tp.weight.reshape((3, 2, 4)).unwrap();
        let slice = w.narrow(1, 1, 1).unwrap().squeeze(1).unwrap();
        let expected = (x.matmul(&slice).unwrap() / 6f64.sqrt()).unwrap();
        let diff = (out - expected).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f64>().unwrap() < 1e-12);
    }

    #[test]
    fn self_connection_rejects_vectors() {
        let weight = Tensor::zeros(12, DType::F32, &Device::Cpu).unwrap();
        let result = FullyConnectedTensorProduct::new(
            "1x1o".parse().unwrap(),
            Irreps::scalars(2),
            Irreps::scalars(2),
            weight,
        );
        assert!(result.is_err());
    }
}
