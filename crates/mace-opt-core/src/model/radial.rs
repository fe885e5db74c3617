//! Radial features of edges.
//!
//! - [`RadialEmbedding`] - Bessel basis times a smooth polynomial cutoff
//! - [`RadialMlp`] - Neighbor-weight generator turning radial features into
//!   per-edge tensor-product weights
//!
//! # Formula
//!
//! `b_n(r) = sqrt(2 / r_max) * sin(n * pi * r / r_max) / r`
//!
//! `f(x) = 1 - (p+1)(p+2)/2 x^p + p(p+2) x^(p+1) - p(p+1)/2 x^(p+2)`, `x = r / r_max`

use super::{join, randn, Parameters, TensorStore};
use crate::error::{MaceOptError, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::silu;
use std::f64::consts::PI;

/// Bessel radial basis with polynomial cutoff envelope.
#[derive(Debug, Clone)]
pub struct RadialEmbedding {
    r_max: f64,
    num_bessel: usize,
    p: usize,
}

impl RadialEmbedding {
    /// Create a radial embedding.
    pub fn new(r_max: f64, num_bessel: usize, p: usize) -> Self {
        Self {
            r_max,
            num_bessel,
            p,
        }
    }

    /// Number of output features per edge.
    pub fn out_dim(&self) -> usize {
        self.num_bessel
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `lengths` - Edge lengths [num_edges, 1]
    ///
    /// # Returns
    ///
    /// Edge features [num_edges, num_bessel]
    pub fn forward(&self, lengths: &Tensor) -> Result<Tensor> {
        let dtype = lengths.dtype();
        let device = lengths.device();

        let freqs: Vec<f64> = (1..=self.num_bessel)
            .map(|n| n as f64 * PI / self.r_max)
            .collect();
        let freqs = Tensor::from_vec(freqs, (1, self.num_bessel), device)?.to_dtype(dtype)?;

        let prefactor = (2.0 / self.r_max).sqrt();
        let bessel = (lengths.broadcast_mul(&freqs)?.sin()? * prefactor)?;
        let bessel = bessel.broadcast_div(lengths)?;

        let envelope = self.cutoff(lengths)?;
        Ok(bessel.broadcast_mul(&envelope)?)
    }

    /// Polynomial envelope, zero at and beyond `r_max`.
    fn cutoff(&self, lengths: &Tensor) -> Result<Tensor> {
        let p = self.p as f64;
        let x = (lengths / self.r_max)?;

        let t0 = (x.powf(p)? * ((p + 1.0) * (p + 2.0) / 2.0))?;
        let t1 = (x.powf(p + 1.0)? * (p * (p + 2.0)))?;
        let t2 = (x.powf(p + 2.0)? * (p * (p + 1.0) / 2.0))?;
        let envelope = ((t1 - t0)? - t2)?;
        let envelope = (envelope + 1.0)?;

        let inside = x.lt(&x.ones_like()?)?.to_dtype(x.dtype())?;
        Ok((envelope * inside)?)
    }
}

/// Fully connected network mapping radial features to tensor-product weights.
///
/// SiLU between layers, no biases, `1/sqrt(fan_in)` weight normalization.
#[derive(Debug, Clone)]
pub struct RadialMlp {
    /// Layer weights: [fan_in, fan_out]
    layers: Vec<Tensor>,
}

impl RadialMlp {
    /// Create from layer weights.
    pub fn new(layers: Vec<Tensor>) -> Result<Self> {
        if layers.is_empty() {
            return Err(MaceOptError::ModelError(
                "radial MLP needs at least one layer".to_string(),
            ));
        }
        for pair in layers.windows(2) {
            if pair[0].dims2()?.1 != pair[1].dims2()?.0 {
                return Err(MaceOptError::ShapeMismatch(format!(
                    "radial MLP layers {:?} and {:?} do not chain",
                    pair[0].dims(),
                    pair[1].dims()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Create with random weights for the given widths (for testing).
    pub fn random(widths: &[usize], dtype: DType, device: &Device) -> Result<Self> {
        let layers = widths
            .windows(2)
            .map(|w| randn(&[w[0], w[1]], dtype, device))
            .collect::<Result<Vec<_>>>()?;
        Self::new(layers)
    }

    /// Load `num_layers` weights stored under `prefix.layer{i}.weight`.
    pub fn load(store: &TensorStore, prefix: &str, num_layers: usize) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| store.get_tensor(&join(prefix, &format!("layer{i}.weight"))))
            .collect::<Result<Vec<_>>>()?;
        Self::new(layers)
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Output width.
    pub fn out_dim(&self) -> usize {
        self.layers.last().map(|w| w.dims()[1]).unwrap_or(0)
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Edge features [num_edges, fan_in]
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, w) in self.layers.iter().enumerate() {
            let fan_in = w.dims()[0] as f64;
            h = (h.matmul(w)? / fan_in.sqrt())?;
            if i < last {
                h = silu(&h)?;
            }
        }
        Ok(h)
    }
}

impl Parameters for RadialMlp {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (i, w) in self.layers.iter().enumerate() {
            out.push((join(prefix, &format!("layer{i}.weight")), w.clone()));
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let layers = self.layers.iter().map(|w| f(w)).collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }
}
