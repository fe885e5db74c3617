//! Accelerated symmetric contraction.
//!
//! The kernel takes integer element types instead of one-hot attributes and
//! gathers one fused weight slab per node. [`ContractionWrapper`] keeps the
//! original `(x, attrs)` call signature by arg-maxing the attributes.

use super::{require_dtype, require_u32};
use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use crate::model::{join, Parameters, TensorStore};
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Thread-block shape of the contraction kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelTiling {
    /// Threads along x.
    pub x: u32,
    /// Threads along y.
    pub y: u32,
    /// Threads along z.
    pub z: u32,
}

impl KernelTiling {
    /// Create a tiling.
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

impl Default for KernelTiling {
    fn default() -> Self {
        Self::new(32, 4, 1)
    }
}

impl fmt::Display for KernelTiling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Weights of one output irrep keyed by body order.
#[derive(Debug, Clone, Default)]
pub struct ContractionWeights(BTreeMap<usize, Tensor>);

impl ContractionWeights {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the weights of body order `nu`.
    pub fn insert(&mut self, nu: usize, weight: Tensor) {
        self.0.insert(nu, weight);
    }

    /// Weights of body order `nu`.
    pub fn by_order(&self, nu: usize) -> Option<&Tensor> {
        self.0.get(&nu)
    }

    /// Highest body order present.
    pub fn max_order(&self) -> usize {
        self.0.keys().next_back().copied().unwrap_or(0)
    }
}

/// `[K, lmax + 1]` matrix with `M[lm, l] = 1`.
fn degree_membership(lmax: u32, dtype: DType, device: &Device) -> Result<Tensor> {
    let k = (lmax as usize + 1).pow(2);
    let mut data = vec![0f32; k * (lmax as usize + 1)];
    for l in 0..=lmax as usize {
        for m in 0..2 * l + 1 {
            data[(l * l + m) * (lmax as usize + 1) + l] = 1.0;
        }
    }
    Ok(Tensor::from_vec(data, (k, lmax as usize + 1), device)?.to_dtype(dtype)?)
}

/// Symmetric contraction indexed by element type, correlation 3.
#[derive(Debug, Clone)]
pub struct AcceleratedContraction {
    irreps_in: Irreps,
    irreps_out: Irreps,
    lmax: u32,
    channels: usize,
    /// Per output irrep: [num_elements, 1 + 2 (lmax + 1), C], orders 1, 2, 3
    weights: Vec<Tensor>,
    membership: Tensor,
    tiling: KernelTiling,
    dtype: DType,
}

impl AcceleratedContraction {
    /// Body order the kernel is compiled for.
    pub const CORRELATION: usize = 3;

    /// Build from coupling irreps, output irreps and per-irrep weights.
    ///
    /// Weights are cast to `dtype`.
    pub fn new(
        irreps_in: Irreps,
        irreps_out: Irreps,
        weights: &[ContractionWeights],
        tiling: KernelTiling,
        dtype: DType,
    ) -> Result<Self> {
        let (one, lmax) = irreps_in.uniform_spherical().ok_or_else(|| {
            MaceOptError::InvalidIrreps(format!("{irreps_in}: expected coupling irreps 0e+1o+..."))
        })?;
        if one != 1 {
            return Err(MaceOptError::InvalidIrreps(format!(
                "{irreps_in}: coupling irreps carry multiplicity 1"
            )));
        }
        if !irreps_out.is_scalar() || irreps_out.len() != weights.len() {
            return Err(MaceOptError::InvalidIrreps(format!(
                "{irreps_out}: expected {} scalar output blocks",
                weights.len()
            )));
        }

        let fused = weights
            .iter()
            .map(|w| Self::fuse(w, lmax, dtype))
            .collect::<Result<Vec<_>>>()?;
        Self::from_fused(irreps_in, irreps_out, fused, tiling)
    }

    /// Concatenate orders 1, 2, 3 along the basis axis.
    fn fuse(weights: &ContractionWeights, lmax: u32, dtype: DType) -> Result<Tensor> {
        if weights.max_order() > Self::CORRELATION {
            return Err(MaceOptError::ModelError(format!(
                "body order {} exceeds the supported correlation {}",
                weights.max_order(),
                Self::CORRELATION
            )));
        }
        let mut parts = Vec::with_capacity(Self::CORRELATION);
        for nu in 1..=Self::CORRELATION {
            let w = weights.by_order(nu).ok_or_else(|| {
                MaceOptError::ModelError(format!("missing weights for body order {nu}"))
            })?;
            let expected = if nu == 1 { 1 } else { lmax as usize + 1 };
            if w.rank() != 3 || w.dims()[1] != expected {
                return Err(MaceOptError::ShapeMismatch(format!(
                    "order {nu} weights must be [E, {expected}, C], got {:?}",
                    w.dims()
                )));
            }
            parts.push(w.to_dtype(dtype)?);
        }
        Ok(Tensor::cat(&parts, 1)?)
    }

    fn from_fused(
        irreps_in: Irreps,
        irreps_out: Irreps,
        weights: Vec<Tensor>,
        tiling: KernelTiling,
    ) -> Result<Self> {
        let lmax = irreps_in.lmax().unwrap_or(0);
        let first = weights.first().ok_or_else(|| {
            MaceOptError::ModelError("contraction needs at least one output irrep".to_string())
        })?;
        let (_, k, channels) = first.dims3()?;
        if k != 1 + 2 * (lmax as usize + 1) {
            return Err(MaceOptError::ShapeMismatch(format!(
                "fused weights have {k} basis functions, degree {lmax} needs {}",
                1 + 2 * (lmax as usize + 1)
            )));
        }
        for (w, block) in weights.iter().zip(irreps_out.iter()) {
            if w.dims() != first.dims() || block.mul != channels {
                return Err(MaceOptError::ShapeMismatch(format!(
                    "fused weights {:?} do not match output block {block}",
                    w.dims()
                )));
            }
        }
        let dtype = first.dtype();
        let membership = degree_membership(lmax, dtype, first.device())?;
        Ok(Self {
            irreps_in,
            irreps_out,
            lmax,
            channels,
            weights,
            membership,
            tiling,
            dtype,
        })
    }

    /// Load fused weights stored under `prefix.weights.{j}`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        irreps_in: Irreps,
        irreps_out: Irreps,
        tiling: KernelTiling,
    ) -> Result<Self> {
        let weights = (0..irreps_out.len())
            .map(|j| store.get_tensor(&join(prefix, &format!("weights.{j}"))))
            .collect::<Result<Vec<_>>>()?;
        Self::from_fused(irreps_in, irreps_out, weights, tiling)
    }

    /// Coupling irreps of the input.
    pub fn irreps_in(&self) -> &Irreps {
        &self.irreps_in
    }

    /// Output irreps.
    pub fn irreps_out(&self) -> &Irreps {
        &self.irreps_out
    }

    /// Kernel tiling.
    pub fn tiling(&self) -> KernelTiling {
        self.tiling
    }

    /// Precision the kernel was built for.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Fused per-irrep weights.
    pub fn weights(&self) -> &[Tensor] {
        &self.weights
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Messages [n, C, (lmax + 1)^2]
    /// * `types` - u32 element index per node [n]
    ///
    /// # Returns
    ///
    /// [n, J * C, 1]
    pub fn forward(&self, x: &Tensor, types: &Tensor) -> Result<Tensor> {
        require_u32("symmetric contraction types", types)?;
        require_dtype("symmetric contraction", self.dtype, &[x])?;
        if !x.device().same_device(self.membership.device()) {
            return Err(MaceOptError::PrecisionMismatch(format!(
                "symmetric contraction lives on {:?}, input on {:?}",
                self.membership.device(),
                x.device()
            )));
        }
        let (n, c, k) = x.dims3()?;
        let num_degrees = self.lmax as usize + 1;
        if c != self.channels || k != num_degrees * num_degrees {
            return Err(MaceOptError::ShapeMismatch(format!(
                "symmetric contraction expects [n, {}, {}], got {:?}",
                self.channels,
                num_degrees * num_degrees,
                x.dims()
            )));
        }

        let x0 = x.narrow(2, 0, 1)?;
        let q = x
            .sqr()?
            .reshape((n * c, k))?
            .matmul(&self.membership)?
            .reshape((n, c, num_degrees))?;
        let cubic = q.broadcast_mul(&x0)?;
        let basis = Tensor::cat(&[&x0, &q, &cubic], 2)?;

        let mut outputs = Vec::with_capacity(self.weights.len());
        for w in &self.weights {
            // [n, K', C] -> [n, C, K']
            let w_node = w.index_select(types, 0)?.transpose(1, 2)?;
            outputs.push((&basis * w_node)?.sum(2)?);
        }
        Ok(Tensor::cat(&outputs, 1)?.unsqueeze(2)?)
    }
}

impl Parameters for AcceleratedContraction {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        for (j, w) in self.weights.iter().enumerate() {
            out.push((join(prefix, &format!("weights.{j}")), w.clone()));
        }
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        let weights = self.weights.iter().map(|w| f(w)).collect::<Result<Vec<_>>>()?;
        Self::from_fused(self.irreps_in, self.irreps_out, weights, self.tiling)
    }
}

/// Row-wise arg-max; ties resolve to the first occurrence.
///
/// NaN compares above every number, so the first NaN of a row wins.
pub fn argmax_rows(rows: &[Vec<f64>]) -> Vec<u32> {
    rows.iter()
        .map(|row| {
            let mut best = 0;
            for (i, v) in row.iter().enumerate() {
                if !row[best].is_nan() && (v.is_nan() || *v > row[best]) {
                    best = i;
                }
            }
            best as u32
        })
        .collect()
}

/// Arg-max of `y` [n, E] along its last axis as u32 indices [n].
///
/// Ties resolve to the first maximal column. Only one-hot attributes give
/// the same result as the reference contraction.
pub fn first_occurrence_argmax(y: &Tensor) -> Result<Tensor> {
    let rows = y.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    let types = argmax_rows(&rows);
    let n = types.len();
    Ok(Tensor::from_vec(types, n, y.device())?)
}

/// Keeps the `(x, attrs)` signature of the reference contraction.
#[derive(Debug, Clone)]
pub struct ContractionWrapper {
    inner: AcceleratedContraction,
}

impl ContractionWrapper {
    /// Wrap a kernel.
    pub fn new(inner: AcceleratedContraction) -> Self {
        Self { inner }
    }

    /// Load a wrapped kernel stored under `prefix`.
    pub fn load(
        store: &TensorStore,
        prefix: &str,
        irreps_in: Irreps,
        irreps_out: Irreps,
        tiling: KernelTiling,
    ) -> Result<Self> {
        Ok(Self::new(AcceleratedContraction::load(
            store, prefix, irreps_in, irreps_out, tiling,
        )?))
    }

    /// The wrapped kernel.
    pub fn inner(&self) -> &AcceleratedContraction {
        &self.inner
    }

    /// Kernel tiling.
    pub fn tiling(&self) -> KernelTiling {
        self.inner.tiling()
    }

    /// Contract `x` [n, C, K] with one-hot `y` [n, E] into [n, J * C].
    ///
    /// Only the trailing singleton axis of the kernel output is removed, so
    /// a single node keeps its leading axis.
    pub fn forward(&self, x: &Tensor, y: &Tensor) -> Result<Tensor> {
        let types = first_occurrence_argmax(y)?;
        Ok(self.inner.forward(x, &types)?.squeeze(2)?)
    }
}

impl Parameters for ContractionWrapper {
    fn named_tensors(&self, prefix: &str, out: &mut Vec<(String, Tensor)>) {
        self.inner.named_tensors(prefix, out);
    }

    fn map_tensors(self, f: &mut dyn FnMut(&Tensor) -> Result<Tensor>) -> Result<Self> {
        Ok(Self::new(self.inner.map_tensors(f)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SymmetricContraction;

    fn reference(channels: usize, num_elements: usize) -> SymmetricContraction {
        SymmetricContraction::random(
            Irreps::channels_times_spherical(channels, 3),
            Irreps::scalars(channels),
            3,
            num_elements,
            DType::F64,
            &Device::Cpu,
        )
        .unwrap()
    }

    fn weights_of(sc: &SymmetricContraction) -> Vec<ContractionWeights> {
        sc.contractions()
            .iter()
            .map(|block| {
                let mut w = ContractionWeights::new();
                for nu in 1..=3 {
                    w.insert(nu, block.weight_for_order(nu).unwrap().clone());
                }
                w
            })
            .collect()
    }

    #[test]
    fn default_tiling() {
        assert_eq!(KernelTiling::default().to_string(), "32x4x1");
    }

    #[test]
    fn argmax_breaks_ties_at_first_occurrence() {
        let rows = vec![vec![0.0, 1.0, 1.0], vec![0.5, 0.5, 0.5], vec![0.0, 0.0, 2.0]];
        assert_eq!(argmax_rows(&rows), vec![1, 0, 2]);
    }

    #[test]
    fn argmax_prefers_first_nan() {
        let rows = vec![
            vec![1.0, f64::NAN, 2.0, f64::NAN],
            vec![f64::NAN, 5.0],
            vec![0.0, 3.0],
        ];
        assert_eq!(argmax_rows(&rows), vec![1, 0, 1]);
    }

    #[test]
    fn argmax_of_one_hot_tensor() {
        let y = Tensor::new(&[[0.0f32, 1.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        let types = first_occurrence_argmax(&y).unwrap();
        assert_eq!(types.dtype(), DType::U32);
        assert_eq!(types.to_vec1::<u32>().unwrap(), vec![1, 0]);
    }

    #[test]
    fn matches_reference_contraction() {
        let sc = reference(4, 3);
        let kernel = AcceleratedContraction::new(
            Irreps::spherical_harmonics(3),
            Irreps::scalars(4),
            &weights_of(&sc),
            KernelTiling::default(),
            DType::F64,
        )
        .unwrap();
        let wrapper = ContractionWrapper::new(kernel);

        let device = Device::Cpu;
        let x = Tensor::randn(0.0f64, 1.0, (5, 4, 16), &device).unwrap();
        let y = Tensor::new(
            &[
                [1.0f64, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [0.0, 1.0, 0.0],
                [1.0, 0.0, 0.0],
            ],
            &device,
        )
        .unwrap();

        let a = sc.forward(&x, &y).unwrap();
        let b = wrapper.forward(&x, &y).unwrap();
        assert_eq!(b.dims(), &[5, 4]);
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f64>().unwrap() < 1e-10);
    }

    #[test]
    fn single_node_keeps_leading_axis() {
        let sc = reference(2, 1);
        let kernel = AcceleratedContraction::new(
            Irreps::spherical_harmonics(3),
            Irreps::scalars(2),
            &weights_of(&sc),
            KernelTiling::default(),
            DType::F64,
        )
        .unwrap();
        let wrapper = ContractionWrapper::new(kernel);
        let x = Tensor::randn(0.0f64, 1.0, (1, 2, 16), &Device::Cpu).unwrap();
        let y = Tensor::ones((1, 1), DType::F64, &Device::Cpu).unwrap();
        assert_eq!(wrapper.forward(&x, &y).unwrap().dims(), &[1, 2]);
    }

    #[test]
    fn precision_mismatch_is_fatal() {
        let sc = reference(2, 1);
        let kernel = AcceleratedContraction::new(
            Irreps::spherical_harmonics(3),
            Irreps::scalars(2),
            &weights_of(&sc),
            KernelTiling::default(),
            DType::F32,
        )
        .unwrap();
        assert_eq!(kernel.dtype(), DType::F32);
        let x = Tensor::zeros((1, 2, 16), DType::F64, &Device::Cpu).unwrap();
        let types = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        assert!(matches!(
            kernel.forward(&x, &types),
            Err(MaceOptError::PrecisionMismatch(_))
        ));
    }

    #[test]
    fn missing_order_is_rejected() {
        let mut w = ContractionWeights::new();
        w.insert(3, Tensor::zeros((1, 4, 2), DType::F32, &Device::Cpu).unwrap());
        assert_eq!(w.max_order(), 3);
        let result = AcceleratedContraction::new(
            Irreps::spherical_harmonics(3),
            Irreps::scalars(2),
            &[w],
            KernelTiling::default(),
            DType::F32,
        );
        assert!(result.is_err());
    }

    #[test]
    fn higher_correlation_is_rejected() {
        let mut w = ContractionWeights::new();
        for (nu, k) in [(1, 1), (2, 4), (3, 4), (4, 4)] {
            w.insert(nu, Tensor::zeros((1, k, 2), DType::F32, &Device::Cpu).unwrap());
        }
        let err = AcceleratedContraction::new(
            Irreps::spherical_harmonics(3),
            Irreps::scalars(2),
            &[w],
            KernelTiling::default(),
            DType::F32,
        )
        .unwrap_err();
        assert!(err.to_string().contains("body order 4"));
    }
}
