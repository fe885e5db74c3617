//! Parameter extraction from reference layers.
//!
//! Pure reads: nothing here modifies the layer it looks at.

use crate::error::{MaceOptError, Result};
use crate::kernels::ContractionWeights;
use crate::model::{IrrepsLinear, SymmetricContraction};
use candle_core::{DType, Tensor};

/// Weight and channel counts of a scalar linear layer.
#[derive(Debug, Clone)]
pub struct LinearParams {
    /// Input channels (total input multiplicity).
    pub c_in: usize,
    /// Output channels (total output multiplicity).
    pub c_out: usize,
    /// Flat weight as stored in the layer.
    pub weight: Tensor,
}

/// Read the channel counts and weight of `linear`.
pub fn extract_linear(linear: &IrrepsLinear) -> LinearParams {
    LinearParams {
        c_in: linear.irreps_in().num_irreps(),
        c_out: linear.irreps_out().num_irreps(),
        weight: linear.weight().clone(),
    }
}

/// Per-degree `[C_in, C_out]` blocks of a `C x (0e + 1o + ...)` linear,
/// normalized by `1/sqrt(C_in)`.
pub fn extract_channel_linear(linear: &IrrepsLinear, layer: &str) -> Result<Vec<Tensor>> {
    let (c_in, lmax) = linear.irreps_in().uniform_spherical().ok_or_else(|| {
        MaceOptError::structural(
            layer,
            format!("input irreps {} are not C x (0e + 1o + ...)", linear.irreps_in()),
        )
    })?;
    let (_, lmax_out) = linear.irreps_out().uniform_spherical().ok_or_else(|| {
        MaceOptError::structural(
            layer,
            format!("output irreps {} are not C x (0e + 1o + ...)", linear.irreps_out()),
        )
    })?;
    if lmax_out != lmax {
        return Err(MaceOptError::structural(
            layer,
            format!("degree changes from {lmax} to {lmax_out}"),
        ));
    }

    let blocks = linear.weight_blocks()?;
    if blocks.len() != lmax as usize + 1
        || blocks
            .iter()
            .enumerate()
            .any(|(l, (ins, _))| ins.i_in != l || ins.i_out != l)
    {
        return Err(MaceOptError::structural(
            layer,
            "expected exactly one diagonal instruction per degree",
        ));
    }

    let norm = (c_in as f64).sqrt();
    blocks
        .into_iter()
        .map(|(_, w)| Ok((w / norm)?))
        .collect()
}

/// Weights of every output irrep of `sc`, keyed by body order and cast to
/// `dtype`.
///
/// `weights_max` is order 3, `weights[0]` order 2 and `weights[1]` order 1.
pub fn extract_contraction(
    sc: &SymmetricContraction,
    dtype: DType,
    layer: &str,
) -> Result<Vec<ContractionWeights>> {
    if sc.correlation() != 3 {
        return Err(MaceOptError::structural(
            layer,
            format!("correlation {} is not supported, expected 3", sc.correlation()),
        ));
    }
    sc.contractions()
        .iter()
        .map(|block| {
            let [second, first] = block.weights() else {
                return Err(MaceOptError::structural(
                    layer,
                    format!("expected 2 lower-order weights, found {}", block.weights().len()),
                ));
            };
            let mut weights = ContractionWeights::new();
            weights.insert(3, block.weights_max().detach().to_dtype(dtype)?);
            weights.insert(2, second.detach().to_dtype(dtype)?);
            weights.insert(1, first.detach().to_dtype(dtype)?);
            Ok(weights)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irreps::Irreps;
    use candle_core::Device;

    #[test]
    fn linear_channel_counts() {
        let linear =
            IrrepsLinear::random(Irreps::scalars(6), Irreps::scalars(3), DType::F32, &Device::Cpu)
                .unwrap();
        let params = extract_linear(&linear);
        assert_eq!((params.c_in, params.c_out), (6, 3));
        assert_eq!(params.weight.elem_count(), 18);
    }

    #[test]
    fn channel_linear_blocks_are_normalized() {
        let irreps = Irreps::channels_times_spherical(4, 2);
        let linear =
            IrrepsLinear::random(irreps.clone(), irreps, DType::F64, &Device::Cpu).unwrap();
        let blocks = extract_channel_linear(&linear, "interactions.0.linear").unwrap();
        assert_eq!(blocks.len(), 3);

        let raw = linear.weight_blocks().unwrap();
        let expected = (&raw[1].1 / 2.0).unwrap();
        let diff = (&blocks[1] - expected).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f64>().unwrap() < 1e-15);
    }

    #[test]
    fn channel_linear_requires_uniform_irreps() {
        let linear = IrrepsLinear::random(
            "4x0e+2x1o".parse().unwrap(),
            "4x0e+2x1o".parse().unwrap(),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        let err = extract_channel_linear(&linear, "interactions.1.linear").unwrap_err();
        assert!(matches!(err, MaceOptError::StructuralMismatch { .. }));
        assert!(err.to_string().contains("interactions.1.linear"));
    }

    #[test]
    fn contraction_orders() {
        let sc = SymmetricContraction::random(
            Irreps::channels_times_spherical(2, 3),
            Irreps::scalars(2),
            3,
            2,
            DType::F64,
            &Device::Cpu,
        )
        .unwrap();
        let weights = extract_contraction(&sc, DType::F32, "products.0").unwrap();
        assert_eq!(weights.len(), 1);
        let w = &weights[0];
        assert_eq!(w.by_order(1).unwrap().dims(), &[2, 1, 2]);
        assert_eq!(w.by_order(2).unwrap().dims(), &[2, 4, 2]);
        assert_eq!(w.by_order(3).unwrap().dtype(), DType::F32);
    }

    #[test]
    fn contraction_rejects_lower_correlation() {
        let sc = SymmetricContraction::random(
            Irreps::channels_times_spherical(2, 3),
            Irreps::scalars(2),
            2,
            2,
            DType::F64,
            &Device::Cpu,
        )
        .unwrap();
        assert!(matches!(
            extract_contraction(&sc, DType::F64, "products.0"),
            Err(MaceOptError::StructuralMismatch { .. })
        ));
    }
}
