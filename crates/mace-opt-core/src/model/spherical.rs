//! Real spherical harmonics of edge directions.
//!
//! Components are ordered `l = 0..=lmax`, `m = -l..=l`, with `z` as the
//! polar axis. Component normalization means `sum_m Y_lm(r)^2 = 2l + 1` for
//! unit `r`.
//!
//! - [`ReferenceSphericalHarmonics`] - Table-driven evaluator for any degree
//!   up to 3 and any normalization
//! - [`FusedSphericalHarmonics`] - Hand-unrolled degree-3 component evaluator
//!   sharing every sub-expression

use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Normalization convention of the harmonics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShNormalization {
    /// `sum_m Y_lm^2 = 2l + 1`.
    Component,
    /// `sum_m Y_lm^2 = 1`.
    Norm,
    /// Orthonormal on the sphere.
    Integral,
}

impl ShNormalization {
    /// Factor relative to component normalization.
    fn scale(&self, l: u32) -> f64 {
        match self {
            Self::Component => 1.0,
            Self::Norm => 1.0 / ((2 * l + 1) as f64).sqrt(),
            Self::Integral => 1.0 / (4.0 * std::f64::consts::PI).sqrt(),
        }
    }
}

/// Monomial `coef * x^a y^b z^c`.
type Term = (f64, [usize; 3]);

/// Component-normalized polynomial of every `(l, m)` up to degree 3.
fn terms(l: u32) -> Vec<Vec<Term>> {
    let s3 = 3f64.sqrt();
    let s5 = 5f64.sqrt();
    let s7 = 7f64.sqrt();
    let s15 = 15f64.sqrt();
    let s42 = 42f64.sqrt();
    let s70 = 70f64.sqrt();
    let s105 = 105f64.sqrt();
    match l {
        0 => vec![vec![(1.0, [0, 0, 0])]],
        1 => vec![
            vec![(s3, [0, 1, 0])],
            vec![(s3, [0, 0, 1])],
            vec![(s3, [1, 0, 0])],
        ],
        2 => vec![
            vec![(s15, [1, 1, 0])],
            vec![(s15, [0, 1, 1])],
            vec![
                (s5, [0, 0, 2]),
                (-s5 / 2.0, [2, 0, 0]),
                (-s5 / 2.0, [0, 2, 0]),
            ],
            vec![(s15, [1, 0, 1])],
            vec![(s15 / 2.0, [2, 0, 0]), (-s15 / 2.0, [0, 2, 0])],
        ],
        3 => vec![
            vec![(3.0 * s70 / 4.0, [2, 1, 0]), (-s70 / 4.0, [0, 3, 0])],
            vec![(s105, [1, 1, 1])],
            vec![
                (s42, [0, 1, 2]),
                (-s42 / 4.0, [2, 1, 0]),
                (-s42 / 4.0, [0, 3, 0]),
            ],
            vec![
                (s7, [0, 0, 3]),
                (-1.5 * s7, [2, 0, 1]),
                (-1.5 * s7, [0, 2, 1]),
            ],
            vec![
                (s42, [1, 0, 2]),
                (-s42 / 4.0, [3, 0, 0]),
                (-s42 / 4.0, [1, 2, 0]),
            ],
            vec![(s105 / 2.0, [2, 0, 1]), (-s105 / 2.0, [0, 2, 1])],
            vec![(s70 / 4.0, [3, 0, 0]), (-3.0 * s70 / 4.0, [1, 2, 0])],
        ],
        _ => Vec::new(),
    }
}

/// Split `[e, 3]` vectors into `[e, 1]` columns.
fn columns(vectors: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
    let (_, three) = vectors.dims2()?;
    if three != 3 {
        return Err(MaceOptError::ShapeMismatch(format!(
            "edge vectors must be [num_edges, 3], got {:?}",
            vectors.dims()
        )));
    }
    Ok((
        vectors.narrow(1, 0, 1)?,
        vectors.narrow(1, 1, 1)?,
        vectors.narrow(1, 2, 1)?,
    ))
}

/// Unit vectors along `vectors`.
fn normalized(vectors: &Tensor) -> Result<Tensor> {
    let norm = vectors.sqr()?.sum_keepdim(1)?.sqrt()?;
    Ok(vectors.broadcast_div(&norm)?)
}

/// Table-driven spherical harmonics.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSphericalHarmonics {
    lmax: u32,
    normalize: bool,
    normalization: ShNormalization,
}

impl ReferenceSphericalHarmonics {
    /// Create an evaluator.
    pub fn new(lmax: u32, normalize: bool, normalization: ShNormalization) -> Result<Self> {
        if lmax > 3 {
            return Err(MaceOptError::ModelError(format!(
                "spherical harmonics above degree 3 are not tabulated (got {lmax})"
            )));
        }
        Ok(Self {
            lmax,
            normalize,
            normalization,
        })
    }

    /// Maximum degree.
    pub fn lmax(&self) -> u32 {
        self.lmax
    }

    /// Whether inputs are normalized to unit length first.
    pub fn normalize(&self) -> bool {
        self.normalize
    }

    /// Normalization convention.
    pub fn normalization(&self) -> ShNormalization {
        self.normalization
    }

    /// Evaluate.
    ///
    /// # Arguments
    ///
    /// * `vectors` - Edge vectors [num_edges, 3]
    ///
    /// # Returns
    ///
    /// Harmonics [num_edges, (lmax + 1)^2]
    pub fn forward(&self, vectors: &Tensor) -> Result<Tensor> {
        let vectors = if self.normalize {
            normalized(vectors)?
        } else {
            vectors.clone()
        };
        let (x, y, z) = columns(&vectors)?;

        // powers[axis][k] = axis^k for k in 0..=3
        let mut powers = Vec::with_capacity(3);
        for axis in [x, y, z] {
            let p2 = axis.sqr()?;
            let p3 = (&p2 * &axis)?;
            powers.push([axis.ones_like()?, axis, p2, p3]);
        }

        let mut components = Vec::new();
        for l in 0..=self.lmax {
            let scale = self.normalization.scale(l);
            for poly in terms(l) {
                let mut acc: Option<Tensor> = None;
                for (coef, [a, b, c]) in poly {
                    let monomial = ((&powers[0][a] * &powers[1][b])? * &powers[2][c])?;
                    let term = (monomial * (coef * scale))?;
                    acc = Some(match acc {
                        Some(sum) => (sum + term)?,
                        None => term,
                    });
                }
                if let Some(component) = acc {
                    components.push(component);
                }
            }
        }
        Ok(Tensor::cat(&components, 1)?)
    }
}

/// Degree-3, normalized, component-normalized harmonics in one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FusedSphericalHarmonics;

impl FusedSphericalHarmonics {
    /// Degree evaluated by the fused kernel.
    pub const LMAX: u32 = 3;

    /// Create the evaluator.
    pub fn new() -> Self {
        Self
    }

    /// Evaluate.
    ///
    /// # Arguments
    ///
    /// * `vectors` - Edge vectors [num_edges, 3], normalized internally
    ///
    /// # Returns
    ///
    /// Harmonics [num_edges, 16]
    pub fn forward(&self, vectors: &Tensor) -> Result<Tensor> {
        let unit = normalized(vectors)?;
        let (x, y, z) = columns(&unit)?;

        let x2 = x.sqr()?;
        let y2 = y.sqr()?;
        let z2 = z.sqr()?;
        let xy = (&x * &y)?;
        let yz = (&y * &z)?;
        let xz = (&x * &z)?;
        let x2_minus_y2 = (&x2 - &y2)?;
        let x2_plus_y2 = (&x2 + &y2)?;

        let s7 = 7f64.sqrt();
        let s15 = 15f64.sqrt();
        let s42 = 42f64.sqrt();
        let s70 = 70f64.sqrt();
        let s105 = 105f64.sqrt();

        let sh0 = x.ones_like()?;

        let s3 = 3f64.sqrt();
        let sh1_0 = (&y * s3)?;
        let sh1_1 = (&z * s3)?;
        let sh1_2 = (&x * s3)?;

        let sh2_0 = (&xy * s15)?;
        let sh2_1 = (&yz * s15)?;
        let sh2_2 = ((((&z2 * 2.0)? - &x2_plus_y2)?) * (5f64.sqrt() / 2.0))?;
        let sh2_3 = (&xz * s15)?;
        let sh2_4 = (&x2_minus_y2 * (s15 / 2.0))?;

        // y (3x^2 - y^2), x (x^2 - 3y^2)
        let sh3_0 = ((&y * ((&x2 * 3.0)? - &y2)?)? * (s70 / 4.0))?;
        let sh3_1 = ((&xy * &z)? * s105)?;
        let four_z2_minus = ((&z2 * 4.0)? - &x2_plus_y2)?;
        let sh3_2 = ((&y * &four_z2_minus)? * (s42 / 4.0))?;
        let sh3_3 = ((&z * ((&z2 * 2.0)? - (&x2_plus_y2 * 3.0)?)?)? * (s7 / 2.0))?;
        let sh3_4 = ((&x * &four_z2_minus)? * (s42 / 4.0))?;
        let sh3_5 = ((&z * &x2_minus_y2)? * (s105 / 2.0))?;
        let sh3_6 = ((&x * (&x2 - (&y2 * 3.0)?)?)? * (s70 / 4.0))?;

        Ok(Tensor::cat(
            &[
                &sh0, &sh1_0, &sh1_1, &sh1_2, &sh2_0, &sh2_1, &sh2_2, &sh2_3, &sh2_4, &sh3_0,
                &sh3_1, &sh3_2, &sh3_3, &sh3_4, &sh3_5, &sh3_6,
            ],
            1,
        )?)
    }
}

/// Spherical-harmonics front-end of a model.
#[derive(Debug, Clone, PartialEq)]
pub enum SphericalHarmonics {
    /// Generic evaluator loaded with the model.
    Reference(ReferenceSphericalHarmonics),
    /// Drop-in fused evaluator installed by the optimizer.
    Fused(FusedSphericalHarmonics),
}

impl SphericalHarmonics {
    /// Maximum degree.
    pub fn lmax(&self) -> u32 {
        match self {
            Self::Reference(sh) => sh.lmax(),
            Self::Fused(_) => FusedSphericalHarmonics::LMAX,
        }
    }

    /// Output irreps.
    pub fn irreps(&self) -> Irreps {
        Irreps::spherical_harmonics(self.lmax())
    }

    /// Evaluate on edge vectors [num_edges, 3].
    pub fn forward(&self, vectors: &Tensor) -> Result<Tensor> {
        match self {
            Self::Reference(sh) => sh.forward(vectors),
            Self::Fused(sh) => sh.forward(vectors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn sample_vectors() -> Tensor {
        Tensor::new(
            &[
                [1.0f64, 0.0, 0.0],
                [0.0, 0.0, 2.0],
                [0.3, -1.2, 0.7],
                [-0.5, 0.25, -1.5],
            ],
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn component_normalization_per_degree() {
        let sh = ReferenceSphericalHarmonics::new(3, true, ShNormalization::Component).unwrap();
        let values: Vec<Vec<f64>> = sh.forward(&sample_vectors()).unwrap().to_vec2().unwrap();

        for row in values {
            assert_eq!(row.len(), 16);
            for l in 0..=3usize {
                let block = &row[l * l..(l + 1) * (l + 1)];
                let norm: f64 = block.iter().map(|v| v * v).sum();
                assert!(
                    (norm - (2 * l + 1) as f64).abs() < 1e-10,
                    "degree {l} norm {norm}"
                );
            }
        }
    }

    #[test]
    fn fused_matches_reference() {
        let reference =
            ReferenceSphericalHarmonics::new(3, true, ShNormalization::Component).unwrap();
        let fused = FusedSphericalHarmonics::new();
        let vectors = sample_vectors();

        let a = reference.forward(&vectors).unwrap();
        let b = fused.forward(&vectors).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f64>().unwrap() < 1e-12);
    }

    #[test]
    fn degree_one_is_scaled_direction() {
        let sh = ReferenceSphericalHarmonics::new(1, true, ShNormalization::Component).unwrap();
        let v = Tensor::new(&[[0.0f64, 0.0, 5.0]], &Device::Cpu).unwrap();
        let values: Vec<Vec<f64>> = sh.forward(&v).unwrap().to_vec2().unwrap();
        let s3 = 3f64.sqrt();
        assert_eq!(values[0].len(), 4);
        assert!((values[0][0] - 1.0).abs() < 1e-12);
        assert!(values[0][1].abs() < 1e-12);
        assert!((values[0][2] - s3).abs() < 1e-12);
        assert!(values[0][3].abs() < 1e-12);
    }

    #[test]
    fn norm_normalization_gives_unit_blocks() {
        let sh = ReferenceSphericalHarmonics::new(2, true, ShNormalization::Norm).unwrap();
        let values: Vec<Vec<f64>> = sh.forward(&sample_vectors()).unwrap().to_vec2().unwrap();
        for row in values {
            let block: f64 = row[4..9].iter().map(|v| v * v).sum();
            assert!((block - 1.0).abs() < 1e-10);
        }
    }

    #[test]
    fn unnormalized_scales_with_length() {
        let sh = ReferenceSphericalHarmonics::new(2, false, ShNormalization::Component).unwrap();
        let v = Tensor::new(&[[0.0f64, 0.0, 2.0]], &Device::Cpu).unwrap();
        let values: Vec<Vec<f64>> = sh.forward(&v).unwrap().to_vec2().unwrap();
        // Y_20 along z is sqrt(5) * r^2
        assert!((values[0][6] - 4.0 * 5f64.sqrt()).abs() < 1e-10);
    }

    #[test]
    fn rejects_degree_above_three() {
        assert!(ReferenceSphericalHarmonics::new(4, true, ShNormalization::Component).is_err());
    }

    #[test]
    fn enum_reports_irreps() {
        let sh = SphericalHarmonics::Fused(FusedSphericalHarmonics::new());
        assert_eq!(sh.irreps().to_string(), "1x0e+1x1o+1x2e+1x3o");
    }
}
