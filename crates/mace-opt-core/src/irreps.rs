//! Irreducible representations of O(3).
//!
//! Irreps label how a feature block transforms under rotation. A block is
//! written `<mul>x<l><p>`, e.g. `32x1o` is 32 copies of the odd `l = 1`
//! representation (3 components each). A full feature layout is a sum of
//! blocks: `32x0e + 32x1o + 32x2e`.
//!
//! # Layout
//!
//! A flat feature vector for `Irreps` stores the blocks back to back. Inside
//! a block the multiplicity index is the slow axis: entry `u * (2l + 1) + m`.

use crate::error::{MaceOptError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parity of a representation under inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parity {
    /// Unchanged under inversion (`e`).
    Even,
    /// Sign flip under inversion (`o`).
    Odd,
}

impl Parity {
    /// Parity of spherical harmonics of degree `l`: `(-1)^l`.
    pub fn spherical(l: u32) -> Self {
        if l % 2 == 0 {
            Self::Even
        } else {
            Self::Odd
        }
    }
}

/// A single irreducible representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Irrep {
    /// Rotational order.
    pub l: u32,
    /// Parity.
    pub parity: Parity,
}

impl Irrep {
    /// Create an irrep.
    pub fn new(l: u32, parity: Parity) -> Self {
        Self { l, parity }
    }

    /// The irrep spanned by spherical harmonics of degree `l`.
    pub fn spherical(l: u32) -> Self {
        Self::new(l, Parity::spherical(l))
    }

    /// Number of components.
    pub fn dim(&self) -> usize {
        2 * self.l as usize + 1
    }

    /// Whether this is the invariant scalar `0e`.
    pub fn is_scalar(&self) -> bool {
        self.l == 0 && self.parity == Parity::Even
    }
}

impl fmt::Display for Irrep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = match self.parity {
            Parity::Even => 'e',
            Parity::Odd => 'o',
        };
        write!(f, "{}{}", self.l, p)
    }
}

impl FromStr for Irrep {
    type Err = MaceOptError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || MaceOptError::InvalidIrreps(s.to_string());
        let (last, _) = s.char_indices().last().ok_or_else(invalid)?;
        let (digits, p) = s.split_at(last);
        let l: u32 = digits.parse().map_err(|_| invalid())?;
        let parity = match p {
            "e" => Parity::Even,
            "o" => Parity::Odd,
            _ => return Err(invalid()),
        };
        Ok(Self::new(l, parity))
    }
}

/// An irrep with a multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulIr {
    /// Number of copies.
    pub mul: usize,
    /// The representation.
    pub ir: Irrep,
}

impl MulIr {
    /// Create a block.
    pub fn new(mul: usize, ir: Irrep) -> Self {
        Self { mul, ir }
    }

    /// Flat size of the block.
    pub fn dim(&self) -> usize {
        self.mul * self.ir.dim()
    }
}

impl fmt::Display for MulIr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.mul, self.ir)
    }
}

/// A direct sum of irrep blocks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Irreps(Vec<MulIr>);

impl Irreps {
    /// Create from blocks.
    pub fn new(blocks: Vec<MulIr>) -> Self {
        Self(blocks)
    }

    /// `mul` copies of the scalar `0e`.
    pub fn scalars(mul: usize) -> Self {
        Self(vec![MulIr::new(mul, Irrep::spherical(0))])
    }

    /// Irreps of spherical harmonics up to degree `lmax`:
    /// `1x0e + 1x1o + ... + 1x<lmax>`.
    pub fn spherical_harmonics(lmax: u32) -> Self {
        Self((0..=lmax).map(|l| MulIr::new(1, Irrep::spherical(l))).collect())
    }

    /// `channels` copies of every spherical-harmonic degree up to `lmax`.
    pub fn channels_times_spherical(channels: usize, lmax: u32) -> Self {
        Self(
            (0..=lmax)
                .map(|l| MulIr::new(channels, Irrep::spherical(l)))
                .collect(),
        )
    }

    /// The coupling irreps: the same irreps in the same order with every
    /// multiplicity stripped to one.
    pub fn coupling(&self) -> Self {
        Self(self.0.iter().map(|b| MulIr::new(1, b.ir)).collect())
    }

    /// Total multiplicity (number of irreps counted with repetition).
    pub fn num_irreps(&self) -> usize {
        self.0.iter().map(|b| b.mul).sum()
    }

    /// Flat feature dimension.
    pub fn dim(&self) -> usize {
        self.0.iter().map(MulIr::dim).sum()
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no blocks.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the blocks.
    pub fn iter(&self) -> std::slice::Iter<'_, MulIr> {
        self.0.iter()
    }

    /// Block at `i`.
    pub fn get(&self, i: usize) -> Option<&MulIr> {
        self.0.get(i)
    }

    /// Highest rotational order present.
    pub fn lmax(&self) -> Option<u32> {
        self.0.iter().map(|b| b.ir.l).max()
    }

    /// Whether every block is a scalar `0e`.
    pub fn is_scalar(&self) -> bool {
        self.0.iter().all(|b| b.ir.is_scalar())
    }

    /// Flat offset of every block.
    pub fn offsets(&self) -> Vec<usize> {
        self.0
            .iter()
            .scan(0, |acc, b| {
                let start = *acc;
                *acc += b.dim();
                Some(start)
            })
            .collect()
    }

    /// If the irreps are `C x0e + C x1o + ... + C x<lmax>` with a common
    /// multiplicity `C`, returns `(C, lmax)`.
    pub fn uniform_spherical(&self) -> Option<(usize, u32)> {
        let first = self.0.first()?;
        let channels = first.mul;
        for (l, block) in self.0.iter().enumerate() {
            if block.mul != channels || block.ir != Irrep::spherical(l as u32) {
                return None;
            }
        }
        Some((channels, self.0.len() as u32 - 1))
    }
}

impl fmt::Display for Irreps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("+"))
    }
}

impl FromStr for Irreps {
    type Err = MaceOptError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        s.split('+')
            .map(|part| {
                let part = part.trim();
                match part.split_once('x') {
                    Some((mul, ir)) => {
                        let mul = mul
                            .trim()
                            .parse()
                            .map_err(|_| MaceOptError::InvalidIrreps(s.to_string()))?;
                        Ok(MulIr::new(mul, ir.parse()?))
                    }
                    None => Ok(MulIr::new(1, part.parse()?)),
                }
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }
}

impl TryFrom<String> for Irreps {
    type Error = MaceOptError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Irreps> for String {
    fn from(irreps: Irreps) -> Self {
        irreps.to_string()
    }
}
