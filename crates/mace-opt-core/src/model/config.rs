//! Model configuration.

use crate::error::{MaceOptError, Result};
use crate::irreps::Irreps;
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Architecture hyperparameters of a MACE model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaceConfig {
    /// Atomic numbers the model was trained on, in one-hot order.
    pub atomic_numbers: Vec<u32>,
    /// Reference energy per element (same order as `atomic_numbers`).
    pub atomic_energies: Vec<f64>,
    /// Cutoff radius in Angstrom.
    pub r_max: f64,
    /// Number of Bessel radial basis functions.
    pub num_bessel: usize,
    /// Power of the polynomial cutoff envelope.
    pub num_polynomial_cutoff: usize,
    /// Maximum spherical-harmonic degree of the edge attributes.
    pub max_ell: u32,
    /// Maximum body order of the symmetric contraction.
    pub correlation: usize,
    /// Number of interaction layers.
    pub num_interactions: usize,
    /// Scalar channels of the hidden node features.
    pub hidden_channels: usize,
    /// Hidden width of the last (non-linear) readout.
    pub readout_hidden: usize,
    /// Hidden widths of the radial MLP producing per-edge weights.
    pub radial_mlp: Vec<usize>,
    /// Average number of neighbors used to normalize messages.
    pub avg_num_neighbors: f64,
    /// Type name of the first interaction block.
    #[serde(default = "default_interaction_first")]
    pub interaction_first: String,
    /// Type name of all later interaction blocks.
    #[serde(default = "default_interaction")]
    pub interaction: String,
}

fn default_interaction_first() -> String {
    "RealAgnosticInteractionBlock".to_string()
}

fn default_interaction() -> String {
    "RealAgnosticResidualInteractionBlock".to_string()
}

impl MaceConfig {
    /// Number of chemical elements.
    pub fn num_elements(&self) -> usize {
        self.atomic_numbers.len()
    }

    /// Edge attribute irreps.
    pub fn sh_irreps(&self) -> Irreps {
        Irreps::spherical_harmonics(self.max_ell)
    }

    /// Node feature irreps between blocks.
    pub fn hidden_irreps(&self) -> Irreps {
        Irreps::scalars(self.hidden_channels)
    }

    /// Irreps of the aggregated message.
    pub fn target_irreps(&self) -> Irreps {
        Irreps::channels_times_spherical(self.hidden_channels, self.max_ell)
    }

    /// Type name of interaction block `layer`.
    pub fn interaction_type(&self, layer: usize) -> &str {
        if layer == 0 {
            &self.interaction_first
        } else {
            &self.interaction
        }
    }

    /// Check the configuration for values the model cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.atomic_numbers.is_empty() {
            return Err(MaceOptError::ConfigError(
                "atomic_numbers must not be empty".to_string(),
            ));
        }
        if self.atomic_energies.len() != self.atomic_numbers.len() {
            return Err(MaceOptError::ConfigError(format!(
                "{} atomic energies for {} elements",
                self.atomic_energies.len(),
                self.atomic_numbers.len()
            )));
        }
        if self.num_interactions == 0 {
            return Err(MaceOptError::ConfigError(
                "num_interactions must be at least 1".to_string(),
            ));
        }
        if !(1..=3).contains(&self.correlation) {
            return Err(MaceOptError::ConfigError(format!(
                "correlation {} is outside 1..=3",
                self.correlation
            )));
        }
        if self.max_ell > 3 {
            return Err(MaceOptError::ConfigError(format!(
                "max_ell {} exceeds 3",
                self.max_ell
            )));
        }
        if !(self.r_max > 0.0) {
            return Err(MaceOptError::ConfigError(format!(
                "r_max must be positive, got {}",
                self.r_max
            )));
        }
        if self.hidden_channels == 0 || self.num_bessel == 0 || self.readout_hidden == 0 {
            return Err(MaceOptError::ConfigError(
                "layer widths must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for MaceConfig {
    fn default() -> Self {
        // MACE-MP "small"-like invariant defaults
        Self {
            atomic_numbers: vec![1, 6, 7, 8],
            atomic_energies: vec![0.0; 4],
            r_max: 5.0,
            num_bessel: 8,
            num_polynomial_cutoff: 5,
            max_ell: 3,
            correlation: 3,
            num_interactions: 2,
            hidden_channels: 128,
            readout_hidden: 16,
            radial_mlp: vec![64, 64, 64],
            avg_num_neighbors: 8.0,
            interaction_first: default_interaction_first(),
            interaction: default_interaction(),
        }
    }
}

/// Working floating point precision of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floats.
    Float32,
    /// 64-bit floats.
    Float64,
}

impl Precision {
    /// Matching candle dtype.
    pub fn dtype(&self) -> DType {
        match self {
            Self::Float32 => DType::F32,
            Self::Float64 => DType::F64,
        }
    }

    /// Precision of a candle dtype, if it is one we run in.
    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(Self::Float32),
            DType::F64 => Some(Self::Float64),
            _ => None,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float32 => write!(f, "float32"),
            Self::Float64 => write!(f, "float64"),
        }
    }
}

impl FromStr for Precision {
    type Err = MaceOptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float32" | "f32" => Ok(Self::Float32),
            "float64" | "f64" => Ok(Self::Float64),
            other => Err(MaceOptError::ConfigError(format!(
                "unknown dtype `{other}` (expected float32 or float64)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = MaceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.num_elements(), 4);
        assert_eq!(config.sh_irreps().dim(), 16);
        assert_eq!(config.target_irreps().dim(), 128 * 16);
    }

    #[test]
    fn interaction_types_per_layer() {
        let config = MaceConfig::default();
        assert_eq!(config.interaction_type(0), "RealAgnosticInteractionBlock");
        assert_eq!(
            config.interaction_type(1),
            "RealAgnosticResidualInteractionBlock"
        );
    }

    #[test]
    fn validate_rejects_mismatched_energies() {
        let config = MaceConfig {
            atomic_energies: vec![0.0],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_high_correlation() {
        let config = MaceConfig {
            correlation: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_roundtrip_fills_type_names() {
        let json = r#"{
            "atomic_numbers": [6],
            "atomic_energies": [-1.0],
            "r_max": 4.0,
            "num_bessel": 8,
            "num_polynomial_cutoff": 5,
            "max_ell": 3,
            "correlation": 3,
            "num_interactions": 2,
            "hidden_channels": 16,
            "readout_hidden": 16,
            "radial_mlp": [32],
            "avg_num_neighbors": 4.0
        }"#;
        let config: MaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.interaction_first, "RealAgnosticInteractionBlock");
        assert_eq!(config.hidden_irreps().to_string(), "16x0e");
    }

    #[test]
    fn precision_parsing() {
        assert_eq!("float32".parse::<Precision>().unwrap(), Precision::Float32);
        assert_eq!("float64".parse::<Precision>().unwrap().dtype(), DType::F64);
        assert!("bfloat16".parse::<Precision>().is_err());
        assert_eq!(Precision::from_dtype(DType::F16), None);
    }
}
