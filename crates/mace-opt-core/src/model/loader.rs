//! SafeTensors persistence of models.
//!
//! A model is one `.safetensors` file: tensors under dotted names plus a
//! JSON [`ModelManifest`] stored in the file metadata under
//! [`MANIFEST_KEY`]. The manifest records the architecture and, for every
//! layer, whether it holds reference or rewritten sublayers.
//!
//! # Example
//!
//! ```ignore
//! use mace_opt_core::model::TensorStore;
//!
//! let store = TensorStore::from_file("model.safetensors".as_ref(), &Device::Cpu)?;
//! let manifest = store.manifest()?;
//! let w = store.get_tensor("node_embedding.weight")?;
//! ```

use super::{InteractionKind, MaceConfig, Precision, ShNormalization};
use crate::error::{MaceOptError, Result};
use crate::kernels::KernelTiling;
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Metadata key holding the JSON manifest.
pub const MANIFEST_KEY: &str = "mace_opt.manifest";

/// Current manifest format.
pub const FORMAT_VERSION: u32 = 1;

/// Architecture description stored next to the tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    /// Manifest format version.
    pub format_version: u32,
    /// Hyperparameters.
    pub config: MaceConfig,
    /// Working precision.
    pub precision: Precision,
    /// Edge harmonics front-end.
    pub spherical_harmonics: ShManifest,
    /// One entry per interaction layer.
    pub layers: Vec<LayerManifest>,
}

/// Persisted form of the spherical-harmonics front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ShManifest {
    /// Table-driven evaluator.
    Reference {
        /// Maximum degree.
        lmax: u32,
        /// Normalize inputs to unit length.
        normalize: bool,
        /// Normalization convention.
        normalization: ShNormalization,
    },
    /// Fused degree-3 evaluator.
    Fused,
}

/// Persisted form of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerManifest {
    /// Interaction block.
    pub interaction: InteractionManifest,
    /// Product block.
    pub product: ProductManifest,
}

/// Persisted form of an interaction block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InteractionManifest {
    /// Reference layers.
    Reference {
        /// Declared type name.
        type_name: String,
        /// Average-neighbor-count normalizer.
        avg_num_neighbors: f64,
    },
    /// Rewritten layers.
    Accelerated {
        /// Declared type name of the block that was rewritten.
        type_name: String,
        /// Forward variant.
        variant: InteractionKind,
        /// Average-neighbor-count normalizer.
        avg_num_neighbors: f64,
    },
}

/// Persisted form of a product block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProductManifest {
    /// Reference layers.
    Reference {
        /// Residual add of the self-connection.
        use_sc: bool,
    },
    /// Rewritten layers.
    Accelerated {
        /// Residual add of the self-connection.
        use_sc: bool,
        /// Contraction kernel tiling.
        tiling: KernelTiling,
    },
}

/// Named tensors read from a SafeTensors file.
pub struct TensorStore {
    /// Loaded tensors indexed by name.
    tensors: HashMap<String, Tensor>,
    /// String metadata of the file.
    metadata: HashMap<String, String>,
}

impl TensorStore {
    /// Load every tensor of a file onto `device`.
    pub fn from_file(path: &Path, device: &Device) -> Result<Self> {
        let data = fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&data).map_err(|e| {
            MaceOptError::ModelError(format!("Failed to read header of {}: {}", path.display(), e))
        })?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let safetensors = SafeTensors::deserialize(&data).map_err(|e| {
            MaceOptError::ModelError(format!("Failed to deserialize {}: {}", path.display(), e))
        })?;

        let mut tensors = HashMap::new();
        for (name, view) in safetensors.tensors() {
            let tensor = Self::view_to_tensor(&view, device)?;
            tensors.insert(name.to_string(), tensor);
        }

        Ok(Self {
            tensors,
            metadata,
        })
    }

    /// Convert a SafeTensors view to a Candle tensor.
    ///
    /// Half precision is upcast to F32, I32 to I64.
    fn view_to_tensor(view: &TensorView, device: &Device) -> Result<Tensor> {
        let shape: Vec<usize> = view.shape().to_vec();
        let data = view.data();

        let tensor = match view.dtype() {
            Dtype::F32 => {
                let values: Vec<f32> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape.as_slice(), device)?
            }
            Dtype::F64 => {
                let values: Vec<f64> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape.as_slice(), device)?
            }
            Dtype::F16 => {
                let values: Vec<half::f16> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
            }
            Dtype::BF16 => {
                let values: Vec<half::bf16> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape.as_slice(), device)?.to_dtype(DType::F32)?
            }
            Dtype::I64 => {
                let values: Vec<i64> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape.as_slice(), device)?
            }
            Dtype::I32 => {
                let values: Vec<i32> = bytemuck::pod_collect_to_vec(data);
                let values: Vec<i64> = values.into_iter().map(i64::from).collect();
                Tensor::from_vec(values, shape.as_slice(), device)?
            }
            Dtype::U32 => {
                let values: Vec<u32> = bytemuck::pod_collect_to_vec(data);
                Tensor::from_vec(values, shape.as_slice(), device)?
            }
            Dtype::U8 => Tensor::from_slice(data, shape.as_slice(), device)?,
            other => {
                return Err(MaceOptError::ModelError(format!(
                    "Unsupported dtype: {:?}",
                    other
                )));
            }
        };

        Ok(tensor)
    }

    /// Get a tensor by name, returning an error if not found.
    pub fn get_tensor(&self, name: &str) -> Result<Tensor> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| MaceOptError::ModelError(format!("Tensor not found: {}", name)))
    }

    /// Get the number of loaded tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Check if no tensors are loaded.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Metadata value stored under `key`.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Parse the model manifest.
    pub fn manifest(&self) -> Result<ModelManifest> {
        let json = self.metadata(MANIFEST_KEY).ok_or_else(|| {
            MaceOptError::ModelError(format!("file carries no `{MANIFEST_KEY}` metadata"))
        })?;
        let manifest: ModelManifest = serde_json::from_str(json)?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(MaceOptError::ModelError(format!(
                "unsupported manifest version {} (expected {FORMAT_VERSION})",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }

    /// Write named tensors and a manifest to `path`.
    pub fn save(path: &Path, tensors: &[(String, Tensor)], manifest: &ModelManifest) -> Result<()> {
        let mut raw = Vec::with_capacity(tensors.len());
        for (name, tensor) in tensors {
            let (dtype, bytes) = tensor_bytes(tensor)?;
            raw.push((name.clone(), dtype, tensor.dims().to_vec(), bytes));
        }

        let views = raw
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                let view = TensorView::new(*dtype, shape.clone(), bytes)?;
                Ok((name.as_str(), view))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut metadata = HashMap::new();
        metadata.insert(MANIFEST_KEY.to_string(), serde_json::to_string(manifest)?);

        safetensors::serialize_to_file(views, &Some(metadata), path)?;
        Ok(())
    }
}

/// Little-endian bytes of a tensor with its SafeTensors dtype.
fn tensor_bytes(tensor: &Tensor) -> Result<(Dtype, Vec<u8>)> {
    let flat = tensor.flatten_all()?;
    let out = match tensor.dtype() {
        DType::F32 => (Dtype::F32, bytemuck::cast_slice(&flat.to_vec1::<f32>()?).to_vec()),
        DType::F64 => (Dtype::F64, bytemuck::cast_slice(&flat.to_vec1::<f64>()?).to_vec()),
        DType::I64 => (Dtype::I64, bytemuck::cast_slice(&flat.to_vec1::<i64>()?).to_vec()),
        DType::U32 => (Dtype::U32, bytemuck::cast_slice(&flat.to_vec1::<u32>()?).to_vec()),
        DType::U8 => (Dtype::U8, flat.to_vec1::<u8>()?),
        other => {
            return Err(MaceOptError::ModelError(format!(
                "cannot persist {:?} tensors",
                other
            )));
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ModelManifest {
        ModelManifest {
            format_version: FORMAT_VERSION,
            config: MaceConfig::default(),
            precision: Precision::Float64,
            spherical_harmonics: ShManifest::Fused,
            layers: vec![LayerManifest {
                interaction: InteractionManifest::Accelerated {
                    type_name: "RealAgnosticResidualInteractionBlock".to_string(),
                    variant: InteractionKind::Residual,
                    avg_num_neighbors: 8.0,
                },
                product: ProductManifest::Accelerated {
                    use_sc: true,
                    tiling: KernelTiling::default(),
                },
            }],
        }
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let device = Device::Cpu;

        let w = Tensor::new(&[[1.0f64, 2.0], [3.0, 4.0]], &device).unwrap();
        let idx = Tensor::new(&[0u32, 5, 7], &device).unwrap();
        let tensors = vec![("a.weight".to_string(), w), ("b.index".to_string(), idx)];
        TensorStore::save(&path, &tensors, &manifest()).unwrap();

        let store = TensorStore::from_file(&path, &device).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get_tensor("b.index").is_ok());
        let w: Vec<Vec<f64>> = store.get_tensor("a.weight").unwrap().to_vec2().unwrap();
        assert_eq!(w, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(store.get_tensor("b.index").unwrap().dtype(), DType::U32);
        assert_eq!(store.manifest().unwrap(), manifest());
    }

    #[test]
    fn missing_tensor_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        TensorStore::save(&path, &[], &manifest()).unwrap();
        let store = TensorStore::from_file(&path, &Device::Cpu).unwrap();
        assert!(store.is_empty());
        assert!(store.get_tensor("missing").is_err());
    }

    #[test]
    fn half_precision_is_upcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let values = [half::f16::from_f32(1.5), half::f16::from_f32(-2.0)];
        let bytes: &[u8] = bytemuck::cast_slice(&values);
        let view = TensorView::new(Dtype::F16, vec![2], bytes).unwrap();
        safetensors::serialize_to_file(vec![("h", view)], &None, &path).unwrap();

        let store = TensorStore::from_file(&path, &Device::Cpu).unwrap();
        let h = store.get_tensor("h").unwrap();
        assert_eq!(h.dtype(), DType::F32);
        assert_eq!(h.to_vec1::<f32>().unwrap(), vec![1.5, -2.0]);
        assert!(store.manifest().is_err());
    }

    #[test]
    fn manifest_json_is_tagged() {
        let json = serde_json::to_string(&manifest()).unwrap();
        assert!(json.contains(r#""kind":"accelerated""#));
        assert!(json.contains(r#""variant":"residual""#));
    }

    #[test]
    fn loader_from_nonexistent_file() {
        let result = TensorStore::from_file(Path::new("/nonexistent/model.safetensors"), &Device::Cpu);
        assert!(result.is_err());
    }
}
