//! Error types for mace-opt.

use thiserror::Error;

/// Result type alias for mace-opt operations.
pub type Result<T> = std::result::Result<T, MaceOptError>;

/// Errors that can occur while building, rewriting or running a model.
#[derive(Error, Debug)]
pub enum MaceOptError {
    /// A layer's class, shape or irreps metadata does not match what a
    /// replacer expects. Always fatal for the transformation.
    #[error("structural mismatch in {layer}: {reason}")]
    StructuralMismatch {
        /// Dotted path of the offending layer.
        layer: String,
        /// What was expected and what was found.
        reason: String,
    },

    /// Tensor shape mismatch at call time.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Input precision does not match the precision a kernel was built for.
    #[error("precision mismatch: {0}")]
    PrecisionMismatch(String),

    /// Receiver indices handed to the bucket builder are not sorted.
    #[error("receiver indices must be sorted ascending (violated at edge {0})")]
    UnsortedReceivers(usize),

    /// Irreps string could not be parsed.
    #[error("invalid irreps `{0}`")]
    InvalidIrreps(String),

    /// Model loading or construction error.
    #[error("model error: {0}")]
    ModelError(String),

    /// Structure file or graph construction error.
    #[error("structure error: {0}")]
    StructureError(String),

    /// Invalid configuration value.
    #[error("config error: {0}")]
    ConfigError(String),

    /// I/O error.
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// SafeTensors container error.
    #[error("safetensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    /// Candle tensor error.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

impl MaceOptError {
    /// Shorthand for a [`MaceOptError::StructuralMismatch`].
    pub fn structural(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StructuralMismatch {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}
