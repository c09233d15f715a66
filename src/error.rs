//! Error types for peft-shard.

use thiserror::Error;

/// Result type alias for peft-shard operations.
pub type Result<T> = std::result::Result<T, PeftError>;

/// Errors that can occur in peft-shard operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PeftError {
    /// Unsupported PEFT method for the runtime mode, unsupported tying rule,
    /// unknown checkpoint extension, or a malformed configuration document.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid adapter hyperparameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A state dict does not carry exactly the expected key set.
    #[error(
        "state dict keys do not match the expected set: missing {missing:?}, unexpected {unexpected:?}"
    )]
    KeyMismatch {
        /// Expected keys absent from the state dict
        missing: Vec<String>,
        /// Keys present in the state dict but not expected
        unexpected: Vec<String>,
    },

    /// The pipeline-parallel-native runtime was requested but is unavailable.
    #[error("missing dependency: {0}")]
    MissingDependency(String),

    /// The PEFT state machine was asked to move backwards or skip a phase.
    #[error("invalid PEFT state transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase
        from: &'static str,
        /// Requested phase
        to: &'static str,
    },

    /// Adapter not found.
    #[error("adapter not found: {name}")]
    AdapterNotFound {
        /// Name of the missing adapter
        name: String,
    },

    /// Adapter already exists.
    #[error("adapter already exists: {name}")]
    AdapterExists {
        /// Name of the duplicate adapter
        name: String,
    },

    /// No module at the requested path.
    #[error("module not found: {path}")]
    ModuleNotFound {
        /// Dotted module path
        path: String,
    },

    /// Weight loading error.
    #[error("failed to load weights: {0}")]
    WeightLoad(String),

    /// Underlying candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Checkpoint archive error.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Safetensors serialization error.
    #[error("safetensors error: {0}")]
    SafeTensor(#[from] safetensors::SafeTensorError),
}
