//! Parallel linear (bottleneck) adapter, shared by LoRA and canonical adapters.
//!
//! The adapter computes `out = norm?(x) @ W_in^T @ W_out^T * scaling` where
//! `W_in ∈ R^{dim×in}` and `W_out ∈ R^{out×dim}`. With the default zero row
//! init the adapter starts as an identity residual.
//!
//! References: <https://arxiv.org/abs/2106.09685>, <https://arxiv.org/abs/1902.00751>

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Activation, LayerNorm, Linear};
use serde::{Deserialize, Serialize};

use crate::adapters::AdapterKind;
use crate::error::{PeftError, Result};
use crate::param::{ParamStore, Parameter};
use crate::traits::{Adapter, Validate};

/// Where the optional layer norm is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormPosition {
    /// No layer norm (LoRA).
    #[default]
    None,
    /// Normalize the adapter input.
    Pre,
    /// Normalize the adapter output.
    Post,
}

/// Weight initialization for one projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// Xavier-normal.
    #[default]
    Xavier,
    /// Normal with std 0.02.
    Normal,
    /// All zeros.
    Zero,
}

impl InitMethod {
    fn init(self, out_dim: usize, in_dim: usize, device: &Device) -> Result<Tensor> {
        let shape = (out_dim, in_dim);
        let tensor = match self {
            Self::Xavier => {
                #[allow(clippy::cast_precision_loss)]
                let std = (2.0 / (in_dim + out_dim) as f64).sqrt();
                #[allow(clippy::cast_possible_truncation)]
                Tensor::randn(0.0f32, std as f32, shape, device)?
            }
            Self::Normal => Tensor::randn(0.0f32, 0.02, shape, device)?,
            Self::Zero => Tensor::zeros(shape, DType::F32, device)?,
        };
        Ok(tensor)
    }
}

/// Configuration for a parallel linear adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelLinearConfig {
    /// Input dimension.
    pub in_features: usize,
    /// Output dimension.
    pub out_features: usize,
    /// Bottleneck dimension (the LoRA rank).
    pub dim: usize,
    /// Activation between the two projections; `None` is the identity.
    #[serde(default)]
    pub activation: Option<Activation>,
    /// Optional layer norm placement.
    #[serde(default)]
    pub norm_position: NormPosition,
    /// Init of the input projection.
    #[serde(default)]
    pub column_init_method: InitMethod,
    /// Init of the output projection.
    #[serde(default = "default_row_init")]
    pub row_init_method: InitMethod,
    /// Scaling numerator; the output is scaled by `alpha / dim`.
    #[serde(default)]
    pub alpha: Option<f64>,
    /// Dropout probability on the adapter output.
    #[serde(default)]
    pub dropout: f64,
}

fn default_row_init() -> InitMethod {
    InitMethod::Zero
}

impl ParallelLinearConfig {
    /// Bottleneck config with defaults for everything but the shapes.
    #[must_use]
    pub fn new(in_features: usize, out_features: usize, dim: usize) -> Self {
        Self {
            in_features,
            out_features,
            dim,
            activation: None,
            norm_position: NormPosition::None,
            column_init_method: InitMethod::Xavier,
            row_init_method: default_row_init(),
            alpha: None,
            dropout: 0.0,
        }
    }
}

impl Validate for ParallelLinearConfig {
    fn validate(&self) -> Result<()> {
        if self.dim == 0 {
            return Err(PeftError::InvalidConfig("adapter dim must be > 0".into()));
        }
        if self.in_features == 0 || self.out_features == 0 {
            return Err(PeftError::InvalidConfig(
                "in_features and out_features must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(PeftError::InvalidConfig(
                "dropout must be between 0 and 1".into(),
            ));
        }
        Ok(())
    }
}

/// Bottleneck adapter with an input projection, an output projection and an
/// optional layer norm.
pub struct ParallelLinearAdapter {
    kind: AdapterKind,
    params: ParamStore,
    scaling: f64,
    config: ParallelLinearConfig,
    position: Option<usize>,
}

impl ParallelLinearAdapter {
    /// Create a new adapter.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid or weight initialization fails.
    pub fn new(kind: AdapterKind, config: ParallelLinearConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        #[allow(clippy::cast_precision_loss)]
        let scaling = config.alpha.map_or(1.0, |alpha| alpha / config.dim as f64);

        let mut params = ParamStore::new();
        params.insert(
            "linear_in.weight".into(),
            Parameter::new(&config.column_init_method.init(config.dim, config.in_features, device)?)?,
        );
        params.insert(
            "linear_out.weight".into(),
            Parameter::new(&config.row_init_method.init(config.out_features, config.dim, device)?)?,
        );
        let norm_dim = match config.norm_position {
            NormPosition::None => None,
            NormPosition::Pre => Some(config.in_features),
            NormPosition::Post => Some(config.out_features),
        };
        if let Some(norm_dim) = norm_dim {
            params.insert(
                "layer_norm.weight".into(),
                Parameter::new(&Tensor::ones(norm_dim, DType::F32, device)?)?,
            );
            params.insert(
                "layer_norm.bias".into(),
                Parameter::new(&Tensor::zeros(norm_dim, DType::F32, device)?)?,
            );
        }

        Ok(Self {
            kind,
            params,
            scaling,
            config,
            position: None,
        })
    }

    /// Get the scaling factor.
    #[must_use]
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ParallelLinearConfig {
        &self.config
    }

    fn weight(&self, name: &str) -> Result<Tensor> {
        self.params
            .get(name)
            .map(|p| p.tensor().clone())
            .ok_or_else(|| PeftError::WeightLoad(format!("missing adapter parameter '{name}'")))
    }

    fn layer_norm(&self) -> Result<LayerNorm> {
        Ok(LayerNorm::new(
            self.weight("layer_norm.weight")?,
            self.weight("layer_norm.bias")?,
            1e-5,
        ))
    }
}

impl Adapter for ParallelLinearAdapter {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        if self.config.norm_position == NormPosition::Pre {
            x = self.layer_norm()?.forward(&x)?;
        }
        x = Linear::new(self.weight("linear_in.weight")?, None).forward(&x)?;
        if let Some(activation) = self.config.activation {
            x = activation.forward(&x)?;
        }
        x = Linear::new(self.weight("linear_out.weight")?, None).forward(&x)?;
        if self.config.norm_position == NormPosition::Post {
            x = self.layer_norm()?.forward(&x)?;
        }
        Ok(x.affine(self.scaling, 0.0)?)
    }

    fn parameters(&self) -> &ParamStore {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    fn position(&self) -> Option<usize> {
        self.position
    }

    fn set_position(&mut self, position: usize) {
        self.position = Some(position);
    }
}
