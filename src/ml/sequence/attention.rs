//! Additive soft attention over the time axis.
//!
//! Forward contract, version 1. For one sample `x: [T, F]` with an optional
//! step mask and weights `W: [F, U]`, `b: [U]`, optional `u: [U]`:
//!
//! ```text
//! e_t = tanh(x_t · W + b)                  [U]
//! s_t = e_t · u        (or e_t[0] if U = 1)
//! s_t = -1e9           where the step is masked
//! a   = softmax over t of s
//! out = Σ_t a_t · x_t                      [F]
//! ```
//!
//! `u` is required when `U > 1`.

use nalgebra::{DMatrix, DVector};
use serde::Deserialize;

use super::{expect_len, matrix_from_rows, Layer, LayerSpec, Tensor};
use crate::error::ModelError;

/// Score assigned to masked steps before the softmax.
pub const MASK_FILL: f64 = -1e9;

#[derive(Deserialize)]
struct AttentionConfig {
    #[serde(default = "AttentionConfig::default_version")]
    version: u32,
}

impl AttentionConfig {
    fn default_version() -> u32 {
        SoftAttention::VERSION
    }
}

#[derive(Deserialize)]
struct AttentionWeights {
    #[serde(alias = "W")]
    kernel: Vec<Vec<f64>>,
    #[serde(alias = "b")]
    bias: Vec<f64>,
    #[serde(default, alias = "u")]
    context: Option<Vec<f64>>,
}

#[derive(Debug)]
pub struct SoftAttention {
    /// `[U, F]`
    projection: DMatrix<f64>,
    bias: DVector<f64>,
    context: Option<DVector<f64>>,
}

impl SoftAttention {
    pub const CLASS_NAME: &'static str = "SoftAttention";
    pub const VERSION: u32 = 1;

    pub fn from_spec(spec: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        let config: AttentionConfig = spec.parse_config()?;
        if config.version != Self::VERSION {
            return Err(ModelError::Format(format!(
                "SoftAttention version {} is not supported (expected {})",
                config.version,
                Self::VERSION
            )));
        }

        let weights: AttentionWeights = spec.parse_weights()?;
        Ok(Box::new(Self::new(weights)?))
    }

    fn new(weights: AttentionWeights) -> Result<Self, ModelError> {
        let kernel = matrix_from_rows(&weights.kernel, "W")?;
        let units = kernel.ncols();
        expect_len("b", &weights.bias, units)?;

        let context = match weights.context {
            Some(u) => {
                expect_len("u", &u, units)?;
                Some(DVector::from_vec(u))
            }
            None if units == 1 => None,
            None => {
                return Err(ModelError::Format(format!(
                    "SoftAttention with {} units needs a context vector 'u'",
                    units
                )));
            }
        };

        Ok(Self {
            projection: kernel.transpose(),
            bias: DVector::from_vec(weights.bias),
            context,
        })
    }

    /// Normalized attention weights over the time axis.
    pub fn weights(&self, values: &DMatrix<f64>, mask: Option<&[bool]>) -> Result<Vec<f64>, ModelError> {
        let features = self.projection.ncols();
        if values.ncols() != features {
            return Err(ModelError::Shape {
                expected: features,
                got: values.ncols(),
            });
        }
        if values.nrows() == 0 {
            return Err(ModelError::Evaluation("attention over an empty sequence".to_string()));
        }

        let scores: Vec<f64> = (0..values.nrows())
            .map(|t| {
                if mask.map_or(false, |m| !m[t]) {
                    return MASK_FILL;
                }
                let e = (&self.projection * values.row(t).transpose() + &self.bias).map(f64::tanh);
                match &self.context {
                    Some(u) => e.dot(u),
                    None => e[0],
                }
            })
            .collect();

        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let sum: f64 = exp.iter().sum();
        Ok(exp.into_iter().map(|e| e / sum).collect())
    }
}

impl Layer for SoftAttention {
    fn class_name(&self) -> &'static str {
        Self::CLASS_NAME
    }

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError> {
        match input {
            Tensor::Sequence { values, mask } => {
                let weights = self.weights(&values, mask.as_deref())?;
                Ok(Tensor::Vector(values.transpose() * DVector::from_vec(weights)))
            }
            Tensor::Vector(_) => Err(ModelError::Evaluation(
                "SoftAttention expects a sequence".to_string(),
            )),
        }
    }
}
