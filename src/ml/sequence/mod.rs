//! Recurrent sequence runtime.
//!
//! Sequence models are stored as JSON archives: an ordered list of layers,
//! each carrying its Keras class name, config and weights. Layers are built
//! through a [`LayerRegistry`]; classes that are not part of the built-in set
//! (such as [`SoftAttention`]) must be registered before the archive is read.

pub mod attention;
pub mod layers;

use nalgebra::{DMatrix, DVector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

use super::window::SequenceBatch;
use crate::error::ModelError;

pub use attention::SoftAttention;

pub const ARCHIVE_FORMAT: &str = "sequence-archive";
pub const ARCHIVE_VERSION: u32 = 1;

/// Values flowing between layers for a single sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// `[T, F]` with an optional per-step validity mask.
    Sequence {
        values: DMatrix<f64>,
        mask: Option<Vec<bool>>,
    },
    Vector(DVector<f64>),
}

impl Tensor {
    pub fn sequence(values: DMatrix<f64>) -> Self {
        Tensor::Sequence { values, mask: None }
    }
}

pub trait Layer: Send + Sync + fmt::Debug {
    fn class_name(&self) -> &'static str;

    fn forward(&self, input: Tensor) -> Result<Tensor, ModelError>;
}

pub type LayerBuilder = fn(&LayerSpec) -> Result<Box<dyn Layer>, ModelError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub class_name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub weights: Value,
}

impl LayerSpec {
    pub(crate) fn parse_config<T: DeserializeOwned>(&self) -> Result<T, ModelError> {
        parse_value(&self.config, &self.class_name, "config")
    }

    pub(crate) fn parse_weights<T: DeserializeOwned>(&self) -> Result<T, ModelError> {
        parse_value(&self.weights, &self.class_name, "weights")
    }
}

fn parse_value<T: DeserializeOwned>(value: &Value, class: &str, what: &str) -> Result<T, ModelError> {
    // absent config sections deserialize like empty objects
    let value = if value.is_null() {
        Value::Object(Default::default())
    } else {
        value.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| ModelError::Format(format!("{} {}: {}", class, what, e)))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceArchive {
    pub format: String,
    pub version: u32,
    #[serde(default)]
    pub input_features: Option<usize>,
    pub layers: Vec<LayerSpec>,
}

/// Maps layer class names to builders.
#[derive(Clone)]
pub struct LayerRegistry {
    builders: HashMap<String, LayerBuilder>,
}

impl fmt::Debug for LayerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.builders.keys().collect();
        names.sort();
        f.debug_struct("LayerRegistry").field("classes", &names).finish()
    }
}

impl LayerRegistry {
    /// Registry with the standard recurrent building blocks.
    pub fn builtin() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry
            .register("InputLayer", layers::Passthrough::input_layer)
            .register("Dropout", layers::Passthrough::dropout)
            .register("Masking", layers::Masking::from_spec)
            .register("Dense", layers::Dense::from_spec)
            .register("LSTM", layers::Lstm::from_spec)
            .register("Bidirectional", layers::Bidirectional::from_spec);
        registry
    }

    pub fn register(&mut self, class_name: &str, builder: LayerBuilder) -> &mut Self {
        self.builders.insert(class_name.to_string(), builder);
        self
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.builders.contains_key(class_name)
    }

    pub fn build(&self, spec: &LayerSpec) -> Result<Box<dyn Layer>, ModelError> {
        let builder = self
            .builders
            .get(&spec.class_name)
            .ok_or_else(|| ModelError::UnknownLayer(spec.class_name.clone()))?;
        builder(spec)
    }
}

/// A loaded sequence model: layers applied in order to each `[T, F]` sample.
#[derive(Debug)]
pub struct SequenceModel {
    layers: Vec<Box<dyn Layer>>,
    input_features: Option<usize>,
}

impl SequenceModel {
    pub fn load(path: &Path, registry: &LayerRegistry) -> Result<Self, ModelError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ModelError::Format(format!("cannot read {}: {}", path.display(), e)))?;
        let archive: SequenceArchive = serde_json::from_str(&content)
            .map_err(|e| ModelError::Format(format!("invalid sequence archive: {}", e)))?;
        Self::from_archive(&archive, registry)
    }

    pub fn from_archive(archive: &SequenceArchive, registry: &LayerRegistry) -> Result<Self, ModelError> {
        if archive.format != ARCHIVE_FORMAT {
            return Err(ModelError::Format(format!(
                "unexpected archive format '{}'",
                archive.format
            )));
        }
        if archive.version != ARCHIVE_VERSION {
            return Err(ModelError::Format(format!(
                "unsupported archive version {}",
                archive.version
            )));
        }
        if archive.layers.is_empty() {
            return Err(ModelError::Format("archive has no layers".to_string()));
        }

        let layers = archive
            .layers
            .iter()
            .map(|spec| registry.build(spec))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "Built sequence model: {}",
            layers.iter().map(|l| l.class_name()).collect::<Vec<_>>().join(" -> ")
        );

        Ok(Self {
            layers,
            input_features: archive.input_features,
        })
    }

    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|l| l.class_name()).collect()
    }

    /// One output vector per batch sample.
    pub fn predict(&self, batch: &SequenceBatch) -> Result<Vec<Vec<f64>>, ModelError> {
        batch
            .samples()
            .iter()
            .map(|sample| self.forward_sample(sample))
            .collect()
    }

    fn forward_sample(&self, sample: &DMatrix<f64>) -> Result<Vec<f64>, ModelError> {
        if let Some(expected) = self.input_features {
            if sample.ncols() != expected {
                return Err(ModelError::Shape {
                    expected,
                    got: sample.ncols(),
                });
            }
        }

        let mut tensor = Tensor::sequence(sample.clone());
        for layer in &self.layers {
            tensor = layer.forward(tensor)?;
        }

        match tensor {
            Tensor::Vector(values) => Ok(values.iter().copied().collect()),
            Tensor::Sequence { .. } => Err(ModelError::Evaluation(
                "model output is still a sequence; the last layers must reduce over time".to_string(),
            )),
        }
    }
}

/// Builds a matrix from row-major nested arrays, checking every row width.
pub(crate) fn matrix_from_rows(rows: &[Vec<f64>], name: &str) -> Result<DMatrix<f64>, ModelError> {
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.is_empty() || ncols == 0 {
        return Err(ModelError::Format(format!("'{}' is empty", name)));
    }
    if rows.iter().any(|r| r.len() != ncols) {
        return Err(ModelError::Format(format!("'{}' has ragged rows", name)));
    }
    Ok(DMatrix::from_row_iterator(
        rows.len(),
        ncols,
        rows.iter().flatten().copied(),
    ))
}

pub(crate) fn expect_dims(
    name: &str,
    matrix: &DMatrix<f64>,
    nrows: usize,
    ncols: usize,
) -> Result<(), ModelError> {
    if matrix.shape() != (nrows, ncols) {
        return Err(ModelError::Format(format!(
            "'{}' has shape {:?}, expected ({}, {})",
            name,
            matrix.shape(),
            nrows,
            ncols
        )));
    }
    Ok(())
}

pub(crate) fn expect_len(name: &str, values: &[f64], len: usize) -> Result<(), ModelError> {
    if values.len() != len {
        return Err(ModelError::Format(format!(
            "'{}' has {} values, expected {}",
            name,
            values.len(),
            len
        )));
    }
    Ok(())
}
