use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::ModelError;

/// Scaler file as written next to the models, with scikit-learn's attribute
/// names (trailing underscores optional).
///
/// ```json
/// {"kind": "standard", "mean_": [412.3], "scale_": [88.1]}
/// {"kind": "minmax", "min_": [-0.12], "scale_": [0.0021]}
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum ScalerFile {
    Standard {
        #[serde(alias = "mean_")]
        mean: Vec<f64>,
        #[serde(alias = "scale_")]
        scale: Vec<f64>,
    },
    #[serde(alias = "min_max")]
    MinMax {
        #[serde(alias = "min_")]
        min: Vec<f64>,
        #[serde(alias = "scale_")]
        scale: Vec<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScalerKind {
    Standard,
    MinMax,
}

/// A fitted single-target scaler. Parameters are checked on construction,
/// so the transforms never fail.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ScalerFile")]
pub struct OutputScaler {
    kind: ScalerKind,
    offset: f64,
    scale: f64,
}

impl TryFrom<ScalerFile> for OutputScaler {
    type Error = ModelError;

    fn try_from(file: ScalerFile) -> Result<Self, Self::Error> {
        let (kind, offset, scale) = match file {
            ScalerFile::Standard { mean, scale } => (ScalerKind::Standard, mean, scale),
            ScalerFile::MinMax { min, scale } => (ScalerKind::MinMax, min, scale),
        };
        match (offset.as_slice(), scale.as_slice()) {
            ([offset], [scale]) => Self::new(kind, *offset, *scale),
            _ => Err(ModelError::Format(format!(
                "expected a single-target scaler, got {} offsets and {} scales",
                offset.len(),
                scale.len()
            ))),
        }
    }
}

impl OutputScaler {
    /// `y = y_scaled * scale + mean`
    pub fn standard(mean: f64, scale: f64) -> Result<Self, ModelError> {
        Self::new(ScalerKind::Standard, mean, scale)
    }

    /// `y = (y_scaled - min) / scale`
    pub fn min_max(min: f64, scale: f64) -> Result<Self, ModelError> {
        Self::new(ScalerKind::MinMax, min, scale)
    }

    fn new(kind: ScalerKind, offset: f64, scale: f64) -> Result<Self, ModelError> {
        if scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
            return Err(ModelError::Format("scaler parameters must be finite and non-zero".to_string()));
        }
        Ok(Self { kind, offset, scale })
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ModelError::Format(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| ModelError::Format(format!("invalid scaler: {}", e)))
    }

    /// Original units → model space.
    pub fn transform(&self, value: f64) -> f64 {
        match self.kind {
            ScalerKind::Standard => (value - self.offset) / self.scale,
            ScalerKind::MinMax => value * self.scale + self.offset,
        }
    }

    /// Model space → original units.
    pub fn inverse_transform(&self, value: f64) -> f64 {
        match self.kind {
            ScalerKind::Standard => value * self.scale + self.offset,
            ScalerKind::MinMax => (value - self.offset) / self.scale,
        }
    }
}

/// Maps a regression output back to original units when a scaler is loaded.
///
/// The flag is `true` when the value is *still* in scaled space, i.e. no
/// inverse transform happened.
pub fn rescale(scaler: Option<&OutputScaler>, y_scaled: f64) -> (f64, bool) {
    match scaler {
        Some(scaler) => (scaler.inverse_transform(y_scaled), false),
        None => (y_scaled, true),
    }
}
