use tracing::debug;

use super::registry::{LoadedModel, ModelRegistry};
use super::window::{self, FeatureWindow};
use super::{Framework, Tag, Task};
use crate::error::InferenceError;

/// What a model call handed back before coercion to a scalar.
#[derive(Debug, Clone, PartialEq)]
enum ModelOutput {
    Scalar(f64),
    Values(Vec<f64>),
}

impl ModelOutput {
    fn into_scalar(self) -> Result<f64, InferenceError> {
        let value = match self {
            ModelOutput::Scalar(value) => value,
            ModelOutput::Values(values) => *values
                .first()
                .ok_or_else(|| InferenceError::Model("model returned no output".to_string()))?,
        };

        if !value.is_finite() {
            return Err(InferenceError::Model(format!(
                "model returned a non-finite value ({})",
                value
            )));
        }
        Ok(value)
    }
}

/// Runs the model for `(framework, tag, task)` on one feature window.
///
/// Tabular models see only the last row; sequence models see the whole
/// window as a batch of one. Regression yields the first output;
/// classification yields the probability of the "up" class.
pub fn infer(
    registry: &ModelRegistry,
    framework: Framework,
    tag: Tag,
    task: Task,
    x: &FeatureWindow,
) -> Result<f64, InferenceError> {
    let model = registry
        .get(framework, tag, task)
        .ok_or(InferenceError::NotFound {
            framework,
            tag,
            task,
        })?;

    let output = match model {
        LoadedModel::Tabular(model) => {
            let row = window::last_step(x)?;
            match task {
                Task::Regression => ModelOutput::Values(model.predict(&row)?),
                Task::Classification => {
                    let proba = model.predict_proba(&row)?;
                    let up = proba.first().map(|p| p[1]).ok_or_else(|| {
                        InferenceError::Model("model returned no probabilities".to_string())
                    })?;
                    ModelOutput::Scalar(up)
                }
            }
        }
        #[cfg(feature = "neural")]
        LoadedModel::Sequence(model) => {
            let batch = window::prepare_sequence_batch(x)?;
            let outputs = model.predict(&batch)?;
            // a single raw output; for classification it is read as P(up)
            ModelOutput::Values(outputs.into_iter().next().unwrap_or_default())
        }
    };

    let value = output.into_scalar()?;
    debug!("{} {} for tag {} -> {}", framework, task, tag, value);
    Ok(value)
}
