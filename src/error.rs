use std::path::PathBuf;
use thiserror::Error;

use crate::ml::{Framework, Tag, Task};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model directory {} is not readable: {source}", .path.display())]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to probe artifact {}: {source}", .path.display())]
    Probe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load {}: {reason}", .path.display())]
    StartupLoad { path: PathBuf, reason: String },

    #[error(
        "{framework} model {} needs the sequence runtime, which is not compiled into this build; \
         rebuild with `--features neural` or remove the artifact",
        .path.display()
    )]
    DependencyMissing { framework: Framework, path: PathBuf },
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Invalid model format: {0}")]
    Format(String),

    #[error("Unknown layer class '{0}' (custom layers must be registered before loading)")]
    UnknownLayer(String),

    #[error("Expected {expected} input features, got {got}")]
    Shape { expected: usize, got: usize },

    #[error("Evaluation failed: {0}")]
    Evaluation(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Model not found: framework={framework}, tag={tag}, task={task}")]
    NotFound {
        framework: Framework,
        tag: Tag,
        task: Task,
    },

    #[error("Invalid input shape: {0}")]
    InputShape(String),

    #[error("Framework '{0}' is not served by this deployment")]
    UnsupportedFramework(String),

    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    #[error("Inference failed: {0}")]
    Model(String),
}

impl From<ModelError> for InferenceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::Shape { .. } => InferenceError::InputShape(err.to_string()),
            other => InferenceError::Model(other.to_string()),
        }
    }
}
