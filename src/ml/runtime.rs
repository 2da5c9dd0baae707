//! Capability handle for the sequence runtime.
//!
//! The runtime is compiled in with the `neural` feature. Without it,
//! [`NeuralRuntime`] is uninhabited and [`NeuralRuntime::detect`] returns
//! `None`, so the registry reports sequence artifacts as missing a dependency
//! while tabular models load normally.

use std::path::Path;

use super::registry::LoadedModel;
use super::Framework;
use crate::error::ModelError;

#[cfg(feature = "neural")]
use super::sequence::{LayerRegistry, SequenceModel, SoftAttention};

#[cfg(feature = "neural")]
#[derive(Debug, Clone, Copy)]
pub struct NeuralRuntime {
    _private: (),
}

#[cfg(not(feature = "neural"))]
#[derive(Debug, Clone, Copy)]
pub enum NeuralRuntime {}

#[cfg(feature = "neural")]
impl NeuralRuntime {
    pub fn detect() -> Option<Self> {
        Some(Self { _private: () })
    }

    /// Layers the loader can reconstruct for a framework's archives.
    pub fn layer_registry(framework: Framework) -> LayerRegistry {
        let mut layers = LayerRegistry::builtin();
        if framework == Framework::Bilstm {
            layers.register(SoftAttention::CLASS_NAME, SoftAttention::from_spec);
        }
        layers
    }

    pub fn load(&self, framework: Framework, path: &Path) -> Result<LoadedModel, ModelError> {
        let layers = Self::layer_registry(framework);
        SequenceModel::load(path, &layers).map(LoadedModel::Sequence)
    }
}

#[cfg(not(feature = "neural"))]
impl NeuralRuntime {
    pub fn detect() -> Option<Self> {
        None
    }

    pub fn load(&self, _framework: Framework, _path: &Path) -> Result<LoadedModel, ModelError> {
        match *self {}
    }
}

#[cfg(all(test, feature = "neural"))]
mod tests {
    use super::*;

    #[test]
    fn only_bilstm_registers_attention() {
        assert!(NeuralRuntime::layer_registry(Framework::Bilstm).contains("SoftAttention"));
        assert!(!NeuralRuntime::layer_registry(Framework::Lstm).contains("SoftAttention"));
        assert!(NeuralRuntime::layer_registry(Framework::Lstm).contains("LSTM"));
    }

    #[test]
    fn detected_when_compiled_in() {
        assert!(NeuralRuntime::detect().is_some());
    }
}
