use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::gbdt::GbdtModel;
use super::locator::{ArtifactLocator, LocatedArtifact};
use super::runtime::NeuralRuntime;
use super::scaler::{self, OutputScaler};
#[cfg(feature = "neural")]
use super::sequence::SequenceModel;
use super::{Family, Framework, Tag, Task};
use crate::config::ModelsConfig;
use crate::error::RegistryError;

pub const DEFAULT_PREFIX: &str = "nvda";

/// A deserialized model, read-only once loaded.
#[derive(Debug)]
pub enum LoadedModel {
    Tabular(GbdtModel),
    #[cfg(feature = "neural")]
    Sequence(SequenceModel),
}

impl LoadedModel {
    pub fn kind(&self) -> &'static str {
        match self {
            LoadedModel::Tabular(_) => "gbdt",
            #[cfg(feature = "neural")]
            LoadedModel::Sequence(_) => "sequence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelSlot {
    pub framework: Framework,
    pub tag: Tag,
    pub task: Task,
}

/// An artifact that existed but could not be loaded.
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<ModelSlot>,
    pub path: PathBuf,
    pub reason: String,
}

type TaskMap = BTreeMap<Task, LoadedModel>;
type TagMap = BTreeMap<Tag, TaskMap>;

/// framework → tag → task → model, plus the shared output scaler.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug)]
pub struct ModelRegistry {
    models: BTreeMap<Framework, TagMap>,
    scaler: Option<OutputScaler>,
    failures: Vec<LoadFailure>,
    neural_available: bool,
    loaded_at: DateTime<Utc>,
}

impl ModelRegistry {
    pub fn load(config: &ModelsConfig) -> Result<Self, RegistryError> {
        RegistryLoader::new(&config.dir).prefix(&config.prefix).load()
    }

    /// Assembles a registry from already loaded models.
    pub fn from_parts(
        models: impl IntoIterator<Item = (ModelSlot, LoadedModel)>,
        scaler: Option<OutputScaler>,
    ) -> Self {
        let mut registry = Self::empty(NeuralRuntime::detect().is_some());
        for (slot, model) in models {
            registry.insert(slot, model);
        }
        registry.scaler = scaler;
        registry
    }

    fn empty(neural_available: bool) -> Self {
        Self {
            models: BTreeMap::new(),
            scaler: None,
            failures: Vec::new(),
            neural_available,
            loaded_at: Utc::now(),
        }
    }

    fn insert(&mut self, slot: ModelSlot, model: LoadedModel) {
        self.models
            .entry(slot.framework)
            .or_default()
            .entry(slot.tag)
            .or_default()
            .insert(slot.task, model);
    }

    pub fn get(&self, framework: Framework, tag: Tag, task: Task) -> Option<&LoadedModel> {
        self.models.get(&framework)?.get(&tag)?.get(&task)
    }

    /// Loaded slots in framework → tag → task order.
    pub fn available(&self) -> Vec<ModelSlot> {
        self.models
            .iter()
            .flat_map(|(&framework, tags)| {
                tags.iter().flat_map(move |(&tag, tasks)| {
                    tasks.keys().map(move |&task| ModelSlot {
                        framework,
                        tag,
                        task,
                    })
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.models
            .values()
            .flat_map(|tags| tags.values())
            .map(|tasks| tasks.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scaler(&self) -> Option<&OutputScaler> {
        self.scaler.as_ref()
    }

    pub fn failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    pub fn neural_available(&self) -> bool {
        self.neural_available
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Inverse-scales a regression output with the shared scaler, if any.
    pub fn rescale(&self, y_scaled: f64) -> (f64, bool) {
        scaler::rescale(self.scaler.as_ref(), y_scaled)
    }
}

/// Startup loader: locates artifacts and deserializes each one, skipping
/// (and recording) those that fail.
#[derive(Debug)]
pub struct RegistryLoader {
    locator_dir: PathBuf,
    prefix: String,
    runtime: Option<NeuralRuntime>,
}

impl RegistryLoader {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            locator_dir: dir.as_ref().to_path_buf(),
            prefix: DEFAULT_PREFIX.to_string(),
            runtime: NeuralRuntime::detect(),
        }
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Loads as if the sequence runtime were absent from this process.
    pub fn without_neural_runtime(mut self) -> Self {
        self.runtime = None;
        self
    }

    pub fn load(self) -> Result<ModelRegistry, RegistryError> {
        let locator = ArtifactLocator::new(&self.locator_dir, self.prefix.as_str());
        let artifacts = locator.locate()?;
        info!(
            "Located {} model artifacts in {}",
            artifacts.len(),
            locator.dir().display()
        );

        if self.runtime.is_none()
            && artifacts.iter().any(|a| a.framework.family() == Family::Sequence)
        {
            warn!("Sequence runtime unavailable; lstm/bilstm artifacts will be skipped");
        }

        let mut registry = ModelRegistry::empty(self.runtime.is_some());

        for artifact in artifacts {
            let slot = ModelSlot {
                framework: artifact.framework,
                tag: artifact.tag,
                task: artifact.task,
            };
            match self.load_artifact(&artifact) {
                Ok(model) => {
                    info!(
                        "Loaded {} {} model ({}) for tag {} from {}",
                        artifact.framework,
                        artifact.task,
                        model.kind(),
                        artifact.tag,
                        artifact.path.display()
                    );
                    registry.insert(slot, model);
                }
                Err(err) => {
                    warn!("Skipping artifact: {}", err);
                    registry.failures.push(LoadFailure {
                        slot: Some(slot),
                        path: artifact.path,
                        reason: err.to_string(),
                    });
                }
            }
        }

        match locator.locate_scaler()? {
            Some(path) => match OutputScaler::load(&path) {
                Ok(scaler) => {
                    info!("Loaded output scaler from {}", path.display());
                    registry.scaler = Some(scaler);
                }
                Err(err) => {
                    warn!("Ignoring output scaler {}: {}", path.display(), err);
                    registry.failures.push(LoadFailure {
                        slot: None,
                        path,
                        reason: err.to_string(),
                    });
                }
            },
            None => info!("No output scaler found; regression outputs stay in scaled space"),
        }

        metrics::gauge!("models_loaded").set(registry.len() as f64);
        info!(
            "Model registry ready: {} models, {} failures",
            registry.len(),
            registry.failures.len()
        );

        Ok(registry)
    }

    fn load_artifact(&self, artifact: &LocatedArtifact) -> Result<LoadedModel, RegistryError> {
        let path = &artifact.path;
        let loaded = match artifact.framework.family() {
            Family::Tabular => GbdtModel::load(path).map(LoadedModel::Tabular),
            Family::Sequence => match &self.runtime {
                Some(runtime) => runtime.load(artifact.framework, path),
                None => {
                    return Err(RegistryError::DependencyMissing {
                        framework: artifact.framework,
                        path: path.clone(),
                    });
                }
            },
        };

        loaded.map_err(|err| RegistryError::StartupLoad {
            path: path.clone(),
            reason: err.to_string(),
        })
    }
}
