pub mod dispatch;
pub mod gbdt;
pub mod locator;
pub mod registry;
pub mod runtime;
pub mod scaler;
#[cfg(feature = "neural")]
pub mod sequence;
pub mod window;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use dispatch::infer;
pub use gbdt::GbdtModel;
pub use locator::{ArtifactLocator, LocatedArtifact};
pub use registry::{LoadFailure, LoadedModel, ModelRegistry, RegistryLoader};
pub use runtime::NeuralRuntime;
pub use scaler::OutputScaler;
pub use window::{FeatureWindow, RawWindow, SequenceBatch};

/// Prediction target a model was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tag {
    A,
    B,
    #[serde(rename = "AFF")]
    Aff,
}

impl Tag {
    pub const ALL: [Tag; 3] = [Tag::A, Tag::B, Tag::Aff];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::A => "A",
            Tag::B => "B",
            Tag::Aff => "AFF",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| format!("unknown tag '{}', expected one of A, B, AFF", s))
    }
}

/// How a framework's models consume the feature window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Stateless across time, sees only the most recent row.
    Tabular,
    /// Consumes the whole window as a `[1, T, F]` batch.
    Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Lgbm,
    Lstm,
    Bilstm,
}

impl Framework {
    pub const ALL: [Framework; 3] = [Framework::Lgbm, Framework::Lstm, Framework::Bilstm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Lgbm => "lgbm",
            Framework::Lstm => "lstm",
            Framework::Bilstm => "bilstm",
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Framework::Lgbm => Family::Tabular,
            Framework::Lstm | Framework::Bilstm => Family::Sequence,
        }
    }

    /// Token used in artifact file names.
    pub fn file_token(&self) -> &'static str {
        match self {
            Framework::Lgbm => "LGB",
            Framework::Lstm => "LSTM",
            Framework::Bilstm => "BiLSTM_Attn",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.family() {
            Family::Tabular => "txt",
            Family::Sequence => "json",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Framework::ALL
            .into_iter()
            .find(|fw| fw.as_str() == s)
            .ok_or_else(|| format!("unknown framework '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Regression,
    Classification,
}

impl Task {
    pub const ALL: [Task; 2] = [Task::Regression, Task::Classification];

    pub fn as_str(&self) -> &'static str {
        match self {
            Task::Regression => "regression",
            Task::Classification => "classification",
        }
    }

    pub fn file_token(&self) -> &'static str {
        match self {
            Task::Regression => "reg",
            Task::Classification => "cls",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
