use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Framework, Tag, Task};
use crate::error::RegistryError;

/// An artifact file that exists on disk for one (framework, tag, task) slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub framework: Framework,
    pub tag: Tag,
    pub task: Task,
    pub path: PathBuf,
}

/// Resolves the fixed artifact naming convention
/// `{prefix}_{framework-token}_{tag}_{task-token}.{ext}` against a directory.
///
/// The locator only tests for existence; it never opens an artifact.
#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    dir: PathBuf,
    prefix: String,
}

impl ArtifactLocator {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, framework: Framework, tag: Tag, task: Task) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}_{}.{}",
            self.prefix,
            framework.file_token(),
            tag,
            task.file_token(),
            framework.extension()
        ))
    }

    /// Recognized scaler file names, in lookup order.
    pub fn scaler_candidates(&self) -> [PathBuf; 2] {
        [
            self.dir.join("y_scaler.json"),
            self.dir.join(format!("{}_y_scaler.json", self.prefix)),
        ]
    }

    /// Checks that the directory itself can be listed.
    pub fn ensure_readable(&self) -> Result<(), RegistryError> {
        fs::read_dir(&self.dir)
            .map(|_| ())
            .map_err(|source| RegistryError::DirectoryUnreadable {
                path: self.dir.clone(),
                source,
            })
    }

    /// Every expected artifact that exists, in framework → tag → task order.
    pub fn locate(&self) -> Result<Vec<LocatedArtifact>, RegistryError> {
        self.ensure_readable()?;

        let mut found = Vec::new();
        for framework in Framework::ALL {
            for tag in Tag::ALL {
                for task in Task::ALL {
                    let path = self.artifact_path(framework, tag, task);
                    if exists(&path)? {
                        debug!("Located {} artifact {}", framework, path.display());
                        found.push(LocatedArtifact {
                            framework,
                            tag,
                            task,
                            path,
                        });
                    }
                }
            }
        }

        Ok(found)
    }

    pub fn locate_scaler(&self) -> Result<Option<PathBuf>, RegistryError> {
        for path in self.scaler_candidates() {
            if exists(&path)? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

fn exists(path: &Path) -> Result<bool, RegistryError> {
    path.try_exists().map_err(|source| RegistryError::Probe {
        path: path.to_path_buf(),
        source,
    })
}
