use anyhow::{bail, Result};
use ::config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::ml::{Framework, Tag};

/// Plain environment variables honored for compatibility with existing
/// deployments, mapped to their configuration keys.
const LEGACY_ENV: [(&str, &str); 6] = [
    ("MODEL_DIR", "models.dir"),
    ("DEFAULT_TAG", "serving.default_tag"),
    ("DEFAULT_FRAMEWORK", "serving.default_framework"),
    ("CLS_THRESHOLD", "serving.threshold"),
    ("CORS_ALLOW_ORIGINS", "server.cors_allow_origins"),
    ("PORT", "server.port"),
];

const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173,\
    https://nidarifda.github.io,\
    https://nidarifda.github.io/nvdia_stock_price_prediction";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub serving: ServingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Comma-separated list; `*` allows any origin.
    pub cors_allow_origins: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelsConfig {
    pub dir: PathBuf,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServingConfig {
    /// `label = 1` iff `p_up >= threshold`.
    pub threshold: f64,
    pub default_tag: Tag,
    pub default_framework: Framework,
    pub enabled_frameworks: Vec<Framework>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_allow_origins: DEFAULT_CORS_ORIGINS.to_string(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            prefix: crate::ml::registry::DEFAULT_PREFIX.to_string(),
        }
    }
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            default_tag: Tag::B,
            default_framework: Framework::Lgbm,
            enabled_frameworks: Framework::ALL.to_vec(),
        }
    }
}

impl ServerConfig {
    pub fn allowed_origins(&self) -> Vec<String> {
        self.cors_allow_origins
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Config {
    /// Defaults, then the TOML file (if present), then the process environment.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(Path::new(path)), std::env::vars().collect())
    }

    /// Layers: defaults → TOML file → `NVDA__SECTION__KEY` → legacy plain variables.
    pub fn load(path: Option<&Path>, env: HashMap<String, String>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("NVDA")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("serving.enabled_frameworks")
                .try_parsing(true)
                .source(Some(env.clone())),
        );

        for (var, key) in LEGACY_ENV {
            builder = builder.set_override_option(key, env.get(var).cloned())?;
        }

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.serving.threshold) {
            bail!(
                "serving.threshold must be within [0, 1], got {}",
                self.serving.threshold
            );
        }
        if self.serving.enabled_frameworks.is_empty() {
            bail!("serving.enabled_frameworks must not be empty");
        }
        if !self
            .serving
            .enabled_frameworks
            .contains(&self.serving.default_framework)
        {
            tracing::warn!(
                "Default framework {} is not enabled; requests must name a framework",
                self.serving.default_framework
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let config = Config::load(None, HashMap::new()).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.models.dir, PathBuf::from("models"));
        assert_eq!(config.models.prefix, "nvda");
        assert_eq!(config.serving.threshold, 0.5);
        assert_eq!(config.serving.default_tag, Tag::B);
        assert_eq!(config.serving.default_framework, Framework::Lgbm);
        assert_eq!(config.serving.enabled_frameworks.len(), 3);
        assert_eq!(config.server.allowed_origins().len(), 3);
    }

    #[test]
    fn file_then_environment() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[serving]\nthreshold = 0.6\ndefault_tag = \"A\"\nenabled_frameworks = [\"lgbm\"]\n\n\
             [models]\ndir = \"/srv/models\"\n",
        )
        .unwrap();

        let config = Config::load(
            Some(&path),
            env(&[("NVDA__SERVING__THRESHOLD", "0.7"), ("DEFAULT_TAG", "AFF")]),
        )
        .unwrap();
        assert_eq!(config.serving.threshold, 0.7);
        assert_eq!(config.serving.default_tag, Tag::Aff);
        assert_eq!(config.serving.enabled_frameworks, vec![Framework::Lgbm]);
        assert_eq!(config.models.dir, PathBuf::from("/srv/models"));
    }

    #[test]
    fn legacy_variables() {
        let config = Config::load(
            None,
            env(&[
                ("MODEL_DIR", "/opt/models"),
                ("CORS_ALLOW_ORIGINS", "https://a.example, https://b.example"),
                ("PORT", "9000"),
            ]),
        )
        .unwrap();
        assert_eq!(config.models.dir, PathBuf::from("/opt/models"));
        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.server.allowed_origins(),
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn missing_file_is_fine() {
        let config = Config::load(Some(Path::new("/nonexistent/config.toml")), HashMap::new()).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        assert!(Config::load(None, env(&[("CLS_THRESHOLD", "1.5")])).is_err());
    }
}
