//! Backend configuration.
//!
//! Mirrors the small JSON settings file deep-learning backends keep in the
//! user's home directory:
//!
//! ```json
//! {"image_data_format": "channels_last", "epsilon": 1e-07, "cache_dir": "/data/fcn"}
//! ```
//!
//! Lookup order: `$FCN_HOME/fcn.json`, then `~/.fcn/fcn.json`. A missing
//! file yields defaults; an unreadable one is logged and ignored by
//! [`BackendConfig::from_env`] but reported by [`BackendConfig::load`].

use crate::error::{FcnError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Environment variable overriding the configuration directory.
pub const FCN_HOME_ENV: &str = "FCN_HOME";

/// Name of the configuration file inside the configuration directory.
pub const CONFIG_FILE: &str = "fcn.json";

/// Memory layout of image tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `(batch, height, width, channels)`; the layout pretrained archives are stored in.
    #[default]
    ChannelsLast,
    /// `(batch, channels, height, width)`.
    ChannelsFirst,
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelsLast => write!(f, "channels_last"),
            Self::ChannelsFirst => write!(f, "channels_first"),
        }
    }
}

/// Backend-wide settings consulted while building and loading models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Layout of image tensors built by a [`Graph`](crate::nn::Graph).
    pub image_data_format: DataFormat,
    /// Fuzz factor used by losses when clipping probabilities.
    pub epsilon: f32,
    /// Root of the download cache; `None` means the configuration directory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            image_data_format: DataFormat::ChannelsLast,
            epsilon: 1e-7,
            cache_dir: None,
        }
    }
}

impl BackendConfig {
    /// Reads a configuration file strictly.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| FcnError::io(path, e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| FcnError::Config(format!("{}: {e}", path.display())))?;
        if !(config.epsilon > 0.0 && config.epsilon < 0.5) {
            return Err(FcnError::Config(format!(
                "{}: epsilon must be in (0, 0.5), got {}",
                path.display(),
                config.epsilon
            )));
        }
        Ok(config)
    }

    /// Resolves the configuration from the environment, falling back to
    /// defaults when no usable file exists.
    #[must_use]
    pub fn from_env() -> Self {
        let path = config_dir().join(CONFIG_FILE);
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(%err, "ignoring unusable backend configuration");
                Self::default()
            }
        }
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|e| FcnError::io(path, e))
    }

    /// Sets the image data format.
    #[must_use]
    pub fn with_data_format(mut self, format: DataFormat) -> Self {
        self.image_data_format = format;
        self
    }

    /// Sets the cache root.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Directory downloaded archives are cached under (before the per-kind subdirectory).
    #[must_use]
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(config_dir)
    }
}

/// Configuration directory: `$FCN_HOME` or `~/.fcn`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(home) = std::env::var_os(FCN_HOME_ENV) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".fcn")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.image_data_format, DataFormat::ChannelsLast);
        assert!((config.epsilon - 1e-7).abs() < 1e-12);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"image_data_format": "channels_first"}"#).expect("write");

        let config = BackendConfig::load(&path).expect("valid config");
        assert_eq!(config.image_data_format, DataFormat::ChannelsFirst);
        assert!((config.epsilon - 1e-7).abs() < 1e-12);
    }

    #[test]
    fn test_load_rejects_bad_epsilon() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"epsilon": 0.0}"#).expect("write");

        let err = BackendConfig::load(&path).expect_err("epsilon 0 is invalid");
        assert!(matches!(err, FcnError::Config(_)));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{not json").expect("write");

        assert!(matches!(BackendConfig::load(&path), Err(FcnError::Config(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(CONFIG_FILE);
        let config = BackendConfig::default()
            .with_data_format(DataFormat::ChannelsFirst)
            .with_cache_dir("/var/cache/fcn");
        config.save(&path).expect("save");

        assert_eq!(BackendConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn test_cache_root_prefers_explicit_dir() {
        let config = BackendConfig::default().with_cache_dir("/srv/models");
        assert_eq!(config.cache_root(), PathBuf::from("/srv/models"));
    }

    #[test]
    fn test_data_format_display() {
        assert_eq!(DataFormat::ChannelsLast.to_string(), "channels_last");
        assert_eq!(DataFormat::ChannelsFirst.to_string(), "channels_first");
    }
}
