//! Plugin configuration.
//!
//! Read from `amp.toml` in the plugin bundle. Every field has a default, so a
//! bundle without the file (or with a partial one) still loads.
//!
//! ```toml
//! script = "amp.js"
//! module = "amp"
//! function = "db_to_coef"
//! fallback = "silence"
//! mode = "synchronous"
//!
//! [runtime]
//! worker_name = "amp-script-runtime"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use amp_js_runtime::RuntimeConfig;

use crate::coefficient::{CoefficientMode, FallbackPolicy};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Configuration for one plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmpConfig {
    /// Conversion script, relative to the bundle unless absolute.
    pub script: PathBuf,

    /// Name the script is registered under inside the engine.
    pub module: String,

    /// Exported function mapping decibels to a linear coefficient.
    pub function: String,

    /// Gain used for a test call during activation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_gain: Option<f32>,

    /// Coefficient used when the script cannot produce one.
    pub fallback: FallbackPolicy,

    /// How the audio path obtains a new coefficient.
    pub mode: CoefficientMode,

    /// Shared script runtime settings.
    pub runtime: RuntimeConfig,

    /// Bundle directory the config was loaded from.
    #[serde(skip)]
    pub bundle_path: PathBuf,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            script: PathBuf::from("amp.js"),
            module: "amp".to_string(),
            function: "db_to_coef".to_string(),
            test_gain: Some(0.0),
            fallback: FallbackPolicy::default(),
            mode: CoefficientMode::default(),
            runtime: RuntimeConfig::default(),
            bundle_path: PathBuf::from("."),
        }
    }
}

impl AmpConfig {
    /// Name of the config file inside a bundle.
    pub const FILE_NAME: &'static str = "amp.toml";

    /// Load the configuration for a bundle directory.
    pub fn load(bundle: impl AsRef<Path>) -> Result<Self, LoadError> {
        let bundle = bundle.as_ref();
        let path = bundle.join(Self::FILE_NAME);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| LoadError::ReadError {
                path: path.clone(),
                source,
            })?;
            tracing::debug!("Loading plugin config from {}", path.display());
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.bundle_path = bundle.to_path_buf();
        Ok(config)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, LoadError> {
        Ok(toml::from_str(content)?)
    }

    /// Use `bundle` as the base directory for relative paths.
    pub fn with_bundle_path(mut self, bundle: impl Into<PathBuf>) -> Self {
        self.bundle_path = bundle.into();
        self
    }

    /// Absolute location of the conversion script.
    pub fn script_path(&self) -> PathBuf {
        if self.script.is_absolute() {
            self.script.clone()
        } else {
            self.bundle_path.join(&self.script)
        }
    }
}
