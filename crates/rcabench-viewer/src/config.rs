//! Configuration

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::viewer::DisplayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Cannot read configuration: {0}")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub viewer: ViewerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Path of the file query endpoint; `{id}` is replaced by the resource id.
    pub file_endpoint: String,
    /// Bearer token sent with every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8082".to_string(),
            file_endpoint: "/api/v2/injections/{id}/files/query".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ViewerSettings {
    /// Rows printed by the terminal viewer.
    pub preview_rows: usize,
    pub display: DisplayConfig,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            preview_rows: 20,
            display: DisplayConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(ConfigError::Toml)
    }

    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string(self).expect("Cannot serialize configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_toml(&fs::read_to_string(path)?)
    }
}
