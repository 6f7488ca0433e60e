//! Daemon configuration file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub http: HttpServer,
    #[serde(default)]
    pub licence: Licence,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub app: App,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub redis: Redis,
    #[serde(default)]
    pub services: Services,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServer {
    pub domains: Vec<String>,
    #[serde(default)]
    pub tls: Tls,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tls {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Licence {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
    #[serde(default = "default_data_dir")]
    pub data: PathBuf,
    #[serde(default = "default_logs_dir")]
    pub logs: PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            data: default_data_dir(),
            logs: default_logs_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/node-isp/")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("/var/log/node-isp/")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct App {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Database {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Redis {
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Services {
    #[serde(default)]
    pub google_maps_api_key: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.domains.iter().all(|d| d.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "http.domains must contain at least one domain".into(),
            ));
        }
        Ok(())
    }

    /// Primary domain the app is served on.
    pub fn primary_domain(&self) -> &str {
        self.http
            .domains
            .iter()
            .find(|d| !d.trim().is_empty())
            .map(String::as_str)
            .unwrap_or_default()
    }
}
