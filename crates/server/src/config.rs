use orchestrator::BuildConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;
use utoipa::ToSchema;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
const CONFIG_DIR: &str = "opsdash";
const CONFIG_FILE: &str = "config.toml";
const CONFIG_HEADER: &str = "\
# opsdash configuration
#
# [server]  listen address and frontend polling interval
# [build]   repository, accounts and toolchain used by the build pipeline
#
# Keys left out fall back to their built-in defaults.

";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `[server]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How often the frontend polls service status
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            poll_interval_ms: 5000,
        }
    }
}

/// Dashboard configuration file with `[server]` and `[build]` tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub server: ServerConfig,
    pub build: BuildConfig,
}

impl DashboardConfig {
    /// `<config dir>/opsdash/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub async fn read(path: &Path) -> Result<Self, ConfigError> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), "Config loaded successfully");
        Ok(config)
    }

    /// Write to `path`, creating parent directories.
    pub async fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let content = format!("{}{}", CONFIG_HEADER, toml::to_string_pretty(self)?);
        fs::write(path, content).await.map_err(write_err)?;
        debug!(path = %path.display(), "Config saved successfully");

        Ok(())
    }

    pub fn public(&self) -> PublicConfig {
        PublicConfig {
            poll_interval_ms: self.server.poll_interval_ms,
            repo_path: self.build.repo_path.display().to_string(),
            build_dir: self.build.build_dir.clone(),
            parallelism: self.build.parallelism,
            mock_step_delay_ms: self.build.mock_step_delay_ms,
        }
    }
}

/// Non-secret settings exposed to the frontend
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PublicConfig {
    pub poll_interval_ms: u64,
    pub repo_path: String,
    pub build_dir: String,
    pub parallelism: u32,
    pub mock_step_delay_ms: u64,
}
