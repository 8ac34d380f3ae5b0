//! Service configuration file
//!
//! `config.json` lives in the PortKnox directory:
//! `$PORTKNOX_CONFIG_DIR` if set, otherwise `%APPDATA%\PortKnox` on Windows
//! and `~/.portknox` elsewhere. The same directory holds `logs/` and the
//! state database.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::types::{ServiceConfig, CONFIG_VERSION, ENV_CONFIG_DIR};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = std::env::var_os(ENV_CONFIG_DIR).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("PortKnox"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".portknox"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn log_dir() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("logs"))
}

pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Default state database location, used when `stateDb` is unset
pub fn state_db_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("state.redb"))
}

/// Reads and writes `config.json`
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration, writing a default file on first start so
    /// there is something to edit.
    ///
    /// An unparsable file is moved aside and defaults are used. A file from
    /// a newer release is an error: running it with defaults would silently
    /// drop settings.
    pub async fn load_or_init(&self) -> Result<ServiceConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = ServiceConfig::default();
                match self.save(&config).await {
                    Ok(()) => info!("Wrote default configuration to {:?}", self.path),
                    Err(e) => warn!("Failed to write default configuration: {}", e),
                }
                return Ok(config);
            }
            Err(e) => return Err(e.into()),
        };

        let config = match serde_json::from_str::<ServiceConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config file {:?} is not valid: {}", self.path, e);
                match self.quarantine().await {
                    Ok(moved) => warn!("Moved it to {:?}, using defaults", moved),
                    Err(e) => error!("Failed to move invalid config aside: {}", e),
                }
                return Ok(ServiceConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// Write pretty JSON through a temp file and rename
    pub async fn save(&self, config: &ServiceConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    async fn quarantine(&self) -> Result<PathBuf, StorageError> {
        let target = self.path.with_extension(format!(
            "json.invalid.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        fs::rename(&self.path, &target).await?;
        Ok(target)
    }
}
