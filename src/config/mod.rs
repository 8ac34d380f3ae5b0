//! Configuration Management Module
//!
//! Service settings (API address, SSH defaults, model gateway, lifecycle
//! timings) loaded from a JSON file and overridden by environment variables.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, log_dir, state_db_file, ConfigStorage, StorageError};
pub use types::{
    ApiSettings, LifecycleSettings, ModelBridgeSettings, ServiceConfig, SshSettings,
    CONFIG_VERSION,
};
