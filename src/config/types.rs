//! Service configuration types
//!
//! Stored as `config.json` in the config directory. Every field has a
//! default, so a missing or partial file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::forwarding::ProbeSettings;
use crate::tunnel::{ReconnectPolicy, RestorePolicy};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

pub const ENV_API_ADDR: &str = "PORTKNOX_API_ADDR";
pub const ENV_CONFIG_DIR: &str = "PORTKNOX_CONFIG_DIR";
pub const ENV_MODEL_BRIDGE_URL: &str = "LITELLM_BASE_URL";
pub const ENV_MODEL_BRIDGE_KEY: &str = "LITELLM_MASTER_KEY";

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub version: u32,
    pub api: ApiSettings,
    pub ssh: SshSettings,
    pub model_bridge: ModelBridgeSettings,
    pub lifecycle: LifecycleSettings,
    /// State database path; `<config dir>/state.redb` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_db: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            api: ApiSettings::default(),
            ssh: SshSettings::default(),
            model_bridge: ModelBridgeSettings::default(),
            lifecycle: LifecycleSettings::default(),
            state_db: None,
        }
    }
}

impl ServiceConfig {
    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(addr) = get(ENV_API_ADDR) {
            self.api.bind = addr;
        }
        if let Some(url) = get(ENV_MODEL_BRIDGE_URL) {
            self.model_bridge.base_url = url;
        }
        if let Some(key) = get(ENV_MODEL_BRIDGE_KEY) {
            self.model_bridge.api_key = key;
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiSettings {
    pub bind: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

/// SSH session settings shared by every tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SshSettings {
    /// Tried after the agent and before the default identity files
    pub identity_file: Option<String>,
    pub use_agent: bool,
    pub strict_host_key_checking: bool,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_max: usize,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            identity_file: None,
            use_agent: true,
            strict_host_key_checking: false,
            connect_timeout_secs: 15,
            keepalive_interval_secs: 10,
            keepalive_max: 3,
        }
    }
}

/// Model gateway (LiteLLM) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelBridgeSettings {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for ModelBridgeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:4000".to_string(),
            api_key: "sk-1234".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Lifecycle timings, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleSettings {
    pub probe_interval_ms: u64,
    pub probe_max_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub restore_retry_delay_ms: u64,
    pub restore_max_attempts: u32,
    pub restore_stagger_ms: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 500,
            probe_max_attempts: 20,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 5,
            restore_retry_delay_ms: 2000,
            restore_max_attempts: 3,
            restore_stagger_ms: 500,
        }
    }
}

impl LifecycleSettings {
    pub fn probe(&self) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(self.probe_interval_ms),
            max_attempts: self.probe_max_attempts.max(1),
        }
    }

    pub fn reconnect(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn restore(&self) -> RestorePolicy {
        RestorePolicy {
            max_attempts: self.restore_max_attempts.max(1),
            retry_delay: Duration::from_millis(self.restore_retry_delay_ms),
            stagger: Duration::from_millis(self.restore_stagger_ms),
        }
    }
}
