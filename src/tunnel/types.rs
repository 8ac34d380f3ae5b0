//! Tunnel configuration and boundary result types

use std::net::IpAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::error::TunnelError;

/// Default local bind address (localhost only)
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Tag added to tunnels that register a model backend
pub const MODEL_TAG: &str = "llm";

/// Persisted/visible status of a tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Forward established and probed
    Active,
    /// Not (yet) usable: establishing, reconnecting or restoring
    #[default]
    Inactive,
    /// Retries exhausted; stays until stopped or recreated
    Error,
}

impl TunnelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelStatus::Active => "active",
            TunnelStatus::Inactive => "inactive",
            TunnelStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and intent of one SSH tunnel
///
/// Older clients send the model-registration fields with a `litellm` prefix;
/// both spellings are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Unique id, generated on create when empty
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    /// `127.0.0.1` for localhost only, `0.0.0.0` for all interfaces
    #[serde(default = "default_bind_address")]
    pub local_bind_address: String,
    #[serde(default)]
    pub ssh_user: String,
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default)]
    pub status: TunnelStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, alias = "litellmEnabled")]
    pub model_registration_enabled: bool,
    #[serde(default, alias = "litellmModelName", skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Only used for the registration call; never echoed back
    #[serde(default, alias = "litellmApiKey", skip_serializing)]
    pub model_api_key: Option<String>,
    #[serde(default, alias = "litellmModelId", skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, alias = "litellmApiBase", skip_serializing_if = "Option::is_none")]
    pub model_api_base: Option<String>,
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl TunnelConfig {
    pub fn new(
        name: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
        local_port: u16,
        ssh_user: impl Into<String>,
        ssh_host: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            remote_host: remote_host.into(),
            remote_port,
            local_port,
            local_bind_address: default_bind_address(),
            ssh_user: ssh_user.into(),
            ssh_host: ssh_host.into(),
            ssh_port: default_ssh_port(),
            status: TunnelStatus::Inactive,
            author: None,
            tags: Vec::new(),
            model_registration_enabled: false,
            model_name: None,
            model_api_key: None,
            model_id: None,
            model_api_base: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.local_bind_address = address.into();
        self
    }

    pub fn with_model(mut self, model_name: impl Into<String>, api_key: Option<String>) -> Self {
        self.model_registration_enabled = true;
        self.model_name = Some(model_name.into());
        self.model_api_key = api_key;
        self
    }

    /// Fill defaults: id, bind address, ssh user/port, tag hygiene.
    pub fn normalized(mut self) -> Self {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            self.id = generate_tunnel_id();
        }

        self.name = self.name.trim().to_string();
        self.remote_host = self.remote_host.trim().to_string();
        self.ssh_host = self.ssh_host.trim().to_string();

        self.local_bind_address = self.local_bind_address.trim().to_string();
        if self.local_bind_address.is_empty() {
            self.local_bind_address = default_bind_address();
        }

        self.ssh_user = self.ssh_user.trim().to_string();
        if self.ssh_user.is_empty() {
            self.ssh_user = whoami::username();
        }

        if self.ssh_port == 0 {
            self.ssh_port = default_ssh_port();
        }

        self.author = self
            .author
            .take()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());

        self.tags = normalize_tags(std::mem::take(&mut self.tags));
        if self.model_registration_enabled && !self.tags.iter().any(|t| t == MODEL_TAG) {
            self.tags.push(MODEL_TAG.to_string());
        }

        self
    }

    /// Reject requests that cannot possibly be established.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.name.is_empty() {
            return Err(TunnelError::InvalidConfig("name is required".into()));
        }
        if self.remote_host.is_empty() {
            return Err(TunnelError::InvalidConfig("remoteHost is required".into()));
        }
        if self.ssh_host.is_empty() {
            return Err(TunnelError::InvalidConfig("sshHost is required".into()));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::InvalidConfig("remotePort must be 1-65535".into()));
        }
        if self.local_port == 0 {
            return Err(TunnelError::InvalidConfig("localPort must be 1-65535".into()));
        }
        if self.local_bind_address != "localhost"
            && self.local_bind_address.parse::<IpAddr>().is_err()
        {
            return Err(TunnelError::InvalidConfig(format!(
                "localBindAddress {} is not an IP address",
                self.local_bind_address
            )));
        }
        if self.model_registration_enabled
            && self.model_name.as_deref().map_or(true, |n| n.trim().is_empty())
        {
            return Err(TunnelError::InvalidConfig(
                "modelName is required when model registration is enabled".into(),
            ));
        }
        Ok(())
    }

    /// Whether the forward is reachable from other machines
    pub fn is_externally_reachable(&self) -> bool {
        self.local_bind_address
            .parse::<IpAddr>()
            .map(|ip| ip.is_unspecified())
            .unwrap_or(false)
    }

    /// OpenAI-compatible base URL of the forwarded endpoint
    pub fn api_base(&self) -> String {
        match self.local_bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("http://[{}]:{}/v1", ip, self.local_port),
            _ => format!("http://{}:{}/v1", self.local_bind_address, self.local_port),
        }
    }

    /// Human-readable summary, e.g. `127.0.0.1:15432 -> db.internal:5432`
    pub fn route(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.local_bind_address, self.local_port, self.remote_host, self.remote_port
        )
    }
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().trim_start_matches('#').to_string();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

/// `fwd_<unix-millis>_<9 base36 chars>`
pub fn generate_tunnel_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("fwd_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// Discriminated result returned by every boundary operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TunnelConfig>,
}

impl TunnelResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            config: None,
        }
    }

    pub fn started(config: TunnelConfig) -> Self {
        let access = if config.is_externally_reachable() {
            "(externally reachable)"
        } else {
            "(localhost only)"
        };
        Self {
            success: true,
            message: format!("SSH port forward started: {} {}", config.route(), access),
            config: Some(config),
        }
    }

    pub fn failure(error: &TunnelError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_tunnel() -> TunnelConfig {
        TunnelConfig::new("db", "db.internal", 5432, 15432, "ops", "bastion")
    }

    #[test]
    fn test_generated_id_shape() {
        let id = generate_tunnel_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "fwd");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert_ne!(generate_tunnel_id(), generate_tunnel_id());
    }

    #[test]
    fn test_normalize_fills_defaults() {
        let mut config = db_tunnel();
        config.local_bind_address = " ".into();
        config.ssh_port = 0;
        config.tags = vec!["#prod".into(), "prod".into(), " ".into()];

        let config = config.normalized();
        assert!(config.id.starts_with("fwd_"));
        assert_eq!(config.local_bind_address, "127.0.0.1");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.tags, vec!["prod".to_string()]);
    }

    #[test]
    fn test_normalize_keeps_given_id_and_adds_model_tag() {
        let config = db_tunnel()
            .with_id("fwd_fixed")
            .with_model("llama", None)
            .normalized();
        assert_eq!(config.id, "fwd_fixed");
        assert_eq!(config.tags, vec![MODEL_TAG.to_string()]);
    }

    #[test]
    fn test_validate() {
        assert!(db_tunnel().normalized().validate().is_ok());

        let mut bad = db_tunnel();
        bad.local_port = 0;
        assert!(matches!(bad.validate(), Err(TunnelError::InvalidConfig(_))));

        let bad = db_tunnel().with_bind_address("not-an-ip");
        assert!(matches!(bad.validate(), Err(TunnelError::InvalidConfig(_))));

        let mut bad = db_tunnel();
        bad.model_registration_enabled = true;
        assert!(matches!(bad.validate(), Err(TunnelError::InvalidConfig(_))));
    }

    #[test]
    fn test_api_base_and_reachability() {
        let config = db_tunnel().with_bind_address("0.0.0.0");
        assert_eq!(config.api_base(), "http://0.0.0.0:15432/v1");
        assert!(config.is_externally_reachable());
        assert!(!db_tunnel().is_externally_reachable());

        let v6 = db_tunnel().with_bind_address("::1");
        assert_eq!(v6.api_base(), "http://[::1]:15432/v1");
    }

    #[test]
    fn test_deserialize_legacy_field_names() {
        let json = r#"{
            "name": "llm",
            "remoteHost": "gpu-box",
            "remotePort": 8000,
            "localPort": 18000,
            "sshUser": "ops",
            "sshHost": "bastion",
            "litellmEnabled": true,
            "litellmModelName": "llama-3",
            "litellmApiKey": "secret"
        }"#;
        let config: TunnelConfig = serde_json::from_str(json).unwrap();
        assert!(config.model_registration_enabled);
        assert_eq!(config.model_name.as_deref(), Some("llama-3"));
        assert_eq!(config.local_bind_address, "127.0.0.1");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.status, TunnelStatus::Inactive);

        let out = serde_json::to_string(&config).unwrap();
        assert!(out.contains("\"modelRegistrationEnabled\":true"));
        assert!(!out.contains("secret"));
    }

    #[test]
    fn test_started_message() {
        let result = TunnelResult::started(db_tunnel());
        assert!(result.success);
        assert!(result.message.contains("127.0.0.1:15432 -> db.internal:5432"));
        assert!(result.message.contains("localhost only"));
    }
}
