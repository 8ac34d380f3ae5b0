//! SSH Configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// SSH connection configuration for one jump host session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Jump host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication methods, tried in order until one is accepted
    pub auth: Vec<AuthMethod>,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Unanswered keepalives before the session is considered lost
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// Strict host key checking (default: false)
    /// - true: reject unknown/changed keys
    /// - false: accept any key, log its fingerprint
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

/// Authentication methods supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,
}

impl AuthMethod {
    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Build the candidate list for a session: agent first (when usable), then the
    /// explicit identity file, then whichever default identity files exist.
    pub fn discover(identity_file: Option<&str>, use_agent: bool) -> Vec<AuthMethod> {
        let mut methods = Vec::new();

        if use_agent && super::agent::is_agent_available() {
            methods.push(AuthMethod::Agent);
        }

        if let Some(path) = identity_file {
            methods.push(AuthMethod::key(expand_home(path), None));
        }

        if let Some(home) = dirs::home_dir() {
            for name in DEFAULT_IDENTITY_FILES {
                let path = home.join(".ssh").join(name);
                if path.exists() {
                    let path = path.to_string_lossy().into_owned();
                    let candidate = AuthMethod::key(path, None);
                    if !methods.contains(&candidate) {
                        methods.push(candidate);
                    }
                }
            }
        }

        methods
    }
}

const DEFAULT_IDENTITY_FILES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().into_owned(),
        _ => PathBuf::from(path).to_string_lossy().into_owned(),
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    15
}

fn default_keepalive_interval() -> u64 {
    10
}

fn default_keepalive_max() -> usize {
    3
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth: vec![AuthMethod::Agent],
            timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            strict_host_key_checking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SshConfig::default();
        assert_eq!(config.port, 22);
        assert_eq!(config.keepalive_interval_secs, 10);
        assert_eq!(config.keepalive_max, 3);
        assert!(!config.strict_host_key_checking);
    }

    #[test]
    fn test_discover_keeps_explicit_identity() {
        let methods = AuthMethod::discover(Some("/tmp/portknox-test-key"), false);
        assert_eq!(
            methods.first(),
            Some(&AuthMethod::key("/tmp/portknox-test-key", None))
        );
        assert!(!methods.contains(&AuthMethod::Agent));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/key"), "/etc/key");
        if let Some(home) = dirs::home_dir() {
            let expanded = expand_home("~/.ssh/id_rsa");
            assert!(expanded.starts_with(&*home.to_string_lossy()));
            assert!(expanded.ends_with("id_rsa"));
        }
    }

    #[test]
    fn test_auth_method_serde() {
        let json = serde_json::to_string(&AuthMethod::Agent).unwrap();
        assert_eq!(json, r#"{"type":"agent"}"#);
    }
}
