//! Tunnel lifecycle error taxonomy

use thiserror::Error;

use crate::model_bridge::BridgeError;
use crate::ssh::SshError;
use crate::state::StateError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// SSH transport or authentication failure
    #[error("SSH connection failed: {0}")]
    Connection(String),

    /// Local bind address/port unavailable
    #[error("Local bind failed: {0}")]
    Bind(String),

    /// Forward negotiated but never accepted a connection
    #[error("Forward on {addr} not reachable after {attempts} probe(s)")]
    ProbeTimeout { addr: String, attempts: u32 },

    /// Reconnection gave up; the tunnel is marked `error`
    #[error("Gave up after {attempts} reconnection attempt(s)")]
    ExhaustedRetries { attempts: u32 },

    /// Non-fatal: record store failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Non-fatal: model registration failure
    #[error("Model bridge error: {0}")]
    Bridge(String),

    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),
}

impl From<SshError> for TunnelError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::BindFailed(msg) => TunnelError::Bind(msg),
            other => TunnelError::Connection(other.to_string()),
        }
    }
}

impl From<StateError> for TunnelError {
    fn from(err: StateError) -> Self {
        TunnelError::Persistence(err.to_string())
    }
}

impl From<BridgeError> for TunnelError {
    fn from(err: BridgeError) -> Self {
        TunnelError::Bridge(err.to_string())
    }
}
