//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::agent::SshAgentClient;
use super::config::{AuthMethod, SshConfig};
use super::error::SshError;

/// SSH client for one jump host session
pub struct SshClient {
    config: SshConfig,
}

impl SshClient {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Connect and authenticate, returning the raw session handle.
    ///
    /// Ownership of the handle is expected to move into a handle owner task
    /// (see [`super::spawn_handle_owner_task`]).
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let addr = (self.config.host.clone(), self.config.port);

        info!("Connecting to SSH server at {}:{}", addr.0, addr.1);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_secs)),
            keepalive_max: self.config.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.strict_host_key_checking,
        );

        let mut handle = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            client::connect(Arc::new(ssh_config), addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| match e {
            SshError::HostKeyRejected(msg) => SshError::HostKeyRejected(msg),
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed");

        if self.config.auth.is_empty() {
            return Err(SshError::AuthenticationFailed(
                "No credentials available (no agent and no identity file)".to_string(),
            ));
        }

        let mut failures = Vec::new();
        for method in &self.config.auth {
            match self.try_authenticate(&mut handle, method).await {
                Ok(true) => {
                    info!(
                        "SSH authentication successful for {}@{}",
                        self.config.username, self.config.host
                    );
                    return Ok(handle);
                }
                Ok(false) => failures.push(format!("{}: rejected by server", describe(method))),
                Err(e) => {
                    debug!("Authentication method {} failed: {}", describe(method), e);
                    failures.push(format!("{}: {}", describe(method), e));
                }
            }
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
            .await;

        Err(SshError::AuthenticationFailed(format!(
            "No method accepted for {}@{} ({})",
            self.config.username,
            self.config.host,
            failures.join("; ")
        )))
    }

    async fn try_authenticate(
        &self,
        handle: &mut Handle<ClientHandler>,
        method: &AuthMethod,
    ) -> Result<bool, SshError> {
        match method {
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;

                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);

                let result = handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
                Ok(result.success())
            }
            AuthMethod::Agent => {
                let mut agent = SshAgentClient::connect().await?;
                agent.authenticate(handle, &self.config.username).await
            }
        }
    }
}

fn describe(method: &AuthMethod) -> String {
    match method {
        AuthMethod::Key { key_path, .. } => format!("key {}", key_path),
        AuthMethod::Agent => "agent".to_string(),
    }
}

/// Client handler for russh callbacks (host key verification)
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: verify against ~/.ssh/known_hosts, reject unknown/changed keys
    /// - false: accept and log the fingerprint
    strict: bool,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool) -> Self {
        Self { host, port, strict }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);

        if !self.strict {
            debug!(
                "Accepting host key for {}:{} (fingerprint: {})",
                self.host, self.port, fingerprint
            );
            return Ok(true);
        }

        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    "Unknown host key for {}:{} (fingerprint: {}), strict mode rejects it",
                    self.host, self.port, fingerprint
                );
                Err(SshError::HostKeyRejected(format!(
                    "unknown host {}:{} ({}); add it to known_hosts or disable strict checking",
                    self.host, self.port, fingerprint
                )))
            }
            Err(e) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (fingerprint: {}): {}",
                    self.host, self.port, fingerprint, e
                );
                Err(SshError::HostKeyRejected(format!(
                    "key for {}:{} does not match known_hosts: {}",
                    self.host, self.port, e
                )))
            }
        }
    }
}
