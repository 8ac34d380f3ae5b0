//! Connection establishment
//!
//! One establishment opens the SSH session, binds the local listener and
//! probes it. The result is a [`ForwardHandle`]; everything above this file
//! only sees that abstraction, so lifecycle code can be driven by a fake.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SshSettings;
use crate::forwarding::{
    start_local_forward, wait_until_ready, LocalForward, LocalForwardHandle, ProbeOutcome,
    ProbeSettings,
};
use crate::ssh::{spawn_handle_owner_task, AuthMethod, HandleController, SshClient, SshConfig};

use super::error::TunnelError;
use super::types::TunnelConfig;

/// A running forward owned by the registry
#[async_trait]
pub trait LiveForward: Send + Sync {
    /// Address the local listener is bound to
    fn bound_addr(&self) -> SocketAddr;

    /// Reads `true` once the forward stops on its own (session loss, listener error)
    fn closed(&self) -> watch::Receiver<bool>;

    /// Release the listener and the SSH session. Idempotent.
    async fn close(&self);
}

pub type ForwardHandle = Box<dyn LiveForward>;

/// Produces live forwards from configurations
#[async_trait]
pub trait ConnectionEstablisher: Send + Sync {
    async fn establish(
        &self,
        id: &str,
        config: &TunnelConfig,
    ) -> Result<ForwardHandle, TunnelError>;
}

/// Run one establishment in its own task so a panic surfaces as a failure
/// instead of tearing down the caller.
pub async fn establish_isolated(
    establisher: &Arc<dyn ConnectionEstablisher>,
    id: &str,
    config: &TunnelConfig,
) -> Result<ForwardHandle, TunnelError> {
    let establisher = establisher.clone();
    let task_id = id.to_string();
    let config = config.clone();

    match tokio::spawn(async move { establisher.establish(&task_id, &config).await }).await {
        Ok(result) => result,
        Err(join_err) => Err(TunnelError::Connection(format!(
            "establishment task failed: {}",
            join_err
        ))),
    }
}

/// SSH session plus local listener
struct SshForward {
    controller: HandleController,
    local: LocalForwardHandle,
}

#[async_trait]
impl LiveForward for SshForward {
    fn bound_addr(&self) -> SocketAddr {
        self.local.bound_addr
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.local.exited()
    }

    async fn close(&self) {
        if self.local.is_running() {
            self.local.stop().await;
        }
        self.controller.disconnect().await;
    }
}

/// Establishes forwards over real SSH sessions
pub struct SshEstablisher {
    ssh: SshSettings,
    probe: ProbeSettings,
}

impl SshEstablisher {
    pub fn new(ssh: SshSettings, probe: ProbeSettings) -> Self {
        Self { ssh, probe }
    }

    fn session_config(&self, config: &TunnelConfig) -> SshConfig {
        SshConfig {
            host: config.ssh_host.clone(),
            port: config.ssh_port,
            username: config.ssh_user.clone(),
            auth: AuthMethod::discover(self.ssh.identity_file.as_deref(), self.ssh.use_agent),
            timeout_secs: self.ssh.connect_timeout_secs,
            keepalive_interval_secs: self.ssh.keepalive_interval_secs,
            keepalive_max: self.ssh.keepalive_max,
            strict_host_key_checking: self.ssh.strict_host_key_checking,
        }
    }
}

#[async_trait]
impl ConnectionEstablisher for SshEstablisher {
    async fn establish(
        &self,
        id: &str,
        config: &TunnelConfig,
    ) -> Result<ForwardHandle, TunnelError> {
        let session = self.session_config(config);
        if session.auth.is_empty() {
            return Err(TunnelError::Connection(
                "no SSH agent or identity file available".into(),
            ));
        }

        info!(
            "[{}] Connecting to {}@{}:{}",
            id, session.username, session.host, session.port
        );
        let handle = SshClient::new(session).connect().await?;
        let controller = spawn_handle_owner_task(handle, id.to_string());

        let forward = LocalForward::new(
            &config.local_bind_address,
            config.local_port,
            config.remote_host.clone(),
            config.remote_port,
        );
        let disconnect_rx = controller.subscribe_disconnect();
        let local = match start_local_forward(controller.clone(), forward, disconnect_rx).await {
            Ok(local) => local,
            Err(e) => {
                controller.disconnect().await;
                return Err(e.into());
            }
        };

        let live = SshForward { controller, local };
        let closed = live.closed();
        match wait_until_ready(live.bound_addr(), self.probe, &closed).await {
            ProbeOutcome::Ready { attempts } => {
                debug!("[{}] Forward ready after {} probe(s)", id, attempts);
                Ok(Box::new(live))
            }
            ProbeOutcome::Closed => {
                live.close().await;
                Err(TunnelError::Connection(
                    "SSH session closed before the forward became ready".into(),
                ))
            }
            ProbeOutcome::TimedOut { attempts } => {
                warn!("[{}] Forward on {} never accepted", id, live.bound_addr());
                let addr = live.bound_addr().to_string();
                live.close().await;
                Err(TunnelError::ProbeTimeout { addr, attempts })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingEstablisher;

    #[async_trait]
    impl ConnectionEstablisher for PanickingEstablisher {
        async fn establish(
            &self,
            _id: &str,
            _config: &TunnelConfig,
        ) -> Result<ForwardHandle, TunnelError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn test_panicking_establishment_is_a_failure() {
        let establisher: Arc<dyn ConnectionEstablisher> = Arc::new(PanickingEstablisher);
        let config = TunnelConfig::new("db", "db.internal", 5432, 15432, "ops", "bastion");
        let result = establish_isolated(&establisher, "fwd_panic", &config).await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }

    #[test]
    fn test_session_config_uses_tunnel_endpoint() {
        let settings = SshSettings {
            identity_file: Some("/tmp/portknox-test-key".into()),
            use_agent: false,
            ..SshSettings::default()
        };
        let establisher = SshEstablisher::new(settings, ProbeSettings::default());
        let mut config = TunnelConfig::new("db", "db.internal", 5432, 15432, "ops", "bastion");
        config.ssh_port = 2222;

        let session = establisher.session_config(&config);
        assert_eq!(session.host, "bastion");
        assert_eq!(session.port, 2222);
        assert_eq!(session.username, "ops");
        assert_eq!(
            session.auth.first(),
            Some(&AuthMethod::key("/tmp/portknox-test-key", None))
        );
        assert_eq!(session.keepalive_max, 3);
    }
}
