//! Local Port Forwarding
//!
//! Forwards connections from a local bind address to a remote host:port through
//! SSH. Example: 127.0.0.1:15432 -> db.internal:5432 via the bastion.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ssh::{HandleController, SshError};

/// How long `stop` waits for relays to wind down
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Local port forwarding configuration
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1:15432")
    pub local_addr: String,
    /// Remote host to connect to through SSH (e.g., "db.internal")
    pub remote_host: String,
    /// Remote port to connect to
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        bind_address: &str,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        let local_addr = if bind_address.contains(':') && !bind_address.starts_with('[') {
            format!("[{}]:{}", bind_address, local_port)
        } else {
            format!("{}:{}", bind_address, local_port)
        };
        Self {
            local_addr,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> remote)
    pub bytes_sent: u64,
    /// Total bytes received (remote -> client)
    pub bytes_received: u64,
}

/// A byte stream to the remote end of a forward
pub trait ForwardStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardStream for T {}

/// Opens the remote half of each forwarded connection.
///
/// Production uses the SSH session (`direct-tcpip` channels); tests dial plain
/// TCP so the relay can be exercised without a server.
#[async_trait]
pub trait RemoteDialer: Clone + Send + Sync + 'static {
    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ForwardStream>, SshError>;
}

#[async_trait]
impl RemoteDialer for HandleController {
    async fn dial(&self, host: &str, port: u16) -> Result<Box<dyn ForwardStream>, SshError> {
        let channel = self
            .open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    /// Forward configuration
    pub config: LocalForward,
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    /// Flips to `true` when the accept loop has exited, for any reason
    exited_rx: watch::Receiver<bool>,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
}

impl LocalForwardHandle {
    /// Stop accepting, cut active relays and release the listener
    pub async fn stop(&self) {
        info!("Stopping local port forward on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        let mut exited = self.exited_rx.clone();
        let drained = tokio::time::timeout(STOP_DRAIN_TIMEOUT, async {
            let _ = exited.wait_for(|done| *done).await;
            while self.stats.read().active_connections > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Timeout waiting for {} active connections to close on {}",
                self.stats.read().active_connections,
                self.bound_addr
            );
        }
    }

    /// Check if the forward is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver that reads `true` once the forward has stopped accepting
    pub fn exited(&self) -> watch::Receiver<bool> {
        self.exited_rx.clone()
    }

    /// Get current statistics
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Bind the local listener and start forwarding.
///
/// A background task accepts local connections; each one is paired with a
/// remote stream from `dialer` and relayed until either side closes. The task
/// exits when `disconnect_rx` reads `true` (session lost) or `stop` is called.
pub async fn start_local_forward<D: RemoteDialer>(
    dialer: D,
    config: LocalForward,
    mut disconnect_rx: watch::Receiver<bool>,
) -> Result<LocalForwardHandle, SshError> {
    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => SshError::BindFailed(format!(
                "Port already in use: {}. Another application may be using this port.",
                config.local_addr
            )),
            std::io::ErrorKind::PermissionDenied => SshError::BindFailed(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                config.local_addr
            )),
            std::io::ErrorKind::AddrNotAvailable => SshError::BindFailed(format!(
                "Address not available: {}. The specified address is not valid on this system.",
                config.local_addr
            )),
            _ => SshError::BindFailed(format!("Failed to bind to {}: {}", config.local_addr, e)),
        })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::BindFailed(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let (exited_tx, exited_rx) = watch::channel(false);
    let stats = Arc::new(parking_lot::RwLock::new(ForwardStats::default()));
    let stats_clone = stats.clone();

    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = async { let _ = disconnect_rx.wait_for(|lost| *lost).await; } => {
                    info!("Local port forward on {} stopped: SSH disconnected", bound_addr);
                    break;
                }

                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                    debug!("Local port forward on {} stopped by request", bound_addr);
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("Accepted connection from {} on {}", peer_addr, bound_addr);

                            {
                                let mut s = stats_clone.write();
                                s.connection_count += 1;
                                s.active_connections += 1;
                            }

                            let dialer = dialer.clone();
                            let remote_host = remote_host.clone();
                            let stats_for_conn = stats_clone.clone();
                            let shutdown = shutdown_rx.clone();

                            tokio::spawn(async move {
                                let result = relay_connection(
                                    dialer,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    stats_for_conn.clone(),
                                    shutdown,
                                )
                                .await;

                                {
                                    let mut s = stats_for_conn.write();
                                    s.active_connections = s.active_connections.saturating_sub(1);
                                }

                                if let Err(e) = result {
                                    warn!("Forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error on {}: {}", bound_addr, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
        // Dropping the listener here releases the port before observers wake up.
        drop(listener);
        let _ = exited_tx.send(true);
        debug!("Local port forward task for {} exited", bound_addr);
    });

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        shutdown_tx,
        exited_rx,
        stats,
    })
}

/// Relay one accepted connection through a freshly dialed remote stream.
///
/// Flow control is paired: `copy_bidirectional` stops reading one side while
/// the other side's writes are pending.
async fn relay_connection<D: RemoteDialer>(
    dialer: D,
    mut local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    stats: Arc<parking_lot::RwLock<ForwardStats>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SshError> {
    let mut remote_stream = dialer.dial(remote_host, remote_port).await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut local_stream, &mut remote_stream) => {
            match result {
                Ok((sent, received)) => {
                    let mut s = stats.write();
                    s.bytes_sent += sent;
                    s.bytes_received += received;
                    debug!(
                        "Forward connection closed ({} bytes sent, {} bytes received)",
                        sent, received
                    );
                }
                Err(e) => debug!("Forward relay ended: {}", e),
            }
        }
        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
            debug!("Forward connection cut by shutdown");
        }
    }

    Ok(())
}
