//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController`, which sends commands through an
//! mpsc channel. This avoids `Arc<Mutex<Handle>>` contention and never holds a
//! lock across `.await`.
//!
//! The owner task also watches the session itself: when russh closes the
//! session (keepalives unanswered, server hung up) the task exits and flips the
//! disconnect watch, which every forward listening on this session observes.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, tunnel_id);
//! let channel = controller.open_direct_tcpip("db.internal", 5432, "127.0.0.1", 0).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether russh has closed the session
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (for local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). Any holder has full control of the
/// session, so controllers never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Flips to `true` once the owner task has exited.
    disconnect_rx: watch::Receiver<bool>,
}

impl HandleController {
    /// Create a controller around an existing command sender (tests only).
    #[cfg(test)]
    pub(crate) fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> (Self, watch::Sender<bool>) {
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        (
            Self {
                cmd_tx,
                disconnect_rx,
            },
            disconnect_tx,
        )
    }

    /// Subscribe to SSH disconnect notification.
    ///
    /// The receiver already reads `true` if the session is gone, so late
    /// subscribers never miss the event.
    pub fn subscribe_disconnect(&self) -> watch::Receiver<bool> {
        self.disconnect_rx.clone()
    }

    /// Open a direct-tcpip channel (for local forward)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed() && !*self.disconnect_rx.borrow()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending
/// commands. `label` is only used for logging.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, disconnect_rx) = watch::channel(false);

    tokio::spawn(async move {
        let handle = handle;
        let mut liveness = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!("Handle owner task started for {}", label);

        let requested = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let result = handle
                            .channel_open_direct_tcpip(
                                &host,
                                port,
                                &originator_host,
                                originator_port,
                            )
                            .await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving direct_tcpip result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break true;
                    }
                    None => {
                        debug!("All controllers dropped for {}", label);
                        break true;
                    }
                },

                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH session for {} closed by transport", label);
                        break false;
                    }
                }
            }
        };

        // Notify forwards before tearing down, so they stop accepting.
        let _ = disconnect_tx.send(true);

        drain_pending_commands(&mut cmd_rx);

        if requested {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
                .await;
        }
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_rx,
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
