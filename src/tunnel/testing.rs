//! In-process fakes for lifecycle tests

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::model_bridge::{BridgeError, ModelBridge};

use super::{ConnectionEstablisher, ForwardHandle, LiveForward, TunnelConfig, TunnelError};

/// Shared view of one fake forward
pub struct FakeForwardState {
    pub port: u16,
    closed_tx: watch::Sender<bool>,
    close_calls: AtomicU32,
}

impl FakeForwardState {
    /// Simulate the SSH session dropping
    pub fn drop_connection(&self) {
        let _ = self.closed_tx.send(true);
    }

    pub fn close_calls(&self) -> u32 {
        self.close_calls.load(Ordering::SeqCst)
    }
}

struct FakeForward(Arc<FakeForwardState>);

#[async_trait]
impl LiveForward for FakeForward {
    fn bound_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.0.port))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.0.closed_tx.subscribe()
    }

    async fn close(&self) {
        self.0.close_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.0.closed_tx.send(true);
    }
}

/// Establisher whose outcome is controlled by the test
#[derive(Default)]
pub struct FakeEstablisher {
    calls: AtomicU32,
    failing: AtomicBool,
    failing_ids: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    forwards: Mutex<HashMap<String, Vec<Arc<FakeForwardState>>>>,
}

impl FakeEstablisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail every establishment for `id` only
    pub fn fail_id(&self, id: &str) {
        self.failing_ids.lock().insert(id.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every forward handed out for `id`, oldest first
    pub fn forwards(&self, id: &str) -> Vec<Arc<FakeForwardState>> {
        self.forwards.lock().get(id).cloned().unwrap_or_default()
    }

    pub fn latest(&self, id: &str) -> Option<Arc<FakeForwardState>> {
        self.forwards(id).pop()
    }
}

#[async_trait]
impl ConnectionEstablisher for FakeEstablisher {
    async fn establish(
        &self,
        id: &str,
        config: &TunnelConfig,
    ) -> Result<ForwardHandle, TunnelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.load(Ordering::SeqCst) || self.failing_ids.lock().contains(id) {
            return Err(TunnelError::Connection("connection refused".into()));
        }

        let (closed_tx, _) = watch::channel(false);
        let state = Arc::new(FakeForwardState {
            port: config.local_port,
            closed_tx,
            close_calls: AtomicU32::new(0),
        });
        self.forwards
            .lock()
            .entry(id.to_string())
            .or_default()
            .push(state.clone());
        Ok(Box::new(FakeForward(state)))
    }
}

/// Model gateway that records calls
#[derive(Default)]
pub struct FakeBridge {
    pub failing: AtomicBool,
    pub registered: Mutex<Vec<(String, String)>>,
    pub unregistered: Mutex<Vec<String>>,
}

#[async_trait]
impl ModelBridge for FakeBridge {
    async fn register(
        &self,
        model_name: &str,
        api_base: &str,
        _api_key: Option<&str>,
    ) -> Result<String, BridgeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::InvalidResponse("gateway down".into()));
        }
        self.registered
            .lock()
            .push((model_name.to_string(), api_base.to_string()));
        Ok(format!("model-{}", model_name))
    }

    async fn unregister(&self, model_id: &str) -> Result<(), BridgeError> {
        self.unregistered.lock().push(model_id.to_string());
        Ok(())
    }

    async fn healthcheck(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
