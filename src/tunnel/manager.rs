//! Tunnel manager
//!
//! Boundary facade over the registry, supervisor, store and model bridge.
//! Every public operation returns a [`TunnelResult`] or plain data; failures
//! of the store or the bridge are logged and never fail the operation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::model_bridge::ModelBridge;
use crate::state::{PersistedTunnel, TunnelStore};

use super::error::TunnelError;
use super::establisher::{establish_isolated, ConnectionEstablisher};
use super::registry::TunnelRegistry;
use super::restore::{RestorationCoordinator, RestorePolicy, RestoreReport};
use super::supervisor::{ReconnectPolicy, ReconnectSupervisor};
use super::types::{TunnelConfig, TunnelResult, TunnelStatus};

/// Registry counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelSummary {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
}

#[derive(Clone)]
pub struct TunnelManager {
    registry: Arc<TunnelRegistry>,
    establisher: Arc<dyn ConnectionEstablisher>,
    store: Option<Arc<dyn TunnelStore>>,
    bridge: Option<Arc<dyn ModelBridge>>,
    supervisor: ReconnectSupervisor,
    restore_policy: RestorePolicy,
}

impl TunnelManager {
    pub fn new(
        establisher: Arc<dyn ConnectionEstablisher>,
        store: Option<Arc<dyn TunnelStore>>,
        bridge: Option<Arc<dyn ModelBridge>>,
        reconnect: ReconnectPolicy,
        restore: RestorePolicy,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let supervisor = ReconnectSupervisor::new(
            registry.clone(),
            establisher.clone(),
            store.clone(),
            reconnect,
        );
        Self {
            registry,
            establisher,
            store,
            bridge,
            supervisor,
            restore_policy: restore,
        }
    }

    pub fn bridge(&self) -> Option<&Arc<dyn ModelBridge>> {
        self.bridge.as_ref()
    }

    fn max_attempts(&self) -> u32 {
        self.supervisor.policy().max_attempts
    }

    /// Establish a tunnel and start supervising it
    pub async fn create(&self, config: TunnelConfig) -> TunnelResult {
        match self.try_create(config).await {
            Ok(config) => {
                let result = TunnelResult::started(config);
                info!("{}", result.message);
                result
            }
            Err(e) => {
                warn!("Failed to start tunnel: {}", e);
                TunnelResult::failure(&e)
            }
        }
    }

    async fn try_create(&self, config: TunnelConfig) -> Result<TunnelConfig, TunnelError> {
        let mut config = config.normalized();
        config.validate()?;

        if let Some(holder) = self.registry.port_holder(config.local_port, &config.id) {
            return Err(TunnelError::Bind(format!(
                "local port {} is already forwarded by tunnel {}",
                config.local_port, holder
            )));
        }

        // Same id: retire the running tunnel before binding its port again
        let replacing = match self.registry.remove(&config.id, self.max_attempts()) {
            Some(previous) => {
                info!("[{}] Replacing existing tunnel", config.id);
                if let Some(handle) = previous.handle {
                    handle.close().await;
                }
                self.unregister_model(&config.id, previous.config.model_id.as_deref())
                    .await;
                true
            }
            None => false,
        };

        info!("[{}] Starting SSH port forward {}", config.id, config.route());
        let handle = match establish_isolated(&self.establisher, &config.id, &config).await {
            Ok(handle) => handle,
            Err(e) => {
                // The retired tunnel's record would otherwise stay `active`
                if replacing {
                    self.forget(&config.id, None).await;
                }
                return Err(e);
            }
        };
        config.status = TunnelStatus::Active;

        if config.model_registration_enabled {
            self.register_model(&mut config).await;
        }

        let closed = handle.closed();
        let generation = self.registry.upsert(config.clone(), handle).await;
        self.supervisor.watch(config.id.clone(), generation, closed);

        if let Some(store) = &self.store {
            if let Err(e) = store.upsert_tunnel(PersistedTunnel::from_config(&config)).await {
                warn!("[{}] {}", config.id, TunnelError::from(e));
            }
        }

        Ok(config)
    }

    /// Stop a tunnel and forget it: registry entry, record and model registration
    pub async fn stop(&self, id: &str) -> TunnelResult {
        if let Some(removed) = self.registry.remove(id, self.max_attempts()) {
            if let Some(handle) = removed.handle {
                handle.close().await;
            }
            self.forget(id, removed.config.model_id.as_deref()).await;
            info!("[{}] SSH port forward stopped", id);
            return TunnelResult::ok("SSH port forward stopped");
        }

        // Not live, but a saved record may still exist
        if let Some(store) = &self.store {
            match store.get_tunnel(id).await {
                Ok(Some(record)) => {
                    self.forget(id, record.model_id.as_deref()).await;
                    info!("[{}] Removed saved tunnel", id);
                    return TunnelResult::ok("Saved SSH port forward removed");
                }
                Ok(None) => {}
                Err(e) => warn!("[{}] {}", id, TunnelError::from(e)),
            }
        }

        TunnelResult::failure(&TunnelError::NotFound(id.to_string()))
    }

    async fn forget(&self, id: &str, model_id: Option<&str>) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_tunnel(id).await {
                warn!("[{}] {}", id, TunnelError::from(e));
            }
        }
        self.unregister_model(id, model_id).await;
    }

    async fn register_model(&self, config: &mut TunnelConfig) {
        let api_base = config.api_base();
        config.model_api_base = Some(api_base.clone());

        let Some(bridge) = &self.bridge else {
            warn!("[{}] Model registration requested but the gateway is disabled", config.id);
            return;
        };
        let Some(model_name) = config.model_name.clone() else {
            return;
        };

        match bridge
            .register(&model_name, &api_base, config.model_api_key.as_deref())
            .await
        {
            Ok(model_id) => config.model_id = Some(model_id),
            Err(e) => warn!("[{}] {}", config.id, TunnelError::from(e)),
        }
    }

    async fn unregister_model(&self, id: &str, model_id: Option<&str>) {
        let (Some(bridge), Some(model_id)) = (&self.bridge, model_id) else {
            return;
        };
        if let Err(e) = bridge.unregister(model_id).await {
            warn!("[{}] {}", id, TunnelError::from(e));
        }
    }

    /// Every registered tunnel, with author and tags from the saved records
    pub async fn list(&self) -> Vec<TunnelConfig> {
        let snapshots = self.registry.list();
        let Some(store) = &self.store else {
            return snapshots;
        };

        let records: HashMap<String, PersistedTunnel> = match store.list_all_tunnels().await {
            Ok(records) => records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            Err(e) => {
                warn!("{}", TunnelError::from(e));
                return snapshots;
            }
        };

        snapshots
            .into_iter()
            .map(|config| {
                let record = records.get(&config.id);
                merge_descriptive(config, record)
            })
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<TunnelConfig> {
        let config = self.registry.get(id)?;
        let Some(store) = &self.store else {
            return Some(config);
        };
        match store.get_tunnel(id).await {
            Ok(record) => Some(merge_descriptive(config, record.as_ref())),
            Err(e) => {
                warn!("[{}] {}", id, TunnelError::from(e));
                Some(config)
            }
        }
    }

    /// Replace author and/or tags on the saved record
    pub async fn update_metadata(
        &self,
        id: &str,
        author: Option<String>,
        tags: Option<Vec<String>>,
    ) -> TunnelResult {
        let Some(store) = &self.store else {
            return TunnelResult::failure(&TunnelError::Persistence(
                "no record store configured".into(),
            ));
        };

        match store.update_descriptive(id, author, tags).await {
            Ok(true) => TunnelResult {
                success: true,
                message: "Tunnel metadata updated".to_string(),
                config: self.get(id).await,
            },
            Ok(false) => TunnelResult::failure(&TunnelError::NotFound(id.to_string())),
            Err(e) => TunnelResult::failure(&TunnelError::from(e)),
        }
    }

    /// Re-establish every saved tunnel
    pub async fn restore_saved(&self) -> RestoreReport {
        let Some(store) = &self.store else {
            return RestoreReport::default();
        };
        RestorationCoordinator::new(self.supervisor.clone(), store.clone(), self.restore_policy)
            .restore_all()
            .await
    }

    /// Current status of a registered tunnel
    pub fn status(&self, id: &str) -> Option<TunnelStatus> {
        self.registry.get(id).map(|config| config.status)
    }

    pub fn summary(&self) -> TunnelSummary {
        let mut summary = TunnelSummary::default();
        for config in self.registry.list() {
            summary.total += 1;
            match config.status {
                TunnelStatus::Active => summary.active += 1,
                TunnelStatus::Inactive => summary.inactive += 1,
                TunnelStatus::Error => summary.error += 1,
            }
        }
        summary
    }

    /// Close every forward. Saved records stay so the next start restores them.
    pub async fn shutdown(&self) {
        let removed = self.registry.drain(self.max_attempts());
        info!("Closing {} tunnel(s)", removed.len());
        for forward in removed {
            if let Some(handle) = forward.handle {
                handle.close().await;
            }
        }
    }
}

fn merge_descriptive(mut config: TunnelConfig, record: Option<&PersistedTunnel>) -> TunnelConfig {
    if let Some(record) = record {
        config.author = record.author.clone();
        config.tags = record.tags.clone();
    }
    config
}
