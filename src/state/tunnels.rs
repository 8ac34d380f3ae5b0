//! Durable tunnel records

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tunnel::{TunnelConfig, TunnelStatus};

use super::store::{StateError, StateStore};

/// A tunnel as written to the state database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTunnel {
    pub id: String,
    pub name: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_port: u16,
    pub local_bind_address: String,
    pub ssh_user: String,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub status: TunnelStatus,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub model_registration_enabled: bool,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub model_api_base: Option<String>,
    /// Unix millis
    pub created_at: i64,
    /// Unix millis
    pub updated_at: i64,
}

impl PersistedTunnel {
    pub fn from_config(config: &TunnelConfig) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            local_port: config.local_port,
            local_bind_address: config.local_bind_address.clone(),
            ssh_user: config.ssh_user.clone(),
            ssh_host: config.ssh_host.clone(),
            ssh_port: config.ssh_port,
            status: config.status,
            author: config.author.clone(),
            tags: config.tags.clone(),
            model_registration_enabled: config.model_registration_enabled,
            model_name: config.model_name.clone(),
            model_id: config.model_id.clone(),
            model_api_base: config.model_api_base.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn into_config(self) -> TunnelConfig {
        TunnelConfig {
            id: self.id,
            name: self.name,
            remote_host: self.remote_host,
            remote_port: self.remote_port,
            local_port: self.local_port,
            local_bind_address: self.local_bind_address,
            ssh_user: self.ssh_user,
            ssh_host: self.ssh_host,
            ssh_port: self.ssh_port,
            status: self.status,
            author: self.author,
            tags: self.tags,
            model_registration_enabled: self.model_registration_enabled,
            model_name: self.model_name,
            model_api_key: None,
            model_id: self.model_id,
            model_api_base: self.model_api_base,
        }
    }
}

/// Durable record store used by the tunnel manager
#[async_trait]
pub trait TunnelStore: Send + Sync {
    /// Insert or replace a record, keeping the original `created_at`
    async fn upsert_tunnel(&self, record: PersistedTunnel) -> Result<(), StateError>;

    /// Returns `false` when no record exists
    async fn update_status(&self, id: &str, status: TunnelStatus) -> Result<bool, StateError>;

    /// Replace author and/or tags. Returns `false` when no record exists.
    async fn update_descriptive(
        &self,
        id: &str,
        author: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<bool, StateError>;

    /// Returns `false` when no record existed
    async fn delete_tunnel(&self, id: &str) -> Result<bool, StateError>;

    async fn get_tunnel(&self, id: &str) -> Result<Option<PersistedTunnel>, StateError>;

    /// All records, oldest first
    async fn list_all_tunnels(&self) -> Result<Vec<PersistedTunnel>, StateError>;
}

/// [`TunnelStore`] over the redb state database
#[derive(Clone)]
pub struct TunnelPersistence {
    store: Arc<StateStore>,
}

impl TunnelPersistence {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    fn upsert_blocking(store: &StateStore, mut record: PersistedTunnel) -> Result<(), StateError> {
        if let Some(existing) = store.get(&record.id)? {
            let existing: PersistedTunnel = rmp_serde::from_slice(&existing)?;
            record.created_at = existing.created_at;
        }
        let bytes = rmp_serde::to_vec_named(&record)?;
        store.put(&record.id, &bytes)?;
        debug!("Persisted tunnel {}", record.id);
        Ok(())
    }

    fn modify_blocking<F>(store: &StateStore, id: &str, modify: F) -> Result<bool, StateError>
    where
        F: FnOnce(&mut PersistedTunnel),
    {
        store.update(id, |bytes| {
            let mut record: PersistedTunnel = rmp_serde::from_slice(bytes)?;
            modify(&mut record);
            record.updated_at = chrono::Utc::now().timestamp_millis();
            Ok(Some(rmp_serde::to_vec_named(&record)?))
        })
    }

    fn list_blocking(store: &StateStore) -> Result<Vec<PersistedTunnel>, StateError> {
        let mut records = store
            .scan()?
            .into_iter()
            .map(|(_, bytes)| rmp_serde::from_slice::<PersistedTunnel>(&bytes))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: FnOnce(&StateStore) -> Result<T, StateError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }
}

#[async_trait]
impl TunnelStore for TunnelPersistence {
    async fn upsert_tunnel(&self, record: PersistedTunnel) -> Result<(), StateError> {
        self.blocking(move |store| Self::upsert_blocking(store, record))
            .await
    }

    async fn update_status(&self, id: &str, status: TunnelStatus) -> Result<bool, StateError> {
        let id = id.to_string();
        self.blocking(move |store| {
            Self::modify_blocking(store, &id, |record| record.status = status)
        })
        .await
    }

    async fn update_descriptive(
        &self,
        id: &str,
        author: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<bool, StateError> {
        let id = id.to_string();
        self.blocking(move |store| {
            Self::modify_blocking(store, &id, |record| {
                if let Some(author) = author {
                    record.author = Some(author).filter(|a| !a.is_empty());
                }
                if let Some(tags) = tags {
                    record.tags = tags;
                }
            })
        })
        .await
    }

    async fn delete_tunnel(&self, id: &str) -> Result<bool, StateError> {
        let id = id.to_string();
        self.blocking(move |store| store.delete(&id)).await
    }

    async fn get_tunnel(&self, id: &str) -> Result<Option<PersistedTunnel>, StateError> {
        let id = id.to_string();
        self.blocking(move |store| {
            store
                .get(&id)?
                .map(|bytes| rmp_serde::from_slice::<PersistedTunnel>(&bytes))
                .transpose()
                .map_err(StateError::from)
        })
        .await
    }

    async fn list_all_tunnels(&self) -> Result<Vec<PersistedTunnel>, StateError> {
        self.blocking(Self::list_blocking).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn persistence() -> (TempDir, TunnelPersistence) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.redb")).unwrap();
        (dir, TunnelPersistence::new(Arc::new(store)))
    }

    fn record(id: &str) -> PersistedTunnel {
        let config = TunnelConfig::new("db", "db.internal", 5432, 15432, "ops", "bastion")
            .with_id(id);
        PersistedTunnel::from_config(&config)
    }

    #[tokio::test]
    async fn test_upsert_preserves_created_at() {
        let (_dir, store) = persistence();
        let mut first = record("fwd_a");
        first.created_at = 1000;
        store.upsert_tunnel(first).await.unwrap();

        let mut second = record("fwd_a");
        second.name = "renamed".into();
        store.upsert_tunnel(second).await.unwrap();

        let loaded = store.get_tunnel("fwd_a").await.unwrap().unwrap();
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.created_at, 1000);
    }

    #[tokio::test]
    async fn test_update_status_and_descriptive() {
        let (_dir, store) = persistence();
        store.upsert_tunnel(record("fwd_a")).await.unwrap();

        assert!(store.update_status("fwd_a", TunnelStatus::Error).await.unwrap());
        assert!(!store.update_status("fwd_missing", TunnelStatus::Error).await.unwrap());

        assert!(store
            .update_descriptive("fwd_a", Some("alice".into()), None)
            .await
            .unwrap());
        assert!(store
            .update_descriptive("fwd_a", None, Some(vec!["prod".into()]))
            .await
            .unwrap());

        let loaded = store.get_tunnel("fwd_a").await.unwrap().unwrap();
        assert_eq!(loaded.status, TunnelStatus::Error);
        assert_eq!(loaded.author.as_deref(), Some("alice"));
        assert_eq!(loaded.tags, vec!["prod".to_string()]);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let (_dir, store) = persistence();
        for (id, created) in [("fwd_c", 3), ("fwd_a", 1), ("fwd_b", 2)] {
            let mut r = record(id);
            r.created_at = created;
            store.upsert_tunnel(r).await.unwrap();
        }
        let ids: Vec<String> = store
            .list_all_tunnels()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["fwd_a", "fwd_b", "fwd_c"]);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, store) = persistence();
        store.upsert_tunnel(record("fwd_a")).await.unwrap();
        assert!(store.delete_tunnel("fwd_a").await.unwrap());
        assert!(!store.delete_tunnel("fwd_a").await.unwrap());
        assert!(store.get_tunnel("fwd_a").await.unwrap().is_none());
    }

    #[test]
    fn test_record_never_keeps_api_key() {
        let config = TunnelConfig::new("llm", "gpu", 8000, 18000, "ops", "bastion")
            .with_model("llama", Some("secret".into()));
        let back = PersistedTunnel::from_config(&config).into_config();
        assert!(back.model_api_key.is_none());
        assert_eq!(back.model_name.as_deref(), Some("llama"));
    }
}
