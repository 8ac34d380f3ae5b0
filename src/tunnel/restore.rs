//! Startup restoration of persisted tunnels

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::state::TunnelStore;

use super::establisher::establish_isolated;
use super::supervisor::{EventScope, ReconnectSupervisor, SupervisorEvent};
use super::types::{TunnelConfig, TunnelStatus};

/// Restoration timing
#[derive(Debug, Clone, Copy)]
pub struct RestorePolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Pause between consecutive records
    pub stagger: Duration,
}

impl Default for RestorePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            stagger: Duration::from_millis(500),
        }
    }
}

/// Summary of one restoration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub total: usize,
    pub restored: usize,
    pub failed: usize,
    /// Already registered when the pass reached them
    pub skipped: usize,
}

/// Re-establishes every persisted tunnel, one at a time
pub struct RestorationCoordinator {
    supervisor: ReconnectSupervisor,
    store: Arc<dyn TunnelStore>,
    policy: RestorePolicy,
}

impl RestorationCoordinator {
    pub fn new(
        supervisor: ReconnectSupervisor,
        store: Arc<dyn TunnelStore>,
        policy: RestorePolicy,
    ) -> Self {
        Self {
            supervisor,
            store,
            policy,
        }
    }

    pub async fn restore_all(&self) -> RestoreReport {
        let records = match self.store.list_all_tunnels().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to load saved tunnels: {}", e);
                return RestoreReport::default();
            }
        };

        let mut report = RestoreReport {
            total: records.len(),
            ..RestoreReport::default()
        };
        if records.is_empty() {
            return report;
        }
        info!("Restoring {} saved tunnel(s)", records.len());

        for (index, record) in records.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.policy.stagger).await;
            }

            let mut config = record.into_config();
            config.status = TunnelStatus::Inactive;
            let Some(instance) = self.supervisor.registry().register_pending(config.clone())
            else {
                info!("[{}] Already registered, skipping restore", config.id);
                report.skipped += 1;
                continue;
            };

            if self.restore_one(&config, instance).await {
                report.restored += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            "Restoration finished: {} restored, {} failed, {} skipped",
            report.restored, report.failed, report.skipped
        );
        report
    }

    async fn restore_one(&self, config: &TunnelConfig, instance: u64) -> bool {
        let id = config.id.as_str();

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.policy.retry_delay).await;
            }
            if self.supervisor.registry().instance(id) != Some(instance) {
                info!("[{}] Stopped during restoration", id);
                return false;
            }

            match establish_isolated(self.supervisor.establisher(), id, config).await {
                Ok(handle) => {
                    let installed = self.supervisor.install(id, instance, handle).await;
                    if installed {
                        info!("[{}] Restored {}", id, config.route());
                    }
                    return installed;
                }
                Err(e) => warn!(
                    "[{}] Restore attempt {}/{} failed: {}",
                    id, attempt, self.policy.max_attempts, e
                ),
            }
        }

        error!(
            "[{}] Could not restore after {} attempt(s)",
            id, self.policy.max_attempts
        );
        self.supervisor
            .dispatch(
                id,
                EventScope::Instance(instance),
                SupervisorEvent::RestorationFailed,
            )
            .await;
        false
    }
}
