//! Live tunnel registry
//!
//! One entry per tunnel id. Each entry sits behind its own lock so the
//! request path, reconnection tasks and restoration never contend on a
//! global map lock. Locks are never held across an await: handles that need
//! closing are taken out first and closed afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::establisher::ForwardHandle;
use super::supervisor::{
    transition, Effect, EventScope, ReconnectPolicy, Supervision, SupervisorEvent,
};
use super::types::TunnelConfig;

struct ActiveForward {
    config: TunnelConfig,
    handle: Option<ForwardHandle>,
    supervision: Supervision,
    /// Bumped on every handle install; closure events carry the value they
    /// were subscribed under so late events from a replaced handle are dropped.
    generation: u64,
    /// Identifies this registration; a same-id replacement gets a new one.
    /// Also the listing order.
    instance: u64,
    /// Set when the entry leaves the map; blocks late installs
    removed: bool,
}

/// What `remove` hands back to the caller
pub struct RemovedForward {
    pub config: TunnelConfig,
    pub handle: Option<ForwardHandle>,
}

#[derive(Default)]
pub struct TunnelRegistry {
    entries: DashMap<String, Arc<Mutex<ActiveForward>>>,
    sequence: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn entry(&self, id: &str) -> Option<Arc<Mutex<ActiveForward>>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Insert or replace the entry for `config.id` with a freshly established
    /// handle. A replaced handle is closed. Returns the new generation.
    pub async fn upsert(&self, config: TunnelConfig, handle: ForwardHandle) -> u64 {
        let generation = self.next_sequence();
        let id = config.id.clone();

        let replaced = match self.entries.entry(id) {
            Entry::Occupied(occupied) => {
                let mut fwd = occupied.get().lock();
                fwd.config = config;
                fwd.supervision = Supervision::connected();
                fwd.generation = generation;
                fwd.handle.replace(handle)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(ActiveForward {
                    config,
                    handle: Some(handle),
                    supervision: Supervision::connected(),
                    generation,
                    instance: generation,
                    removed: false,
                })));
                None
            }
        };

        if let Some(old) = replaced {
            old.close().await;
        }
        generation
    }

    /// Register a tunnel that has no live forward yet (restoration).
    /// Returns the new instance, or `None` when the id is already registered.
    pub fn register_pending(&self, config: TunnelConfig) -> Option<u64> {
        match self.entries.entry(config.id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let instance = self.next_sequence();
                vacant.insert(Arc::new(Mutex::new(ActiveForward {
                    config,
                    handle: None,
                    supervision: Supervision::restoring(),
                    generation: instance,
                    instance,
                    removed: false,
                })));
                Some(instance)
            }
        }
    }

    /// Attach a new handle to the registration `instance` of `id`.
    ///
    /// Returns the new generation, or hands the handle back when that
    /// registration was stopped or replaced in the meantime so the caller can
    /// close it.
    pub async fn install_if_present(
        &self,
        id: &str,
        instance: u64,
        handle: ForwardHandle,
    ) -> Result<u64, ForwardHandle> {
        let Some(entry) = self.entry(id) else {
            return Err(handle);
        };

        let generation = self.next_sequence();
        let replaced = {
            let mut fwd = entry.lock();
            if fwd.removed || fwd.instance != instance {
                return Err(handle);
            }
            fwd.generation = generation;
            fwd.handle.replace(handle)
        };

        if let Some(old) = replaced {
            old.close().await;
        }
        Ok(generation)
    }

    /// Deregister a tunnel. The supervision state is pinned to "exhausted and
    /// busy" first so no in-flight watcher or attempt can schedule more work.
    /// The caller closes the returned handle.
    pub fn remove(&self, id: &str, max_attempts: u32) -> Option<RemovedForward> {
        let (_, entry) = self.entries.remove(id)?;
        let mut fwd = entry.lock();
        fwd.removed = true;
        fwd.supervision.attempts = max_attempts;
        fwd.supervision.reconnecting = true;
        Some(RemovedForward {
            config: fwd.config.clone(),
            handle: fwd.handle.take(),
        })
    }

    /// Deregister everything (service shutdown)
    pub fn drain(&self, max_attempts: u32) -> Vec<RemovedForward> {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.remove(id, max_attempts))
            .collect()
    }

    /// Feed an event into a tunnel's state machine.
    ///
    /// The event is dropped (`None`) when the entry is gone or `scope` no
    /// longer matches it. A connection loss also releases the dead handle,
    /// which the caller closes.
    pub fn apply(
        &self,
        id: &str,
        scope: EventScope,
        event: SupervisorEvent,
        policy: &ReconnectPolicy,
    ) -> Option<(Vec<Effect>, Option<ForwardHandle>)> {
        let entry = self.entry(id)?;
        let mut fwd = entry.lock();
        let current = match scope {
            EventScope::Generation(generation) => fwd.generation == generation,
            EventScope::Instance(instance) => fwd.instance == instance,
        };
        if fwd.removed || !current {
            return None;
        }

        let (next, effects) = transition(fwd.supervision, event, policy);
        fwd.supervision = next;
        fwd.config.status = next.phase.status();
        let released = match event {
            SupervisorEvent::ConnectionLost => fwd.handle.take(),
            _ => None,
        };
        Some((effects, released))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Current registration instance of `id`
    pub fn instance(&self, id: &str) -> Option<u64> {
        self.entry(id).map(|e| e.lock().instance)
    }

    pub fn get(&self, id: &str) -> Option<TunnelConfig> {
        self.entry(id).map(|e| e.lock().config.clone())
    }

    pub fn supervision(&self, id: &str) -> Option<Supervision> {
        self.entry(id).map(|e| e.lock().supervision)
    }

    /// Snapshot of every registered tunnel, in registration order
    pub fn list(&self) -> Vec<TunnelConfig> {
        let mut snapshot: Vec<(u64, TunnelConfig)> = self
            .entries
            .iter()
            .map(|e| {
                let fwd = e.value().lock();
                (fwd.instance, fwd.config.clone())
            })
            .collect();
        snapshot.sort_by_key(|(instance, _)| *instance);
        snapshot.into_iter().map(|(_, config)| config).collect()
    }

    /// Id of another tunnel that currently holds a live forward on `local_port`
    pub fn port_holder(&self, local_port: u16, except_id: &str) -> Option<String> {
        self.entries.iter().find_map(|e| {
            if e.key() == except_id {
                return None;
            }
            let fwd = e.value().lock();
            (fwd.handle.is_some() && fwd.config.local_port == local_port).then(|| e.key().clone())
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
