//! Reconnection supervisor
//!
//! The per-tunnel lifecycle is a small state machine. [`transition`] is pure
//! so the policy can be tested without timers or sockets; [`ReconnectSupervisor`]
//! drives it, running the effects it returns.
//!
//! ```text
//!   Connected --lost--> Reconnecting --ok--> Connected
//!                          |   ^
//!                       fail   | (attempts < max)
//!                          v   |
//!                        (retry) --attempts == max--> Errored
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::state::TunnelStore;

use super::error::TunnelError;
use super::establisher::{establish_isolated, ConnectionEstablisher, ForwardHandle};
use super::registry::TunnelRegistry;
use super::types::TunnelStatus;

/// Reconnection timing
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Connected,
    Reconnecting,
    Errored,
}

impl SupervisorPhase {
    pub fn status(self) -> TunnelStatus {
        match self {
            SupervisorPhase::Connected => TunnelStatus::Active,
            SupervisorPhase::Reconnecting => TunnelStatus::Inactive,
            SupervisorPhase::Errored => TunnelStatus::Error,
        }
    }
}

/// Supervision state of one tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervision {
    pub phase: SupervisorPhase,
    /// Attempts used in the current reconnection cycle
    pub attempts: u32,
    /// An attempt is scheduled or running
    pub reconnecting: bool,
}

impl Supervision {
    pub fn connected() -> Self {
        Self {
            phase: SupervisorPhase::Connected,
            attempts: 0,
            reconnecting: false,
        }
    }

    /// Registered by restoration; the coordinator owns the attempts
    pub fn restoring() -> Self {
        Self {
            phase: SupervisorPhase::Reconnecting,
            attempts: 0,
            reconnecting: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The live forward closed on its own
    ConnectionLost,
    AttemptSucceeded,
    AttemptFailed,
    /// Restoration used up its own retries
    RestorationFailed,
}

/// Which registration an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventScope {
    /// A specific installed handle
    Generation(u64),
    /// A registration, whatever handle it holds
    Instance(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Persist(TunnelStatus),
    ScheduleAttempt { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

/// Next state and effects for `event`
pub fn transition(
    current: Supervision,
    event: SupervisorEvent,
    policy: &ReconnectPolicy,
) -> (Supervision, Vec<Effect>) {
    match event {
        SupervisorEvent::ConnectionLost => {
            if current.reconnecting || current.phase == SupervisorPhase::Errored {
                return (current, Vec::new());
            }
            begin_attempt(current, policy)
        }
        SupervisorEvent::AttemptSucceeded => {
            (Supervision::connected(), vec![Effect::Persist(TunnelStatus::Active)])
        }
        SupervisorEvent::AttemptFailed => begin_attempt(
            Supervision {
                reconnecting: false,
                ..current
            },
            policy,
        ),
        SupervisorEvent::RestorationFailed => give_up(current),
    }
}

fn begin_attempt(current: Supervision, policy: &ReconnectPolicy) -> (Supervision, Vec<Effect>) {
    if current.attempts >= policy.max_attempts {
        return give_up(current);
    }

    let attempt = current.attempts + 1;
    (
        Supervision {
            phase: SupervisorPhase::Reconnecting,
            attempts: attempt,
            reconnecting: true,
        },
        vec![
            Effect::Persist(TunnelStatus::Inactive),
            Effect::ScheduleAttempt {
                attempt,
                delay: policy.delay,
            },
        ],
    )
}

fn give_up(current: Supervision) -> (Supervision, Vec<Effect>) {
    (
        Supervision {
            phase: SupervisorPhase::Errored,
            attempts: current.attempts,
            reconnecting: false,
        },
        vec![
            Effect::Persist(TunnelStatus::Error),
            Effect::GiveUp {
                attempts: current.attempts,
            },
        ],
    )
}

type AttemptTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Drives the state machine for every registered tunnel
#[derive(Clone)]
pub struct ReconnectSupervisor {
    registry: Arc<TunnelRegistry>,
    establisher: Arc<dyn ConnectionEstablisher>,
    store: Option<Arc<dyn TunnelStore>>,
    policy: ReconnectPolicy,
}

impl ReconnectSupervisor {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        establisher: Arc<dyn ConnectionEstablisher>,
        store: Option<Arc<dyn TunnelStore>>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            registry,
            establisher,
            store,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    pub fn establisher(&self) -> &Arc<dyn ConnectionEstablisher> {
        &self.establisher
    }

    /// Watch a freshly installed forward for closure
    pub fn watch(&self, id: String, generation: u64, mut closed: watch::Receiver<bool>) {
        let this = self.clone();
        tokio::spawn(async move {
            if closed.wait_for(|done| *done).await.is_err() {
                // Sender dropped without signalling: the forward is gone too
                debug!("[{}] Closure signal dropped", id);
            }
            this.dispatch(
                &id,
                EventScope::Generation(generation),
                SupervisorEvent::ConnectionLost,
            )
            .await;
        });
    }

    /// Apply an event and run the resulting effects
    pub async fn dispatch(&self, id: &str, scope: EventScope, event: SupervisorEvent) {
        let Some((effects, released)) = self.registry.apply(id, scope, event, &self.policy)
        else {
            debug!("[{}] Ignoring {:?} (stopped or superseded)", id, event);
            return;
        };

        if let Some(dead) = released {
            warn!("[{}] SSH forward closed unexpectedly", id);
            dead.close().await;
        }

        for effect in effects {
            match effect {
                Effect::Persist(status) => persist_status(self.store.as_deref(), id, status).await,
                Effect::ScheduleAttempt { attempt, delay } => {
                    let Some(instance) = self.registry.instance(id) else {
                        continue;
                    };
                    info!(
                        "[{}] Reconnect attempt {}/{} in {:?}",
                        id, attempt, self.policy.max_attempts, delay
                    );
                    tokio::spawn(self.clone().attempt(id.to_string(), instance, delay));
                }
                Effect::GiveUp { attempts } => {
                    error!("[{}] {}", id, TunnelError::ExhaustedRetries { attempts });
                }
            }
        }
    }

    fn attempt(self, id: String, instance: u64, delay: Duration) -> AttemptTask {
        Box::pin(async move {
            tokio::time::sleep(delay).await;

            let config = match self.registry.get(&id) {
                Some(config) if self.registry.instance(&id) == Some(instance) => config,
                _ => {
                    info!("[{}] Stopped while waiting to reconnect", id);
                    return;
                }
            };

            match establish_isolated(&self.establisher, &id, &config).await {
                Ok(handle) => {
                    self.install(&id, instance, handle).await;
                }
                Err(e) => {
                    warn!("[{}] Reconnect failed: {}", id, e);
                    self.dispatch(
                        &id,
                        EventScope::Instance(instance),
                        SupervisorEvent::AttemptFailed,
                    )
                    .await;
                }
            }
        })
    }

    /// Attach a newly established forward to registration `instance`, mark it
    /// connected and start watching it. Closes the forward and returns `false`
    /// when the tunnel was stopped or replaced during establishment.
    pub async fn install(&self, id: &str, instance: u64, handle: ForwardHandle) -> bool {
        let closed = handle.closed();
        match self.registry.install_if_present(id, instance, handle).await {
            Ok(generation) => {
                info!("[{}] SSH forward re-established", id);
                self.dispatch(
                    id,
                    EventScope::Generation(generation),
                    SupervisorEvent::AttemptSucceeded,
                )
                .await;
                self.watch(id.to_string(), generation, closed);
                true
            }
            Err(orphan) => {
                info!("[{}] Stopped during establishment, discarding forward", id);
                orphan.close().await;
                false
            }
        }
    }
}

/// Best-effort status write; failures are logged only
pub async fn persist_status(store: Option<&dyn TunnelStore>, id: &str, status: TunnelStatus) {
    let Some(store) = store else {
        return;
    };
    if let Err(e) = store.update_status(id, status).await {
        warn!("[{}] {}", id, TunnelError::from(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(10),
        }
    }

    fn schedules(effects: &[Effect]) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, Effect::ScheduleAttempt { .. }))
    }

    #[test]
    fn test_loss_schedules_first_attempt() {
        let (next, effects) = transition(
            Supervision::connected(),
            SupervisorEvent::ConnectionLost,
            &policy(),
        );
        assert_eq!(next.phase, SupervisorPhase::Reconnecting);
        assert_eq!(next.attempts, 1);
        assert!(next.reconnecting);
        assert_eq!(effects[0], Effect::Persist(TunnelStatus::Inactive));
        assert!(schedules(&effects));
    }

    #[test]
    fn test_loss_while_reconnecting_is_ignored() {
        let busy = Supervision {
            phase: SupervisorPhase::Reconnecting,
            attempts: 2,
            reconnecting: true,
        };
        let (next, effects) = transition(busy, SupervisorEvent::ConnectionLost, &policy());
        assert_eq!(next, busy);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_exactly_max_attempts_before_error() {
        let policy = policy();
        let (mut state, mut effects) = transition(
            Supervision::connected(),
            SupervisorEvent::ConnectionLost,
            &policy,
        );
        let mut scheduled = 0;
        while schedules(&effects) {
            scheduled += 1;
            let (next, next_effects) = transition(state, SupervisorEvent::AttemptFailed, &policy);
            state = next;
            effects = next_effects;
        }

        assert_eq!(scheduled, 5);
        assert_eq!(state.phase, SupervisorPhase::Errored);
        assert!(effects.contains(&Effect::Persist(TunnelStatus::Error)));
        assert!(effects.contains(&Effect::GiveUp { attempts: 5 }));
    }

    #[test]
    fn test_success_resets_counter() {
        let mid = Supervision {
            phase: SupervisorPhase::Reconnecting,
            attempts: 3,
            reconnecting: true,
        };
        let (next, effects) = transition(mid, SupervisorEvent::AttemptSucceeded, &policy());
        assert_eq!(next, Supervision::connected());
        assert_eq!(effects, vec![Effect::Persist(TunnelStatus::Active)]);

        // A later loss starts a fresh cycle
        let (next, _) = transition(next, SupervisorEvent::ConnectionLost, &policy());
        assert_eq!(next.attempts, 1);
    }

    #[test]
    fn test_errored_stays_errored() {
        let (errored, _) = transition(
            Supervision::restoring(),
            SupervisorEvent::RestorationFailed,
            &policy(),
        );
        assert_eq!(errored.phase, SupervisorPhase::Errored);
        assert_eq!(errored.phase.status(), TunnelStatus::Error);

        let (next, effects) = transition(errored, SupervisorEvent::ConnectionLost, &policy());
        assert_eq!(next, errored);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_stopped_tunnel_cannot_schedule() {
        // What the registry pins on removal
        let pinned = Supervision {
            phase: SupervisorPhase::Connected,
            attempts: 5,
            reconnecting: true,
        };
        let (_, effects) = transition(pinned, SupervisorEvent::ConnectionLost, &policy());
        assert!(!schedules(&effects));
    }
}
