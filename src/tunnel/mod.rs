//! Tunnel lifecycle
//!
//! A tunnel is one SSH local port forward with an identity, a supervision
//! state and an optional durable record.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   ┌─────────────────┐   ┌─────────────────────┐
//! │ TunnelManager │──▶│ TunnelRegistry  │◀──│ ReconnectSupervisor │
//! └──────┬────────┘   └─────────────────┘   └──────────┬──────────┘
//!        │                                             │
//!        ▼                                             ▼
//! ┌─────────────────────┐                  ┌──────────────────────┐
//! │ RestorationCoord.   │─────────────────▶│ ConnectionEstablisher│
//! └─────────────────────┘                  └──────────────────────┘
//! ```

mod error;
mod establisher;
mod manager;
mod registry;
mod restore;
mod supervisor;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::TunnelError;
pub use establisher::{
    establish_isolated, ConnectionEstablisher, ForwardHandle, LiveForward, SshEstablisher,
};
pub use manager::{TunnelManager, TunnelSummary};
pub use registry::{RemovedForward, TunnelRegistry};
pub use restore::{RestorationCoordinator, RestorePolicy, RestoreReport};
pub use supervisor::{
    transition, Effect, EventScope, ReconnectPolicy, ReconnectSupervisor, Supervision,
    SupervisorEvent, SupervisorPhase,
};
pub use types::{
    generate_tunnel_id, TunnelConfig, TunnelResult, TunnelStatus, DEFAULT_BIND_ADDRESS, MODEL_TAG,
};
