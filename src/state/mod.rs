//! State persistence using redb + MessagePack (rmp-serde)
//! Holds the durable tunnel records used for restoration and list merging

pub mod store;
pub mod tunnels;

pub use store::{StateError, StateStore, STATE_DB_VERSION};
pub use tunnels::{PersistedTunnel, TunnelPersistence, TunnelStore};
