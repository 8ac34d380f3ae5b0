//! Port Forwarding Module
//!
//! Local listeners relayed through an SSH session, plus the readiness probe
//! used before a forward is reported as usable.

mod local;
pub mod probe;

pub use local::{
    start_local_forward, ForwardStats, ForwardStream, LocalForward, LocalForwardHandle,
    RemoteDialer,
};
pub use probe::{check_port, probe_target, wait_until_ready, ProbeOutcome, ProbeSettings};
