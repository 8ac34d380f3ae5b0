//! SSH module - sessions to jump hosts
//!
//! This module provides the SSH client side of a tunnel using the russh library.
//!
//! # Features
//! - Agent and identity-file authentication, tried in order
//! - Optional host key verification via ~/.ssh/known_hosts
//! - Single-owner session handle with disconnect notification

mod agent;
mod client;
mod config;
mod error;
mod handle_owner;

pub use agent::{is_agent_available, SshAgentClient};
pub use client::{ClientHandler, SshClient};
pub use config::{expand_home, AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
