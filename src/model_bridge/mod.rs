//! Model gateway registration
//!
//! A tunnel that fronts an OpenAI-compatible server can register itself with a
//! model gateway. Registration is best-effort: a gateway failure never fails
//! the tunnel operation that triggered it.

mod litellm;

use async_trait::async_trait;
use thiserror::Error;

pub use litellm::LiteLlmBridge;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ModelBridge: Send + Sync {
    /// Register `model_name` served at `api_base`; returns the gateway's model id
    async fn register(
        &self,
        model_name: &str,
        api_base: &str,
        api_key: Option<&str>,
    ) -> Result<String, BridgeError>;

    async fn unregister(&self, model_id: &str) -> Result<(), BridgeError>;

    /// Whether the gateway answers its health endpoint
    async fn healthcheck(&self) -> bool;
}
