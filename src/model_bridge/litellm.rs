//! LiteLLM proxy client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{BridgeError, ModelBridge};

/// Key sent when the upstream server needs none
const PLACEHOLDER_API_KEY: &str = "dummy";

pub struct LiteLlmBridge {
    base_url: String,
    master_key: String,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewModelResponse {
    model_info: Option<ModelInfo>,
    model_name: Option<String>,
}

impl LiteLlmBridge {
    pub fn new(
        base_url: impl Into<String>,
        master_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            master_key: master_key.into(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, BridgeError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.master_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Rejected { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelBridge for LiteLlmBridge {
    async fn register(
        &self,
        model_name: &str,
        api_base: &str,
        api_key: Option<&str>,
    ) -> Result<String, BridgeError> {
        let body = json!({
            "model_name": model_name,
            "litellm_params": {
                "model": format!("openai/{}", model_name),
                "api_base": api_base,
                "api_key": api_key.filter(|k| !k.is_empty()).unwrap_or(PLACEHOLDER_API_KEY),
            }
        });

        let response: NewModelResponse = self.post("/model/new", body).await?.json().await?;
        let model_id = response
            .model_info
            .and_then(|info| info.id)
            .or(response.model_name)
            .ok_or_else(|| BridgeError::InvalidResponse("no model id in response".into()))?;

        info!("Registered model {} ({}) at {}", model_name, model_id, api_base);
        Ok(model_id)
    }

    async fn unregister(&self, model_id: &str) -> Result<(), BridgeError> {
        self.post("/model/delete", json!({ "id": model_id })).await?;
        info!("Unregistered model {}", model_id);
        Ok(())
    }

    async fn healthcheck(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http_client
            .get(&url)
            .bearer_auth(&self.master_key)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Model gateway health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Gateway {
        requests: Mutex<Vec<(String, serde_json::Value)>>,
    }

    async fn new_model(
        State(gw): State<Arc<Gateway>>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
        }
        gw.requests.lock().push(("new".into(), body));
        (
            StatusCode::OK,
            Json(json!({"model_name": "llama", "model_info": {"id": "model-123"}})),
        )
    }

    async fn delete_model(
        State(gw): State<Arc<Gateway>>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        gw.requests.lock().push(("delete".into(), body));
        StatusCode::OK
    }

    async fn spawn_gateway() -> (String, Arc<Gateway>) {
        let gw = Arc::new(Gateway::default());
        let app = Router::new()
            .route("/model/new", post(new_model))
            .route("/model/delete", post(delete_model))
            .route("/health", get(|| async { "ok" }))
            .with_state(gw.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), gw)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let (url, gw) = spawn_gateway().await;
        let bridge = LiteLlmBridge::new(url, "sk-test", Duration::from_secs(5)).unwrap();

        let id = bridge
            .register("llama", "http://127.0.0.1:18000/v1", None)
            .await
            .unwrap();
        assert_eq!(id, "model-123");
        bridge.unregister(&id).await.unwrap();
        assert!(bridge.healthcheck().await);

        let requests = gw.requests.lock();
        let (_, body) = &requests[0];
        assert_eq!(body["model_name"], "llama");
        assert_eq!(body["litellm_params"]["model"], "openai/llama");
        assert_eq!(body["litellm_params"]["api_base"], "http://127.0.0.1:18000/v1");
        assert_eq!(body["litellm_params"]["api_key"], "dummy");
        assert_eq!(requests[1].1["id"], "model-123");
    }

    #[tokio::test]
    async fn test_rejected_registration() {
        let (url, _gw) = spawn_gateway().await;
        let bridge = LiteLlmBridge::new(url, "sk-wrong", Duration::from_secs(5)).unwrap();

        let err = bridge
            .register("llama", "http://127.0.0.1:18000/v1", Some("k"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Rejected { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_unhealthy() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let bridge =
            LiteLlmBridge::new(format!("http://{}", addr), "sk", Duration::from_secs(1)).unwrap();
        assert!(!bridge.healthcheck().await);
    }
}
