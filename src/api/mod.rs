//! HTTP API
//!
//! JSON endpoints over the tunnel manager:
//! - `GET    /api/ssh-forward`               list
//! - `POST   /api/ssh-forward`               create or replace
//! - `DELETE /api/ssh-forward`               stop (`{"id": ...}`)
//! - `GET    /api/ssh-forward/{id}`          single tunnel
//! - `PATCH  /api/ssh-forward/{id}/metadata` author/tags
//! - `GET    /api/health`

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, patch},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::tunnel::TunnelManager;

/// Application state shared across handlers
pub struct AppState {
    pub manager: TunnelManager,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/api/ssh-forward",
            get(handlers::list_forwards)
                .post(handlers::create_forward)
                .delete(handlers::stop_forward),
        )
        .route("/api/ssh-forward/{id}", get(handlers::get_forward))
        .route(
            "/api/ssh-forward/{id}/metadata",
            patch(handlers::update_metadata),
        )
        .route("/api/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `addr` until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, state: Arc<AppState>, shutdown: F) -> std::io::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StateStore, TunnelPersistence, TunnelStore};
    use crate::tunnel::testing::FakeEstablisher;
    use crate::tunnel::{ReconnectPolicy, RestorePolicy};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app() -> (Router, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = StateStore::new(dir.path().join("state.redb")).unwrap();
        let store: Arc<dyn TunnelStore> = Arc::new(TunnelPersistence::new(Arc::new(state)));
        let manager = TunnelManager::new(
            FakeEstablisher::new(),
            Some(store),
            None,
            ReconnectPolicy::default(),
            RestorePolicy::default(),
        );
        (router(Arc::new(AppState { manager })), dir)
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn db_forward() -> Value {
        json!({
            "id": "fwd_db",
            "name": "db",
            "remoteHost": "db.internal",
            "remotePort": 5432,
            "localPort": 15432,
            "sshHost": "bastion",
            "sshUser": "ops",
            "sshPort": 22
        })
    }

    #[tokio::test]
    async fn test_create_list_get_stop() {
        let (app, _dir) = app();

        let (status, body) = call(&app, Method::POST, "/api/ssh-forward", Some(db_forward())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["config"]["status"], "active");

        let (status, body) = call(&app, Method::GET, "/api/ssh-forward", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["forwards"].as_array().unwrap().len(), 1);
        assert_eq!(body["forwards"][0]["localPort"], 15432);

        let (status, body) = call(&app, Method::GET, "/api/ssh-forward/fwd_db", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["remoteHost"], "db.internal");

        let (status, body) = call(
            &app,
            Method::DELETE,
            "/api/ssh-forward",
            Some(json!({"id": "fwd_db"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (status, _) = call(&app, Method::GET, "/api/ssh-forward/fwd_db", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_failures_are_bad_requests() {
        let (app, _dir) = app();

        let mut invalid = db_forward();
        invalid["remoteHost"] = json!("");
        let (status, body) = call(&app, Method::POST, "/api/ssh-forward", Some(invalid)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (status, body) = call(
            &app,
            Method::DELETE,
            "/api/ssh-forward",
            Some(json!({"id": "fwd_missing"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_metadata_patch_shows_in_list() {
        let (app, _dir) = app();
        call(&app, Method::POST, "/api/ssh-forward", Some(db_forward())).await;

        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/ssh-forward/fwd_db/metadata",
            Some(json!({"author": "alice", "tags": ["prod"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, Method::GET, "/api/ssh-forward", None).await;
        assert_eq!(body["forwards"][0]["author"], "alice");
        assert_eq!(body["forwards"][0]["tags"], json!(["prod"]));
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = app();
        call(&app, Method::POST, "/api/ssh-forward", Some(db_forward())).await;

        let (status, body) = call(&app, Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tunnels"], 1);
        assert_eq!(body["active"], 1);
        assert_eq!(body["modelBridge"], false);
    }
}
