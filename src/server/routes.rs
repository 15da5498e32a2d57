// src/server/routes.rs
//! Axum router for the repository server
//!
//! One JSON route per call: `POST /rpc/:method` with a body of
//! `{ "protocol": n, "auth": {...}, "params": {...} }`. Replies carry either
//! `result` or `fault`. The engine blocks on SQLite, so calls run on the
//! blocking pool.
//!
//! Manifests and uncached change sets named in a successful reply live in
//! the scratch directory until the file server that streams them deletes
//! them. Files of failed calls are already gone.

use crate::auth::AuthToken;
use crate::error::Error;
use crate::server::RepositoryServer;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Body of an RPC request
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    pub protocol: u32,
    #[serde(default)]
    pub auth: AuthToken,
    #[serde(default)]
    pub params: Value,
}

/// Create the main application router
pub fn create_router(server: Arc<RepositoryServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/rpc/:method", post(rpc))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(server)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

async fn rpc(
    State(server): State<Arc<RepositoryServer>>,
    Path(method): Path<String>,
    Json(request): Json<RpcRequest>,
) -> (StatusCode, Json<Value>) {
    let joined = tokio::task::spawn_blocking(move || {
        server.call(&method, &request.auth, request.protocol, request.params)
    })
    .await;

    match joined {
        Ok(Ok(result)) => (StatusCode::OK, Json(json!({ "result": result }))),
        Ok(Err(e)) => (StatusCode::OK, Json(json!({ "fault": e.fault() }))),
        Err(e) => {
            tracing::error!("Call worker failed: {}", e);
            let fault = Error::Io(std::io::Error::other("call aborted")).fault();
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "fault": fault })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{MAX_PROTOCOL, ServerConfig};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let server = RepositoryServer::open(ServerConfig::rooted(dir.path())).unwrap();
        (dir, create_router(Arc::new(server)))
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> Value {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, app) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rpc_result() {
        let (_dir, app) = app();
        let reply = post_json(app, "/rpc/checkVersion", json!({ "protocol": MAX_PROTOCOL })).await;
        assert!(reply["result"].is_array());
    }

    #[tokio::test]
    async fn test_rpc_fault() {
        let (_dir, app) = app();
        let reply = post_json(app, "/rpc/checkVersion", json!({ "protocol": 1 })).await;
        assert_eq!(reply["fault"]["kind"], "InvalidClientVersion");
    }
}
