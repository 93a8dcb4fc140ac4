//! HTTP API for a storage node
//!
//! Client-facing:
//! - `POST /put`, `POST /get`
//!
//! Peer and control-plane facing:
//! - `POST /replicate` (synchronous copy)
//! - `POST /replicate/async` (async channel delivery)
//! - `POST /cluster/membership` (versioned snapshot push)
//!
//! Operational: `GET /status`, `GET /health`, `GET /metrics`

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, Result, METRICS};
use crate::node::membership::MembershipSnapshot;
use crate::node::reconcile::ReconcileHandle;
use crate::node::server::NodeContext;
use crate::node::transport::{AsyncPayload, ReplicateRequest};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct NodeHttpState {
    pub ctx: Arc<NodeContext>,
    /// Absent when no reconcile worker runs (tests)
    pub reconcile: Option<ReconcileHandle>,
}

#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

pub fn create_router(state: NodeHttpState) -> Router {
    Router::new()
        .route("/put", post(put_key))
        .route("/get", post(get_key))
        .route("/replicate", post(replicate))
        .route("/replicate/async", post(replicate_async))
        .route("/cluster/membership", post(cluster_membership))
        .route("/status", get(status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn put_key(
    State(state): State<NodeHttpState>,
    Json(req): Json<PutRequest>,
) -> Result<Json<Value>> {
    let topology = state.ctx.coordinator().write(&req.key, req.value).await?;
    Ok(Json(json!({
        "status": "ok",
        "key": req.key,
        "topology": topology,
    })))
}

async fn get_key(
    State(state): State<NodeHttpState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<Value>> {
    let record = state
        .ctx
        .coordinator()
        .read(&req.key)
        .ok_or_else(|| Error::NotFound(req.key.clone()))?;
    Ok(Json(json!({
        "key": record.key,
        "value": record.value,
        "role": record.role,
        "topology": record.topology,
    })))
}

async fn replicate(
    State(state): State<NodeHttpState>,
    Json(req): Json<ReplicateRequest>,
) -> Result<Json<Value>> {
    let role = state.ctx.coordinator().handle_replicate(req)?;
    Ok(Json(json!({ "status": "ok", "role": role })))
}

async fn replicate_async(
    State(state): State<NodeHttpState>,
    Json(payload): Json<AsyncPayload>,
) -> impl IntoResponse {
    let applied = state.ctx.coordinator().apply_async(payload);
    Json(json!({ "status": "ok", "applied": applied }))
}

async fn cluster_membership(
    State(state): State<NodeHttpState>,
    Json(snapshot): Json<MembershipSnapshot>,
) -> Result<Json<Value>> {
    let delta = state.ctx.apply_membership(snapshot)?;
    let changed = !delta.is_empty();
    let version = delta.version;
    if changed {
        if let Some(reconcile) = &state.reconcile {
            reconcile.notify(delta);
        }
    }
    Ok(Json(json!({ "status": "ok", "version": version, "changed": changed })))
}

async fn status(State(state): State<NodeHttpState>) -> impl IntoResponse {
    let membership = state.ctx.membership().snapshot();
    let records = state.ctx.coordinator().store().snapshot();
    Json(json!({
        "node": state.ctx.self_id(),
        "membership": membership,
        "async_pending": state.ctx.replicator().pending(),
        "reconcile_passes": state.ctx.reconciler().passes(),
        "keys": records.len(),
        "records": records,
    }))
}

async fn health(State(state): State<NodeHttpState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "node": state.ctx.self_id(),
            "membership_version": state.ctx.membership().version(),
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeConfig;
    use crate::node::testing::{fast_config, RecordingControl, ScriptedPeers};
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn router(dir: &TempDir) -> (Router, Arc<NodeContext>) {
        let config = NodeConfig {
            node_id: "http://n1".into(),
            outbox_path: dir.path().join("outbox.log"),
            replication: fast_config(),
            ..NodeConfig::default()
        };
        let ctx = Arc::new(
            NodeContext::with_transports(
                &config,
                Arc::new(ScriptedPeers::default()),
                Arc::new(RecordingControl::default()),
            )
            .unwrap(),
        );
        let router = create_router(NodeHttpState {
            ctx: ctx.clone(),
            reconcile: None,
        });
        (router, ctx)
    }

    async fn post_json(router: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn membership(alive: &[&str], version: u64) -> Value {
        json!({ "alive": alive, "dead": [], "version": version })
    }

    #[tokio::test]
    async fn test_put_rejected_without_peers() {
        let dir = TempDir::new().unwrap();
        let (router, _) = router(&dir);
        let (status, body) =
            post_json(&router, "/put", json!({ "key": "k", "value": "v" })).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], true);
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let (router, _) = router(&dir);

        let (status, _) = post_json(
            &router,
            "/cluster/membership",
            membership(&["http://n1", "http://n2"], 1),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            post_json(&router, "/put", json!({ "key": "user:42", "value": "alice" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["topology"]["sync"], "http://n2");

        let (status, body) = post_json(&router, "/get", json!({ "key": "user:42" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], "alice");
        assert_eq!(body["role"], "PRIMARY");

        let (status, _) = post_json(&router, "/get", json!({ "key": "missing" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stale_membership_conflict() {
        let dir = TempDir::new().unwrap();
        let (router, ctx) = router(&dir);

        let (status, body) =
            post_json(&router, "/cluster/membership", membership(&["http://n1"], 3)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], 3);

        let (status, _) = post_json(
            &router,
            "/cluster/membership",
            membership(&["http://n1", "http://n2"], 2),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(ctx.membership().version(), 3);
    }

    #[tokio::test]
    async fn test_replicate_endpoints() {
        let dir = TempDir::new().unwrap();
        let (router, ctx) = router(&dir);

        let (status, body) = post_json(
            &router,
            "/replicate",
            json!({
                "key": "k",
                "value": "v",
                "primary": "http://n2",
                "sync": "http://n1",
                "async": "http://n3",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "SYNC");

        let (_, body) = post_json(
            &router,
            "/replicate/async",
            json!({
                "key": "other",
                "value": "v",
                "target": "http://n3",
                "primary": "http://n2",
                "sync": "http://n1",
            }),
        )
        .await;
        assert_eq!(body["applied"], false);
        assert!(ctx.coordinator().read("other").is_none());
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let dir = TempDir::new().unwrap();
        let (router, _) = router(&dir);

        let response = router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let response = router
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("replikv_writes_accepted_total"));
    }
}
