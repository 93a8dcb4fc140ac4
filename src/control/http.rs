//! HTTP API for the control plane
//!
//! Worker-facing: `POST /heartbeat`, `POST /notify/primary`.
//! Client-facing: `POST /put`, `POST /get` routed to workers.
//! Operational: `GET /cluster`, `GET /health`, `GET /metrics`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{candidates_for, validate_key, Error, NodeId, Result, METRICS};
use crate::control::broadcast::MembershipBroadcaster;
use crate::control::index::PrimaryIndex;
use crate::control::registry::WorkerRegistry;

#[derive(Clone)]
pub struct ControlState {
    pub registry: Arc<WorkerRegistry>,
    pub index: Arc<PrimaryIndex>,
    pub broadcaster: Arc<MembershipBroadcaster>,
    pub client: Client,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub node: NodeId,
}

#[derive(Debug, Deserialize)]
pub struct PrimaryNotice {
    pub key: String,
    pub primary: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

pub fn create_router(state: ControlState) -> Router {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/notify/primary", post(notify_primary))
        .route("/put", post(put_key))
        .route("/get", post(get_key))
        .route("/cluster", get(cluster))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(axum::middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn heartbeat(
    State(state): State<ControlState>,
    Json(req): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    if let Some(snapshot) = state.registry.heartbeat(&req.node) {
        let broadcaster = state.broadcaster.clone();
        tokio::spawn(async move {
            let report = broadcaster.broadcast(&snapshot).await;
            debug!("Membership v{} broadcast: {:?}", snapshot.version, report);
        });
    }
    Json(json!({ "status": "ok", "version": state.registry.version() }))
}

async fn notify_primary(
    State(state): State<ControlState>,
    Json(notice): Json<PrimaryNotice>,
) -> impl IntoResponse {
    if let Some(previous) = state.index.record(&notice.key, notice.primary.clone()) {
        info!(
            "Primary for {} moved {} -> {}",
            notice.key, previous, notice.primary
        );
    }
    Json(json!({ "status": "ok" }))
}

/// Route a write to the key's primary: the indexed one if it is alive,
/// otherwise the first computed candidate. One redirect is followed when
/// the chosen worker names a different primary.
async fn put_key(
    State(state): State<ControlState>,
    Json(req): Json<PutRequest>,
) -> Result<Response> {
    validate_key(&req.key)?;

    let alive = state.registry.alive_nodes();
    let mut target = state
        .index
        .primary_of(&req.key)
        .filter(|p| alive.contains(p))
        .or_else(|| candidates_for(&req.key, &alive).into_iter().next())
        .ok_or_else(|| Error::NoReplicaCandidate("no alive workers".into()))?;

    for hop in 0..2 {
        let resp = state
            .client
            .post(target.url("/put"))
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::transport(&target, e))?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            state.index.record(&req.key, target.clone());
            return Ok(Json(body).into_response());
        }

        if status == StatusCode::MISDIRECTED_REQUEST && hop == 0 {
            if let Some(primary) = body["primary"].as_str() {
                debug!("{} redirected from {} to {}", req.key, target, primary);
                target = NodeId::new(primary);
                continue;
            }
        }

        return Ok((status, Json(body)).into_response());
    }

    Err(Error::Internal(format!("write for {} bounced between primaries", req.key)))
}

/// Read from the first worker that has the key: indexed primary, then the
/// computed candidates, then every other alive worker.
async fn get_key(
    State(state): State<ControlState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<Value>> {
    validate_key(&req.key)?;

    let alive = state.registry.alive_nodes();
    let mut order: Vec<NodeId> = Vec::with_capacity(alive.len() + 1);
    let indexed = state.index.primary_of(&req.key);
    for node in indexed
        .into_iter()
        .chain(candidates_for(&req.key, &alive))
        .chain(alive.iter().cloned())
    {
        if !order.contains(&node) {
            order.push(node);
        }
    }

    for node in order {
        let resp = match state.client.post(node.url("/get")).json(&req).send().await {
            Ok(resp) => resp,
            Err(e) => {
                debug!("Read of {} from {} failed: {}", req.key, node, e);
                continue;
            }
        };
        if !resp.status().is_success() {
            continue;
        }
        if let Ok(mut body) = resp.json::<Value>().await {
            body["source"] = Value::String(node.to_string());
            return Ok(Json(body));
        }
    }

    Err(Error::NotFound(req.key))
}

async fn cluster(State(state): State<ControlState>) -> impl IntoResponse {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "version": snapshot.version,
        "alive": snapshot.alive,
        "dead": snapshot.dead,
        "workers": state.registry.workers(),
        "indexed_keys": state.index.len(),
    }))
}

async fn health(State(state): State<ControlState>) -> impl IntoResponse {
    let alive = state.registry.alive_nodes().len();
    let status = if alive > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if alive > 0 { "healthy" } else { "no_workers" },
            "alive_workers": alive,
            "membership_version": state.registry.version(),
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, METRICS.to_prometheus())
}
