//! Node-to-node and node-to-control-plane calls
//!
//! The replication logic only talks to the traits; the HTTP clients here are
//! what a running node plugs in.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::common::{Error, NodeId, Result};
use crate::node::store::Topology;

/// Synchronous replicate request: store `value` with the given topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub key: String,
    pub value: String,
    pub primary: NodeId,
    pub sync: Option<NodeId>,
    #[serde(rename = "async")]
    pub asynchronous: Option<NodeId>,
}

impl ReplicateRequest {
    pub fn new(key: &str, value: &str, topology: &Topology) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            primary: topology.primary.clone(),
            sync: topology.sync.clone(),
            asynchronous: topology.asynchronous.clone(),
        }
    }

    pub fn topology(&self) -> Topology {
        Topology {
            primary: self.primary.clone(),
            sync: self.sync.clone(),
            asynchronous: self.asynchronous.clone(),
        }
    }
}

/// Message carried by the async channel. Receivers ignore payloads whose
/// `target` is not themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncPayload {
    pub key: String,
    pub value: String,
    pub target: NodeId,
    pub primary: NodeId,
    pub sync: Option<NodeId>,
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn replicate(&self, target: &NodeId, request: &ReplicateRequest) -> Result<()>;

    async fn deliver_async(&self, target: &NodeId, payload: &AsyncPayload) -> Result<()>;
}

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Best-effort primary-change notification
    async fn primary_changed(&self, key: &str, primary: &NodeId) -> Result<()>;

    async fn heartbeat(&self, node: &NodeId) -> Result<()>;
}

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))
}

async fn post_json<T: Serialize + ?Sized>(client: &Client, node: &str, url: String, body: &T) -> Result<()> {
    let resp = client
        .post(&url)
        .json(body)
        .send()
        .await
        .map_err(|e| Error::transport(node, e))?;

    if resp.status().is_success() {
        return Ok(());
    }

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    Err(Error::transport(node, format!("{} returned {}: {}", url, status, text)))
}

#[derive(Clone)]
pub struct HttpPeerTransport {
    client: Client,
}

impl HttpPeerTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn replicate(&self, target: &NodeId, request: &ReplicateRequest) -> Result<()> {
        debug!("replicate {} -> {}", request.key, target);
        post_json(&self.client, target.as_str(), target.url("/replicate"), request).await
    }

    async fn deliver_async(&self, target: &NodeId, payload: &AsyncPayload) -> Result<()> {
        debug!("async {} -> {}", payload.key, target);
        post_json(&self.client, target.as_str(), target.url("/replicate/async"), payload).await
    }
}

#[derive(Clone)]
pub struct HttpControlPlane {
    client: Client,
    base_url: String,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlane {
    async fn primary_changed(&self, key: &str, primary: &NodeId) -> Result<()> {
        let body = serde_json::json!({ "key": key, "primary": primary });
        post_json(
            &self.client,
            &self.base_url,
            format!("{}/notify/primary", self.base_url),
            &body,
        )
        .await
    }

    async fn heartbeat(&self, node: &NodeId) -> Result<()> {
        let body = serde_json::json!({ "node": node });
        post_json(
            &self.client,
            &self.base_url,
            format!("{}/heartbeat", self.base_url),
            &body,
        )
        .await
    }
}
