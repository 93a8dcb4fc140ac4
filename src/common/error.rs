//! Error types for replikv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Outbox error: {0}")]
    Outbox(String),

    // === Replication Errors ===
    #[error("Write rejected for {key}: {reason}")]
    WriteRejected { key: String, reason: String },

    #[error("Update rejected for {key}: {reason}")]
    UpdateRejected { key: String, reason: String },

    #[error("No replica candidate available for {0}")]
    NoReplicaCandidate(String),

    #[error("Node {0} is reported dead")]
    NodeDead(String),

    #[error("Not primary for {key}; primary is {primary}")]
    NotPrimary { key: String, primary: String },

    // === Membership Errors ===
    #[error("Stale membership: version {received} <= held {held}")]
    StaleMembership { received: u64, held: u64 },

    // === Network Errors ===
    #[error("Transport error talking to {node}: {reason}")]
    Transport { node: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    // === Request / Config Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WriteRejected { .. }
                | Error::UpdateRejected { .. }
                | Error::NoReplicaCandidate(_)
                | Error::Transport { .. }
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::StaleMembership { .. } => StatusCode::CONFLICT,
            Error::NotPrimary { .. } => StatusCode::MISDIRECTED_REQUEST,
            Error::WriteRejected { .. }
            | Error::UpdateRejected { .. }
            | Error::NoReplicaCandidate(_)
            | Error::NodeDead(_)
            | Error::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub(crate) fn transport(node: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::Transport {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.to_http_status();
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        });
        if let Error::NotPrimary { primary, .. } = &self {
            body["primary"] = serde_json::Value::String(primary.clone());
        }
        (status, axum::Json(body)).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
