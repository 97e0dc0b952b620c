//! Error types for the sharded document store

use std::fmt;

use thiserror::Error;

use crate::types::{DocumentId, ShardId};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Classification of a failure reported by the database client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// Recoverable reconnect situation. The connection object may still be usable.
    Transient,
    /// The connection is unusable and must be rebuilt.
    ConnectionLost,
    /// Non-network failure (bad query, rejected write, ...).
    Query,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientErrorKind::Transient => "transient",
            ClientErrorKind::ConnectionLost => "connection lost",
            ClientErrorKind::Query => "query",
        })
    }
}

/// Error returned by a database client (shard connection or catalog).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Transient, message)
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::ConnectionLost, message)
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Query, message)
    }

    /// True for the two network conditions the health manager classifies.
    pub fn is_network(&self) -> bool {
        matches!(self.kind, ClientErrorKind::Transient | ClientErrorKind::ConnectionLost)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Shard {shard} has no available endpoints")]
    NoEndpointAvailable { shard: ShardId },

    #[error("Shard {0} is not registered")]
    UnknownShard(ShardId),

    #[error("Redirect chain detected: {id} -> {target} redirects again")]
    RedirectChain { id: DocumentId, target: DocumentId },

    #[error("Cannot determine shard for document {0}")]
    UnroutableDocument(DocumentId),

    #[error("Write to shard {shard} failed: {reason}")]
    WriteFailed { shard: ShardId, reason: String },

    #[error("Catalog error: {0}")]
    Catalog(#[source] ClientError),

    #[error("Query error on shard {shard}: {source}")]
    Query { shard: ShardId, source: ClientError },

    #[error("Invalid document id: {0}")]
    InvalidId(String),

    #[error("Invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Get error code for callers that report errors over a wire
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NoEndpointAvailable { .. } => "NO_ENDPOINT_AVAILABLE",
            StoreError::UnknownShard(_) => "UNKNOWN_SHARD",
            StoreError::RedirectChain { .. } => "REDIRECT_CHAIN",
            StoreError::UnroutableDocument(_) => "UNROUTABLE_DOCUMENT",
            StoreError::WriteFailed { .. } => "WRITE_FAILED",
            StoreError::InvalidId(_) => "INVALID_ID",
            StoreError::InvalidField { .. } => "INVALID_FIELD",
            StoreError::Config(_) => "INVALID_CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// True when the error only means a shard is currently unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::NoEndpointAvailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_network_classification() {
        assert!(ClientError::transient("reconnect").is_network());
        assert!(ClientError::connection_lost("reset").is_network());
        assert!(!ClientError::query("bad filter").is_network());
    }

    #[test]
    fn test_error_codes() {
        let err = StoreError::NoEndpointAvailable { shard: ShardId(3) };
        assert_eq!(err.code(), "NO_ENDPOINT_AVAILABLE");
        assert!(err.is_unavailable());

        let err = StoreError::Catalog(ClientError::query("boom"));
        assert_eq!(err.code(), "INTERNAL_ERROR");
        assert!(!err.is_unavailable());
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::connection_lost("reset by peer");
        assert_eq!(err.to_string(), "connection lost error: reset by peer");
        assert_eq!(ClientError::transient("x").to_string(), "transient error: x");
    }

    #[test]
    fn test_catalog_error_keeps_source() {
        use std::error::Error as _;

        let err = StoreError::Catalog(ClientError::query("boom"));
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("query error: boom"));
    }

    #[test]
    fn test_display_includes_shard() {
        let err = StoreError::NoEndpointAvailable { shard: ShardId(7) };
        assert_eq!(err.to_string(), "Shard 7 has no available endpoints");
    }
}
