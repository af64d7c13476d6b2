//! Error types for dubbo-client.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::Status;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// JSON error (configuration loading, typed results).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (bad magic, truncated stream, oversized payload, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport connect/read failure. Recovered inside the endpoint.
    #[error("Connect error: {0}")]
    Connect(String),

    /// The provider answered with a non-OK status.
    #[error("Remote status {status}: {message}")]
    RemoteStatus { status: Status, message: String },

    /// The provider answered with a serialized application exception.
    #[error("Remote exception: {0}")]
    RemoteException(Value),

    /// No response arrived before the call's deadline.
    #[error("Request {request_id} timed out: {message}")]
    Timeout { request_id: i64, message: String },

    /// Invalid invocation or client configuration, raised before any I/O.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No overload of the method matches the call.
    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    /// More than one overload matches the call.
    #[error("Ambiguous method {service}.{method}, candidates: {}", candidates.join(", "))]
    AmbiguousMethod {
        service: String,
        method: String,
        candidates: Vec<String>,
    },

    /// A pending call is already registered under this id.
    #[error("Request id {0} is already pending")]
    DuplicateRequestId(i64),

    /// Endpoint or client has been closed.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl RpcError {
    /// True for errors raised before anything touched the network.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RpcError::Configuration(_)
                | RpcError::MethodNotFound { .. }
                | RpcError::AmbiguousMethod { .. }
        )
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
