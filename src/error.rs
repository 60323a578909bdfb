//! Error types for the proxy pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while serving a query
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Length-prefixed read or write failed, or a body does not fit a frame
    #[error("framing error: {0}")]
    Framing(String),

    /// Message body could not be decoded or carries no question
    #[error("malformed DNS message: {0}")]
    MalformedMessage(String),

    /// Attempt to cache a zero-length response
    #[error("refusing to cache an empty payload")]
    EmptyPayload,

    /// Cache miss
    #[error("no cached record for {0}")]
    NotFound(String),

    /// Every pooled connection is checked out
    #[error("no idle upstream connection")]
    NoIdleConnection,

    /// No upstream connected during pool construction
    #[error("no upstream connections available")]
    NoUpstreamsAvailable,

    /// Connection id that the pool never handed out
    #[error("unknown upstream connection id {0}")]
    UnknownConnection(usize),

    /// Upstream address is not of the form `host:port`
    #[error("invalid upstream address '{0}'")]
    InvalidUpstream(String),

    /// Dial, write or read failure on an upstream transport
    #[error("upstream {host}: {source}")]
    UpstreamIo {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// Upstream answered a different query than the one sent
    #[error("upstream answered {got}, expected {expected}")]
    ResponseMismatch { expected: String, got: String },

    /// Writing the response back to the client failed
    #[error("client I/O error: {0}")]
    ClientIo(#[source] std::io::Error),

    /// A deadline expired
    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, Duration),

    /// The session was cancelled by server shutdown
    #[error("session cancelled")]
    Cancelled,
}

impl ProxyError {
    pub(crate) fn upstream(host: impl Into<String>, source: std::io::Error) -> Self {
        ProxyError::UpstreamIo {
            host: host.into(),
            source,
        }
    }
}
