//! Error types shared across the broker and agent binaries.

use thiserror::Error;

/// Errors surfaced by the tunnel transport, registry, ingress and session
/// bridge. Display text is written to be safe to return to a remote peer
/// where the spec calls for it (banners, HTTP error bodies); callers that
/// need to hide internals should log the error and emit a generic message
/// instead of `{err}`.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("failed to bind listener: {0}")]
    BindFailure(String),

    #[error("missing device id")]
    MissingDeviceId,

    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("failed to dial device: {0}")]
    DialFailure(String),

    #[error("tunnel closed")]
    TunnelClosed,

    #[error("authentication rejected")]
    AuthRejected,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("invalid ssh id: {0}")]
    InvalidSshId(String),

    #[error("policy rejected the request: {0}")]
    PolicyRejected(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
