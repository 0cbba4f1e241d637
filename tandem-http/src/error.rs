use std::io;

use tandem_h2::H2Error;

/// Errors produced by the HTTP client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The connection was closed, or shut down while the operation waited.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived within the configured timeout.
    #[error("timeout")]
    Timeout,

    /// The peer broke the protocol, or a stream was reset.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A flow control window would have gone negative or overflowed.
    #[error("flow control error")]
    FlowControl,

    /// HTTP/2 framing or header compression error.
    #[error("h2 error: {0}")]
    H2(#[from] H2Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Invalid URL or path.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Response parsing error.
    #[error("parse error")]
    Parse,

    /// JSON body could not be serialized or deserialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The blocking adapter could not start its runtime.
    #[error("runtime error: {0}")]
    Runtime(String),
}
