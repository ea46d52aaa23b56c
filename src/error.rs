//! Proxy error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors that can abort startup of the proxy.
///
/// Per-connection failures (broker unreachable, short write, malformed
/// CONNECT) are deliberately *not* represented here -- a single
/// misbehaving client must never destabilize the process-wide error type
/// used for startup. Those are logged and handled locally by the worker
/// that hit them; see [`crate::forwarder::Forwarder`].
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Binding the listening socket failed.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Registering the listener with the event loop failed.
    #[error("failed to start listening: {0}")]
    Listen(std::io::Error),

    /// An I/O error not covered above.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The server was asked to stop before it finished starting.
    #[error("server shutdown")]
    Shutdown,
}
