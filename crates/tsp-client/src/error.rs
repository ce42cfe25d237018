//! Client error types.

use tsp_net::TransportError;

/// Errors returned by [`crate::Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The initial connect failed. Not retried by `connect` itself.
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Transport-level cause.
        #[source]
        source: TransportError,
    },

    /// `connect` was called while a connection is active or being established.
    #[error("client is already connected")]
    AlreadyConnected,

    /// `disconnect` ran while the initial connect was still in progress.
    #[error("connect aborted by disconnect")]
    Aborted,
}

/// Failure delivered to a reply handler instead of a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The request was sent while the client had no connection.
    #[error("not connected")]
    NotConnected,

    /// The transport refused the payload.
    #[error("transport rejected request: {0}")]
    SendFailed(String),

    /// The connection was closed or abandoned before the reply arrived.
    #[error("connection lost before reply")]
    ConnectionLost,
}
