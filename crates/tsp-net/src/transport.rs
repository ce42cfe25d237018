//! The contract between a stream transport and the request/reply client.
//!
//! A transport opens one logical connection at a time, forwards payloads
//! without blocking, and reports incoming payloads and unexpected drops as
//! [`TransportEvent`]s on a channel owned by its consumer.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::framing::FrameError;
use crate::tls::TlsError;

/// Asynchronous notification from a transport to its consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete payload arrived.
    Message(Vec<u8>),
    /// The connection ended without a local `shutdown`.
    Dropped,
}

/// Sending half of the event channel handed to [`Transport::connect`].
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of the event channel.
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Create a fresh event channel.
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// Errors reported by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connect (including the TLS handshake) did not finish in time.
    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Deadline that expired.
        timeout: Duration,
    },

    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The host is not usable as a TLS server name.
    #[error("invalid TLS server name: {0}")]
    InvalidServerName(String),

    /// Framing failure on an established connection.
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// The connection is closing and accepts no more payloads.
    #[error("connection closed")]
    Closed,
}

/// A stream connection primitive consumed by the client.
///
/// `send`, `is_connected` and `shutdown` never block: payloads are handed to
/// the transport's own writer. After `shutdown` no further events are emitted
/// for the closed connection.
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `host:port`, reporting its events on `events`.
    ///
    /// Any previous connection is closed first. `timeout` bounds the whole
    /// attempt.
    fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        events: EventSink,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Queue `payload` for transmission on the current connection.
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Whether a connection is currently established.
    fn is_connected(&self) -> bool;

    /// Close the current connection, if any, without emitting `Dropped`.
    fn shutdown(&self);
}
